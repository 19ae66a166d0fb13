#![cfg(test)]

use crate::cycle_detection::CycleDetection;
use crate::error::CompilerError;
use crate::meta::Span;
use crate::program::{CallTarget, FragmentRoots, NodeKind, ShaderProgram, SymbolId};

fn method(program: &mut ShaderProgram, id: u32, name: &str) -> SymbolId {
    let symbol = SymbolId(id);
    program.add_node(symbol, name, NodeKind::Method, Span::new(id, 0));
    symbol
}

fn call(program: &mut ShaderProgram, from: SymbolId, to: SymbolId) {
    program.add_call(from, CallTarget::Local(to), Span::new(from.0, 10));
}

fn roots(program: &mut ShaderProgram, methods: Vec<SymbolId>) {
    program.fragments.push(FragmentRoots {
        type_name: "TestFragment".into(),
        pre_constructor: None,
        constructors: Vec::new(),
        methods,
    });
}

#[test]
fn straight_chain_has_no_cycle() {
    let mut program = ShaderProgram::new();
    let a = method(&mut program, 1, "A");
    let b = method(&mut program, 2, "B");
    let c = method(&mut program, 3, "C");
    call(&mut program, a, b);
    call(&mut program, b, c);
    roots(&mut program, vec![a]);

    let mut detection = CycleDetection::new(&program);
    assert!(!detection.run());
    assert!(detection.errors().is_empty());
}

#[test]
fn diamond_is_not_a_cycle() {
    // A calls B and C, both call D. D's subtree completes once and is
    // never re-walked; a shared callee must not be reported as recursion.
    let mut program = ShaderProgram::new();
    let a = method(&mut program, 1, "A");
    let b = method(&mut program, 2, "B");
    let c = method(&mut program, 3, "C");
    let d = method(&mut program, 4, "D");
    call(&mut program, a, b);
    call(&mut program, a, c);
    call(&mut program, b, d);
    call(&mut program, c, d);
    roots(&mut program, vec![a]);

    let mut detection = CycleDetection::new(&program);
    assert!(!detection.run());
}

#[test]
fn direct_recursion_is_detected() {
    let mut program = ShaderProgram::new();
    let a = method(&mut program, 1, "A");
    call(&mut program, a, a);
    roots(&mut program, vec![a]);

    let mut detection = CycleDetection::new(&program);
    assert!(detection.run());
    assert_eq!(detection.errors().len(), 1);
}

#[test]
fn indirect_recursion_trace_starts_and_ends_at_the_cycle_symbol() {
    let mut program = ShaderProgram::new();
    let a = method(&mut program, 1, "A");
    let b = method(&mut program, 2, "B");
    let c = method(&mut program, 3, "C");
    call(&mut program, a, b);
    call(&mut program, b, c);
    call(&mut program, c, a);
    roots(&mut program, vec![a]);

    let mut detection = CycleDetection::new(&program);
    assert!(detection.run());

    match &detection.errors()[0] {
        CompilerError::CycleError(message, trace) => {
            assert!(message.starts_with("A ->"));
            assert!(message.ends_with("-> A"));
            assert_eq!(trace.first(), trace.last());
            assert_eq!(*trace.first().unwrap(), Span::new(1, 0));
            assert_eq!(trace.len(), 4);
        }
        other => panic!("expected a cycle error, got {:?}", other),
    }
}

#[test]
fn constructor_cycles_are_detected() {
    let mut program = ShaderProgram::new();
    let ctor = SymbolId(1);
    program.add_node(ctor, "Fragment", NodeKind::Constructor, Span::new(1, 0));
    let init = SymbolId(2);
    program.add_node(init, "FieldInit", NodeKind::FieldInitializer, Span::new(2, 0));
    call(&mut program, ctor, init);
    call(&mut program, init, ctor);
    program.fragments.push(FragmentRoots {
        type_name: "Fragment".into(),
        pre_constructor: None,
        constructors: vec![ctor],
        methods: Vec::new(),
    });

    let mut detection = CycleDetection::new(&program);
    assert!(detection.run());
}

#[test]
fn later_cycles_are_suppressed_by_default() {
    let mut program = ShaderProgram::new();
    let a = method(&mut program, 1, "A");
    let b = method(&mut program, 2, "B");
    call(&mut program, a, a);
    call(&mut program, b, b);
    roots(&mut program, vec![a, b]);

    let mut detection = CycleDetection::new(&program);
    assert!(detection.run());
    assert_eq!(detection.errors().len(), 1);

    let mut emit_all = CycleDetection::new(&program).emit_all_errors();
    assert!(emit_all.run());
    assert_eq!(emit_all.errors().len(), 2);
}

#[test]
fn external_calls_are_leaves() {
    let mut program = ShaderProgram::new();
    let a = method(&mut program, 1, "A");
    program.add_call(
        a,
        CallTarget::External("Math.Dot".into()),
        Span::new(1, 10),
    );
    roots(&mut program, vec![a]);

    let mut detection = CycleDetection::new(&program);
    assert!(!detection.run());
}
