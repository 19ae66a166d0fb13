//! Rejects recursive call chains before lowering. Recursion is illegal in
//! a shading context, so any cycle through functions, constructors,
//! property accessors or field initializers fails the run.

use crate::error::CompilerError;
use crate::meta::Span;
use crate::program::{CallTarget, NodeDef, ShaderProgram, SymbolId};
use log::debug;
use std::collections::{HashMap, HashSet};

/// Walk state scoped to a single `run` call.
#[derive(Default)]
struct CycleDetectionContext {
    /// Symbols on the current DFS stack.
    on_stack: HashSet<SymbolId>,
    /// Symbols whose subtree already completed; never re-walked.
    visited: HashSet<SymbolId>,
    /// Entered nodes, for the human-readable trace on failure.
    call_stack: Vec<(SymbolId, String, Span)>,
}

pub struct CycleDetection<'a> {
    program: &'a ShaderProgram,
    /// Call sites only know the symbol they invoke; this maps each symbol
    /// back to its defining node.
    by_symbol: HashMap<SymbolId, &'a NodeDef>,
    context: CycleDetectionContext,
    errors: Vec<CompilerError>,
    emit_all: bool,
    cycle_found: bool,
}

impl<'a> CycleDetection<'a> {
    pub fn new(program: &'a ShaderProgram) -> Self {
        let by_symbol = program.nodes.iter().map(|n| (n.symbol, n)).collect();
        CycleDetection {
            program,
            by_symbol,
            context: CycleDetectionContext::default(),
            errors: Vec::new(),
            emit_all: false,
            cycle_found: false,
        }
    }

    /// Report every cycle instead of stopping at the first.
    pub fn emit_all_errors(mut self) -> Self {
        self.emit_all = true;
        self
    }

    /// Returns true if any cycle exists. The first cycle's trace is kept in
    /// `errors`; later cycles are suppressed unless `emit_all_errors` was
    /// requested.
    pub fn run(&mut self) -> bool {
        for fragment in &self.program.fragments {
            if let Some(pre) = fragment.pre_constructor {
                self.walk(pre);
            }
            for ctor in &fragment.constructors {
                self.walk(*ctor);
            }
            for method in &fragment.methods {
                self.walk(*method);
            }
        }
        self.cycle_found
    }

    pub fn errors(&self) -> &[CompilerError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<CompilerError> {
        std::mem::take(&mut self.errors)
    }

    fn walk(&mut self, symbol: SymbolId) {
        if self.context.on_stack.contains(&symbol) {
            self.report_cycle(symbol);
            return;
        }
        if self.context.visited.contains(&symbol) {
            return;
        }

        // Unknown symbols come from dependency libraries; they were checked
        // when that library was built.
        let node = match self.by_symbol.get(&symbol) {
            Some(node) => *node,
            None => return,
        };

        self.context.on_stack.insert(symbol);
        self.context
            .call_stack
            .push((symbol, node.name.clone(), node.location));

        for call in &node.calls {
            match &call.target {
                CallTarget::Local(target) => self.walk(*target),
                CallTarget::External(_) => {}
            }
        }

        self.context.call_stack.pop();
        self.context.on_stack.remove(&symbol);
        self.context.visited.insert(symbol);
    }

    fn report_cycle(&mut self, symbol: SymbolId) {
        self.cycle_found = true;
        if !self.errors.is_empty() && !self.emit_all {
            return;
        }

        // The trace starts where the repeated symbol first entered the
        // stack and ends with it again, so both endpoints name the cycle.
        let start = self
            .context
            .call_stack
            .iter()
            .position(|(s, _, _)| *s == symbol)
            .unwrap_or(0);
        let chain = &self.context.call_stack[start..];

        let mut names: Vec<&str> = chain.iter().map(|(_, name, _)| name.as_str()).collect();
        let mut trace: Vec<Span> = chain.iter().map(|(_, _, span)| *span).collect();
        if let Some((_, name, span)) = chain.first() {
            names.push(name);
            trace.push(*span);
        }

        let message = names.join(" -> ");
        debug!("cycle detected: {}", message);
        self.errors.push(CompilerError::CycleError(message, trace));
    }
}
