//! Resolved-program view handed over by the front end.
//!
//! Call sites only know the symbol they invoke, not the syntax node that
//! defines it, so the cycle detector re-indexes every node by symbol before
//! walking. Calls that cross translation-unit boundaries are leaves: a
//! dependency library was already checked when it was built.

use crate::meta::Span;

/// Opaque symbol handle assigned by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// What kind of callable a node defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PreConstructor,
    Constructor,
    Method,
    PropertyGetter,
    PropertySetter,
    FieldInitializer,
}

/// A resolved call target: either a node in this translation unit or a
/// symbol from a dependency library.
#[derive(Debug, Clone)]
pub enum CallTarget {
    Local(SymbolId),
    External(String),
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub target: CallTarget,
    pub location: Span,
}

/// One callable node of the resolved program.
#[derive(Debug, Clone)]
pub struct NodeDef {
    pub symbol: SymbolId,
    pub name: String,
    pub kind: NodeKind,
    pub location: Span,
    pub calls: Vec<CallSite>,
}

/// Walk roots for one fragment type. Property accessors and field
/// initializers are reached through call sites, not listed as roots.
#[derive(Debug, Clone, Default)]
pub struct FragmentRoots {
    pub type_name: String,
    pub pre_constructor: Option<SymbolId>,
    pub constructors: Vec<SymbolId>,
    pub methods: Vec<SymbolId>,
}

/// The complete resolved program for one translation unit.
#[derive(Debug, Clone, Default)]
pub struct ShaderProgram {
    pub nodes: Vec<NodeDef>,
    pub fragments: Vec<FragmentRoots>,
}

impl ShaderProgram {
    pub fn new() -> Self {
        ShaderProgram::default()
    }

    pub fn add_node(
        &mut self,
        symbol: SymbolId,
        name: impl Into<String>,
        kind: NodeKind,
        location: Span,
    ) -> &mut NodeDef {
        let index = self.nodes.len();
        self.nodes.push(NodeDef {
            symbol,
            name: name.into(),
            kind,
            location,
            calls: Vec::new(),
        });
        &mut self.nodes[index]
    }

    pub fn add_call(&mut self, from: SymbolId, target: CallTarget, location: Span) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.symbol == from) {
            node.calls.push(CallSite { target, location });
        }
    }

    pub fn find_node(&self, symbol: SymbolId) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.symbol == symbol)
    }
}
