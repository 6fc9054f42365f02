//! Block scoping: two namespaces (variables/typedefs/enum-constants,
//! and struct/union/enum tags), stacked per block.

use crate::ast::ObjId;
use crate::types::Type;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum VarBinding {
    Var(ObjId),
    Typedef(Type),
    EnumConst { ty: Type, value: i64 },
}

#[derive(Debug, Default)]
pub struct Scope {
    vars: HashMap<String, VarBinding>,
    tags: HashMap<String, Type>,
}

/// A `Vec<Scope>` stack; index 0 is file (global) scope.
#[derive(Debug)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack { scopes: vec![Scope::default()] }
    }

    pub fn enter(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn leave(&mut self) {
        self.scopes.pop();
        assert!(!self.scopes.is_empty(), "popped the file scope");
    }

    pub fn is_global(&self) -> bool {
        self.scopes.len() == 1
    }

    pub fn push_var(&mut self, name: impl Into<String>, binding: VarBinding) {
        self.scopes.last_mut().unwrap().vars.insert(name.into(), binding);
    }

    pub fn push_tag(&mut self, name: impl Into<String>, ty: Type) {
        self.scopes.last_mut().unwrap().tags.insert(name.into(), ty);
    }

    pub fn find_var(&self, name: &str) -> Option<&VarBinding> {
        self.scopes.iter().rev().find_map(|s| s.vars.get(name))
    }

    pub fn find_tag(&self, name: &str) -> Option<Type> {
        self.scopes.iter().rev().find_map(|s| s.tags.get(name).cloned())
    }

    /// Tags and typedefs are only overwritten/found within the *current*
    /// innermost scope for declaration purposes (distinct from lookup,
    /// which searches outward).
    pub fn find_tag_in_current(&self, name: &str) -> Option<Type> {
        self.scopes.last().unwrap().tags.get(name).cloned()
    }

    /// Functions are only ever declared at file scope.
    pub fn find_func(&self, name: &str) -> Option<ObjId> {
        match self.scopes[0].vars.get(name) {
            Some(VarBinding::Var(id)) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ty_int;

    #[test]
    fn inner_scope_shadows_outer() {
        let mut scopes = ScopeStack::new();
        scopes.push_var("x", VarBinding::Var(0));
        scopes.enter();
        scopes.push_var("x", VarBinding::Var(1));
        assert!(matches!(scopes.find_var("x"), Some(VarBinding::Var(1))));
        scopes.leave();
        assert!(matches!(scopes.find_var("x"), Some(VarBinding::Var(0))));
    }

    #[test]
    fn tag_lookup_walks_outward() {
        let mut scopes = ScopeStack::new();
        scopes.push_tag("S", ty_int());
        scopes.enter();
        assert!(scopes.find_tag("S").is_some());
        assert!(scopes.find_tag_in_current("S").is_none());
    }
}
