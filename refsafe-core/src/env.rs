#![forbid(unsafe_code)]

//! Per-method variable environment: one map of `LocalId` to its
//! current [`EscapeInfo`] per active block scope.
//!
//! This replaces mutable per-symbol compiler state with an explicit
//! structure threaded through the walk. By-value locals get their pair
//! stamped once at declaration; ref-kind locals have theirs *replaced*
//! (never merged) on each successful ref-reassignment. Entries drop
//! with their block.

use std::collections::HashMap;

use refsafe_ast::LocalId;

use crate::scope::EscapeInfo;

#[derive(Clone, Debug)]
pub struct VariableEnv {
    scopes: Vec<HashMap<LocalId, EscapeInfo>>,
}

impl Default for VariableEnv {
    fn default() -> Self {
        VariableEnv::new()
    }
}

impl VariableEnv {
    pub fn new() -> Self {
        VariableEnv {
            scopes: vec![HashMap::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        // The root scope stays; popping it would orphan the walk.
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Records a local's escape pair in the current block.
    pub fn declare(&mut self, id: LocalId, info: EscapeInfo) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(id, info);
        }
    }

    /// Innermost-first lookup across all active blocks.
    pub fn lookup(&self, id: LocalId) -> Option<EscapeInfo> {
        for scope in self.scopes.iter().rev() {
            if let Some(info) = scope.get(&id) {
                return Some(*info);
            }
        }
        None
    }

    /// Replaces the stored pair for a ref-kind local after a
    /// successful `x = ref y`. Returns false when `x` was never
    /// declared, which signals a malformed tree.
    pub fn rebind(&mut self, id: LocalId, info: EscapeInfo) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(&id) {
                *slot = info;
                return true;
            }
        }
        false
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}
