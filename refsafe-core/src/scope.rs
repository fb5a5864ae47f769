#![forbid(unsafe_code)]

//! The scope model: a totally ordered nesting depth within one method
//! body, and the `(ref, val)` escape pair computed per expression.
//!
//! Depths count downward in safety: a *smaller* number is a *wider*
//! scope. Depth 0 is the calling method (values there may be returned),
//! depth 1 is the method's top-level block, and each nested block,
//! loop body or lambda body adds one.

/// A nesting depth within one method body. Total order; smaller is
/// wider (safer to keep longer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope(pub u32);

impl Scope {
    /// The widest scope: storage reachable from here survives the
    /// current call, so references to it may be returned.
    pub const CALLING_METHOD: Scope = Scope(0);

    /// Demand used for `return ref` expressions. In the minimal model
    /// this coincides with [`Scope::CALLING_METHOD`]; it is kept as a
    /// separate name so return checks read differently from
    /// assignment checks.
    pub const RETURN_ONLY: Scope = Scope(0);

    /// The method's outermost block. By-value parameters and struct
    /// `this` live here for ref-escape purposes: aliases to them are
    /// valid anywhere in the method but must not leave it.
    pub const TOP_LEVEL: Scope = Scope(1);

    /// Enter a nested block/loop/lambda scope.
    pub fn nested(self) -> Scope {
        Scope(self.0 + 1)
    }

    /// Leave the current scope.
    pub fn enclosing(self) -> Scope {
        debug_assert!(self.0 > 0);
        Scope(self.0.saturating_sub(1))
    }

    /// The wider (safer) of two scopes.
    pub fn wider(a: Scope, b: Scope) -> Scope {
        Scope(a.0.min(b.0))
    }

    /// The narrower (more restrictive) of two scopes. This is the
    /// conservative join used when aggregating arms or arguments.
    pub fn narrower(a: Scope, b: Scope) -> Scope {
        Scope(a.0.max(b.0))
    }

    /// `self` survives at least as long as `other`.
    pub fn is_at_least_as_wide_as(self, other: Scope) -> bool {
        self.0 <= other.0
    }
}

/// The two escape values synthesized for an expression.
///
/// `ref_scope` bounds how far an *alias to the expression's storage*
/// may travel; `val_scope` bounds how far a *copy of its value* may.
/// For any expression the reference is at least as constrained as the
/// value, so `ref_scope` is never wider than `val_scope`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscapeInfo {
    pub ref_scope: Scope,
    pub val_scope: Scope,
}

impl EscapeInfo {
    /// Builds a pair, clamping `ref_scope` so the invariant holds even
    /// when the caller computed the components independently.
    pub fn new(ref_scope: Scope, val_scope: Scope) -> Self {
        EscapeInfo {
            ref_scope: Scope::narrower(ref_scope, val_scope),
            val_scope,
        }
    }

    /// Both components pinned to the given scope. Used for freshly
    /// declared storage and as the recovery value after a reported
    /// violation, so later checks neither cascade nor crash.
    pub fn narrowest(scope: Scope) -> Self {
        EscapeInfo {
            ref_scope: scope,
            val_scope: scope,
        }
    }

    /// The pair for an ordinary non-aliasing value: freely copyable,
    /// not addressable beyond the current expression.
    pub fn value_only(current: Scope) -> Self {
        EscapeInfo {
            ref_scope: current,
            val_scope: Scope::CALLING_METHOD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_counts_down_in_safety() {
        assert!(Scope::CALLING_METHOD.is_at_least_as_wide_as(Scope::TOP_LEVEL));
        assert!(!Scope::TOP_LEVEL.is_at_least_as_wide_as(Scope::CALLING_METHOD));
        assert!(Scope::TOP_LEVEL.is_at_least_as_wide_as(Scope::TOP_LEVEL));
    }

    #[test]
    fn joins() {
        let inner = Scope::TOP_LEVEL.nested();
        assert_eq!(Scope::wider(inner, Scope::TOP_LEVEL), Scope::TOP_LEVEL);
        assert_eq!(Scope::narrower(inner, Scope::TOP_LEVEL), inner);
        assert_eq!(inner.enclosing(), Scope::TOP_LEVEL);
    }

    #[test]
    fn escape_info_clamps_ref_to_val() {
        let info = EscapeInfo::new(Scope::CALLING_METHOD, Scope::TOP_LEVEL);
        assert_eq!(info.ref_scope, Scope::TOP_LEVEL);
        assert!(info.val_scope.is_at_least_as_wide_as(info.ref_scope));
    }

    #[test]
    fn return_only_is_calling_method_in_minimal_model() {
        assert_eq!(Scope::RETURN_ONLY, Scope::CALLING_METHOD);
    }
}
