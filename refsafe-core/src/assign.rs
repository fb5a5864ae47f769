#![forbid(unsafe_code)]

//! Declaration and ref-reassignment validation.
//!
//! A ref-kind local captures its initializer's escape pair into the
//! variable environment at declaration; `x = ref y` replaces that pair
//! wholesale after the scope comparison passes. A failed reassignment
//! leaves the previous binding untouched, so re-analyzing the identical
//! statement reproduces the identical diagnostic.

use refsafe_ast::{
    BodyKind, BoundExpr, ConversionKind, ExprKind, LocalId, LocalSymbol, MethodBody, RefKind,
    Span, Ty,
};

use crate::diagnostics::{DiagnosticSink, RefSafetyDiagnostic};
use crate::env::VariableEnv;
use crate::escape::{check_val_escape, evaluate, val_escape, EvalCx};
use crate::readonly::{check_addressable, check_writable};
use crate::scope::{EscapeInfo, Scope};

/// The escape pair a by-value local is stamped with at declaration.
/// The outermost block of a top-level (script) body is
/// caller-reachable storage; any other block pins the local to its own
/// depth.
pub fn declared_escape(body: &MethodBody, local: &LocalSymbol) -> EscapeInfo {
    let declared = if local.depth == 1 && body.top_level {
        Scope::CALLING_METHOD
    } else {
        Scope(local.depth)
    };
    let val = if local.ty.is_ref_like() {
        declared
    } else {
        Scope::CALLING_METHOD
    };
    EscapeInfo::new(declared, val)
}

/// Validates one `LocalDecl` statement and installs the local's escape
/// pair in the environment. The local is always declared, with the
/// narrowest fallback pair on failure, so later uses do not cascade.
#[allow(clippy::too_many_arguments)]
pub fn check_local_decl(
    body: &MethodBody,
    env: &mut VariableEnv,
    span: Span,
    id: LocalId,
    init: Option<&BoundExpr>,
    init_is_ref: bool,
    local_scope: Scope,
    sink: &mut DiagnosticSink,
) -> bool {
    let local = body.local(id);

    if !local.is_ref_kind() {
        let mut ok = true;
        if init_is_ref {
            sink.report(RefSafetyDiagnostic::InitializeByValueWithReference { span });
            ok = false;
        }
        let info = declared_escape(body, local);
        if let Some(init) = init {
            if local.ty.is_ref_like() {
                let cx = EvalCx::new(body, env);
                ok &= check_val_escape(cx, init, local_scope, info.val_scope, sink);
            }
        }
        env.declare(id, info);
        return ok;
    }

    // Resumable bodies flatten their frame into a state machine; a ref
    // local would dangle at the first suspension.
    if body.kind != BodyKind::Ordinary {
        sink.report(RefSafetyDiagnostic::IteratorOrAsyncRefLocal {
            span: local.span,
            name: local.name.clone(),
        });
        env.declare(id, EscapeInfo::narrowest(local_scope));
        return false;
    }

    let Some(init) = init else {
        sink.report(RefSafetyDiagnostic::ByReferenceVariableMustBeInitialized {
            span,
            name: local.name.clone(),
        });
        env.declare(id, EscapeInfo::narrowest(local_scope));
        return false;
    };

    if !init_is_ref {
        sink.report(RefSafetyDiagnostic::InitializeByReferenceWithValue { span });
        env.declare(id, EscapeInfo::narrowest(local_scope));
        return false;
    }

    let cx = EvalCx::new(body, env);
    let mut ok = if local.is_ref_readonly {
        check_addressable(init, sink)
    } else {
        check_writable(cx, init, sink)
    };
    ok &= check_identity(init, &local.ty, sink);

    let info = evaluate(cx, init, local_scope);
    env.declare(
        id,
        if ok {
            info
        } else {
            EscapeInfo::narrowest(local_scope)
        },
    );
    ok
}

/// Validates one assignment statement, ref reassignment or value write.
#[allow(clippy::too_many_arguments)]
pub fn check_assign(
    body: &MethodBody,
    env: &mut VariableEnv,
    span: Span,
    target: &BoundExpr,
    value: &BoundExpr,
    is_ref: bool,
    local_scope: Scope,
    sink: &mut DiagnosticSink,
) -> bool {
    if is_ref {
        return check_ref_reassign(body, env, span, target, value, local_scope, sink);
    }

    let cx = EvalCx::new(body, env);
    let mut ok = check_writable(cx, target, sink);
    if target.ty.is_ref_like() {
        // Writing a stack-only value into wider-scoped storage would
        // widen its reach.
        let demand = val_escape(cx, target, local_scope);
        ok &= check_val_escape(cx, value, local_scope, demand, sink);
    }
    ok
}

fn check_ref_reassign(
    body: &MethodBody,
    env: &mut VariableEnv,
    span: Span,
    target: &BoundExpr,
    value: &BoundExpr,
    local_scope: Scope,
    sink: &mut DiagnosticSink,
) -> bool {
    // Only ref variables can be re-pointed.
    let (demand, readonly_target, rebind, target_name) = match &target.kind {
        ExprKind::Local(id) => {
            let local = body.local(*id);
            if !local.is_ref_kind() {
                sink.report(RefSafetyDiagnostic::RefAssignTargetExpected { span: target.span });
                return false;
            }
            let demand = env
                .lookup(*id)
                .map(|info| info.ref_scope)
                .unwrap_or(Scope(local.depth));
            (demand, local.is_ref_readonly, Some(*id), local.name.clone())
        }
        ExprKind::Parameter(id) => {
            let param = body.param(*id);
            if !param.ref_kind.is_by_ref() {
                sink.report(RefSafetyDiagnostic::RefAssignTargetExpected { span: target.span });
                return false;
            }
            (
                Scope::CALLING_METHOD,
                param.ref_kind == RefKind::In,
                None,
                param.name.clone(),
            )
        }
        _ => {
            sink.report(RefSafetyDiagnostic::RefAssignTargetExpected { span: target.span });
            return false;
        }
    };

    let cx = EvalCx::new(body, env);
    let mut ok = if readonly_target {
        check_addressable(value, sink)
    } else {
        check_writable(cx, value, sink)
    };
    ok &= check_identity(value, &target.ty, sink);

    let info = evaluate(cx, value, local_scope);
    if ok && !info.ref_scope.is_at_least_as_wide_as(demand) {
        sink.report(RefSafetyDiagnostic::NarrowerEscapeScope {
            span,
            name: target_name,
            source_name: source_name(body, value),
        });
        ok = false;
    }

    if ok {
        if let Some(id) = rebind {
            env.rebind(id, info);
        }
    }
    ok
}

/// Type identity required for ref binding: the value's static type must
/// equal the target's, and any conversion node in between must be the
/// identity conversion.
fn check_identity(value: &BoundExpr, target: &Ty, sink: &mut DiagnosticSink) -> bool {
    let identical = match &value.kind {
        ExprKind::Conversion { kind, .. } => {
            *kind == ConversionKind::Identity && value.ty == *target
        }
        _ => value.ty == *target,
    };
    if !identical {
        sink.report(RefSafetyDiagnostic::IdentityConversionRequired {
            span: value.span,
            target: target.name().to_string(),
        });
    }
    identical
}

fn source_name(body: &MethodBody, value: &BoundExpr) -> String {
    match &value.kind {
        ExprKind::Local(id) => body.local(*id).name.clone(),
        ExprKind::Parameter(id) => body.param(*id).name.clone(),
        ExprKind::Field { field, .. } => field.name.clone(),
        ExprKind::Call { callee, .. } => callee.name.clone(),
        _ => "the expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SeverityConfig;
    use refsafe_ast::{span, MethodSig, ParamId, ParamSig};

    fn sink() -> DiagnosticSink {
        DiagnosticSink::new(SeverityConfig::default(), false)
    }

    #[test]
    fn ref_variable_must_be_initialized_with_a_reference() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![LocalSymbol::by_ref("rx", Ty::Int, 1, span(0, 2))],
            vec![],
        );
        let mut env = VariableEnv::new();

        let mut sink1 = sink();
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 10),
            LocalId(0),
            None,
            false,
            Scope::TOP_LEVEL,
            &mut sink1
        ));
        assert!(matches!(
            sink1.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::ByReferenceVariableMustBeInitialized { .. }
        ));

        let mut sink2 = sink();
        let value_init = BoundExpr::literal(span(4, 1), Ty::Int);
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 10),
            LocalId(0),
            Some(&value_init),
            false,
            Scope::TOP_LEVEL,
            &mut sink2
        ));
        assert!(matches!(
            sink2.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::InitializeByReferenceWithValue { .. }
        ));
    }

    #[test]
    fn by_value_variable_rejects_a_ref_initializer() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![LocalSymbol::by_value("x", Ty::Int, 1, span(0, 1))],
            vec![],
        );
        let mut env = VariableEnv::new();
        let init = BoundExpr::literal(span(4, 1), Ty::Int);

        let mut s = sink();
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 8),
            LocalId(0),
            Some(&init),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::InitializeByValueWithReference { .. }
        ));
        // The local still exists afterwards.
        assert!(env.lookup(LocalId(0)).is_some());
    }

    #[test]
    fn ref_initializer_must_be_an_lvalue_of_identical_type() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![ParamSig::new("p", Ty::Int, RefKind::Ref)], Ty::Unit),
            vec![
                LocalSymbol::by_ref("rx", Ty::Int, 1, span(0, 2)),
                LocalSymbol::by_ref("rb", Ty::Bool, 1, span(0, 2)),
            ],
            vec![],
        );
        let mut env = VariableEnv::new();

        let mut s1 = sink();
        let literal = BoundExpr::literal(span(4, 1), Ty::Int);
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 8),
            LocalId(0),
            Some(&literal),
            true,
            Scope::TOP_LEVEL,
            &mut s1
        ));
        assert!(matches!(
            s1.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::NotAnLvalue { .. }
        ));

        let mut s2 = sink();
        let wrong_ty = BoundExpr::parameter(span(4, 1), Ty::Int, ParamId(0));
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 8),
            LocalId(1),
            Some(&wrong_ty),
            true,
            Scope::TOP_LEVEL,
            &mut s2
        ));
        assert!(matches!(
            s2.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::IdentityConversionRequired { .. }
        ));
    }

    #[test]
    fn non_identity_conversion_rejected_even_when_types_match() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![ParamSig::new("p", Ty::Int, RefKind::Ref)], Ty::Unit),
            vec![LocalSymbol::by_ref("rx", Ty::Int, 1, span(0, 2))],
            vec![],
        );
        let mut env = VariableEnv::new();
        let converted = BoundExpr::new(
            span(4, 5),
            Ty::Int,
            ExprKind::Conversion {
                kind: ConversionKind::Implicit,
                operand: Box::new(BoundExpr::parameter(span(4, 1), Ty::Int, ParamId(0))),
            },
        );

        let mut s = sink();
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 10),
            LocalId(0),
            Some(&converted),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(s
            .diagnostics()
            .iter()
            .any(|d| matches!(d.diagnostic, RefSafetyDiagnostic::IdentityConversionRequired { .. })));
    }

    #[test]
    fn reassigning_a_parameter_to_a_narrower_local_is_rejected() {
        // ref int m(ref int p) { int y = 0; p = ref y; }
        let body = MethodBody::new(
            MethodSig::by_ref("m", vec![ParamSig::new("p", Ty::Int, RefKind::Ref)], Ty::Int),
            vec![LocalSymbol::by_value("y", Ty::Int, 1, span(10, 1))],
            vec![],
        );
        let mut env = VariableEnv::new();
        env.declare(LocalId(0), declared_escape(&body, body.local(LocalId(0))));

        let target = BoundExpr::parameter(span(20, 1), Ty::Int, ParamId(0));
        let value = BoundExpr::local(span(24, 1), Ty::Int, LocalId(0));

        let mut s = sink();
        assert!(!check_assign(
            &body,
            &mut env,
            span(20, 10),
            &target,
            &value,
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        match &s.diagnostics()[0].diagnostic {
            RefSafetyDiagnostic::NarrowerEscapeScope { name, source_name, .. } => {
                assert_eq!(name, "p");
                assert_eq!(source_name, "y");
            }
            other => panic!("unexpected diagnostic {other:?}"),
        }
    }

    #[test]
    fn failed_reassignment_repeats_identically() {
        let body = MethodBody::new(
            MethodSig::by_ref("m", vec![ParamSig::new("p", Ty::Int, RefKind::Ref)], Ty::Int),
            vec![LocalSymbol::by_value("y", Ty::Int, 1, span(10, 1))],
            vec![],
        );
        let mut env = VariableEnv::new();
        env.declare(LocalId(0), declared_escape(&body, body.local(LocalId(0))));

        let target = BoundExpr::parameter(span(20, 1), Ty::Int, ParamId(0));
        let value = BoundExpr::local(span(24, 1), Ty::Int, LocalId(0));

        let mut s = sink();
        check_assign(&body, &mut env, span(20, 10), &target, &value, true, Scope::TOP_LEVEL, &mut s);
        check_assign(&body, &mut env, span(20, 10), &target, &value, true, Scope::TOP_LEVEL, &mut s);
        assert_eq!(s.len(), 2);
        assert_eq!(s.diagnostics()[0], s.diagnostics()[1]);
    }

    #[test]
    fn successful_reassignment_replaces_the_stored_pair() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![ParamSig::new("p", Ty::Int, RefKind::Ref)], Ty::Unit),
            vec![
                LocalSymbol::by_value("x", Ty::Int, 1, span(0, 1)),
                LocalSymbol::by_ref("rx", Ty::Int, 1, span(4, 2)),
            ],
            vec![],
        );
        let mut env = VariableEnv::new();
        env.declare(LocalId(0), declared_escape(&body, body.local(LocalId(0))));

        let x_init = BoundExpr::local(span(8, 1), Ty::Int, LocalId(0));
        let mut s = sink();
        assert!(check_local_decl(
            &body,
            &mut env,
            span(4, 8),
            LocalId(1),
            Some(&x_init),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert_eq!(env.lookup(LocalId(1)).unwrap().ref_scope, Scope::TOP_LEVEL);

        // Re-point rx at a caller-scoped parameter: the stored pair widens.
        let p = BoundExpr::parameter(span(12, 1), Ty::Int, ParamId(0));
        let rx = BoundExpr::local(span(16, 2), Ty::Int, LocalId(1));
        assert!(check_assign(
            &body,
            &mut env,
            span(12, 10),
            &rx,
            &p,
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert_eq!(
            env.lookup(LocalId(1)).unwrap().ref_scope,
            Scope::CALLING_METHOD
        );
    }

    #[test]
    fn iterator_bodies_reject_ref_locals() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![LocalSymbol::by_ref("rx", Ty::Int, 1, span(0, 2))],
            vec![],
        )
        .iterator();
        let mut env = VariableEnv::new();
        let init = BoundExpr::local(span(4, 1), Ty::Int, LocalId(0));

        let mut s = sink();
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 8),
            LocalId(0),
            Some(&init),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::IteratorOrAsyncRefLocal { .. }
        ));
    }

    #[test]
    fn nested_stackalloc_cannot_initialize_an_outer_span() {
        let inner = Scope::TOP_LEVEL.nested();
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![LocalSymbol::by_value("s", Ty::ref_like("Span"), 1, span(0, 1))],
            vec![],
        );
        let mut env = VariableEnv::new();
        let alloc = BoundExpr::stackalloc(
            span(4, 8),
            Ty::ref_like("Span"),
            BoundExpr::literal(span(6, 1), Ty::Int),
        );

        let mut s = sink();
        assert!(!check_local_decl(
            &body,
            &mut env,
            span(0, 14),
            LocalId(0),
            Some(&alloc),
            false,
            inner,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::EscapeStackalloc { .. }
        ));
    }

    #[test]
    fn value_write_through_a_readonly_alias_is_rejected() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![LocalSymbol::by_ref_readonly("y", Ty::Int, 1, span(0, 1))],
            vec![],
        );
        let mut env = VariableEnv::new();
        env.declare(LocalId(0), EscapeInfo::narrowest(Scope::CALLING_METHOD));

        let target = BoundExpr::local(span(4, 1), Ty::Int, LocalId(0));
        let value = BoundExpr::literal(span(8, 1), Ty::Int);

        let mut s = sink();
        assert!(!check_assign(
            &body,
            &mut env,
            span(4, 6),
            &target,
            &value,
            false,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::ReadonlyTarget { .. }
        ));
    }

    #[test]
    fn value_writes_through_a_ref_conditional_defer_to_its_arms() {
        // (c ? ref a : ref b) = 1 is a value write into whichever arm
        // was chosen; it succeeds only when both arms are writable.
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![
                LocalSymbol::by_value("a", Ty::Int, 1, span(0, 1)),
                LocalSymbol::by_ref_readonly("b", Ty::Int, 1, span(2, 1)),
            ],
            vec![],
        );
        let mut env = VariableEnv::new();
        let arm = |id: u32| Box::new(BoundExpr::local(span(6, 1), Ty::Int, LocalId(id)));
        let target = |when_false: Box<BoundExpr>| {
            BoundExpr::new(
                span(4, 10),
                Ty::Int,
                ExprKind::Conditional {
                    cond: Box::new(BoundExpr::literal(span(4, 1), Ty::Bool)),
                    when_true: arm(0),
                    when_false,
                    is_ref: true,
                },
            )
        };
        let value = BoundExpr::literal(span(16, 1), Ty::Int);

        let mut s = sink();
        assert!(check_assign(
            &body,
            &mut env,
            span(4, 14),
            &target(arm(0)),
            &value,
            false,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(s.is_empty());

        // One readonly arm fails the whole target.
        let mut s = sink();
        assert!(!check_assign(
            &body,
            &mut env,
            span(4, 14),
            &target(arm(1)),
            &value,
            false,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::ReadonlyTarget { .. }
        ));
    }

    #[test]
    fn ref_assignment_needs_a_ref_variable_target() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![
                LocalSymbol::by_value("x", Ty::Int, 1, span(0, 1)),
                LocalSymbol::by_value("y", Ty::Int, 1, span(2, 1)),
            ],
            vec![],
        );
        let mut env = VariableEnv::new();
        env.declare(LocalId(0), declared_escape(&body, body.local(LocalId(0))));
        env.declare(LocalId(1), declared_escape(&body, body.local(LocalId(1))));

        let target = BoundExpr::local(span(4, 1), Ty::Int, LocalId(0));
        let value = BoundExpr::local(span(10, 1), Ty::Int, LocalId(1));

        let mut s = sink();
        assert!(!check_assign(
            &body,
            &mut env,
            span(4, 8),
            &target,
            &value,
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::RefAssignTargetExpected { .. }
        ));
    }
}
