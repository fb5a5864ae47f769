#![forbid(unsafe_code)]

//! Return and yield validation, plus the lambda-shaped rules that hang
//! off it: by-ref returns out of expression trees, ref-local capture by
//! closures, and references held across suspension points.

use refsafe_ast::{
    BodyKind, BoundExpr, BoundStmt, ExprKind, LambdaKind, LocalId, MethodBody, Span,
};
use std::collections::HashSet;

use crate::diagnostics::{DiagnosticSink, RefSafetyDiagnostic};
use crate::env::VariableEnv;
use crate::escape::{check_ref_escape, check_val_escape, EvalCx};
use crate::readonly::check_writable;
use crate::scope::Scope;

/// Signature-level contract of a resumable body: an iterator or async
/// method can never return by reference.
pub fn check_body_shape(body: &MethodBody, sink: &mut DiagnosticSink) -> bool {
    if body.sig.returns_by_ref && body.kind != BodyKind::Ordinary {
        sink.report(RefSafetyDiagnostic::RefReturningIteratorOrAsync {
            span: first_span(&body.stmts).unwrap_or_else(|| refsafe_ast::span(0, 0)),
        });
        false
    } else {
        true
    }
}

/// Validates one `return` statement. An empty `return;` counts as a
/// by-value return for the contract check.
pub fn validate_return(
    body: &MethodBody,
    env: &VariableEnv,
    span: Span,
    value: Option<&BoundExpr>,
    is_ref: bool,
    local_scope: Scope,
    sink: &mut DiagnosticSink,
) -> bool {
    if is_ref && !body.sig.returns_by_ref {
        sink.report(RefSafetyDiagnostic::MustHaveRefReturn { span });
        return false;
    }
    if !is_ref && body.sig.returns_by_ref {
        sink.report(RefSafetyDiagnostic::MustNotHaveRefReturn { span });
        return false;
    }

    let Some(value) = value else {
        return true;
    };
    let cx = EvalCx::new(body, env);

    if is_ref {
        let mut ok = true;
        // The caller receives a writable alias unless the signature
        // promises readonly.
        if !body.sig.ref_readonly_return {
            ok &= check_writable(cx, value, sink);
        }
        ok && check_ref_escape(cx, value, local_scope, Scope::RETURN_ONLY, false, sink)
    } else {
        check_val_escape(cx, value, local_scope, Scope::CALLING_METHOD, sink)
    }
}

/// Validates one `yield return` value: the yielded value surfaces in
/// the caller, so it must escape that far.
pub fn validate_yield(
    body: &MethodBody,
    env: &VariableEnv,
    value: &BoundExpr,
    local_scope: Scope,
    sink: &mut DiagnosticSink,
) -> bool {
    let cx = EvalCx::new(body, env);
    check_val_escape(cx, value, local_scope, Scope::CALLING_METHOD, sink)
}

/// Validates a lambda or local function found inside the body under
/// analysis: expression-tree conversion of by-ref returns, by-ref calls
/// inside expression trees, and capture of enclosing ref locals.
pub fn check_lambda(
    body: &MethodBody,
    span: Span,
    kind: LambdaKind,
    returns_by_ref: bool,
    stmts: &[BoundStmt],
    sink: &mut DiagnosticSink,
) -> bool {
    let mut ok = true;

    if kind == LambdaKind::ExpressionTree {
        if returns_by_ref {
            sink.report(RefSafetyDiagnostic::ExpressionTreeRefReturningLambda { span });
            ok = false;
        }
        for_each_expr(stmts, &mut |expr| {
            if let ExprKind::Call { callee, .. } = &expr.kind {
                if callee.returns_by_ref {
                    sink.report(RefSafetyDiagnostic::ExpressionTreeRefReturningCall {
                        span: expr.span,
                        method: callee.name.clone(),
                    });
                    ok = false;
                }
            }
        });
    }

    // The closure's frame outlives (or is unrelated to) the enclosing
    // stack frame, so an enclosing ref local may not be touched at all.
    let own_locals = declared_locals(stmts);
    for_each_expr(stmts, &mut |expr| {
        if let ExprKind::Local(id) = &expr.kind {
            if own_locals.contains(id) {
                return;
            }
            let local = body.local(*id);
            if local.is_ref_kind() {
                sink.report(RefSafetyDiagnostic::ClosureCapturesRefLocal {
                    span: expr.span,
                    name: local.name.clone(),
                });
                ok = false;
            }
        }
    });

    ok
}

/// In a resumable body, a by-ref-returning call's result may not stay
/// live while a later argument of the same invocation awaits: the frame
/// is unwound into the state machine at the suspension and the
/// reference would dangle. `expr` must be a `Call` or `New` node.
pub fn check_across_suspension(expr: &BoundExpr, sink: &mut DiagnosticSink) -> bool {
    let (receiver, args) = match &expr.kind {
        ExprKind::Call { receiver, args, .. } => (receiver.as_deref(), args.as_slice()),
        ExprKind::New { args, .. } => (None, args.as_slice()),
        _ => return true,
    };

    let mut live_ref_call: Option<String> = receiver.and_then(by_ref_call_inside);
    let mut ok = true;
    for arg in args {
        if let Some(method) = &live_ref_call {
            if contains_await(&arg.expr) {
                sink.report(RefSafetyDiagnostic::RefAcrossSuspension {
                    span: expr.span,
                    method: method.clone(),
                });
                ok = false;
                break;
            }
        }
        if live_ref_call.is_none() {
            live_ref_call = by_ref_call_inside(&arg.expr);
        }
    }
    ok
}

fn by_ref_call_inside(expr: &BoundExpr) -> Option<String> {
    let mut found = None;
    visit_expr(expr, &mut |e| {
        if found.is_none() {
            if let ExprKind::Call { callee, .. } = &e.kind {
                if callee.returns_by_ref {
                    found = Some(callee.name.clone());
                }
            }
        }
    });
    found
}

fn contains_await(expr: &BoundExpr) -> bool {
    let mut found = false;
    visit_expr(expr, &mut |e| {
        if matches!(e.kind, ExprKind::Await(_)) {
            found = true;
        }
    });
    found
}

fn declared_locals(stmts: &[BoundStmt]) -> HashSet<LocalId> {
    let mut ids = HashSet::new();
    collect_declared(stmts, &mut ids);
    ids
}

fn collect_declared(stmts: &[BoundStmt], ids: &mut HashSet<LocalId>) {
    for stmt in stmts {
        match stmt {
            BoundStmt::LocalDecl { local, .. } => {
                ids.insert(*local);
            }
            BoundStmt::Foreach { local, body, .. } => {
                ids.insert(*local);
                collect_declared(body, ids);
            }
            BoundStmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                collect_declared(then_branch, ids);
                collect_declared(else_branch, ids);
            }
            BoundStmt::While { body, .. } => collect_declared(body, ids),
            BoundStmt::Block(body) => collect_declared(body, ids),
            _ => {}
        }
    }
}

fn first_span(stmts: &[BoundStmt]) -> Option<Span> {
    stmts.first().map(|stmt| match stmt {
        BoundStmt::LocalDecl { span, .. }
        | BoundStmt::Assign { span, .. }
        | BoundStmt::Return { span, .. }
        | BoundStmt::Yield { span, .. }
        | BoundStmt::Foreach { span, .. } => *span,
        BoundStmt::Expr(expr) => expr.span,
        BoundStmt::If { cond, .. } | BoundStmt::While { cond, .. } => cond.span,
        BoundStmt::Block(inner) => {
            first_span(inner).unwrap_or_else(|| refsafe_ast::span(0, 0))
        }
    })
}

/// Applies `f` to every expression in the statement list, outside-in.
fn for_each_expr(stmts: &[BoundStmt], f: &mut impl FnMut(&BoundExpr)) {
    for stmt in stmts {
        match stmt {
            BoundStmt::LocalDecl { init, .. } => {
                if let Some(init) = init {
                    visit_expr(init, f);
                }
            }
            BoundStmt::Assign { target, value, .. } => {
                visit_expr(target, f);
                visit_expr(value, f);
            }
            BoundStmt::Expr(expr) => visit_expr(expr, f),
            BoundStmt::Return { value, .. } => {
                if let Some(value) = value {
                    visit_expr(value, f);
                }
            }
            BoundStmt::Yield { value, .. } => visit_expr(value, f),
            BoundStmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                visit_expr(cond, f);
                for_each_expr(then_branch, f);
                for_each_expr(else_branch, f);
            }
            BoundStmt::While { cond, body } => {
                visit_expr(cond, f);
                for_each_expr(body, f);
            }
            BoundStmt::Foreach { source, body, .. } => {
                visit_expr(source, f);
                for_each_expr(body, f);
            }
            BoundStmt::Block(body) => for_each_expr(body, f),
        }
    }
}

fn visit_expr(expr: &BoundExpr, f: &mut impl FnMut(&BoundExpr)) {
    f(expr);
    match &expr.kind {
        ExprKind::Field { receiver, .. } => {
            if let Some(receiver) = receiver {
                visit_expr(receiver, f);
            }
        }
        ExprKind::ArrayElement { array, index } => {
            visit_expr(array, f);
            visit_expr(index, f);
        }
        ExprKind::StackAlloc { count } => visit_expr(count, f),
        ExprKind::New { args, .. } => {
            for arg in args {
                visit_expr(&arg.expr, f);
            }
        }
        ExprKind::Call { receiver, args, .. } => {
            if let Some(receiver) = receiver {
                visit_expr(receiver, f);
            }
            for arg in args {
                visit_expr(&arg.expr, f);
            }
        }
        ExprKind::Conditional {
            cond,
            when_true,
            when_false,
            ..
        } => {
            visit_expr(cond, f);
            visit_expr(when_true, f);
            visit_expr(when_false, f);
        }
        ExprKind::Binary { left, right } => {
            visit_expr(left, f);
            visit_expr(right, f);
        }
        ExprKind::Conversion { operand, .. } => visit_expr(operand, f),
        ExprKind::Tuple(elements) => {
            for element in elements {
                visit_expr(element, f);
            }
        }
        ExprKind::DynamicMember { receiver, .. } => visit_expr(receiver, f),
        ExprKind::Lambda { body, .. } => for_each_expr(body, f),
        ExprKind::Await(operand) => visit_expr(operand, f),
        ExprKind::Literal
        | ExprKind::Local(_)
        | ExprKind::Parameter(_)
        | ExprKind::This
        | ExprKind::MethodGroup(_)
        | ExprKind::RangeVariable(_)
        | ExprKind::Discard => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SeverityConfig;
    use refsafe_ast::{
        span, Argument, LocalSymbol, MethodSig, ParamId, ParamSig, Receiver, RefKind, Ty,
    };

    fn sink() -> DiagnosticSink {
        DiagnosticSink::new(SeverityConfig::default(), false)
    }

    #[test]
    fn return_contract_is_checked_before_any_scope() {
        let by_val = MethodBody::new(MethodSig::by_value("m", vec![], Ty::Int), vec![], vec![]);
        let env = VariableEnv::new();
        let value = BoundExpr::literal(span(0, 1), Ty::Int);

        let mut s = sink();
        assert!(!validate_return(
            &by_val,
            &env,
            span(0, 10),
            Some(&value),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::MustHaveRefReturn { .. }
        ));

        let by_ref = MethodBody::new(MethodSig::by_ref("m", vec![], Ty::Int), vec![], vec![]);
        let mut s = sink();
        // An empty return is treated as by-value.
        assert!(!validate_return(
            &by_ref,
            &env,
            span(0, 7),
            None,
            false,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::MustNotHaveRefReturn { .. }
        ));
    }

    #[test]
    fn struct_members_cannot_ref_return_their_own_fields() {
        // struct method: ref int m() { return ref this.field; }
        let body = MethodBody::new(
            MethodSig::by_ref("m", vec![], Ty::Int).with_receiver(Receiver::Struct),
            vec![],
            vec![],
        );
        let env = VariableEnv::new();
        let this = BoundExpr::this(span(11, 4), Ty::plain_struct("S"));
        let field = BoundExpr::field(
            span(11, 10),
            this,
            refsafe_ast::FieldSig::new("field", Ty::Int, "S"),
        );

        let mut s = sink();
        assert!(!validate_return(
            &body,
            &env,
            span(0, 22),
            Some(&field),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(s
            .diagnostics()
            .iter()
            .any(|d| matches!(d.diagnostic, RefSafetyDiagnostic::StructThisEscape { .. })));
    }

    #[test]
    fn ref_readonly_return_skips_the_writable_gate() {
        let sig = MethodSig::by_ref("m", vec![ParamSig::new("p", Ty::Int, RefKind::In)], Ty::Int)
            .ref_readonly();
        let body = MethodBody::new(sig, vec![], vec![]);
        let env = VariableEnv::new();
        let p = BoundExpr::parameter(span(0, 1), Ty::Int, ParamId(0));

        let mut s = sink();
        assert!(validate_return(
            &body,
            &env,
            span(0, 12),
            Some(&p),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(s.is_empty());

        // The same return through a writable-ref signature trips the gate.
        let writable = MethodBody::new(
            MethodSig::by_ref("m", vec![ParamSig::new("p", Ty::Int, RefKind::In)], Ty::Int),
            vec![],
            vec![],
        );
        let mut s = sink();
        assert!(!validate_return(
            &writable,
            &env,
            span(0, 12),
            Some(&p),
            true,
            Scope::TOP_LEVEL,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::ReadonlyTarget { .. }
        ));
    }

    #[test]
    fn resumable_bodies_cannot_return_by_ref_at_all() {
        let body = MethodBody::new(MethodSig::by_ref("m", vec![], Ty::Int), vec![], vec![])
            .asynchronous();
        let mut s = sink();
        assert!(!check_body_shape(&body, &mut s));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::RefReturningIteratorOrAsync { .. }
        ));
    }

    #[test]
    fn expression_tree_lambdas_reject_by_ref_calls() {
        let body = MethodBody::new(MethodSig::by_value("m", vec![], Ty::Unit), vec![], vec![]);
        let by_ref_call = BoundExpr::call(
            span(5, 6),
            MethodSig::by_ref("first", vec![], Ty::Int),
            None,
            vec![],
        );
        let stmts = vec![BoundStmt::Expr(by_ref_call)];

        let mut s = sink();
        assert!(!check_lambda(
            &body,
            span(0, 12),
            LambdaKind::ExpressionTree,
            false,
            &stmts,
            &mut s
        ));
        assert!(matches!(
            s.diagnostics()[0].diagnostic,
            RefSafetyDiagnostic::ExpressionTreeRefReturningCall { .. }
        ));
    }

    #[test]
    fn closures_cannot_touch_enclosing_ref_locals() {
        let body = MethodBody::new(
            MethodSig::by_value("m", vec![], Ty::Unit),
            vec![
                LocalSymbol::by_ref("rx", Ty::Int, 1, span(0, 2)),
                LocalSymbol::by_value("inner", Ty::Int, 2, span(10, 5)),
            ],
            vec![],
        );
        // Lambda declares `inner`, reads `rx` from the enclosing frame.
        let stmts = vec![
            BoundStmt::LocalDecl {
                span: span(10, 9),
                local: refsafe_ast::LocalId(1),
                init: Some(BoundExpr::literal(span(18, 1), Ty::Int)),
                init_is_ref: false,
            },
            BoundStmt::Expr(BoundExpr::local(span(20, 2), Ty::Int, refsafe_ast::LocalId(0))),
        ];

        let mut s = sink();
        assert!(!check_lambda(
            &body,
            span(8, 16),
            LambdaKind::Escaping,
            false,
            &stmts,
            &mut s
        ));
        match &s.diagnostics()[0].diagnostic {
            RefSafetyDiagnostic::ClosureCapturesRefLocal { name, .. } => assert_eq!(name, "rx"),
            other => panic!("unexpected diagnostic {other:?}"),
        }
    }

    #[test]
    fn ref_result_held_across_an_await_is_rejected() {
        // outer(first(), await task)
        let first = BoundExpr::call(
            span(6, 7),
            MethodSig::by_ref("first", vec![], Ty::Int),
            None,
            vec![],
        );
        let awaited = BoundExpr::new(
            span(15, 10),
            Ty::Int,
            ExprKind::Await(Box::new(BoundExpr::literal(span(21, 4), Ty::Int))),
        );
        let outer = BoundExpr::call(
            span(0, 26),
            MethodSig::by_value(
                "outer",
                vec![
                    ParamSig::new("a", Ty::Int, RefKind::None),
                    ParamSig::new("b", Ty::Int, RefKind::None),
                ],
                Ty::Unit,
            ),
            None,
            vec![Argument::by_value(first), Argument::by_value(awaited)],
        );

        let mut s = sink();
        assert!(!check_across_suspension(&outer, &mut s));
        match &s.diagnostics()[0].diagnostic {
            RefSafetyDiagnostic::RefAcrossSuspension { method, .. } => assert_eq!(method, "first"),
            other => panic!("unexpected diagnostic {other:?}"),
        }

        // Await before the by-ref call is fine: nothing is live yet.
        let reordered = BoundExpr::call(
            span(0, 26),
            MethodSig::by_value(
                "outer",
                vec![
                    ParamSig::new("a", Ty::Int, RefKind::None),
                    ParamSig::new("b", Ty::Int, RefKind::None),
                ],
                Ty::Unit,
            ),
            None,
            vec![
                Argument::by_value(BoundExpr::new(
                    span(6, 10),
                    Ty::Int,
                    ExprKind::Await(Box::new(BoundExpr::literal(span(12, 4), Ty::Int))),
                )),
                Argument::by_value(BoundExpr::call(
                    span(17, 7),
                    MethodSig::by_ref("first", vec![], Ty::Int),
                    None,
                    vec![],
                )),
            ],
        );
        let mut s = sink();
        assert!(check_across_suspension(&reordered, &mut s));
    }
}
