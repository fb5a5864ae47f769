#![forbid(unsafe_code)]

//! The escape-scope evaluator: a structural recursion over bound
//! expressions computing how far a reference to the expression's
//! storage (`ref_escape`) and a copy of its value (`val_escape`) may
//! safely travel.
//!
//! Each compute function has a checking counterpart that validates a
//! concrete escape demand and reports a diagnostic shaped by what the
//! failing expression is (plain local, member of local, parameter,
//! struct `this`, call result, ...). Checks are local and recoverable:
//! a failure emits and returns `false`, the walk continues.

use refsafe_ast::{BoundExpr, ExprKind, MethodBody, Receiver, Ty};

use crate::calls::{check_invocation_escape, invocation_escape_scope};
use crate::diagnostics::{DiagnosticSink, ReadonlyCategory, RefSafetyDiagnostic};
use crate::env::VariableEnv;
use crate::scope::{EscapeInfo, Scope};

/// Read-only context for one evaluation: the method body under
/// analysis and the current variable environment.
#[derive(Clone, Copy)]
pub struct EvalCx<'a> {
    pub body: &'a MethodBody,
    pub env: &'a VariableEnv,
}

impl<'a> EvalCx<'a> {
    pub fn new(body: &'a MethodBody, env: &'a VariableEnv) -> Self {
        EvalCx { body, env }
    }
}

/// Computes the full escape pair for an expression.
pub fn evaluate(cx: EvalCx<'_>, expr: &BoundExpr, local_scope: Scope) -> EscapeInfo {
    EscapeInfo::new(
        ref_escape(cx, expr, local_scope),
        val_escape(cx, expr, local_scope),
    )
}

/// The widest scope a reference to this expression's storage is valid
/// within. Expressions that denote no storage (rvalues) pin to the
/// current scope, the narrowest possible answer.
pub fn ref_escape(cx: EvalCx<'_>, expr: &BoundExpr, local_scope: Scope) -> Scope {
    match &expr.kind {
        // Heap storage outlives any method.
        ExprKind::ArrayElement { .. } => Scope::CALLING_METHOD,

        ExprKind::Local(id) => cx
            .env
            .lookup(*id)
            .map(|info| info.ref_scope)
            .unwrap_or(local_scope),

        ExprKind::Parameter(id) => {
            let param = cx.body.param(*id);
            if param.ref_kind.is_by_ref() {
                Scope::CALLING_METHOD
            } else {
                // By-value parameters are aliasable anywhere in the
                // method but not beyond it.
                Scope::TOP_LEVEL
            }
        }

        ExprKind::This => match cx.body.sig.receiver {
            // Struct `this` is an alias into the caller's storage that
            // must not be returned by reference.
            Receiver::Struct => Scope::TOP_LEVEL,
            // Class `this` is an rvalue for aliasing purposes.
            Receiver::Class | Receiver::Static => local_scope,
        },

        ExprKind::Field { receiver, field } => {
            if field.is_static || field.containing_is_class {
                Scope::CALLING_METHOD
            } else {
                // A struct field cannot outlive its containing value.
                receiver
                    .as_deref()
                    .map(|r| ref_escape(cx, r, local_scope))
                    .unwrap_or(Scope::CALLING_METHOD)
            }
        }

        ExprKind::Call {
            callee,
            receiver,
            args,
        } => {
            if callee.returns_by_ref {
                invocation_escape_scope(cx, callee, receiver.as_deref(), args, local_scope, true)
            } else {
                local_scope
            }
        }

        ExprKind::Conditional {
            when_true,
            when_false,
            is_ref,
            ..
        } => {
            if *is_ref {
                // The whole expression is only as wide as its most
                // restrictive arm.
                Scope::narrower(
                    ref_escape(cx, when_true, local_scope),
                    ref_escape(cx, when_false, local_scope),
                )
            } else {
                local_scope
            }
        }

        // Everything else is a plain value; a reference to it would be
        // a reference to a temporary of the current scope.
        ExprKind::Literal
        | ExprKind::StackAlloc { .. }
        | ExprKind::New { .. }
        | ExprKind::Binary { .. }
        | ExprKind::Conversion { .. }
        | ExprKind::Tuple(_)
        | ExprKind::MethodGroup(_)
        | ExprKind::RangeVariable(_)
        | ExprKind::Discard
        | ExprKind::DynamicMember { .. }
        | ExprKind::Lambda { .. }
        | ExprKind::Await(_) => local_scope,
    }
}

/// The widest scope a copy of this expression's value is valid within.
/// Unless the type is stack-only this is always the calling method:
/// ordinary values can be stored anywhere.
pub fn val_escape(cx: EvalCx<'_>, expr: &BoundExpr, local_scope: Scope) -> Scope {
    if !expr.ty.is_ref_like() {
        return Scope::CALLING_METHOD;
    }

    match &expr.kind {
        // Stack-only parameters and `this` are as wide as the call
        // allows.
        ExprKind::Literal | ExprKind::Parameter(_) | ExprKind::This | ExprKind::Discard => {
            Scope::CALLING_METHOD
        }

        ExprKind::Local(id) => cx
            .env
            .lookup(*id)
            .map(|info| info.val_scope)
            .unwrap_or(local_scope),

        // Stack memory of the current block; never assignable to an
        // outer-scoped variable and never returnable.
        ExprKind::StackAlloc { .. } => local_scope,

        ExprKind::Field { receiver, field } => {
            if field.is_static || !field.containing_is_ref_like {
                Scope::CALLING_METHOD
            } else {
                receiver
                    .as_deref()
                    .map(|r| val_escape(cx, r, local_scope))
                    .unwrap_or(Scope::CALLING_METHOD)
            }
        }

        ExprKind::Call {
            callee,
            receiver,
            args,
        } => invocation_escape_scope(cx, callee, receiver.as_deref(), args, local_scope, false),

        ExprKind::New { ctor, args } => {
            invocation_escape_scope(cx, ctor, None, args, local_scope, false)
        }

        ExprKind::Conditional {
            when_true,
            when_false,
            ..
        } => Scope::narrower(
            val_escape(cx, when_true, local_scope),
            val_escape(cx, when_false, local_scope),
        ),

        ExprKind::Binary { left, right } => Scope::narrower(
            val_escape(cx, left, local_scope),
            val_escape(cx, right, local_scope),
        ),

        ExprKind::Conversion { operand, .. } => val_escape(cx, operand, local_scope),

        ExprKind::Tuple(elements) => elements.iter().fold(Scope::CALLING_METHOD, |acc, e| {
            Scope::narrower(acc, val_escape(cx, e, local_scope))
        }),

        ExprKind::ArrayElement { .. } | ExprKind::DynamicMember { .. } => Scope::CALLING_METHOD,

        ExprKind::MethodGroup(_) | ExprKind::RangeVariable(_) | ExprKind::Lambda { .. } => {
            Scope::CALLING_METHOD
        }

        // A stack-only value surviving an await is rejected elsewhere;
        // give the narrowest answer so nothing widens through it.
        ExprKind::Await(_) => local_scope,
    }
}

/// Validates that a reference to `expr` may escape from `escape_from`
/// out to `escape_to`, reporting a shape-specific diagnostic when not.
pub fn check_ref_escape(
    cx: EvalCx<'_>,
    expr: &BoundExpr,
    escape_from: Scope,
    escape_to: Scope,
    checking_receiver: bool,
    sink: &mut DiagnosticSink,
) -> bool {
    // Escaping to the same or a narrower scope always succeeds.
    if escape_from.is_at_least_as_wide_as(escape_to) {
        return true;
    }

    let to_caller = escape_to == Scope::RETURN_ONLY;

    match &expr.kind {
        ExprKind::ArrayElement { .. } => true,

        ExprKind::Local(id) => {
            let local = cx.body.local(*id);
            let current = cx
                .env
                .lookup(*id)
                .map(|info| info.ref_scope)
                .unwrap_or(escape_from);
            if current.is_at_least_as_wide_as(escape_to) {
                return true;
            }
            sink.report(match (to_caller && !local.is_ref_kind(), checking_receiver) {
                (true, false) => RefSafetyDiagnostic::RefReturnLocal {
                    span: expr.span,
                    name: local.name.clone(),
                },
                (true, true) => RefSafetyDiagnostic::RefReturnLocalMember {
                    span: expr.span,
                    name: local.name.clone(),
                },
                (false, _) => RefSafetyDiagnostic::EscapeLocal {
                    span: expr.span,
                    name: local.name.clone(),
                },
            });
            false
        }

        ExprKind::Parameter(id) => {
            let param = cx.body.param(*id);
            if param.ref_kind.is_by_ref() {
                return true;
            }
            // A by-value parameter alias reaches the method top level
            // only; any deeper demand already returned true above.
            sink.report(if checking_receiver {
                RefSafetyDiagnostic::RefReturnParameterMember {
                    span: expr.span,
                    name: param.name.clone(),
                }
            } else {
                RefSafetyDiagnostic::RefReturnParameter {
                    span: expr.span,
                    name: param.name.clone(),
                }
            });
            false
        }

        ExprKind::This => {
            match cx.body.sig.receiver {
                Receiver::Struct => {
                    sink.report(RefSafetyDiagnostic::StructThisEscape { span: expr.span });
                }
                Receiver::Class | Receiver::Static => {
                    // Returning class `this` by reference is rejected
                    // by policy, not by lifetime.
                    sink.report(if to_caller {
                        RefSafetyDiagnostic::RefReturnClassThis { span: expr.span }
                    } else {
                        RefSafetyDiagnostic::EscapeOther { span: expr.span }
                    });
                }
            }
            false
        }

        ExprKind::Field { receiver, field } => {
            if field.is_static || field.containing_is_class {
                return true;
            }
            match receiver.as_deref() {
                Some(r) => check_ref_escape(cx, r, escape_from, escape_to, true, sink),
                None => true,
            }
        }

        ExprKind::Call {
            callee,
            receiver,
            args,
        } => {
            if callee.returns_by_ref {
                check_invocation_escape(
                    cx,
                    expr.span,
                    callee,
                    receiver.as_deref(),
                    args,
                    escape_from,
                    escape_to,
                    true,
                    sink,
                )
            } else {
                sink.report(rvalue_error(expr, to_caller));
                false
            }
        }

        ExprKind::Conditional {
            when_true,
            when_false,
            is_ref,
            ..
        } => {
            if *is_ref {
                // Both arms must individually satisfy the demand.
                let t = check_ref_escape(cx, when_true, escape_from, escape_to, false, sink);
                let f = check_ref_escape(cx, when_false, escape_from, escape_to, false, sink);
                t && f
            } else {
                sink.report(rvalue_error(expr, to_caller));
                false
            }
        }

        ExprKind::RangeVariable(name) => {
            // Dedicated rejection, independent of scope.
            sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                span: expr.span,
                category: ReadonlyCategory::RangeVariable,
                name: name.clone(),
            });
            false
        }

        ExprKind::StackAlloc { .. } => {
            sink.report(RefSafetyDiagnostic::EscapeStackalloc { span: expr.span });
            false
        }

        ExprKind::Literal
        | ExprKind::New { .. }
        | ExprKind::Binary { .. }
        | ExprKind::Conversion { .. }
        | ExprKind::Tuple(_)
        | ExprKind::MethodGroup(_)
        | ExprKind::Discard
        | ExprKind::DynamicMember { .. }
        | ExprKind::Lambda { .. }
        | ExprKind::Await(_) => {
            sink.report(rvalue_error(expr, to_caller));
            false
        }
    }
}

/// Validates that a copy of `expr`'s value may escape out to
/// `escape_to`. Only stack-only values can fail.
pub fn check_val_escape(
    cx: EvalCx<'_>,
    expr: &BoundExpr,
    escape_from: Scope,
    escape_to: Scope,
    sink: &mut DiagnosticSink,
) -> bool {
    if escape_from.is_at_least_as_wide_as(escape_to) {
        return true;
    }

    if !expr.ty.is_ref_like() {
        return true;
    }

    match &expr.kind {
        ExprKind::Literal | ExprKind::Parameter(_) | ExprKind::This | ExprKind::Discard => true,

        ExprKind::Local(id) => {
            let current = cx
                .env
                .lookup(*id)
                .map(|info| info.val_scope)
                .unwrap_or(escape_from);
            if current.is_at_least_as_wide_as(escape_to) {
                return true;
            }
            sink.report(RefSafetyDiagnostic::EscapeLocal {
                span: expr.span,
                name: cx.body.local(*id).name.clone(),
            });
            false
        }

        ExprKind::StackAlloc { .. } => {
            sink.report(RefSafetyDiagnostic::EscapeStackalloc { span: expr.span });
            false
        }

        ExprKind::Field { receiver, field } => {
            if field.is_static || !field.containing_is_ref_like {
                return true;
            }
            match receiver.as_deref() {
                Some(r) => check_val_escape(cx, r, escape_from, escape_to, sink),
                None => true,
            }
        }

        ExprKind::Call {
            callee,
            receiver,
            args,
        } => check_invocation_escape(
            cx,
            expr.span,
            callee,
            receiver.as_deref(),
            args,
            escape_from,
            escape_to,
            false,
            sink,
        ),

        ExprKind::New { ctor, args } => check_invocation_escape(
            cx, expr.span, ctor, None, args, escape_from, escape_to, false, sink,
        ),

        ExprKind::Conditional {
            when_true,
            when_false,
            ..
        } => {
            let t = check_val_escape(cx, when_true, escape_from, escape_to, sink);
            let f = check_val_escape(cx, when_false, escape_from, escape_to, sink);
            t && f
        }

        ExprKind::Binary { left, right } => {
            let l = check_val_escape(cx, left, escape_from, escape_to, sink);
            let r = check_val_escape(cx, right, escape_from, escape_to, sink);
            l && r
        }

        ExprKind::Conversion { operand, .. } => {
            check_val_escape(cx, operand, escape_from, escape_to, sink)
        }

        ExprKind::Tuple(elements) => {
            let mut ok = true;
            for element in elements {
                ok &= check_val_escape(cx, element, escape_from, escape_to, sink);
            }
            ok
        }

        ExprKind::ArrayElement { .. }
        | ExprKind::DynamicMember { .. }
        | ExprKind::MethodGroup(_)
        | ExprKind::RangeVariable(_)
        | ExprKind::Lambda { .. } => true,

        ExprKind::Await(_) => {
            sink.report(RefSafetyDiagnostic::EscapeOther { span: expr.span });
            false
        }
    }
}

fn rvalue_error(expr: &BoundExpr, to_caller: bool) -> RefSafetyDiagnostic {
    if to_caller {
        RefSafetyDiagnostic::NotAnLvalue { span: expr.span }
    } else {
        RefSafetyDiagnostic::EscapeOther { span: expr.span }
    }
}

/// Struct-typed lvalue receivers of by-ref-returning members narrow
/// the call result by their own ref escape; class and dynamic
/// receivers never do.
pub(crate) fn receiver_ref_contribution(
    cx: EvalCx<'_>,
    receiver: &BoundExpr,
    local_scope: Scope,
) -> Option<Scope> {
    match receiver.ty {
        Ty::Struct { .. } if receiver.is_addressable() => {
            Some(ref_escape(cx, receiver, local_scope))
        }
        _ => None,
    }
}
