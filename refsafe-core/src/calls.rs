#![forbid(unsafe_code)]

//! Call-site escape propagation.
//!
//! A by-ref-returning call can only hand out a reference the callee
//! could itself have produced, and the callee can only have produced it
//! from its by-ref arguments, its receiver, or heap storage. The
//! invocation's escape scope is therefore the narrowest join over the
//! contributing arguments, starting from the widest possible answer for
//! an argument-free call. A stack-only value result is pinned the same
//! way: the callee may have wrapped a `ref`/`out` referent into it, so
//! those arguments contribute their ref escape in both dimensions.
//!
//! Argument mixing is the writable counterpart: a callee may store any
//! argument into any writable stack-only (`ref`/`out` ref-like)
//! argument, so every argument's value must be able to escape into the
//! narrowest such destination.

use refsafe_ast::{Argument, BoundExpr, MethodSig, ParamSig, RefKind, Span};

use crate::diagnostics::{DiagnosticSink, RefSafetyDiagnostic};
use crate::escape::{
    check_ref_escape, check_val_escape, receiver_ref_contribution, ref_escape, val_escape, EvalCx,
};
use crate::scope::Scope;

/// Ref kind an argument is effectively passed with. A by-value
/// argument matched to an `in` parameter is passed by read-only
/// reference even though the call site writes no modifier.
fn effective_ref_kind(param: &ParamSig, arg: &Argument) -> RefKind {
    if arg.ref_kind.is_by_ref() {
        arg.ref_kind
    } else if param.ref_kind == RefKind::In {
        RefKind::In
    } else {
        RefKind::None
    }
}

/// Computes how far the result of calling `callee` may escape, by
/// reference (`is_ref_escape`) or by value.
pub fn invocation_escape_scope(
    cx: EvalCx<'_>,
    callee: &MethodSig,
    receiver: Option<&BoundExpr>,
    args: &[Argument],
    local_scope: Scope,
    is_ref_escape: bool,
) -> Scope {
    let mut escape = Scope::CALLING_METHOD;

    for (param, arg) in callee.params.iter().zip(args) {
        if param.no_capture {
            continue;
        }
        // A writable referent can be wrapped into the result no matter
        // which dimension is asked for; `in` and by-value arguments
        // flow in as values unless a ref alias is being produced.
        let effective = effective_ref_kind(param, arg);
        let contribution = if effective.is_writable_reference()
            || (is_ref_escape && effective.is_by_ref())
        {
            ref_escape(cx, &arg.expr, local_scope)
        } else {
            val_escape(cx, &arg.expr, local_scope)
        };
        escape = Scope::narrower(escape, contribution);
    }

    // An omitted optional `in` parameter is filled with a temporary of
    // the current scope; a ref to the result may alias that temporary.
    if is_ref_escape
        && callee.params.len() > args.len()
        && callee.params[args.len()..]
            .iter()
            .any(|p| p.ref_kind == RefKind::In)
    {
        return local_scope;
    }

    if let Some(receiver) = receiver {
        if receiver.ty.is_ref_like() {
            escape = Scope::narrower(escape, val_escape(cx, receiver, local_scope));
        }
        if is_ref_escape {
            if let Some(r) = receiver_ref_contribution(cx, receiver, local_scope) {
                escape = Scope::narrower(escape, r);
            }
        }
    }

    escape
}

/// Validates that the result of an invocation may escape from
/// `escape_from` out to `escape_to`. Each failing argument gets its own
/// shape diagnostic from the recursive check, followed by a call-level
/// diagnostic naming the parameter that constrained the result.
#[allow(clippy::too_many_arguments)]
pub fn check_invocation_escape(
    cx: EvalCx<'_>,
    span: Span,
    callee: &MethodSig,
    receiver: Option<&BoundExpr>,
    args: &[Argument],
    escape_from: Scope,
    escape_to: Scope,
    is_ref_escape: bool,
    sink: &mut DiagnosticSink,
) -> bool {
    for (param, arg) in callee.params.iter().zip(args) {
        if param.no_capture {
            continue;
        }
        let effective = effective_ref_kind(param, arg);
        let ok = if effective.is_writable_reference()
            || (is_ref_escape && effective.is_by_ref())
        {
            check_ref_escape(cx, &arg.expr, escape_from, escape_to, false, sink)
        } else {
            check_val_escape(cx, &arg.expr, escape_from, escape_to, sink)
        };
        if !ok {
            sink.report(RefSafetyDiagnostic::CallResultEscape {
                span,
                method: callee.name.clone(),
                param: param.name.clone(),
            });
            return false;
        }
    }

    if is_ref_escape
        && callee.params.len() > args.len()
        && escape_to.is_at_least_as_wide_as(escape_from)
        && escape_to != escape_from
    {
        if let Some(param) = callee.params[args.len()..]
            .iter()
            .find(|p| p.ref_kind == RefKind::In)
        {
            sink.report(RefSafetyDiagnostic::CallResultEscape {
                span,
                method: callee.name.clone(),
                param: param.name.clone(),
            });
            return false;
        }
    }

    if let Some(receiver) = receiver {
        if receiver.ty.is_ref_like()
            && !check_val_escape(cx, receiver, escape_from, escape_to, sink)
        {
            sink.report(RefSafetyDiagnostic::CallResultEscape {
                span,
                method: callee.name.clone(),
                param: "this".into(),
            });
            return false;
        }
        if is_ref_escape
            && receiver_ref_contribution(cx, receiver, escape_from).is_some()
            && !check_ref_escape(cx, receiver, escape_from, escape_to, true, sink)
        {
            sink.report(RefSafetyDiagnostic::CallResultEscape {
                span,
                method: callee.name.clone(),
                param: "this".into(),
            });
            return false;
        }
    }

    true
}

/// Validates that no argument smuggles a narrower-scoped value into a
/// wider-scoped writable stack-only argument of the same call.
pub fn check_invocation_arg_mixing(
    cx: EvalCx<'_>,
    span: Span,
    callee: &MethodSig,
    receiver: Option<&BoundExpr>,
    args: &[Argument],
    local_scope: Scope,
    sink: &mut DiagnosticSink,
) -> bool {
    // The callee may store into any writable ref-like destination it
    // was handed; the binding demand is the narrowest such destination.
    let mut escape_to = Scope::CALLING_METHOD;

    for (param, arg) in callee.params.iter().zip(args) {
        if effective_ref_kind(param, arg).is_writable_reference() && arg.expr.ty.is_ref_like() {
            escape_to = Scope::narrower(escape_to, val_escape(cx, &arg.expr, local_scope));
        }
    }
    if let Some(receiver) = receiver {
        // A non-readonly member of a stack-only struct receives `this`
        // as a writable reference.
        if receiver.ty.is_ref_like() && !callee.is_readonly {
            escape_to = Scope::narrower(escape_to, val_escape(cx, receiver, local_scope));
        }
    }

    if escape_to == Scope::CALLING_METHOD {
        return true;
    }

    let mut ok = true;
    for (param, arg) in callee.params.iter().zip(args) {
        if !check_val_escape(cx, &arg.expr, local_scope, escape_to, sink) {
            sink.report(RefSafetyDiagnostic::ArgMixing {
                span,
                method: callee.name.clone(),
                param: param.name.clone(),
            });
            ok = false;
        }
    }
    if let Some(receiver) = receiver {
        if receiver.ty.is_ref_like()
            && !check_val_escape(cx, receiver, local_scope, escape_to, sink)
        {
            sink.report(RefSafetyDiagnostic::ArgMixing {
                span,
                method: callee.name.clone(),
                param: "this".into(),
            });
            ok = false;
        }
    }
    ok
}
