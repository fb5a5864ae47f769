#![forbid(unsafe_code)]

//! The readonly/mutability gate.
//!
//! Runs before any scope computation wherever a writable reference is
//! demanded: the target of a ref assignment, a `ref`/`out` argument, a
//! ref return of a non-readonly ref, the receiver of a mutating member.
//! Rejection is by category membership, never by scope, so widening a
//! binding can never bypass it.

use refsafe_ast::{BoundExpr, ConversionKind, ExprKind, LocalOrigin, Receiver, RefKind};

use crate::diagnostics::{DiagnosticSink, ReadonlyCategory, RefSafetyDiagnostic};
use crate::escape::EvalCx;

/// Demands only that the expression denote addressable storage. This
/// is the weaker gate used for `ref readonly` bindings and `in`
/// arguments, which tolerate readonly sources.
pub fn check_addressable(expr: &BoundExpr, sink: &mut DiagnosticSink) -> bool {
    if expr.is_addressable() {
        true
    } else {
        sink.report(RefSafetyDiagnostic::NotAnLvalue { span: expr.span });
        false
    }
}

/// Demands addressable storage that is also writable through.
pub fn check_writable(cx: EvalCx<'_>, expr: &BoundExpr, sink: &mut DiagnosticSink) -> bool {
    match &expr.kind {
        ExprKind::Local(id) => {
            let local = cx.body.local(*id);
            match local.origin {
                LocalOrigin::Foreach { writable_ref: false } => {
                    sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                        span: expr.span,
                        category: ReadonlyCategory::ForeachVariable,
                        name: local.name.clone(),
                    });
                    false
                }
                LocalOrigin::RangeVariable => {
                    sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                        span: expr.span,
                        category: ReadonlyCategory::RangeVariable,
                        name: local.name.clone(),
                    });
                    false
                }
                _ if local.is_ref_readonly => {
                    sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                        span: expr.span,
                        category: ReadonlyCategory::RefReadonlyLocal,
                        name: local.name.clone(),
                    });
                    false
                }
                _ => true,
            }
        }

        ExprKind::Parameter(id) => {
            let param = cx.body.param(*id);
            if param.ref_kind == RefKind::In {
                sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                    span: expr.span,
                    category: ReadonlyCategory::InParameter,
                    name: param.name.clone(),
                });
                false
            } else {
                true
            }
        }

        ExprKind::This => match cx.body.sig.receiver {
            Receiver::Struct if cx.body.sig.is_readonly => {
                sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                    span: expr.span,
                    category: ReadonlyCategory::ReadonlyStructThis,
                    name: "this".into(),
                });
                false
            }
            Receiver::Struct => true,
            Receiver::Class | Receiver::Static => {
                sink.report(RefSafetyDiagnostic::NotAnLvalue { span: expr.span });
                false
            }
        },

        ExprKind::Field { receiver, field } => {
            if field.is_readonly && !writable_in_own_ctor(cx, field, receiver.as_deref()) {
                sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                    span: expr.span,
                    category: if field.is_static {
                        ReadonlyCategory::StaticReadonlyField
                    } else {
                        ReadonlyCategory::ReadonlyField
                    },
                    name: field.name.clone(),
                });
                false
            } else if !field.is_static && !field.containing_is_class {
                // Writing a value-type member writes its container.
                match receiver.as_deref() {
                    Some(r) => check_writable(cx, r, sink),
                    None => true,
                }
            } else {
                true
            }
        }

        ExprKind::ArrayElement { .. } => true,

        // Late-bound members are assumed writable; their escape rules
        // are enforced separately.
        ExprKind::DynamicMember { .. } => true,

        ExprKind::Call { callee, .. } => {
            if !callee.returns_by_ref {
                sink.report(RefSafetyDiagnostic::NotAnLvalue { span: expr.span });
                false
            } else if callee.ref_readonly_return {
                sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                    span: expr.span,
                    category: ReadonlyCategory::RefReadonlyReturn,
                    name: callee.name.clone(),
                });
                false
            } else {
                true
            }
        }

        ExprKind::Conditional {
            when_true,
            when_false,
            is_ref: true,
            ..
        } => {
            let t = check_writable(cx, when_true, sink);
            let f = check_writable(cx, when_false, sink);
            t && f
        }

        ExprKind::Conversion {
            kind: ConversionKind::Identity,
            operand,
        } => check_writable(cx, operand, sink),

        ExprKind::MethodGroup(name) => {
            sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                span: expr.span,
                category: ReadonlyCategory::MethodGroup,
                name: name.clone(),
            });
            false
        }

        ExprKind::RangeVariable(name) => {
            sink.report(RefSafetyDiagnostic::ReadonlyTarget {
                span: expr.span,
                category: ReadonlyCategory::RangeVariable,
                name: name.clone(),
            });
            false
        }

        _ => {
            sink.report(RefSafetyDiagnostic::NotAnLvalue { span: expr.span });
            false
        }
    }
}

/// Readonly fields of a type are writable inside that type's own
/// constructor, through `this` (or directly for statics).
fn writable_in_own_ctor(
    cx: EvalCx<'_>,
    field: &refsafe_ast::FieldSig,
    receiver: Option<&BoundExpr>,
) -> bool {
    if cx.body.ctor_of.as_deref() != Some(field.containing.as_str()) {
        return false;
    }
    field.is_static || matches!(receiver.map(|r| &r.kind), Some(ExprKind::This))
}
