#![forbid(unsafe_code)]

//! Ref-safety analysis over already-bound method bodies: a two
//! dimensional escape-scope model (reference reach and value reach)
//! enforced by a single forward walk per method.

mod assign;
mod calls;
mod checker;
mod diagnostics;
mod env;
mod escape;
mod readonly;
mod returns;
mod scope;

pub use assign::{check_assign, check_local_decl, declared_escape};
pub use calls::{check_invocation_arg_mixing, check_invocation_escape, invocation_escape_scope};
pub use checker::{check_program, MethodAnalysis, RefSafetyChecker};
pub use diagnostics::{
    DiagnosticClass, DiagnosticSink, ReadonlyCategory, RefSafetyDiagnostic, ReportedDiagnostic,
    Severity, SeverityConfig,
};
pub use env::VariableEnv;
pub use escape::{check_ref_escape, check_val_escape, evaluate, ref_escape, val_escape, EvalCx};
pub use readonly::{check_addressable, check_writable};
pub use returns::{
    check_across_suspension, check_body_shape, check_lambda, validate_return, validate_yield,
};
pub use scope::{EscapeInfo, Scope};
