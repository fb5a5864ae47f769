#![forbid(unsafe_code)]

//! Diagnostic taxonomy for the ref-safety analyzer.
//!
//! Every violation is one value of [`RefSafetyDiagnostic`]; the walk
//! appends it to a [`DiagnosticSink`] and keeps going. Several
//! variants share the `refsafe::narrower_escape_scope` code: they are
//! one diagnostic class with per-shape wordings (plain local, member
//! of local, parameter, call result, ...). That class is the only one
//! whose severity is configurable — inside a relaxed region it is
//! demoted to a warning and stops being load-bearing.

use std::fmt;

use miette::Diagnostic;
use refsafe_ast::Span;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Error, Diagnostic)]
pub enum RefSafetyDiagnostic {
    // --- lvalue-ness -------------------------------------------------
    #[error("an expression cannot be used in this context because it may not be passed or returned by reference")]
    #[diagnostic(code(refsafe::not_an_lvalue))]
    NotAnLvalue {
        #[label("not an addressable storage location")]
        span: Span,
    },

    #[error("the left-hand side of a ref assignment must be a ref variable")]
    #[diagnostic(code(refsafe::not_an_lvalue))]
    RefAssignTargetExpected {
        #[label("not a ref local or ref parameter")]
        span: Span,
    },

    // --- conversions -------------------------------------------------
    #[error("the expression must have an identity conversion to '{target}' to be assigned by reference")]
    #[diagnostic(code(refsafe::identity_conversion_required))]
    IdentityConversionRequired {
        #[label("has a different type")]
        span: Span,
        target: String,
    },

    // --- narrower escape scope (one class, many shapes) --------------
    #[error("cannot ref-assign '{source_name}' to '{name}' because '{source_name}' has a narrower escape scope")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    NarrowerEscapeScope {
        #[label("escapes no further than its own scope")]
        span: Span,
        name: String,
        // Not `source`: thiserror reserves that name for the error
        // cause chain.
        source_name: String,
    },

    #[error("cannot return local '{name}' by reference because it is not a ref local")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    RefReturnLocal {
        #[label("local variable")]
        span: Span,
        name: String,
    },

    #[error("cannot return a member of local '{name}' by reference because it is not a ref local")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    RefReturnLocalMember {
        #[label("member of a local variable")]
        span: Span,
        name: String,
    },

    #[error("cannot return parameter '{name}' by reference because it is not a ref or out parameter")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    RefReturnParameter {
        #[label("by-value parameter")]
        span: Span,
        name: String,
    },

    #[error("cannot return a member of parameter '{name}' by reference because it is not a ref or out parameter")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    RefReturnParameterMember {
        #[label("member of a by-value parameter")]
        span: Span,
        name: String,
    },

    #[error("cannot use local '{name}' in this context because it may expose referenced variables outside of their declaration scope")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    EscapeLocal {
        #[label("narrower escape scope")]
        span: Span,
        name: String,
    },

    #[error("a result of a stackalloc expression cannot escape the containing scope")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    EscapeStackalloc {
        #[label("refers to stack memory of the current block")]
        span: Span,
    },

    #[error("expression cannot be used in this context because it may indirectly expose variables outside of their declaration scope")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    EscapeOther {
        #[label("narrower escape scope")]
        span: Span,
    },

    #[error("cannot use a result of '{method}' in this context because it may expose variables referenced by parameter '{param}' outside of their declaration scope")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    CallResultEscape {
        #[label("call result constrained by its arguments")]
        span: Span,
        method: String,
        param: String,
    },

    #[error("this combination of arguments to '{method}' is disallowed because it may expose variables referenced by parameter '{param}' outside of their declaration scope")]
    #[diagnostic(code(refsafe::narrower_escape_scope))]
    ArgMixing {
        #[label("mixes scopes of its arguments")]
        span: Span,
        method: String,
        param: String,
    },

    // --- readonly gate ----------------------------------------------
    #[error("cannot use {category} '{name}' as a writable reference")]
    #[diagnostic(code(refsafe::readonly_target))]
    ReadonlyTarget {
        #[label("read-only")]
        span: Span,
        category: ReadonlyCategory,
        name: String,
    },

    // --- this --------------------------------------------------------
    #[error("struct members cannot return 'this' or other instance members by reference")]
    #[diagnostic(code(refsafe::struct_this_escape))]
    StructThisEscape {
        #[label("alias into the receiver struct")]
        span: Span,
    },

    #[error("cannot return 'this' by reference")]
    #[diagnostic(code(refsafe::ref_return_this))]
    RefReturnClassThis {
        #[label("'this' reference")]
        span: Span,
    },

    // --- closures ----------------------------------------------------
    #[error("cannot use ref local '{name}' inside a lambda, local function or query expression")]
    #[diagnostic(code(refsafe::closure_captures_ref_local))]
    ClosureCapturesRefLocal {
        #[label("captured here")]
        span: Span,
        name: String,
    },

    // --- iterators / async ------------------------------------------
    #[error("iterators and async methods cannot declare ref local '{name}'")]
    #[diagnostic(code(refsafe::iterator_or_async_ref_local))]
    IteratorOrAsyncRefLocal {
        #[label("ref local in a resumable body")]
        span: Span,
        name: String,
    },

    #[error("iterators and async methods cannot return by reference")]
    #[diagnostic(code(refsafe::iterator_or_async_ref_local))]
    RefReturningIteratorOrAsync {
        #[label("by-ref-returning resumable body")]
        span: Span,
    },

    #[error("a reference returned by a call to '{method}' cannot be preserved across an 'await' or 'yield' boundary")]
    #[diagnostic(code(refsafe::ref_across_suspension))]
    RefAcrossSuspension {
        #[label("still live at the suspension point")]
        span: Span,
        method: String,
    },

    // --- expression trees -------------------------------------------
    #[error("lambda expressions that return by reference cannot be converted to expression trees")]
    #[diagnostic(code(refsafe::expression_tree_ref_return))]
    ExpressionTreeRefReturningLambda {
        #[label("by-ref-returning lambda")]
        span: Span,
    },

    #[error("an expression tree lambda may not contain a call to '{method}' because it returns by reference")]
    #[diagnostic(code(refsafe::expression_tree_ref_return))]
    ExpressionTreeRefReturningCall {
        #[label("by-ref-returning call")]
        span: Span,
        method: String,
    },

    // --- return contract --------------------------------------------
    #[error("by-reference returns may only be used in methods that return by reference")]
    #[diagnostic(code(refsafe::by_ref_return_contract))]
    MustHaveRefReturn {
        #[label("'return ref' in a by-value returning method")]
        span: Span,
    },

    #[error("by-value returns may only be used in methods that return by value")]
    #[diagnostic(code(refsafe::by_ref_return_contract))]
    MustNotHaveRefReturn {
        #[label("by-value return in a by-ref returning method")]
        span: Span,
    },

    // --- declarations ------------------------------------------------
    #[error("cannot initialize a by-value variable with a reference")]
    #[diagnostic(code(refsafe::ref_initializer_mismatch))]
    InitializeByValueWithReference {
        #[label("'= ref' initializer on a by-value variable")]
        span: Span,
    },

    #[error("cannot initialize a by-reference variable with a value")]
    #[diagnostic(code(refsafe::ref_initializer_mismatch))]
    InitializeByReferenceWithValue {
        #[label("value initializer on a ref variable")]
        span: Span,
    },

    #[error("a declaration of a by-reference variable '{name}' must have an initializer")]
    #[diagnostic(code(refsafe::ref_initializer_mismatch))]
    ByReferenceVariableMustBeInitialized {
        #[label("uninitialized ref variable")]
        span: Span,
        name: String,
    },
}

impl RefSafetyDiagnostic {
    /// The taxonomy class of this diagnostic; severity policy is keyed
    /// by class, not by variant.
    pub fn class(&self) -> DiagnosticClass {
        use RefSafetyDiagnostic::*;
        match self {
            NotAnLvalue { .. } | RefAssignTargetExpected { .. } => DiagnosticClass::NotAnLvalue,
            IdentityConversionRequired { .. } => DiagnosticClass::IdentityConversionRequired,
            NarrowerEscapeScope { .. }
            | RefReturnLocal { .. }
            | RefReturnLocalMember { .. }
            | RefReturnParameter { .. }
            | RefReturnParameterMember { .. }
            | EscapeLocal { .. }
            | EscapeStackalloc { .. }
            | EscapeOther { .. }
            | CallResultEscape { .. }
            | ArgMixing { .. } => DiagnosticClass::NarrowerEscapeScope,
            ReadonlyTarget { .. } => DiagnosticClass::ReadonlyTarget,
            StructThisEscape { .. } => DiagnosticClass::StructThisEscape,
            RefReturnClassThis { .. } => DiagnosticClass::ClassThisRefReturn,
            ClosureCapturesRefLocal { .. } => DiagnosticClass::ClosureCapturesRefLocal,
            IteratorOrAsyncRefLocal { .. } | RefReturningIteratorOrAsync { .. } => {
                DiagnosticClass::IteratorOrAsyncRefLocal
            }
            RefAcrossSuspension { .. } => DiagnosticClass::RefAcrossSuspension,
            ExpressionTreeRefReturningLambda { .. } | ExpressionTreeRefReturningCall { .. } => {
                DiagnosticClass::ExpressionTreeRefReturn
            }
            MustHaveRefReturn { .. } | MustNotHaveRefReturn { .. } => {
                DiagnosticClass::ByRefReturnContractMismatch
            }
            InitializeByValueWithReference { .. }
            | InitializeByReferenceWithValue { .. }
            | ByReferenceVariableMustBeInitialized { .. } => DiagnosticClass::RefInitializerMismatch,
        }
    }
}

/// Stable diagnostic classes of the taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticClass {
    NotAnLvalue,
    IdentityConversionRequired,
    NarrowerEscapeScope,
    ReadonlyTarget,
    StructThisEscape,
    ClassThisRefReturn,
    ClosureCapturesRefLocal,
    IteratorOrAsyncRefLocal,
    RefAcrossSuspension,
    ExpressionTreeRefReturn,
    ByRefReturnContractMismatch,
    RefInitializerMismatch,
}

/// Readonly categories of the mutability gate. Each gets its own
/// wording; all share one semantics (reject before scope checks).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadonlyCategory {
    ReadonlyField,
    StaticReadonlyField,
    InParameter,
    ForeachVariable,
    RangeVariable,
    MethodGroup,
    ReadonlyStructThis,
    RefReadonlyLocal,
    RefReadonlyReturn,
}

impl fmt::Display for ReadonlyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReadonlyCategory::ReadonlyField => "readonly field",
            ReadonlyCategory::StaticReadonlyField => "static readonly field",
            ReadonlyCategory::InParameter => "'in' parameter",
            ReadonlyCategory::ForeachVariable => "foreach iteration variable",
            ReadonlyCategory::RangeVariable => "range variable",
            ReadonlyCategory::MethodGroup => "method group",
            ReadonlyCategory::ReadonlyStructThis => "'this' in a readonly member",
            ReadonlyCategory::RefReadonlyLocal => "'ref readonly' variable",
            ReadonlyCategory::RefReadonlyReturn => "'ref readonly' return value",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// Severity policy. The only tunable knob is what the narrower-escape
/// class becomes inside a relaxed region; everything else is always an
/// error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeverityConfig {
    pub relaxed_narrower_escape: Severity,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        SeverityConfig {
            relaxed_narrower_escape: Severity::Warning,
        }
    }
}

impl SeverityConfig {
    pub fn severity_of(&self, class: DiagnosticClass, relaxed: bool) -> Severity {
        match class {
            DiagnosticClass::NarrowerEscapeScope if relaxed => self.relaxed_narrower_escape,
            _ => Severity::Error,
        }
    }
}

/// One collected diagnostic with its resolved severity.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportedDiagnostic {
    pub severity: Severity,
    pub diagnostic: RefSafetyDiagnostic,
}

/// Incremental diagnostic collector for one method walk. Appending is
/// the only mutation; an abandoned walk still leaves everything
/// reported so far intact.
#[derive(Clone, Debug)]
pub struct DiagnosticSink {
    config: SeverityConfig,
    relaxed: bool,
    entries: Vec<ReportedDiagnostic>,
}

impl DiagnosticSink {
    pub fn new(config: SeverityConfig, relaxed: bool) -> Self {
        DiagnosticSink {
            config,
            relaxed,
            entries: Vec::new(),
        }
    }

    /// Appends one diagnostic and returns its resolved severity.
    pub fn report(&mut self, diagnostic: RefSafetyDiagnostic) -> Severity {
        let severity = self.config.severity_of(diagnostic.class(), self.relaxed);
        self.entries.push(ReportedDiagnostic {
            severity,
            diagnostic,
        });
        severity
    }

    /// Absorbs the output of a nested walk, severities already
    /// resolved.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = ReportedDiagnostic>) {
        self.entries.extend(entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.severity == Severity::Error)
    }

    pub fn diagnostics(&self) -> &[ReportedDiagnostic] {
        &self.entries
    }

    pub fn into_diagnostics(self) -> Vec<ReportedDiagnostic> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
