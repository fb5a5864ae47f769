#![forbid(unsafe_code)]

//! The bound (already type-checked) tree consumed by the ref-safety
//! analyzer, together with the symbol and type models it needs.
//!
//! This crate carries no analysis logic of its own: the binder that
//! produces these nodes has already resolved every identifier to a
//! symbol, every invocation to a signature, and every type to a `Ty`
//! with its stack-only bit filled in. Locals arrive stamped with the
//! block-scoping depth at their point of declaration.

use miette::SourceSpan;

pub type Span = SourceSpan;

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

/// Static type of a bound expression.
///
/// Type identity (`==`) is the identity-conversion test used by ref
/// assignments and ref returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ty {
    Unit,
    Int,
    Bool,
    /// Heap-allocated reference type.
    Class(String),
    /// Ordinary value type or, when `is_ref_like` is set, a stack-only
    /// type whose instances must never outlive the producing frame.
    Struct { name: String, is_ref_like: bool },
    Array(Box<Ty>),
    /// Late-bound receiver. Escape-wise an ordinary by-value
    /// reference-type expression.
    Dynamic,
}

impl Ty {
    pub fn ref_like(name: impl Into<String>) -> Ty {
        Ty::Struct {
            name: name.into(),
            is_ref_like: true,
        }
    }

    pub fn plain_struct(name: impl Into<String>) -> Ty {
        Ty::Struct {
            name: name.into(),
            is_ref_like: false,
        }
    }

    pub fn is_ref_like(&self) -> bool {
        matches!(self, Ty::Struct { is_ref_like: true, .. })
    }

    pub fn name(&self) -> &str {
        match self {
            Ty::Unit => "unit",
            Ty::Int => "int",
            Ty::Bool => "bool",
            Ty::Class(n) => n,
            Ty::Struct { name, .. } => name,
            Ty::Array(_) => "array",
            Ty::Dynamic => "dynamic",
        }
    }
}

/// By-reference passing mode of a parameter, argument or local.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    None,
    Ref,
    Out,
    In,
}

impl RefKind {
    pub fn is_by_ref(self) -> bool {
        !matches!(self, RefKind::None)
    }

    /// `ref` and `out` denote writable aliases; `in` is read-only.
    pub fn is_writable_reference(self) -> bool {
        matches!(self, RefKind::Ref | RefKind::Out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParamId(pub u32);

/// What kind of storage a local binding came from. Foreach iteration
/// variables and query range variables carry extra readonly policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalOrigin {
    Ordinary,
    /// Iteration variable; writable only when the enumerator exposes a
    /// genuinely mutable `ref` element.
    Foreach { writable_ref: bool },
    /// Query/range variable. Never a ref target, never ref-returnable.
    RangeVariable,
}

/// A local variable as recorded by the binder. `depth` is the nesting
/// depth of the block that declares it (1 = method top level).
#[derive(Clone, Debug, PartialEq)]
pub struct LocalSymbol {
    pub name: String,
    pub ty: Ty,
    pub depth: u32,
    pub ref_kind: RefKind,
    pub is_ref_readonly: bool,
    pub origin: LocalOrigin,
    pub span: Span,
}

impl LocalSymbol {
    pub fn by_value(name: impl Into<String>, ty: Ty, depth: u32, span: Span) -> Self {
        LocalSymbol {
            name: name.into(),
            ty,
            depth,
            ref_kind: RefKind::None,
            is_ref_readonly: false,
            origin: LocalOrigin::Ordinary,
            span,
        }
    }

    pub fn by_ref(name: impl Into<String>, ty: Ty, depth: u32, span: Span) -> Self {
        LocalSymbol {
            ref_kind: RefKind::Ref,
            ..LocalSymbol::by_value(name, ty, depth, span)
        }
    }

    pub fn by_ref_readonly(name: impl Into<String>, ty: Ty, depth: u32, span: Span) -> Self {
        LocalSymbol {
            is_ref_readonly: true,
            ..LocalSymbol::by_ref(name, ty, depth, span)
        }
    }

    pub fn is_ref_kind(&self) -> bool {
        self.ref_kind.is_by_ref()
    }
}

/// A parameter of a callee signature (or of the method under analysis).
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSig {
    pub name: String,
    pub ty: Ty,
    pub ref_kind: RefKind,
    /// Lifetime-opt-out attribute: the callee promises not to capture
    /// the escape of the matching argument in its result.
    pub no_capture: bool,
}

impl ParamSig {
    pub fn new(name: impl Into<String>, ty: Ty, ref_kind: RefKind) -> Self {
        ParamSig {
            name: name.into(),
            ty,
            ref_kind,
            no_capture: false,
        }
    }

    pub fn no_capture(mut self) -> Self {
        self.no_capture = true;
        self
    }
}

/// Receiver shape of an instance member, as seen from inside its body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receiver {
    Static,
    Class,
    Struct,
}

/// Resolved signature of an invocable member. Property and indexer
/// accessors are represented by their accessor method signatures.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodSig {
    pub name: String,
    pub params: Vec<ParamSig>,
    pub return_ty: Ty,
    pub returns_by_ref: bool,
    /// `ref readonly` return: an alias the caller may read but not
    /// write through.
    pub ref_readonly_return: bool,
    pub receiver: Receiver,
    /// Member does not mutate its receiver (readonly member, or member
    /// of a readonly struct).
    pub is_readonly: bool,
}

impl MethodSig {
    pub fn by_value(name: impl Into<String>, params: Vec<ParamSig>, return_ty: Ty) -> Self {
        MethodSig {
            name: name.into(),
            params,
            return_ty,
            returns_by_ref: false,
            ref_readonly_return: false,
            receiver: Receiver::Static,
            is_readonly: false,
        }
    }

    pub fn by_ref(name: impl Into<String>, params: Vec<ParamSig>, return_ty: Ty) -> Self {
        MethodSig {
            returns_by_ref: true,
            ..MethodSig::by_value(name, params, return_ty)
        }
    }

    pub fn with_receiver(mut self, receiver: Receiver) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn readonly_member(mut self) -> Self {
        self.is_readonly = true;
        self
    }

    pub fn ref_readonly(mut self) -> Self {
        debug_assert!(self.returns_by_ref);
        self.ref_readonly_return = true;
        self
    }
}

/// Resolved field metadata attached to a field-access node.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSig {
    pub name: String,
    pub ty: Ty,
    /// Name of the declaring type; readonly fields of this type are
    /// writable only inside its own constructor.
    pub containing: String,
    pub is_static: bool,
    pub is_readonly: bool,
    pub containing_is_class: bool,
    pub containing_is_ref_like: bool,
}

impl FieldSig {
    pub fn new(name: impl Into<String>, ty: Ty, containing: impl Into<String>) -> Self {
        FieldSig {
            name: name.into(),
            ty,
            containing: containing.into(),
            is_static: false,
            is_readonly: false,
            containing_is_class: false,
            containing_is_ref_like: false,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.is_readonly = true;
        self
    }

    pub fn of_class(mut self) -> Self {
        self.containing_is_class = true;
        self
    }

    pub fn of_ref_like(mut self) -> Self {
        self.containing_is_ref_like = true;
        self
    }

    pub fn static_field(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// Conversion classification already performed by the type checker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionKind {
    Identity,
    Implicit,
    Explicit,
}

/// How a lambda or local function relates to the enclosing frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LambdaKind {
    /// Invoked synchronously and never stored; still may not capture
    /// ref-kind locals.
    Ordinary,
    /// Stored, returned or invoked asynchronously; its scope chain is
    /// unrelated to the enclosing frame.
    Escaping,
    /// Converted to an expression-tree representation.
    ExpressionTree,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Argument {
    pub expr: BoundExpr,
    pub ref_kind: RefKind,
}

impl Argument {
    pub fn by_value(expr: BoundExpr) -> Self {
        Argument {
            expr,
            ref_kind: RefKind::None,
        }
    }

    pub fn by_ref(expr: BoundExpr) -> Self {
        Argument {
            expr,
            ref_kind: RefKind::Ref,
        }
    }

    pub fn out(expr: BoundExpr) -> Self {
        Argument {
            expr,
            ref_kind: RefKind::Out,
        }
    }

    pub fn in_arg(expr: BoundExpr) -> Self {
        Argument {
            expr,
            ref_kind: RefKind::In,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BoundExpr {
    pub span: Span,
    pub ty: Ty,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    /// Literals, constants and `default` expressions.
    Literal,
    Local(LocalId),
    Parameter(ParamId),
    This,
    Field {
        /// Absent for static fields.
        receiver: Option<Box<BoundExpr>>,
        field: FieldSig,
    },
    ArrayElement {
        array: Box<BoundExpr>,
        index: Box<BoundExpr>,
    },
    StackAlloc {
        count: Box<BoundExpr>,
    },
    New {
        ctor: MethodSig,
        args: Vec<Argument>,
    },
    Call {
        callee: MethodSig,
        receiver: Option<Box<BoundExpr>>,
        args: Vec<Argument>,
    },
    Conditional {
        cond: Box<BoundExpr>,
        when_true: Box<BoundExpr>,
        when_false: Box<BoundExpr>,
        is_ref: bool,
    },
    Binary {
        left: Box<BoundExpr>,
        right: Box<BoundExpr>,
    },
    Conversion {
        kind: ConversionKind,
        operand: Box<BoundExpr>,
    },
    Tuple(Vec<BoundExpr>),
    MethodGroup(String),
    RangeVariable(String),
    Discard,
    DynamicMember {
        receiver: Box<BoundExpr>,
        member: String,
    },
    Lambda {
        kind: LambdaKind,
        returns_by_ref: bool,
        body: Vec<BoundStmt>,
    },
    Await(Box<BoundExpr>),
}

impl BoundExpr {
    pub fn new(span: Span, ty: Ty, kind: ExprKind) -> Self {
        BoundExpr { span, ty, kind }
    }

    pub fn literal(span: Span, ty: Ty) -> Self {
        BoundExpr::new(span, ty, ExprKind::Literal)
    }

    pub fn local(span: Span, ty: Ty, id: LocalId) -> Self {
        BoundExpr::new(span, ty, ExprKind::Local(id))
    }

    pub fn parameter(span: Span, ty: Ty, id: ParamId) -> Self {
        BoundExpr::new(span, ty, ExprKind::Parameter(id))
    }

    pub fn this(span: Span, ty: Ty) -> Self {
        BoundExpr::new(span, ty, ExprKind::This)
    }

    pub fn field(span: Span, receiver: BoundExpr, field: FieldSig) -> Self {
        let ty = field.ty.clone();
        BoundExpr::new(
            span,
            ty,
            ExprKind::Field {
                receiver: Some(Box::new(receiver)),
                field,
            },
        )
    }

    pub fn static_field(span: Span, field: FieldSig) -> Self {
        let ty = field.ty.clone();
        BoundExpr::new(span, ty, ExprKind::Field { receiver: None, field })
    }

    pub fn stackalloc(span: Span, ty: Ty, count: BoundExpr) -> Self {
        BoundExpr::new(
            span,
            ty,
            ExprKind::StackAlloc {
                count: Box::new(count),
            },
        )
    }

    pub fn call(span: Span, callee: MethodSig, receiver: Option<BoundExpr>, args: Vec<Argument>) -> Self {
        let ty = callee.return_ty.clone();
        BoundExpr::new(
            span,
            ty,
            ExprKind::Call {
                callee,
                receiver: receiver.map(Box::new),
                args,
            },
        )
    }

    pub fn is_addressable(&self) -> bool {
        match &self.kind {
            ExprKind::Local(_)
            | ExprKind::Parameter(_)
            | ExprKind::Field { .. }
            | ExprKind::ArrayElement { .. } => true,
            ExprKind::This => matches!(self.ty, Ty::Struct { .. }),
            ExprKind::Call { callee, .. } => callee.returns_by_ref,
            ExprKind::Conditional { is_ref, .. } => *is_ref,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BoundStmt {
    LocalDecl {
        span: Span,
        local: LocalId,
        init: Option<BoundExpr>,
        /// `= ref` initializer.
        init_is_ref: bool,
    },
    Assign {
        span: Span,
        target: BoundExpr,
        value: BoundExpr,
        /// `x = ref y` reassignment as opposed to a value write.
        is_ref: bool,
    },
    Expr(BoundExpr),
    Return {
        span: Span,
        value: Option<BoundExpr>,
        is_ref: bool,
    },
    Yield {
        span: Span,
        value: BoundExpr,
    },
    If {
        cond: BoundExpr,
        then_branch: Vec<BoundStmt>,
        else_branch: Vec<BoundStmt>,
    },
    While {
        cond: BoundExpr,
        body: Vec<BoundStmt>,
    },
    Foreach {
        span: Span,
        local: LocalId,
        source: BoundExpr,
        body: Vec<BoundStmt>,
    },
    Block(Vec<BoundStmt>),
}

/// Kind of the member body being analyzed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyKind {
    Ordinary,
    /// Contains `yield`.
    Iterator,
    Async,
}

/// One already-bound method body, self-contained for analysis.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody {
    pub sig: MethodSig,
    pub kind: BodyKind,
    /// Relaxed/unsafe region: narrower-escape violations become
    /// advisory warnings instead of errors.
    pub relaxed: bool,
    /// Script or top-level-statements body. Locals of its outermost
    /// block live in caller-reachable storage and may be returned by
    /// reference.
    pub top_level: bool,
    /// When analyzing a constructor body, the name of the constructed
    /// type; readonly instance fields of that type are writable here.
    pub ctor_of: Option<String>,
    /// All locals of the body, indexed by `LocalId`.
    pub locals: Vec<LocalSymbol>,
    pub stmts: Vec<BoundStmt>,
}

impl MethodBody {
    pub fn new(sig: MethodSig, locals: Vec<LocalSymbol>, stmts: Vec<BoundStmt>) -> Self {
        MethodBody {
            sig,
            kind: BodyKind::Ordinary,
            relaxed: false,
            top_level: false,
            ctor_of: None,
            locals,
            stmts,
        }
    }

    pub fn top_level(mut self) -> Self {
        self.top_level = true;
        self
    }

    pub fn iterator(mut self) -> Self {
        self.kind = BodyKind::Iterator;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.kind = BodyKind::Async;
        self
    }

    pub fn relaxed(mut self) -> Self {
        self.relaxed = true;
        self
    }

    pub fn in_ctor_of(mut self, ty: impl Into<String>) -> Self {
        self.ctor_of = Some(ty.into());
        self
    }

    pub fn local(&self, id: LocalId) -> &LocalSymbol {
        &self.locals[id.0 as usize]
    }

    pub fn param(&self, id: ParamId) -> &ParamSig {
        &self.sig.params[id.0 as usize]
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Program {
    pub methods: Vec<MethodBody>,
}
