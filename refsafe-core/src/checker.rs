#![forbid(unsafe_code)]

//! The per-method driver: one forward walk over a bound body, owning
//! the variable environment and the diagnostic sink for that walk.
//! Method walks are independent, so a whole program is checked with a
//! parallel map over its bodies.

use rayon::prelude::*;
use refsafe_ast::{BodyKind, BoundExpr, BoundStmt, ExprKind, MethodBody, Program};

use crate::assign::{check_assign, check_local_decl};
use crate::calls::check_invocation_arg_mixing;
use crate::diagnostics::{DiagnosticSink, ReportedDiagnostic, Severity, SeverityConfig};
use crate::env::VariableEnv;
use crate::escape::{evaluate, val_escape, EvalCx};
use crate::readonly::check_writable;
use crate::returns::{
    check_across_suspension, check_body_shape, check_lambda, validate_return, validate_yield,
};
use crate::scope::{EscapeInfo, Scope};

/// Everything one method walk produced.
#[derive(Clone, Debug)]
pub struct MethodAnalysis {
    pub method: String,
    pub diagnostics: Vec<ReportedDiagnostic>,
}

impl MethodAnalysis {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

pub struct RefSafetyChecker<'a> {
    body: &'a MethodBody,
    env: VariableEnv,
    sink: DiagnosticSink,
    config: SeverityConfig,
    local_scope: Scope,
}

impl<'a> RefSafetyChecker<'a> {
    pub fn new(body: &'a MethodBody, config: SeverityConfig) -> Self {
        RefSafetyChecker {
            body,
            env: VariableEnv::new(),
            sink: DiagnosticSink::new(config, body.relaxed),
            config,
            local_scope: Scope::TOP_LEVEL,
        }
    }

    /// Runs the whole walk and surrenders the collected diagnostics.
    pub fn check_method(mut self) -> MethodAnalysis {
        check_body_shape(self.body, &mut self.sink);
        let body = self.body;
        self.check_stmts(&body.stmts);
        MethodAnalysis {
            method: self.body.sig.name.clone(),
            diagnostics: self.sink.into_diagnostics(),
        }
    }

    /// Read-only escape query at the walk's current position.
    pub fn evaluate(&self, expr: &BoundExpr) -> EscapeInfo {
        evaluate(
            EvalCx::new(self.body, &self.env),
            expr,
            self.local_scope,
        )
    }

    fn check_stmts(&mut self, stmts: &'a [BoundStmt]) {
        for stmt in stmts {
            self.check_stmt(stmt);
        }
    }

    fn check_stmt(&mut self, stmt: &'a BoundStmt) {
        match stmt {
            BoundStmt::LocalDecl {
                span,
                local,
                init,
                init_is_ref,
            } => {
                if let Some(init) = init {
                    self.verify_expr(init);
                }
                check_local_decl(
                    self.body,
                    &mut self.env,
                    *span,
                    *local,
                    init.as_ref(),
                    *init_is_ref,
                    self.local_scope,
                    &mut self.sink,
                );
            }

            BoundStmt::Assign {
                span,
                target,
                value,
                is_ref,
            } => {
                self.verify_expr(target);
                self.verify_expr(value);
                check_assign(
                    self.body,
                    &mut self.env,
                    *span,
                    target,
                    value,
                    *is_ref,
                    self.local_scope,
                    &mut self.sink,
                );
            }

            BoundStmt::Expr(expr) => self.verify_expr(expr),

            BoundStmt::Return {
                span,
                value,
                is_ref,
            } => {
                if let Some(value) = value {
                    self.verify_expr(value);
                }
                validate_return(
                    self.body,
                    &self.env,
                    *span,
                    value.as_ref(),
                    *is_ref,
                    self.local_scope,
                    &mut self.sink,
                );
            }

            BoundStmt::Yield { value, .. } => {
                self.verify_expr(value);
                validate_yield(self.body, &self.env, value, self.local_scope, &mut self.sink);
            }

            BoundStmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.verify_expr(cond);
                self.enter_scope();
                self.check_stmts(then_branch);
                self.exit_scope();
                self.enter_scope();
                self.check_stmts(else_branch);
                self.exit_scope();
            }

            BoundStmt::While { cond, body } => {
                self.verify_expr(cond);
                self.enter_scope();
                self.check_stmts(body);
                self.exit_scope();
            }

            BoundStmt::Foreach {
                span: _,
                local,
                source,
                body,
            } => {
                self.verify_expr(source);
                self.enter_scope();
                // The iteration variable aliases the enumerator's
                // current element, so its value reach is the source's.
                let source_val = val_escape(
                    EvalCx::new(self.body, &self.env),
                    source,
                    self.local_scope,
                );
                self.env
                    .declare(*local, EscapeInfo::new(self.local_scope, source_val));
                self.check_stmts(body);
                self.exit_scope();
            }

            BoundStmt::Block(stmts) => {
                self.enter_scope();
                self.check_stmts(stmts);
                self.exit_scope();
            }
        }
    }

    /// Per-expression side checks that do not depend on how the
    /// surrounding statement uses the value: writable gating of
    /// `ref`/`out` arguments, argument mixing, lambda rules and
    /// suspension crossings.
    fn verify_expr(&mut self, expr: &'a BoundExpr) {
        match &expr.kind {
            ExprKind::Call {
                callee,
                receiver,
                args,
            } => {
                if let Some(receiver) = receiver {
                    self.verify_expr(receiver);
                }
                for arg in args {
                    self.verify_expr(&arg.expr);
                    if arg.ref_kind.is_writable_reference() {
                        let cx = EvalCx::new(self.body, &self.env);
                        check_writable(cx, &arg.expr, &mut self.sink);
                    }
                }
                let cx = EvalCx::new(self.body, &self.env);
                check_invocation_arg_mixing(
                    cx,
                    expr.span,
                    callee,
                    receiver.as_deref(),
                    args,
                    self.local_scope,
                    &mut self.sink,
                );
                if self.body.kind != BodyKind::Ordinary {
                    check_across_suspension(expr, &mut self.sink);
                }
            }

            ExprKind::New { ctor, args } => {
                for arg in args {
                    self.verify_expr(&arg.expr);
                    if arg.ref_kind.is_writable_reference() {
                        let cx = EvalCx::new(self.body, &self.env);
                        check_writable(cx, &arg.expr, &mut self.sink);
                    }
                }
                let cx = EvalCx::new(self.body, &self.env);
                check_invocation_arg_mixing(
                    cx,
                    expr.span,
                    ctor,
                    None,
                    args,
                    self.local_scope,
                    &mut self.sink,
                );
                if self.body.kind != BodyKind::Ordinary {
                    check_across_suspension(expr, &mut self.sink);
                }
            }

            ExprKind::Lambda {
                kind,
                returns_by_ref,
                body,
            } => {
                check_lambda(
                    self.body,
                    expr.span,
                    *kind,
                    *returns_by_ref,
                    body,
                    &mut self.sink,
                );
                self.check_lambda_body(*returns_by_ref, body);
            }

            ExprKind::Field { receiver, .. } => {
                if let Some(receiver) = receiver {
                    self.verify_expr(receiver);
                }
            }
            ExprKind::ArrayElement { array, index } => {
                self.verify_expr(array);
                self.verify_expr(index);
            }
            ExprKind::StackAlloc { count } => self.verify_expr(count),
            ExprKind::Conditional {
                cond,
                when_true,
                when_false,
                ..
            } => {
                self.verify_expr(cond);
                self.verify_expr(when_true);
                self.verify_expr(when_false);
            }
            ExprKind::Binary { left, right } => {
                self.verify_expr(left);
                self.verify_expr(right);
            }
            ExprKind::Conversion { operand, .. } => self.verify_expr(operand),
            ExprKind::Tuple(elements) => {
                for element in elements {
                    self.verify_expr(element);
                }
            }
            ExprKind::DynamicMember { receiver, .. } => self.verify_expr(receiver),
            ExprKind::Await(operand) => self.verify_expr(operand),

            ExprKind::Literal
            | ExprKind::Local(_)
            | ExprKind::Parameter(_)
            | ExprKind::This
            | ExprKind::MethodGroup(_)
            | ExprKind::RangeVariable(_)
            | ExprKind::Discard => {}
        }
    }

    /// A lambda or local function body is a frame of its own: its
    /// scope chain restarts at the method top level with an empty
    /// environment, and its return statements answer to the lambda's
    /// own contract rather than the enclosing signature's.
    fn check_lambda_body(&mut self, returns_by_ref: bool, stmts: &[BoundStmt]) {
        let mut sig = self.body.sig.clone();
        sig.returns_by_ref = returns_by_ref;
        sig.ref_readonly_return = false;
        let nested = MethodBody {
            sig,
            stmts: stmts.to_vec(),
            ..self.body.clone()
        };
        let analysis = RefSafetyChecker::new(&nested, self.config).check_method();
        self.sink.extend(analysis.diagnostics);
    }

    fn enter_scope(&mut self) {
        self.local_scope = self.local_scope.nested();
        self.env.push_scope();
    }

    fn exit_scope(&mut self) {
        self.env.pop_scope();
        self.local_scope = self.local_scope.enclosing();
    }
}

/// Checks every method of a program. Walks are self-contained, so they
/// run in parallel; the result order matches the input order.
pub fn check_program(program: &Program, config: SeverityConfig) -> Vec<MethodAnalysis> {
    program
        .methods
        .par_iter()
        .map(|body| RefSafetyChecker::new(body, config).check_method())
        .collect()
}
