//! Function, closure, and arrow-function compilation.

use crate::ast::{Capture, Expr, FunctionDecl, Parameter, Stmt, TypeHint};
use crate::errors::CompileError;
use crate::vm::compiler::{Compiler, FnState, Scope};
use crate::vm::opcode::{CaptureSpec, Constant, Op, PhpParam, UserFunction};
use crate::vm::optimizer;
use std::collections::HashSet;
use std::sync::Arc;

impl<'a> Compiler<'a> {
    pub(crate) fn compile_function_decl(&mut self, decl: &FunctionDecl) -> Result<(), CompileError> {
        let name = self.name(decl.name).to_string();
        let func = self.compile_function_parts(
            name.clone(),
            &decl.params,
            &decl.return_type,
            &decl.body,
            Scope::Function,
            &[],
            None,
            &decl.attributes,
        )?;
        self.fn_sigs.insert(
            name.to_lowercase(),
            func.params.iter().map(|p| p.by_ref).collect(),
        );
        let idx = self.functions.len() as u16;
        self.functions.push(Arc::new(func));
        self.emit_a(Op::DeclareFn, idx);
        Ok(())
    }

    /// Compile one function body into a [`UserFunction`]. Shared by named
    /// functions, methods, and closures; `captures` appends capture slots
    /// after the parameters, and `declaring_class` marks method scope.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn compile_function_parts(
        &mut self,
        name: String,
        params: &[Parameter],
        return_type: &Option<TypeHint>,
        body: &[Stmt],
        scope: Scope,
        captures: &[Capture],
        declaring_class: Option<String>,
        attributes: &[crate::ast::Attribute],
    ) -> Result<UserFunction, CompileError> {
        let is_static = matches!(scope, Scope::Method { is_static: true, .. });
        self.state.push(FnState::new(name.clone(), scope));

        let mut compiled_params = Vec::with_capacity(params.len());
        for param in params {
            let pname = self.var_name(param.name).to_string();
            self.s().local_slot(&pname)?;
            let default = match &param.default {
                Some(e) => Some(lit_const(self, e).ok_or(CompileError::NonLiteralDefault)?),
                None => None,
            };
            compiled_params.push(PhpParam {
                name: pname,
                type_hint: param.type_hint.clone(),
                default,
                by_ref: param.by_ref,
                variadic: param.variadic,
                promoted: param.promoted,
            });
        }
        let capture_specs: Vec<CaptureSpec> = captures
            .iter()
            .map(|c| CaptureSpec {
                name: self.var_name(c.name).to_string(),
                by_ref: c.by_ref,
            })
            .collect();
        for spec in &capture_specs {
            self.s().local_slot(&spec.name)?;
        }

        self.emit_op(Op::Safepoint);

        // Constructor property promotion writes the promoted parameters
        // into their properties before the body runs.
        for (i, param) in compiled_params.iter().enumerate() {
            if param.promoted.is_some() {
                let this_offset = 1u16; // slot 0 is $this in promoting scope
                self.emit_a(Op::PushLocal, 0);
                self.emit_a(Op::PushLocal, this_offset + i as u16);
                let name_k = self.str_const(&param.name.clone())?;
                let cache = self.add_cache();
                self.emit_ab(Op::SetProp, name_k, cache);
                self.emit_op(Op::Pop);
            }
        }

        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit_op(Op::RetVoid);

        let state = self.state.pop().expect("function state pushed above");
        let mut compiled = state.into_function()?;
        compiled.arg_count = compiled_params.len().min(u8::MAX as usize) as u8;
        optimizer::optimize(&mut compiled);

        let min_arity = compiled_params
            .iter()
            .take_while(|p| p.default.is_none() && !p.variadic)
            .count() as u8;
        let max_arity = if compiled_params.iter().any(|p| p.variadic) {
            u8::MAX
        } else {
            compiled_params.len().min(u8::MAX as usize) as u8
        };

        Ok(UserFunction {
            name,
            params: compiled_params,
            return_type: return_type.clone(),
            captures: capture_specs,
            attributes: attributes
                .iter()
                .map(|a| self.name(a.name).to_string())
                .collect(),
            is_static,
            declaring_class,
            min_arity,
            max_arity,
            body: compiled,
        })
    }

    // ==================== Closures ====================

    pub(crate) fn compile_closure(
        &mut self,
        params: &[Parameter],
        captures: &[Capture],
        body: &[Stmt],
        is_static: bool,
    ) -> Result<(), CompileError> {
        let scope = self.closure_scope(is_static);
        let declaring_class = match &scope {
            Scope::Method { class, .. } => Some(class.clone()),
            _ => None,
        };
        let proto = self.compile_function_parts(
            "{closure}".to_string(),
            params,
            &None,
            body,
            scope,
            captures,
            declaring_class,
            &[],
        )?;
        self.emit_captures(captures)?;
        let proto_k = {
            let state = self.s();
            let idx = state.func.protos.len() as u16;
            state.func.protos.push(Arc::new(proto));
            idx
        };
        self.emit_ab(Op::MakeClosure, proto_k, captures.len() as u16);
        Ok(())
    }

    /// `fn(...) => expr` captures every free variable by value.
    pub(crate) fn compile_arrow_function(
        &mut self,
        params: &[Parameter],
        body: &Expr,
    ) -> Result<(), CompileError> {
        let mut bound: HashSet<String> = params
            .iter()
            .map(|p| self.var_name(p.name).to_string())
            .collect();
        bound.insert("this".to_string());
        let mut free = Vec::new();
        collect_free_vars(self, body, &bound, &mut free);

        let captures: Vec<Capture> = free
            .into_iter()
            .map(|id| Capture {
                name: id,
                by_ref: false,
            })
            .collect();
        let body_stmts = vec![Stmt::Return(Some(body.clone()))];
        let scope = self.closure_scope(false);
        let declaring_class = match &scope {
            Scope::Method { class, .. } => Some(class.clone()),
            _ => None,
        };
        let proto = self.compile_function_parts(
            "{closure}".to_string(),
            params,
            &None,
            &body_stmts,
            scope,
            &captures,
            declaring_class,
            &[],
        )?;
        self.emit_captures(&captures)?;
        let proto_k = {
            let state = self.s();
            let idx = state.func.protos.len() as u16;
            state.func.protos.push(Arc::new(proto));
            idx
        };
        self.emit_ab(Op::MakeClosure, proto_k, captures.len() as u16);
        Ok(())
    }

    /// A closure created in a method keeps that method's class scope (and
    /// its `$this`, unless declared static).
    fn closure_scope(&self, is_static: bool) -> Scope {
        match &self.st().scope {
            Scope::Method { class, is_static: enclosing_static } => Scope::Method {
                class: class.clone(),
                is_static: is_static || *enclosing_static,
            },
            _ => Scope::Function,
        }
    }

    fn emit_captures(&mut self, captures: &[Capture]) -> Result<(), CompileError> {
        for capture in captures {
            let name = self.var_name(capture.name).to_string();
            let mode = if capture.by_ref { 1 } else { 0 };
            if self.st().scope == Scope::Main {
                let slot = self.global_slot(&name);
                self.emit_ab(Op::CaptureGlobal, slot, mode);
            } else {
                let slot = self.s().local_slot(&name)?;
                self.emit_ab(Op::CaptureVar, slot, mode);
            }
        }
        Ok(())
    }
}

/// Collect `$`-variables referenced by an expression that are not locally
/// bound, in first-use order.
fn collect_free_vars(
    c: &Compiler<'_>,
    e: &Expr,
    bound: &HashSet<String>,
    out: &mut Vec<crate::ast::StringId>,
) {
    let push_free = |c: &Compiler<'_>,
                     id: crate::ast::StringId,
                     bound: &HashSet<String>,
                     out: &mut Vec<crate::ast::StringId>| {
        let name = c.var_name(id).to_string();
        if !bound.contains(&name) && !out.iter().any(|o| c.var_name(*o) == name) {
            out.push(id);
        }
    };
    use Expr::*;
    match e {
        Variable(id) => push_free(c, *id, bound, out),
        Binary { lhs, rhs, .. } => {
            collect_free_vars(c, lhs, bound, out);
            collect_free_vars(c, rhs, bound, out);
        }
        Unary { operand, .. } | Postfix { operand, .. } => {
            collect_free_vars(c, operand, bound, out)
        }
        Assign { target, value } => {
            collect_free_vars(c, target, bound, out);
            collect_free_vars(c, value, bound, out);
        }
        Ternary {
            condition,
            then,
            otherwise,
        } => {
            collect_free_vars(c, condition, bound, out);
            if let Some(t) = then {
                collect_free_vars(c, t, bound, out);
            }
            collect_free_vars(c, otherwise, bound, out);
        }
        Call { callee, args } => {
            if let crate::ast::Callee::Expr(inner) = callee {
                collect_free_vars(c, inner, bound, out);
            }
            for a in args {
                collect_free_vars(c, a, bound, out);
            }
        }
        MethodCall { target, args, .. } => {
            collect_free_vars(c, target, bound, out);
            for a in args {
                collect_free_vars(c, a, bound, out);
            }
        }
        StaticCall { args, .. } | New { args, .. } => {
            for a in args {
                collect_free_vars(c, a, bound, out);
            }
        }
        ArrayInit(elements) => {
            for el in elements {
                if let Some(k) = &el.key {
                    collect_free_vars(c, k, bound, out);
                }
                collect_free_vars(c, &el.value, bound, out);
            }
        }
        ArrayAccess { target, index } => {
            collect_free_vars(c, target, bound, out);
            if let Some(i) = index {
                collect_free_vars(c, i, bound, out);
            }
        }
        PropertyAccess { target, .. } => collect_free_vars(c, target, bound, out),
        CloneWith { target, updates } => {
            collect_free_vars(c, target, bound, out);
            for (_, v) in updates {
                collect_free_vars(c, v, bound, out);
            }
        }
        Cast { expr, .. } => collect_free_vars(c, expr, bound, out),
        Instanceof { expr, .. } => collect_free_vars(c, expr, bound, out),
        Interpolation(parts) => {
            for p in parts {
                collect_free_vars(c, p, bound, out);
            }
        }
        Closure { captures, .. } => {
            // A nested closure pulls its explicit captures from this scope.
            for cap in captures {
                push_free(c, cap.name, bound, out);
            }
        }
        ArrowFunction { params, body } => {
            let mut inner = bound.clone();
            for p in params {
                inner.insert(c.var_name(p.name).to_string());
            }
            collect_free_vars(c, body, &inner, out);
        }
        Int(_) | Float(_) | Str(_) | Bool(_) | Null | StaticPropertyAccess { .. }
        | ClassConst { .. } => {}
    }
}

/// Literal expression to constant, for defaults and class constants.
pub(crate) fn lit_const(c: &Compiler<'_>, e: &Expr) -> Option<Constant> {
    match e {
        Expr::Int(n) => Some(Constant::Int(*n)),
        Expr::Float(f) => Some(Constant::Float(*f)),
        Expr::Str(id) => Some(Constant::Str(c.name(*id).to_string())),
        Expr::Bool(b) => Some(Constant::Bool(*b)),
        Expr::Null => Some(Constant::Null),
        Expr::Unary {
            op: crate::ast::UnaryOp::Neg,
            operand,
        } => match lit_const(c, operand)? {
            Constant::Int(n) => Some(Constant::Int(-n)),
            Constant::Float(f) => Some(Constant::Float(-f)),
            _ => None,
        },
        _ => None,
    }
}
