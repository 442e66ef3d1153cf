//! Statement lowering.

use crate::ast::{Expr, PostfixOp, Stmt, UnaryOp};
use crate::errors::CompileError;
use crate::vm::compiler::{Compiler, Scope};
use crate::vm::opcode::Op;

impl<'a> Compiler<'a> {
    pub(crate) fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expression(e) => self.compile_expr_stmt(e),
            Stmt::Echo(parts) => {
                for part in parts {
                    self.compile_expr(part)?;
                    self.emit_op(Op::Echo);
                }
                Ok(())
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                Ok(())
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => self.compile_if(condition, then_branch, else_branch),
            Stmt::While { condition, body } => self.compile_while(condition, body),
            Stmt::DoWhile { body, condition } => self.compile_do_while(body, condition),
            Stmt::For {
                init,
                condition,
                update,
                body,
            } => self.compile_for(init, condition, update, body),
            Stmt::Foreach {
                iterable,
                key,
                value,
                body,
            } => self.compile_foreach(iterable, *key, *value, body),
            Stmt::Switch {
                subject,
                cases,
                default,
            } => self.compile_switch(subject, cases, default),
            Stmt::Return(expr) => self.compile_return(expr.as_ref()),
            Stmt::Break(depth) => self.compile_break(*depth),
            Stmt::Continue(depth) => self.compile_continue(*depth),
            Stmt::Try {
                body,
                catches,
                finally,
            } => self.compile_try(body, catches, finally),
            Stmt::Throw(expr) => {
                self.compile_expr(expr)?;
                self.emit_op(Op::Throw);
                Ok(())
            }
            Stmt::Unset(targets) => {
                for target in targets {
                    self.compile_unset(target)?;
                }
                Ok(())
            }
            Stmt::FunctionDecl(decl) => self.compile_function_decl(decl),
            Stmt::ClassDecl(decl) => self.compile_class_decl(decl),
            Stmt::InterfaceDecl(decl) => self.compile_interface_decl(decl),
            Stmt::TraitDecl(decl) => self.compile_trait_decl(decl),
            Stmt::EnumDecl(decl) => self.compile_enum_decl(decl),
            Stmt::Line(n) => {
                let offset = self.here();
                self.s().func.lines.push((offset as u16, *n));
                self.emit_a(Op::LineNumber, (*n).min(u16::MAX as u32) as u16);
                Ok(())
            }
        }
    }

    /// Expression statement: evaluate for effect, discarding the value.
    /// Increment/decrement of an integer local short-circuits to the
    /// in-place fast path.
    fn compile_expr_stmt(&mut self, e: &Expr) -> Result<(), CompileError> {
        if let Expr::Postfix { op, operand } = e {
            if let Some(slot) = self.as_local_slot(operand)? {
                let op = match op {
                    PostfixOp::PostInc => Op::IncLocalInt,
                    PostfixOp::PostDec => Op::DecLocalInt,
                };
                self.emit_a(op, slot);
                return Ok(());
            }
        }
        if let Expr::Unary {
            op: op @ (UnaryOp::PreInc | UnaryOp::PreDec),
            operand,
        } = e
        {
            if let Some(slot) = self.as_local_slot(operand)? {
                let op = match op {
                    UnaryOp::PreInc => Op::IncLocalInt,
                    _ => Op::DecLocalInt,
                };
                self.emit_a(op, slot);
                return Ok(());
            }
        }
        self.compile_expr(e)?;
        self.emit_op(Op::Pop);
        Ok(())
    }

    /// Local slot of a plain variable operand, when the current scope
    /// stores it in a local (not a global) slot.
    pub(crate) fn as_local_slot(&mut self, e: &Expr) -> Result<Option<u16>, CompileError> {
        if let Expr::Variable(id) = e {
            if self.st().scope != Scope::Main {
                let name = self.var_name(*id).to_string();
                if name == "this" {
                    return Ok(None);
                }
                return Ok(Some(self.s().local_slot(&name)?));
            }
        }
        Ok(None)
    }

    fn compile_if(
        &mut self,
        condition: &Expr,
        then_branch: &[Stmt],
        else_branch: &Option<Vec<Stmt>>,
    ) -> Result<(), CompileError> {
        self.compile_expr(condition)?;
        let to_else = self.emit_jump(Op::Jz);
        for s in then_branch {
            self.compile_stmt(s)?;
        }
        match else_branch {
            Some(else_stmts) => {
                let to_end = self.emit_jump(Op::Jmp);
                self.patch_jump(to_else)?;
                for s in else_stmts {
                    self.compile_stmt(s)?;
                }
                self.patch_jump(to_end)?;
            }
            None => {
                self.patch_jump(to_else)?;
            }
        }
        Ok(())
    }

    /// `return` runs every enclosing finally before leaving the frame: the
    /// value parks in the pending-return register and control enters the
    /// innermost finally, whose dispatch chains outward.
    fn compile_return(&mut self, expr: Option<&Expr>) -> Result<(), CompileError> {
        match expr {
            Some(e) => self.compile_expr(e)?,
            None => {
                self.emit_op(Op::PushNull);
            }
        }
        if !self.st().finally_bodies.is_empty() {
            // Inside a finally body: overwrite the pending action and jump
            // to this block's dispatch.
            self.emit_op(Op::SetPendingRet);
            let j = self.emit_jump(Op::Jmp);
            self.s()
                .finally_bodies
                .last_mut()
                .expect("checked non-empty")
                .ret_jumps
                .push(j);
            return Ok(());
        }
        if !self.st().finallies.is_empty() {
            self.emit_op(Op::SetPendingRet);
            let site = self.emit_a(Op::EnterFinally, 0);
            self.s()
                .finallies
                .last_mut()
                .expect("checked non-empty")
                .enter_sites
                .push(site);
            return Ok(());
        }
        self.emit_op(Op::Ret);
        Ok(())
    }

    fn compile_unset(&mut self, target: &Expr) -> Result<(), CompileError> {
        match target {
            Expr::Variable(id) => {
                let name = self.var_name(*id).to_string();
                self.emit_op(Op::PushNull);
                if self.st().scope == Scope::Main {
                    let slot = self.global_slot(&name);
                    self.emit_a(Op::StoreGlobal, slot);
                } else {
                    let slot = self.s().local_slot(&name)?;
                    self.emit_a(Op::StoreLocal, slot);
                }
                Ok(())
            }
            Expr::ArrayAccess {
                target,
                index: Some(index),
            } => {
                self.compile_expr(target)?;
                self.compile_expr(index)?;
                self.emit_op(Op::ArrayUnset);
                Ok(())
            }
            _ => Err(CompileError::InvalidAssignmentTarget),
        }
    }
}
