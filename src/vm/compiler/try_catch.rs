//! try/catch/finally lowering.
//!
//! Protected regions are described by the exception table, not by opcodes.
//! Per construct the generator records one entry per catch clause over the
//! try-body range (innermost entries precede enclosing ones because inner
//! constructs finish compiling first), plus a catch-less entry carrying
//! the finally offset over the whole try-and-catch span. Non-exceptional
//! paths reach the finally body through `enter_finally`, and its trailing
//! `finally_dispatch` resumes whatever was suspended.

use crate::ast::{CatchClause, Stmt};
use crate::errors::CompileError;
use crate::vm::compiler::{Compiler, FinallyBodyCtx, FinallyCtx, Scope};
use crate::vm::opcode::{ExceptionEntry, Op};

impl<'a> Compiler<'a> {
    pub(crate) fn compile_try(
        &mut self,
        body: &[Stmt],
        catches: &[CatchClause],
        finally: &Option<Vec<Stmt>>,
    ) -> Result<(), CompileError> {
        let has_finally = finally.is_some();
        if let Some(finally_body) = finally {
            self.s().finallies.push(FinallyCtx {
                body: finally_body.clone(),
                enter_sites: Vec::new(),
            });
        }

        let try_depth = self.st().depth;
        let try_iter = self.st().iter_depth;
        let try_start = self.here();
        for s in body {
            self.compile_stmt(s)?;
        }
        let try_end = self.here();

        let mut end_jumps = Vec::new();
        if has_finally {
            let site = self.emit_a(Op::EnterFinally, 0);
            self.s()
                .finallies
                .last_mut()
                .expect("finally context pushed above")
                .enter_sites
                .push(site);
        } else {
            end_jumps.push(self.emit_jump(Op::Jmp));
        }

        // Catch handlers. Each begins with the exception on the stack.
        let mut clause_entries = Vec::new();
        for clause in catches {
            let handler = self.here();
            self.set_depth(try_depth + 1);
            match clause.variable {
                Some(var) => {
                    let name = self.var_name(var).to_string();
                    if self.st().scope == Scope::Main {
                        let slot = self.global_slot(&name);
                        self.emit_a(Op::StoreGlobal, slot);
                    } else {
                        let slot = self.s().local_slot(&name)?;
                        self.emit_a(Op::StoreLocal, slot);
                    }
                }
                None => {
                    self.emit_op(Op::Pop);
                }
            }
            for s in &clause.body {
                self.compile_stmt(s)?;
            }
            if has_finally {
                let site = self.emit_a(Op::EnterFinally, 0);
                self.s()
                    .finallies
                    .last_mut()
                    .expect("finally context pushed above")
                    .enter_sites
                    .push(site);
            } else {
                end_jumps.push(self.emit_jump(Op::Jmp));
            }
            let type_name = self.name(clause.type_name).to_string();
            let type_k = self.str_const(&type_name)?;
            clause_entries.push((handler, type_k));
        }
        let catch_end = self.here();

        for (handler, type_k) in clause_entries {
            self.s().func.exception_table.push(ExceptionEntry {
                start: try_start as u16,
                end: try_end as u16,
                handler: Some(handler as u16),
                catch_type: Some(type_k),
                finally: None,
                stack_depth: try_depth.max(0) as u16,
                iter_depth: try_iter,
            });
        }

        if has_finally {
            let ctx = self
                .s()
                .finallies
                .pop()
                .expect("finally context pushed above");

            let finally_offset = self.here();
            self.set_depth(try_depth);
            self.s().finally_bodies.push(FinallyBodyCtx {
                ret_jumps: Vec::new(),
            });
            for s in &ctx.body {
                self.compile_stmt(s)?;
            }
            let body_ctx = self
                .s()
                .finally_bodies
                .pop()
                .expect("finally body context pushed above");
            let dispatch_at = self.here();
            for j in body_ctx.ret_jumps {
                self.patch_jump_to(j, dispatch_at)?;
            }
            let dispatch = self.emit_a(Op::FinallyDispatch, 0);

            let entry_idx = self.s().func.exception_table.len() as u16;
            self.s().func.exception_table.push(ExceptionEntry {
                start: try_start as u16,
                end: catch_end as u16,
                handler: None,
                catch_type: None,
                finally: Some(finally_offset as u16),
                stack_depth: try_depth.max(0) as u16,
                iter_depth: try_iter,
            });
            for site in ctx.enter_sites {
                self.s().func.bytecode[site].a = entry_idx;
            }

            let end = self.here();
            self.patch_jump_to(dispatch, end)?;
            self.set_depth(try_depth);
        }

        for j in end_jumps {
            self.patch_jump(j)?;
        }
        Ok(())
    }
}
