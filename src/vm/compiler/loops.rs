//! Loop and switch lowering, with break/continue bookkeeping.

use crate::ast::{Expr, Stmt, StringId, SwitchCase};
use crate::errors::CompileError;
use crate::vm::compiler::{Compiler, LoopCtx, Scope};
use crate::vm::opcode::{JumpTable, Op};

impl<'a> Compiler<'a> {
    fn push_loop(&mut self, is_foreach: bool, is_switch: bool) {
        let finally_depth = self.st().finallies.len();
        self.s().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            is_foreach,
            is_switch,
            finally_depth,
        });
    }

    /// Close a loop: patch breaks to the current offset and continues to
    /// `continue_target`.
    fn pop_loop(&mut self, continue_target: usize) -> Result<(), CompileError> {
        let ctx = self.s().loops.pop().expect("loop stack underflow");
        for j in ctx.break_jumps {
            self.patch_jump(j)?;
        }
        for j in ctx.continue_jumps {
            self.patch_jump_to(j, continue_target)?;
        }
        Ok(())
    }

    pub(crate) fn compile_while(
        &mut self,
        condition: &Expr,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let start = self.here();
        self.emit_op(Op::LoopStart);
        self.emit_op(Op::Safepoint);
        self.compile_expr(condition)?;
        let exit = self.emit_jump(Op::Jz);
        self.push_loop(false, false);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit_op(Op::LoopEnd);
        let back = self.emit_jump(Op::Jmp);
        self.patch_jump_to(back, start)?;
        self.patch_jump(exit)?;
        self.pop_loop(start)?;
        Ok(())
    }

    pub(crate) fn compile_do_while(
        &mut self,
        body: &[Stmt],
        condition: &Expr,
    ) -> Result<(), CompileError> {
        let start = self.here();
        self.emit_op(Op::LoopStart);
        self.emit_op(Op::Safepoint);
        self.push_loop(false, false);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit_op(Op::LoopEnd);
        let cont = self.here();
        self.compile_expr(condition)?;
        let back = self.emit_jump(Op::Jnz);
        self.patch_jump_to(back, start)?;
        self.pop_loop(cont)?;
        Ok(())
    }

    pub(crate) fn compile_for(
        &mut self,
        init: &Option<Expr>,
        condition: &Option<Expr>,
        update: &Option<Expr>,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        if let Some(init) = init {
            self.compile_expr(init)?;
            self.emit_op(Op::Pop);
        }
        let start = self.here();
        self.emit_op(Op::LoopStart);
        self.emit_op(Op::Safepoint);
        let exit = match condition {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit_jump(Op::Jz))
            }
            None => None,
        };
        self.push_loop(false, false);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit_op(Op::LoopEnd);
        let cont = self.here();
        if let Some(update) = update {
            self.compile_expr(update)?;
            self.emit_op(Op::Pop);
        }
        let back = self.emit_jump(Op::Jmp);
        self.patch_jump_to(back, start)?;
        if let Some(exit) = exit {
            self.patch_jump(exit)?;
        }
        self.pop_loop(cont)?;
        Ok(())
    }

    pub(crate) fn compile_foreach(
        &mut self,
        iterable: &Expr,
        key: Option<StringId>,
        value: StringId,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        self.compile_expr(iterable)?;
        self.emit_op(Op::ForeachInit);
        self.s().iter_depth += 1;

        let head = self.here();
        self.emit_op(Op::LoopStart);
        self.emit_op(Op::Safepoint);
        let head_depth = self.st().depth;
        let next = self.emit_jump(Op::ForeachNext);
        // Stack is now [key, value].
        self.compile_foreach_store(value)?;
        match key {
            Some(key) => self.compile_foreach_store(key)?,
            None => {
                self.emit_op(Op::Pop);
            }
        }

        self.push_loop(true, false);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit_op(Op::LoopEnd);
        let back = self.emit_jump(Op::Jmp);
        self.patch_jump_to(back, head)?;
        self.patch_jump(next)?;
        self.set_depth(head_depth);
        self.pop_loop(head)?;
        self.s().iter_depth -= 1;
        Ok(())
    }

    fn compile_foreach_store(&mut self, var: StringId) -> Result<(), CompileError> {
        let name = self.var_name(var).to_string();
        if self.st().scope == Scope::Main {
            let slot = self.global_slot(&name);
            self.emit_a(Op::StoreGlobal, slot);
        } else {
            let slot = self.s().local_slot(&name)?;
            self.emit_a(Op::StoreLocal, slot);
        }
        Ok(())
    }

    // ==================== switch ====================

    pub(crate) fn compile_switch(
        &mut self,
        subject: &Expr,
        cases: &[SwitchCase],
        default: &Option<Vec<Stmt>>,
    ) -> Result<(), CompileError> {
        let all_int = cases.iter().all(|c| matches!(c.value, Expr::Int(_)));
        let all_str = cases.iter().all(|c| matches!(c.value, Expr::Str(_)));
        if !cases.is_empty() && (all_int || all_str) {
            return self.compile_switch_table(subject, cases, default, all_int);
        }
        self.compile_switch_chain(subject, cases, default)
    }

    /// Dense dispatch through a jump table.
    fn compile_switch_table(
        &mut self,
        subject: &Expr,
        cases: &[SwitchCase],
        default: &Option<Vec<Stmt>>,
        int_table: bool,
    ) -> Result<(), CompileError> {
        self.compile_expr(subject)?;
        let table_idx = {
            let state = self.s();
            let idx = state.func.jump_tables.len() as u16;
            state.func.jump_tables.push(if int_table {
                JumpTable::Int(Vec::new())
            } else {
                JumpTable::Str(Vec::new())
            });
            idx
        };
        let switch_at = self.emit_ab(
            if int_table { Op::SwitchInt } else { Op::SwitchStr },
            table_idx,
            0,
        );

        self.push_loop(false, true);
        for case in cases {
            let target = self.here() as u16;
            match &case.value {
                Expr::Int(n) => {
                    if let JumpTable::Int(pairs) =
                        &mut self.s().func.jump_tables[table_idx as usize]
                    {
                        pairs.push((*n, target));
                    }
                }
                Expr::Str(id) => {
                    let label = self.name(*id).to_string();
                    if let JumpTable::Str(pairs) =
                        &mut self.s().func.jump_tables[table_idx as usize]
                    {
                        pairs.push((label, target));
                    }
                }
                _ => unreachable!("mixed switch table"),
            }
            for s in &case.body {
                self.compile_stmt(s)?;
            }
            // Fall through to the next case, as PHP does without break.
        }
        let default_target = self.here();
        if let Some(default) = default {
            for s in default {
                self.compile_stmt(s)?;
            }
        }
        let end = self.here();
        let default_target = if default.is_some() {
            default_target
        } else {
            end
        };
        self.s().func.bytecode[switch_at].b = default_target as u16;
        self.pop_loop(end)?;
        Ok(())
    }

    /// Loose-comparison chain for mixed or non-literal labels.
    fn compile_switch_chain(
        &mut self,
        subject: &Expr,
        cases: &[SwitchCase],
        default: &Option<Vec<Stmt>>,
    ) -> Result<(), CompileError> {
        self.compile_expr(subject)?;
        let tmp = self.temp_local("switch")?;
        self.emit_a(Op::StoreLocal, tmp);

        let mut case_jumps = Vec::new();
        for case in cases {
            self.emit_a(Op::PushLocal, tmp);
            self.compile_expr(&case.value)?;
            self.emit_op(Op::Eq);
            case_jumps.push(self.emit_jump(Op::Jnz));
        }
        let to_default = self.emit_jump(Op::Jmp);

        self.push_loop(false, true);
        for (case, jump) in cases.iter().zip(case_jumps) {
            self.patch_jump(jump)?;
            for s in &case.body {
                self.compile_stmt(s)?;
            }
        }
        self.patch_jump(to_default)?;
        if let Some(default) = default {
            for s in default {
                self.compile_stmt(s)?;
            }
        }
        let end = self.here();
        self.pop_loop(end)?;
        Ok(())
    }

    // ==================== break / continue ====================

    /// Finally bodies opened since `finally_depth` replay inline before a
    /// jump leaves their try regions, innermost first. Each body compiles
    /// with its own context popped (a block never re-enters itself) and
    /// the contexts are restored afterwards.
    fn inline_finallies_down_to(&mut self, finally_depth: usize) -> Result<(), CompileError> {
        let mut saved = Vec::new();
        while self.st().finallies.len() > finally_depth {
            let ctx = self.s().finallies.pop().expect("checked non-empty");
            let body = ctx.body.clone();
            saved.push(ctx);
            for s in &body {
                self.compile_stmt(s)?;
            }
        }
        while let Some(ctx) = saved.pop() {
            self.s().finallies.push(ctx);
        }
        Ok(())
    }

    pub(crate) fn compile_break(&mut self, depth: u32) -> Result<(), CompileError> {
        let depth = depth.max(1) as usize;
        let loop_count = self.st().loops.len();
        if depth > loop_count {
            return if loop_count == 0 {
                Err(CompileError::BreakOutsideLoop)
            } else {
                Err(CompileError::BadBreakDepth(depth as u32))
            };
        }
        let target_idx = loop_count - depth;
        // Close the iterators of every foreach being exited.
        let pops = self.st().loops[target_idx..]
            .iter()
            .filter(|l| l.is_foreach)
            .count();
        for _ in 0..pops {
            self.emit_op(Op::IterPop);
        }
        let finally_depth = self.st().loops[target_idx].finally_depth;
        self.inline_finallies_down_to(finally_depth)?;
        let j = self.emit_jump(Op::Jmp);
        self.s().loops[target_idx].break_jumps.push(j);
        Ok(())
    }

    pub(crate) fn compile_continue(&mut self, depth: u32) -> Result<(), CompileError> {
        let mut remaining = depth.max(1) as usize;
        // `continue` targets loops, not switches.
        let mut target_idx = None;
        for (i, l) in self.st().loops.iter().enumerate().rev() {
            if l.is_switch {
                continue;
            }
            remaining -= 1;
            if remaining == 0 {
                target_idx = Some(i);
                break;
            }
        }
        let Some(target_idx) = target_idx else {
            return Err(CompileError::ContinueOutsideLoop);
        };
        // Close iterators of inner foreach loops, keeping the target's.
        let pops = self.st().loops[target_idx + 1..]
            .iter()
            .filter(|l| l.is_foreach)
            .count();
        for _ in 0..pops {
            self.emit_op(Op::IterPop);
        }
        let finally_depth = self.st().loops[target_idx].finally_depth;
        self.inline_finallies_down_to(finally_depth)?;
        let j = self.emit_jump(Op::Jmp);
        self.s().loops[target_idx].continue_jumps.push(j);
        Ok(())
    }
}
