//! Expression lowering.

use crate::ast::{BinaryOp, Callee, CastKind, Expr, PostfixOp, StringId, UnaryOp};
use crate::errors::CompileError;
use crate::vm::builtins;
use crate::vm::compiler::{Compiler, Scope};
use crate::vm::opcode::{Constant, Instruction, Op};

impl<'a> Compiler<'a> {
    /// Compile an expression; exactly one value is left on the stack.
    pub(crate) fn compile_expr(&mut self, e: &Expr) -> Result<(), CompileError> {
        match e {
            Expr::Int(0) => {
                self.emit_op(Op::PushInt0);
            }
            Expr::Int(1) => {
                self.emit_op(Op::PushInt1);
            }
            Expr::Int(n) => {
                let k = self.add_const(Constant::Int(*n))?;
                self.emit_a(Op::PushConst, k);
            }
            Expr::Float(f) => {
                let k = self.add_const(Constant::Float(*f))?;
                self.emit_a(Op::PushConst, k);
            }
            Expr::Str(id) => {
                let s = self.name(*id).to_string();
                let k = self.str_const(&s)?;
                self.emit_a(Op::PushConst, k);
            }
            Expr::Bool(true) => {
                self.emit_op(Op::PushTrue);
            }
            Expr::Bool(false) => {
                self.emit_op(Op::PushFalse);
            }
            Expr::Null => {
                self.emit_op(Op::PushNull);
            }

            Expr::Variable(id) => self.compile_var_load(*id)?,

            Expr::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs)?,
            Expr::Unary { op, operand } => self.compile_unary(*op, operand)?,
            Expr::Postfix { op, operand } => self.compile_postfix(*op, operand)?,

            Expr::Assign { target, value } => self.compile_assign(target, value)?,

            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => self.compile_ternary(condition, then.as_deref(), otherwise)?,

            Expr::Call { callee, args } => self.compile_call(callee, args)?,
            Expr::MethodCall {
                target,
                method,
                args,
                nullsafe,
            } => self.compile_method_call(target, *method, args, *nullsafe)?,
            Expr::StaticCall {
                class,
                method,
                args,
            } => {
                let class_k = {
                    let name = self.name(*class).to_string();
                    self.str_const(&name)?
                };
                let method_k = {
                    let name = self.name(*method).to_string();
                    self.str_const(&name)?
                };
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit_abf(Op::CallStatic, class_k, method_k, args.len() as u8);
            }

            Expr::New { class, args } => {
                let class_k = {
                    let name = self.name(*class).to_string();
                    self.str_const(&name)?
                };
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit_ab(Op::NewObject, class_k, args.len() as u16);
            }

            Expr::ArrayInit(elements) => {
                self.emit_a(Op::NewArray, elements.len().min(u16::MAX as usize) as u16);
                for element in elements {
                    self.emit_op(Op::Dup);
                    match &element.key {
                        Some(key) => {
                            self.compile_expr(key)?;
                            self.compile_expr(&element.value)?;
                            self.emit_op(Op::ArraySet);
                        }
                        None => {
                            self.compile_expr(&element.value)?;
                            self.emit_op(Op::ArrayPush);
                        }
                    }
                    self.emit_op(Op::Pop);
                }
            }

            Expr::ArrayAccess { target, index } => match index {
                Some(index) => {
                    self.compile_expr(target)?;
                    self.compile_expr(index)?;
                    self.emit_op(Op::ArrayGet);
                }
                None => return Err(CompileError::AppendOutsideAssignment),
            },

            Expr::PropertyAccess {
                target,
                property,
                nullsafe,
            } => {
                self.compile_expr(target)?;
                let name_k = {
                    let name = self.name(*property).to_string();
                    self.str_const(&name)?
                };
                let cache = self.add_cache();
                let op = if *nullsafe { Op::NullsafeGet } else { Op::GetProp };
                self.emit_ab(op, name_k, cache);
            }

            Expr::StaticPropertyAccess { class, property } => {
                let class_k = {
                    let name = self.name(*class).to_string();
                    self.str_const(&name)?
                };
                let name_k = {
                    let name = self.var_name(*property).to_string();
                    self.str_const(&name)?
                };
                self.emit_ab(Op::PushStaticProp, class_k, name_k);
            }

            Expr::ClassConst { class, constant } => {
                let class_k = {
                    let name = self.name(*class).to_string();
                    self.str_const(&name)?
                };
                let name_k = {
                    let name = self.name(*constant).to_string();
                    self.str_const(&name)?
                };
                self.emit_ab(Op::PushClassConst, class_k, name_k);
            }

            Expr::Closure {
                params,
                captures,
                body,
                is_static,
            } => self.compile_closure(params, captures, body, *is_static)?,
            Expr::ArrowFunction { params, body } => self.compile_arrow_function(params, body)?,

            Expr::CloneWith { target, updates } => {
                self.compile_expr(target)?;
                self.emit_op(Op::CloneOp);
                for (prop, value) in updates {
                    self.emit_op(Op::Dup);
                    self.compile_expr(value)?;
                    let name_k = {
                        let name = self.name(*prop).to_string();
                        self.str_const(&name)?
                    };
                    let cache = self.add_cache();
                    self.emit_ab(Op::SetProp, name_k, cache);
                    self.emit_op(Op::Pop);
                }
            }

            Expr::Cast { kind, expr } => {
                self.compile_expr(expr)?;
                let op = match kind {
                    CastKind::Int => Op::ToInt,
                    CastKind::Float => Op::ToFloat,
                    CastKind::String => Op::ToString,
                    CastKind::Bool => Op::ToBool,
                    CastKind::Array => Op::ToArray,
                    CastKind::Object => Op::ToObject,
                };
                self.emit_op(op);
            }

            Expr::Instanceof { expr, class } => {
                self.compile_expr(expr)?;
                let class_k = {
                    let name = self.name(*class).to_string();
                    self.str_const(&name)?
                };
                self.emit_a(Op::InstanceOf, class_k);
            }

            Expr::Interpolation(parts) => {
                for part in parts {
                    self.compile_expr(part)?;
                }
                self.emit_a(Op::Interpolate, parts.len() as u16);
            }
        }
        Ok(())
    }

    // ==================== Variables ====================

    pub(crate) fn compile_var_load(&mut self, id: StringId) -> Result<(), CompileError> {
        let name = self.var_name(id).to_string();
        if name == "this" {
            return match self.st().scope {
                Scope::Method { is_static: false, .. } => {
                    self.emit_a(Op::PushLocal, 0);
                    Ok(())
                }
                _ => Err(CompileError::ThisOutsideMethod),
            };
        }
        if self.st().scope == Scope::Main {
            let slot = self.global_slot(&name);
            self.emit_a(Op::PushGlobal, slot);
        } else {
            let slot = self.s().local_slot(&name)?;
            self.emit_a(Op::PushLocal, slot);
        }
        Ok(())
    }

    /// Emit the store for a variable; the value to store is on the stack.
    fn compile_var_store(&mut self, id: StringId) -> Result<(), CompileError> {
        let name = self.var_name(id).to_string();
        if name == "this" {
            return Err(CompileError::InvalidAssignmentTarget);
        }
        if self.st().scope == Scope::Main {
            let slot = self.global_slot(&name);
            self.emit_a(Op::StoreGlobal, slot);
        } else {
            let slot = self.s().local_slot(&name)?;
            self.emit_a(Op::StoreLocal, slot);
        }
        Ok(())
    }

    // ==================== Binary operators ====================

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        match op {
            BinaryOp::And => return self.compile_and(lhs, rhs),
            BinaryOp::Or => return self.compile_or(lhs, rhs),
            BinaryOp::NullCoalesce => return self.compile_coalesce(lhs, rhs),
            BinaryOp::Pipe => return self.compile_pipe(lhs, rhs),
            _ => {}
        }
        self.compile_expr(lhs)?;
        self.compile_expr(rhs)?;
        let float = is_float_hint(lhs) || is_float_hint(rhs);
        let op = match op {
            BinaryOp::Add => pick(float, Op::AddFloat, Op::AddInt),
            BinaryOp::Sub => pick(float, Op::SubFloat, Op::SubInt),
            BinaryOp::Mul => pick(float, Op::MulFloat, Op::MulInt),
            BinaryOp::Div => pick(float, Op::DivFloat, Op::DivInt),
            BinaryOp::Mod => pick(float, Op::ModFloat, Op::ModInt),
            BinaryOp::Pow => pick(float, Op::PowFloat, Op::PowInt),
            BinaryOp::Concat => Op::Concat,
            BinaryOp::Equal => Op::Eq,
            BinaryOp::NotEqual => Op::Neq,
            BinaryOp::Identical => Op::Identical,
            BinaryOp::NotIdentical => Op::NotIdentical,
            BinaryOp::LessThan => Op::Lt,
            BinaryOp::LessEqual => Op::Le,
            BinaryOp::GreaterThan => Op::Gt,
            BinaryOp::GreaterEqual => Op::Ge,
            BinaryOp::Spaceship => Op::Spaceship,
            BinaryOp::BitAnd => Op::BitAnd,
            BinaryOp::BitOr => Op::BitOr,
            BinaryOp::BitXor => Op::BitXor,
            BinaryOp::ShiftLeft => Op::Shl,
            BinaryOp::ShiftRight => Op::Shr,
            BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce | BinaryOp::Pipe => {
                unreachable!("handled above")
            }
        };
        self.emit_op(op);
        Ok(())
    }

    /// `&&` without materializing both sides.
    fn compile_and(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        self.compile_expr(lhs)?;
        let to_false = self.emit_jump(Op::Jz);
        let depth = self.st().depth;
        self.compile_expr(rhs)?;
        self.emit_op(Op::ToBool);
        let to_end = self.emit_jump(Op::Jmp);
        self.patch_jump(to_false)?;
        self.set_depth(depth);
        self.emit_op(Op::PushFalse);
        self.patch_jump(to_end)?;
        self.set_depth(depth + 1);
        Ok(())
    }

    fn compile_or(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        self.compile_expr(lhs)?;
        let to_true = self.emit_jump(Op::Jnz);
        let depth = self.st().depth;
        self.compile_expr(rhs)?;
        self.emit_op(Op::ToBool);
        let to_end = self.emit_jump(Op::Jmp);
        self.patch_jump(to_true)?;
        self.set_depth(depth);
        self.emit_op(Op::PushTrue);
        self.patch_jump(to_end)?;
        self.set_depth(depth + 1);
        Ok(())
    }

    /// `??` with a single evaluation of the left side. Literal right sides
    /// use the eager `coalesce` instruction.
    fn compile_coalesce(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        if is_cheap_literal(rhs) {
            self.compile_expr(lhs)?;
            self.compile_expr(rhs)?;
            self.emit_op(Op::Coalesce);
            return Ok(());
        }
        self.compile_expr(lhs)?;
        self.emit_op(Op::Dup);
        self.emit_op(Op::IsNull);
        let keep = self.emit_jump(Op::Jz);
        let depth = self.st().depth;
        self.emit_op(Op::Pop);
        self.compile_expr(rhs)?;
        self.patch_jump(keep)?;
        self.set_depth(depth);
        Ok(())
    }

    /// `a |> f`: push `a`, then invoke `f` with one argument. A literal
    /// function name takes the direct-call fast path.
    fn compile_pipe(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        self.compile_expr(lhs)?;
        if let Expr::Str(id) = rhs {
            let name = self.name(*id).to_string();
            let lower = name.to_lowercase();
            if let Some(def) = builtins::lookup(&lower) {
                self.emit_ab(Op::CallBuiltin, def.id, 1);
            } else {
                let name_k = self.str_const(&name)?;
                self.emit_ab(Op::Call, name_k, 1);
            }
            return Ok(());
        }
        self.compile_expr(rhs)?;
        self.emit_op(Op::Swap);
        self.emit_a(Op::ClosureCall, 1);
        Ok(())
    }

    // ==================== Unary & postfix ====================

    fn compile_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<(), CompileError> {
        match op {
            UnaryOp::Neg => {
                self.compile_expr(operand)?;
                let op = if is_float_hint(operand) {
                    Op::NegFloat
                } else {
                    Op::NegInt
                };
                self.emit_op(op);
            }
            UnaryOp::Not => {
                self.compile_expr(operand)?;
                self.emit_op(Op::LogicNot);
            }
            UnaryOp::BitNot => {
                self.compile_expr(operand)?;
                self.emit_op(Op::BitNot);
            }
            UnaryOp::Clone => {
                self.compile_expr(operand)?;
                self.emit_op(Op::CloneOp);
            }
            UnaryOp::PreInc | UnaryOp::PreDec => {
                let delta_op = if op == UnaryOp::PreInc {
                    Op::IncLocalInt
                } else {
                    Op::DecLocalInt
                };
                if let Some(slot) = self.as_local_slot(operand)? {
                    self.emit_a(delta_op, slot);
                    self.emit_a(Op::PushLocal, slot);
                } else {
                    // Desugar to `target = target ± 1`, yielding the new
                    // value.
                    let one = Expr::Int(1);
                    let bin = Expr::Binary {
                        op: if op == UnaryOp::PreInc {
                            BinaryOp::Add
                        } else {
                            BinaryOp::Sub
                        },
                        lhs: Box::new(operand.clone()),
                        rhs: Box::new(one),
                    };
                    self.compile_assign(operand, &bin)?;
                }
            }
        }
        Ok(())
    }

    fn compile_postfix(&mut self, op: PostfixOp, operand: &Expr) -> Result<(), CompileError> {
        if let Some(slot) = self.as_local_slot(operand)? {
            self.emit_a(Op::PushLocal, slot);
            let delta_op = match op {
                PostfixOp::PostInc => Op::IncLocalInt,
                PostfixOp::PostDec => Op::DecLocalInt,
            };
            self.emit_a(delta_op, slot);
            return Ok(());
        }
        if let (Expr::Variable(id), Scope::Main) = (operand, &self.st().scope) {
            let name = self.var_name(*id).to_string();
            let slot = self.global_slot(&name);
            self.emit_a(Op::PushGlobal, slot);
            self.emit_op(Op::Dup);
            self.emit_op(Op::PushInt1);
            let delta = match op {
                PostfixOp::PostInc => Op::AddInt,
                PostfixOp::PostDec => Op::SubInt,
            };
            self.emit_op(delta);
            self.emit_a(Op::StoreGlobal, slot);
            return Ok(());
        }
        // Complex target: `(target = target ± 1) ∓ 1` restores the old
        // numeric value as the expression result.
        let bin = Expr::Binary {
            op: match op {
                PostfixOp::PostInc => BinaryOp::Add,
                PostfixOp::PostDec => BinaryOp::Sub,
            },
            lhs: Box::new(operand.clone()),
            rhs: Box::new(Expr::Int(1)),
        };
        self.compile_assign(operand, &bin)?;
        self.emit_op(Op::PushInt1);
        self.emit_op(match op {
            PostfixOp::PostInc => Op::SubInt,
            PostfixOp::PostDec => Op::AddInt,
        });
        Ok(())
    }

    // ==================== Assignment ====================

    pub(crate) fn compile_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
    ) -> Result<(), CompileError> {
        match target {
            Expr::Variable(id) => {
                self.compile_expr(value)?;
                self.emit_op(Op::Dup);
                self.compile_var_store(*id)?;
                Ok(())
            }
            Expr::ArrayAccess { target, index } => {
                self.compile_write_base(target)?;
                match index {
                    Some(index) => {
                        self.compile_expr(index)?;
                        self.compile_expr(value)?;
                        self.emit_op(Op::ArraySet);
                    }
                    None => {
                        self.compile_expr(value)?;
                        self.emit_op(Op::ArrayPush);
                    }
                }
                Ok(())
            }
            Expr::PropertyAccess {
                target, property, ..
            } => {
                self.compile_expr(target)?;
                self.compile_expr(value)?;
                let name_k = {
                    let name = self.name(*property).to_string();
                    self.str_const(&name)?
                };
                let cache = self.add_cache();
                self.emit_ab(Op::SetProp, name_k, cache);
                Ok(())
            }
            Expr::StaticPropertyAccess { class, property } => {
                self.compile_expr(value)?;
                self.emit_op(Op::Dup);
                let class_k = {
                    let name = self.name(*class).to_string();
                    self.str_const(&name)?
                };
                let name_k = {
                    let name = self.var_name(*property).to_string();
                    self.str_const(&name)?
                };
                self.emit_ab(Op::StoreStaticProp, class_k, name_k);
                Ok(())
            }
            _ => Err(CompileError::InvalidAssignmentTarget),
        }
    }

    /// Push the array a nested write goes through, vivifying along the
    /// way: `$a[1][2] = v` fetches (or creates) `$a`, then `$a[1]`.
    fn compile_write_base(&mut self, base: &Expr) -> Result<(), CompileError> {
        match base {
            Expr::Variable(id) => {
                let name = self.var_name(*id).to_string();
                if self.st().scope == Scope::Main {
                    let slot = self.global_slot(&name);
                    self.emit_a(Op::PushGlobalArray, slot);
                } else {
                    let slot = self.s().local_slot(&name)?;
                    self.emit_a(Op::PushLocalArray, slot);
                }
                Ok(())
            }
            Expr::ArrayAccess {
                target,
                index: Some(index),
            } => {
                self.compile_write_base(target)?;
                self.compile_expr(index)?;
                self.emit_op(Op::ArrayGetW);
                Ok(())
            }
            Expr::ArrayAccess { index: None, .. } => Err(CompileError::AppendOutsideAssignment),
            // Arrays reached through properties or calls share their box;
            // mutation through the fetched handle is visible.
            other => self.compile_expr(other),
        }
    }

    // ==================== Ternary ====================

    fn compile_ternary(
        &mut self,
        condition: &Expr,
        then: Option<&Expr>,
        otherwise: &Expr,
    ) -> Result<(), CompileError> {
        match then {
            Some(then) => {
                self.compile_expr(condition)?;
                let to_else = self.emit_jump(Op::Jz);
                let depth = self.st().depth;
                self.compile_expr(then)?;
                let to_end = self.emit_jump(Op::Jmp);
                self.patch_jump(to_else)?;
                self.set_depth(depth);
                self.compile_expr(otherwise)?;
                self.patch_jump(to_end)?;
            }
            None => {
                // `a ?: b` evaluates `a` once.
                self.compile_expr(condition)?;
                self.emit_op(Op::Dup);
                let keep = self.emit_jump(Op::Jnz);
                let depth = self.st().depth;
                self.emit_op(Op::Pop);
                self.compile_expr(otherwise)?;
                self.patch_jump(keep)?;
                self.set_depth(depth);
            }
        }
        Ok(())
    }

    // ==================== Calls ====================

    fn compile_call(&mut self, callee: &Callee, args: &[Expr]) -> Result<(), CompileError> {
        match callee {
            Callee::Name(id) => {
                let name = self.name(*id).to_string();
                let lower = name.to_lowercase();
                let sig = self.fn_sigs.get(&lower).cloned();
                self.compile_args(args, sig.as_deref())?;
                if let Some(def) = builtins::lookup(&lower) {
                    self.emit_ab(Op::CallBuiltin, def.id, args.len() as u16);
                } else {
                    let name_k = self.str_const(&name)?;
                    self.emit(Instruction::with_ab(Op::Call, name_k, args.len() as u16));
                }
                Ok(())
            }
            Callee::Expr(callee) => {
                self.compile_expr(callee)?;
                self.compile_args(args, None)?;
                self.emit_a(Op::ClosureCall, args.len() as u16);
                Ok(())
            }
        }
    }

    /// Emit arguments; a declared by-reference parameter receiving a plain
    /// variable gets a reference cell instead of a copy.
    fn compile_args(
        &mut self,
        args: &[Expr],
        by_ref: Option<&[bool]>,
    ) -> Result<(), CompileError> {
        for (i, arg) in args.iter().enumerate() {
            let wants_ref = by_ref.and_then(|flags| flags.get(i).copied()).unwrap_or(false);
            if wants_ref {
                if let Expr::Variable(id) = arg {
                    let name = self.var_name(*id).to_string();
                    if name != "this" {
                        if self.st().scope == Scope::Main {
                            let slot = self.global_slot(&name);
                            self.emit_ab(Op::CaptureGlobal, slot, 1);
                        } else {
                            let slot = self.s().local_slot(&name)?;
                            self.emit_ab(Op::CaptureVar, slot, 1);
                        }
                        continue;
                    }
                }
            }
            self.compile_expr(arg)?;
        }
        Ok(())
    }

    fn compile_method_call(
        &mut self,
        target: &Expr,
        method: StringId,
        args: &[Expr],
        nullsafe: bool,
    ) -> Result<(), CompileError> {
        self.compile_expr(target)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        let name_k = {
            let name = self.name(method).to_string();
            self.str_const(&name)?
        };
        let cache = self.add_cache();
        let op = if nullsafe {
            Op::NullsafeCall
        } else {
            Op::CallMethod
        };
        self.emit_abf(op, name_k, cache, args.len() as u8);
        Ok(())
    }
}

fn pick(float: bool, f: Op, i: Op) -> Op {
    if float {
        f
    } else {
        i
    }
}

/// Shallow static type hint: literal floats (and float casts) choose the
/// float-typed opcodes; everything else defaults to the int forms, whose
/// fallback handles the rest.
fn is_float_hint(e: &Expr) -> bool {
    match e {
        Expr::Float(_) => true,
        Expr::Cast {
            kind: CastKind::Float,
            ..
        } => true,
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Pow => {
                is_float_hint(lhs) || is_float_hint(rhs)
            }
            BinaryOp::Div => true,
            _ => false,
        },
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => is_float_hint(operand),
        _ => false,
    }
}

fn is_cheap_literal(e: &Expr) -> bool {
    matches!(
        e,
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Null
    )
}
