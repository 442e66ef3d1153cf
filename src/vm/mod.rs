//! The bytecode virtual machine.
//!
//! A stack machine executing [`opcode::CompiledFunction`] bodies: one shared
//! operand stack, a frame per invocation, exception-table unwinding, inline
//! caches on property and method sites, and a reference-counted heap with a
//! cycle collector that runs at safepoints.

pub mod builtins;
pub mod class;
pub mod compiler;
pub mod frame;
pub mod inline_cache;
pub mod opcode;
pub mod optimizer;
pub mod registry;

mod execution;
mod ops;
mod values;

use crate::errors::{FatalError, VmError};
use crate::heap::Heap;
use crate::runtime::{ArrayKey, Value};
use crate::vm::class::ClassId;
use crate::vm::compiler::CompilationUnit;
use crate::vm::frame::CallFrame;
use crate::vm::opcode::{Instruction, Op, UserFunction};
use crate::vm::registry::ClassRegistry;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Tunables for one VM instance.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Roots-buffer size that triggers a cycle collection at safepoints.
    pub gc_threshold: usize,
    /// Narrate collections on stderr.
    pub gc_debug: bool,
    /// Call frames before a stack-overflow fatal.
    pub max_call_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            gc_threshold: crate::heap::DEFAULT_GC_THRESHOLD,
            gc_debug: false,
            max_call_depth: 4096,
        }
    }
}

/// A snapshot iterator opened by `foreach_init`. Iteration order is the
/// array's insertion order at snapshot time; later mutation of the source
/// array never affects the sequence.
pub(crate) struct ForeachIter {
    pub entries: Vec<(ArrayKey, Value)>,
    pub pos: usize,
}

/// Hint left by `finally_dispatch` for the unwinder: resume scanning the
/// exception table after the entry whose finally just completed.
pub(crate) struct ResumeHint {
    pub from_entry: usize,
    pub at_pc: u16,
}

/// The virtual machine.
pub struct Vm<W: Write> {
    /// Operand stack shared by all frames
    pub(crate) stack: Vec<Value>,
    /// Call frames
    pub(crate) frames: Vec<CallFrame>,
    /// Global slots (top-level scope)
    pub(crate) globals: Vec<Value>,
    /// Open foreach iterators
    pub(crate) iters: Vec<ForeachIter>,
    pub heap: Heap,
    pub registry: ClassRegistry,
    /// User functions, keyed by lowercased name
    pub(crate) functions: HashMap<String, Arc<UserFunction>>,
    /// The unit being executed (declaration instructions index into it)
    pub(crate) unit: Option<Arc<CompilationUnit>>,
    /// Enum case singletons, instantiated on first access
    pub(crate) enum_cases: HashMap<(ClassId, String), Value>,
    pub(crate) output: W,
    pub(crate) options: VmOptions,
    pub(crate) in_gc: bool,
    pub(crate) in_finalizer: bool,
    pub(crate) halted: bool,
    pub(crate) resume_hint: Option<ResumeHint>,
}

impl<W: Write> Vm<W> {
    pub fn new(output: W) -> Self {
        Self::with_options(output, VmOptions::default())
    }

    pub fn with_options(output: W, options: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.gc_threshold = options.gc_threshold;
        heap.gc_debug = options.gc_debug;
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: Vec::new(),
            iters: Vec::new(),
            heap,
            registry: ClassRegistry::new(),
            functions: HashMap::new(),
            unit: None,
            enum_cases: HashMap::new(),
            output,
            options,
            in_gc: false,
            in_finalizer: false,
            halted: false,
            resume_hint: None,
        }
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Number of live heap boxes; test hooks and `gc_collect_cycles`
    /// reporting.
    pub fn live_boxes(&self) -> usize {
        self.heap.live_count()
    }

    /// Write to the program's output stream, surfacing failures as a
    /// fatal condition.
    pub(crate) fn write_output(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.output
            .write_all(bytes)
            .map_err(|e| VmError::Fatal(FatalError::Output(e)))
    }

    // ==================== Dispatch ====================

    /// Execute one instruction. Jumps rewrite the current frame's `ip`;
    /// thrown PHP values surface as `VmError::Throw` and are routed to the
    /// exception table by the caller.
    pub(crate) fn execute_instruction(&mut self, ins: Instruction) -> Result<(), VmError> {
        match ins.op {
            // ==================== Stack & slots ====================
            Op::Nop => {}
            Op::PushConst => {
                let c = self.current_code().constants[ins.a as usize].clone();
                let v = self.constant_value(&c);
                self.stack.push(v);
            }
            Op::PushLocal => {
                let v = self.load_local(ins.a);
                self.stack.push(v);
            }
            Op::PushGlobal => {
                let v = self.load_global(ins.a);
                self.stack.push(v);
            }
            Op::Pop => {
                let v = self.pop()?;
                self.heap.release_value(&v);
            }
            Op::Dup => {
                let top = self.peek()?.clone();
                self.heap.retain_value(&top);
                self.stack.push(top);
            }
            Op::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.underflow());
                }
                self.stack.swap(len - 1, len - 2);
            }
            Op::PushNull => self.stack.push(Value::Null),
            Op::PushTrue => self.stack.push(Value::Bool(true)),
            Op::PushFalse => self.stack.push(Value::Bool(false)),
            Op::PushInt0 => self.stack.push(Value::Int(0)),
            Op::PushInt1 => self.stack.push(Value::Int(1)),
            Op::StoreLocal => {
                let v = self.pop()?;
                self.store_local(ins.a, v);
            }
            Op::StoreGlobal => {
                let v = self.pop()?;
                self.store_global(ins.a, v);
            }
            Op::PushLocalArray => ops::arrays::push_local_array(self, ins.a)?,
            Op::PushGlobalArray => ops::arrays::push_global_array(self, ins.a)?,

            // ==================== Arithmetic ====================
            Op::AddInt => ops::arithmetic::add(self)?,
            Op::SubInt => ops::arithmetic::sub(self)?,
            Op::MulInt => ops::arithmetic::mul(self)?,
            Op::DivInt => ops::arithmetic::div(self)?,
            Op::ModInt => ops::arithmetic::modulo(self)?,
            Op::PowInt => ops::arithmetic::pow(self)?,
            Op::NegInt => ops::arithmetic::neg(self)?,
            Op::IncLocalInt => ops::arithmetic::inc_local(self, ins.a, 1)?,
            Op::DecLocalInt => ops::arithmetic::inc_local(self, ins.a, -1)?,
            Op::AddFloat => ops::arithmetic::add_float(self)?,
            Op::SubFloat => ops::arithmetic::sub_float(self)?,
            Op::MulFloat => ops::arithmetic::mul_float(self)?,
            Op::DivFloat => ops::arithmetic::div_float(self)?,
            Op::ModFloat => ops::arithmetic::mod_float(self)?,
            Op::PowFloat => ops::arithmetic::pow_float(self)?,
            Op::NegFloat => ops::arithmetic::neg(self)?,
            Op::BitAnd => ops::arithmetic::bit_and(self)?,
            Op::BitOr => ops::arithmetic::bit_or(self)?,
            Op::BitXor => ops::arithmetic::bit_xor(self)?,
            Op::BitNot => ops::arithmetic::bit_not(self)?,
            Op::Shl => ops::arithmetic::shl(self)?,
            Op::Shr => ops::arithmetic::shr(self)?,

            // ==================== Strings ====================
            Op::Concat => ops::strings::concat(self)?,
            Op::Interpolate => ops::strings::interpolate(self, ins.a)?,

            // ==================== Compare ====================
            Op::Eq => ops::compare::eq(self, false)?,
            Op::Neq => ops::compare::eq(self, true)?,
            Op::Identical => ops::compare::identical(self, false)?,
            Op::NotIdentical => ops::compare::identical(self, true)?,
            Op::Lt => ops::compare::relational(self, ins.op)?,
            Op::Le => ops::compare::relational(self, ins.op)?,
            Op::Gt => ops::compare::relational(self, ins.op)?,
            Op::Ge => ops::compare::relational(self, ins.op)?,
            Op::Spaceship => ops::compare::spaceship(self)?,

            // ==================== Logic ====================
            Op::LogicAnd => ops::logic::and(self)?,
            Op::LogicOr => ops::logic::or(self)?,
            Op::LogicNot => ops::logic::not(self)?,
            Op::Coalesce => ops::logic::coalesce(self)?,

            // ==================== Control ====================
            Op::Jmp => self.current_frame_mut().jump_to(ins.a as usize),
            Op::Jz => {
                let v = self.pop()?;
                let truthy = self.is_truthy(&v);
                self.heap.release_value(&v);
                if !truthy {
                    self.current_frame_mut().jump_to(ins.a as usize);
                }
            }
            Op::Jnz => {
                let v = self.pop()?;
                let truthy = self.is_truthy(&v);
                self.heap.release_value(&v);
                if truthy {
                    self.current_frame_mut().jump_to(ins.a as usize);
                }
            }
            Op::SwitchInt | Op::SwitchStr => ops::calls::switch_jump(self, ins)?,
            Op::Call => ops::calls::call_named(self, ins.a, ins.b as u8)?,
            Op::CallBuiltin => ops::calls::call_builtin(self, ins.a, ins.b as u8)?,
            Op::CallStatic => ops::calls::call_static(self, ins.a, ins.b, ins.flags)?,
            Op::Ret => {
                let v = self.pop()?;
                self.do_return(v)?;
            }
            Op::RetVoid => self.do_return(Value::Null)?,
            Op::LoopStart | Op::LoopEnd => {}

            // ==================== Arrays ====================
            Op::NewArray => ops::arrays::new_array(self, ins.a),
            Op::ArrayGet => ops::arrays::array_get(self)?,
            Op::ArrayGetW => ops::arrays::array_get_w(self)?,
            Op::ArraySet => ops::arrays::array_set(self)?,
            Op::ArrayPush => ops::arrays::array_push(self)?,
            Op::ArrayPop => ops::arrays::array_pop(self)?,
            Op::ArrayLen => ops::arrays::array_len(self)?,
            Op::ArrayUnset => ops::arrays::array_unset(self)?,
            Op::ForeachInit => ops::arrays::foreach_init(self)?,
            Op::ForeachNext => ops::arrays::foreach_next(self, ins.a)?,
            Op::IterPop => ops::arrays::iter_pop(self),

            // ==================== Objects ====================
            Op::NewObject => ops::objects::new_object(self, ins.a, ins.b as u8)?,
            Op::GetProp => ops::objects::get_prop(self, ins.a, ins.b, false)?,
            Op::NullsafeGet => ops::objects::get_prop(self, ins.a, ins.b, true)?,
            Op::SetProp => ops::objects::set_prop(self, ins.a, ins.b)?,
            Op::CallMethod => ops::objects::call_method(self, ins.a, ins.b, ins.flags, false)?,
            Op::NullsafeCall => ops::objects::call_method(self, ins.a, ins.b, ins.flags, true)?,
            Op::InstanceOf => ops::objects::instance_of(self, ins.a)?,
            Op::CloneOp => ops::objects::clone_object(self)?,
            Op::PushStaticProp => ops::objects::push_static_prop(self, ins.a, ins.b)?,
            Op::StoreStaticProp => ops::objects::store_static_prop(self, ins.a, ins.b)?,
            Op::PushClassConst => ops::objects::push_class_const(self, ins.a, ins.b)?,
            Op::DeclareClass => ops::objects::declare_class(self, ins.a)?,
            Op::DeclareFn => ops::objects::declare_fn(self, ins.a)?,

            // ==================== Closures ====================
            Op::CaptureVar => ops::closures::capture_var(self, ins.a, ins.b)?,
            Op::CaptureGlobal => ops::closures::capture_global(self, ins.a, ins.b)?,
            Op::MakeClosure => ops::closures::make_closure(self, ins.a, ins.b)?,
            Op::ClosureCall => ops::closures::closure_call(self, ins.a as u8)?,

            // ==================== Exceptions ====================
            Op::Throw => ops::exceptions::throw(self)?,
            Op::EnterFinally => ops::exceptions::enter_finally(self, ins.a)?,
            Op::FinallyDispatch => ops::exceptions::finally_dispatch(self, ins.a)?,
            Op::SetPendingRet => ops::exceptions::set_pending_ret(self)?,

            // ==================== Casts & checks ====================
            Op::ToInt | Op::ToFloat | Op::ToString | Op::ToBool | Op::ToArray | Op::ToObject => {
                ops::casts::cast(self, ins.op)?
            }
            Op::IsInt
            | Op::IsFloat
            | Op::IsString
            | Op::IsBool
            | Op::IsArray
            | Op::IsObject
            | Op::IsNull
            | Op::IsCallable => ops::casts::type_check(self, ins.op)?,

            // ==================== GC & debug ====================
            Op::Safepoint => {
                if !self.in_gc && self.heap.needs_collection() {
                    self.run_cycle_collection();
                }
            }
            Op::LineNumber => self.current_frame_mut().current_line = ins.a as u32,
            Op::Echo => {
                let v = self.pop()?;
                let s = self.display_string(&v);
                self.heap.release_value(&v);
                self.write_output(s?.as_bytes())?;
            }
            Op::Print => {
                let v = self.pop()?;
                let s = self.display_string(&v);
                self.heap.release_value(&v);
                self.write_output(s?.as_bytes())?;
                self.stack.push(Value::Int(1));
            }
            Op::Halt => self.halted = true,
        }
        Ok(())
    }

    // ==================== Frame & stack helpers ====================

    #[inline]
    pub(crate) fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no call frame")
    }

    #[inline]
    pub(crate) fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no call frame")
    }

    #[inline]
    pub(crate) fn current_code(&self) -> &opcode::CompiledFunction {
        self.current_frame().code()
    }

    /// Read a string constant of the current function.
    pub(crate) fn const_str(&self, idx: u16) -> String {
        match &self.current_code().constants[idx as usize] {
            opcode::Constant::Str(s) => s.clone(),
            other => panic!("constant {} is not a string: {:?}", idx, other),
        }
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| self.underflow_err())
    }

    #[inline]
    pub(crate) fn peek(&self) -> Result<&Value, VmError> {
        self.stack.last().ok_or_else(|| self.underflow_err())
    }

    fn underflow(&self) -> VmError {
        self.underflow_err()
    }

    fn underflow_err(&self) -> VmError {
        VmError::Fatal(FatalError::CorruptedBytecode(
            "operand stack underflow".to_string(),
        ))
    }

    /// Pop `n` values preserving push order.
    pub(crate) fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < n {
            return Err(self.underflow_err());
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    // ==================== Slot access ====================

    /// Load a local slot, dereferencing a reference cell, with a fresh
    /// strong reference for the caller.
    pub(crate) fn load_local(&mut self, slot: u16) -> Value {
        let v = self.current_frame().locals[slot as usize].clone();
        match v {
            Value::Ref(h) => {
                let inner = self.heap.ref_get(h).clone();
                self.heap.retain_value(&inner);
                inner
            }
            other => {
                self.heap.retain_value(&other);
                other
            }
        }
    }

    /// Store into a local slot, writing through a reference cell.
    pub(crate) fn store_local(&mut self, slot: u16, v: Value) {
        let cur = self.current_frame().locals[slot as usize].clone();
        match cur {
            Value::Ref(h) => {
                let old = self.heap.ref_replace(h, v);
                self.heap.release_value(&old);
            }
            _ => {
                let old =
                    std::mem::replace(&mut self.current_frame_mut().locals[slot as usize], v);
                self.heap.release_value(&old);
            }
        }
    }

    pub(crate) fn load_global(&mut self, slot: u16) -> Value {
        let v = self.globals[slot as usize].clone();
        match v {
            Value::Ref(h) => {
                let inner = self.heap.ref_get(h).clone();
                self.heap.retain_value(&inner);
                inner
            }
            other => {
                self.heap.retain_value(&other);
                other
            }
        }
    }

    pub(crate) fn store_global(&mut self, slot: u16, v: Value) {
        let cur = self.globals[slot as usize].clone();
        match cur {
            Value::Ref(h) => {
                let old = self.heap.ref_replace(h, v);
                self.heap.release_value(&old);
            }
            _ => {
                let old = std::mem::replace(&mut self.globals[slot as usize], v);
                self.heap.release_value(&old);
            }
        }
    }
}
