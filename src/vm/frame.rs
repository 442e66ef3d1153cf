//! Call frames.

use crate::runtime::Value;
use crate::vm::class::ClassId;
use crate::vm::opcode::{CompiledFunction, UserFunction};
use std::sync::Arc;

/// An unwind action suspended while a finally block runs.
#[derive(Debug)]
pub enum Pending {
    Return(Value),
    Throw(Value),
}

impl Pending {
    pub fn into_value(self) -> Value {
        match self {
            Pending::Return(v) | Pending::Throw(v) => v,
        }
    }
}

/// A call frame: one function invocation.
///
/// Instance methods keep `$this` in local slot 0; parameters follow, then
/// closure captures, then plain locals. The frame's segment of the operand
/// stack starts at `stack_base` and is fully unwound when the frame pops.
#[derive(Debug)]
pub struct CallFrame {
    pub function: Arc<UserFunction>,
    /// Instruction pointer (index into the bytecode)
    pub ip: usize,
    /// Base index in the shared operand stack
    pub stack_base: usize,
    /// Local slots; values here hold strong references
    pub locals: Vec<Value>,
    /// Class context for visibility checks and static resolution
    pub class_ctx: Option<ClassId>,
    /// Open foreach iterators below this frame
    pub iter_base: usize,
    /// Exception-table entries whose finally block is currently running
    pub active_finallies: Vec<u16>,
    /// Suspended return or throw, restored by `finally_dispatch`
    pub pending: Option<Pending>,
    /// Constructor frames drop their return value
    pub discard_return: bool,
    /// Source line last recorded by a `line_number` instruction
    pub current_line: u32,
}

impl CallFrame {
    pub fn new(function: Arc<UserFunction>, stack_base: usize, iter_base: usize) -> Self {
        let local_count = function.body.local_count as usize;
        Self {
            function,
            ip: 0,
            stack_base,
            locals: vec![Value::Null; local_count],
            class_ctx: None,
            iter_base,
            active_finallies: Vec::new(),
            pending: None,
            discard_return: false,
            current_line: 0,
        }
    }

    #[inline]
    pub fn code(&self) -> &CompiledFunction {
        &self.function.body
    }

    #[inline]
    pub fn jump_to(&mut self, offset: usize) {
        self.ip = offset;
    }
}
