//! Bytecode instruction set.
//!
//! The ISA is a stack machine with typed fast paths. Every instruction is a
//! fixed-width record: an 8-bit opcode, two 16-bit operands, and 8 bits of
//! flags. Operands address the constant pool, local or global slots, jump
//! targets, inline-cache slots, jump tables, or immediate small integers;
//! the meaning per opcode is documented on the [`Op`] variants.
//!
//! Method-call instructions need three quantities (name, cache slot, arg
//! count); their argument count travels in the flags byte.

use crate::ast::{TypeHint, Visibility};
use crate::vm::inline_cache::InlineCache;
use std::cell::RefCell;
use std::sync::Arc;

/// Marks a call in tail position (`call` immediately followed by `ret`).
pub const FLAG_TAIL_CALL: u8 = 0b0000_0001;
/// Marks an instruction as a collector safepoint.
pub const FLAG_SAFEPOINT: u8 = 0b0000_0010;

/// Opcodes. Unless noted otherwise, `a` and `b` are unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // ==================== Stack & slots ====================
    /// No operation
    Nop,
    /// Push constant pool entry `a`
    PushConst,
    /// Push local slot `a` (dereferences a reference cell)
    PushLocal,
    /// Push global slot `a`
    PushGlobal,
    /// Pop and discard the top of stack
    Pop,
    /// Duplicate the top of stack
    Dup,
    /// Swap the two top stack values
    Swap,
    PushNull,
    PushTrue,
    PushFalse,
    PushInt0,
    PushInt1,
    /// Pop into local slot `a` (writes through a reference cell)
    StoreLocal,
    /// Pop into global slot `a`
    StoreGlobal,
    /// Push local slot `a` as an array for writing, vivifying null
    PushLocalArray,
    /// Push global slot `a` as an array for writing, vivifying null
    PushGlobalArray,

    // ==================== Arithmetic (typed fast paths) ====================
    // The typed forms assume both operands match the hint and fall back to
    // the general coercing routine on mismatch. Integer overflow promotes
    // to float.
    AddInt,
    SubInt,
    MulInt,
    /// PHP `/`: exact integer quotients stay int, otherwise float;
    /// division by zero raises DivisionByZeroError
    DivInt,
    /// Modulo by zero raises DivisionByZeroError
    ModInt,
    PowInt,
    NegInt,
    /// Increment integer local slot `a` in place
    IncLocalInt,
    /// Decrement integer local slot `a` in place
    DecLocalInt,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    /// `fmod` semantics
    ModFloat,
    PowFloat,
    NegFloat,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,

    // ==================== Strings ====================
    Concat,
    /// Concatenate the top `a` values with PHP string casts
    Interpolate,

    // ==================== Compare ====================
    Eq,
    Neq,
    Identical,
    NotIdentical,
    Lt,
    Le,
    Gt,
    Ge,
    /// Pushes -1, 0 or 1
    Spaceship,

    // ==================== Logic ====================
    LogicAnd,
    LogicOr,
    LogicNot,
    /// `a ?? b` with both operands materialized
    Coalesce,

    // ==================== Control ====================
    /// Jump to offset `a`
    Jmp,
    /// Pop; jump to `a` when falsy
    Jz,
    /// Pop; jump to `a` when truthy
    Jnz,
    /// Pop subject; jump through jump table `a`, default target `b`
    SwitchInt,
    SwitchStr,
    /// Call function named by constant `a` with `b` arguments
    Call,
    /// Call builtin `a` with `b` arguments
    CallBuiltin,
    /// Call static method: class constant `a`, method constant `b`,
    /// argument count in flags
    CallStatic,
    /// Pop the return value and leave the frame
    Ret,
    /// Leave the frame returning null
    RetVoid,
    /// Loop-header hint for profilers
    LoopStart,
    LoopEnd,

    // ==================== Arrays ====================
    /// Push a fresh array (capacity hint `a`)
    NewArray,
    /// array, key -> value
    ArrayGet,
    /// array, key -> array-at-key for writing, vivifying missing/null
    ArrayGetW,
    /// array, key, value -> value (writes through the box)
    ArraySet,
    /// array, value -> value (append at next_index)
    ArrayPush,
    /// array -> value (removes the last entry)
    ArrayPop,
    /// array -> int
    ArrayLen,
    /// array, key -> (removes the entry)
    ArrayUnset,
    /// Pop the iterable and open a snapshot iterator
    ForeachInit,
    /// Push next key and value, or jump to `a` when exhausted
    ForeachNext,
    /// Close the innermost foreach iterator early
    IterPop,

    // ==================== Objects ====================
    /// Construct class named by constant `a` with `b` arguments, running
    /// `__construct` if defined
    NewObject,
    /// Property read: name constant `a`, inline cache `b`
    GetProp,
    /// object, value -> value: name constant `a`, inline cache `b`
    SetProp,
    /// Like GetProp but null propagates
    NullsafeGet,
    /// Method call: name constant `a`, inline cache `b`, argc in flags
    CallMethod,
    /// Like CallMethod but null receivers propagate
    NullsafeCall,
    /// object -> bool for class named by constant `a`
    InstanceOf,
    /// object -> cloned object, running `__clone` on the copy
    CloneOp,
    /// Push static property: class constant `a`, property constant `b`
    PushStaticProp,
    StoreStaticProp,
    /// Push class constant / enum case: class `a`, name `b`
    PushClassConst,
    /// Register class declaration `a` of the current unit
    DeclareClass,
    /// Register function declaration `a` of the current unit
    DeclareFn,

    // ==================== Closures ====================
    /// Capture local slot `a`; mode `b` is 0 by value, 1 by reference
    CaptureVar,
    /// Capture global slot `a`; mode `b` as above
    CaptureGlobal,
    /// Build a closure from prototype `a` with `b` captured values
    MakeClosure,
    /// callable, args... -> result with `a` arguments
    ClosureCall,

    // ==================== Exceptions ====================
    /// Pop and raise
    Throw,
    /// Enter the finally block of exception-table entry `a`
    EnterFinally,
    /// Leave a finally block: resume the pending action, or fall through
    /// to `a`
    FinallyDispatch,
    /// Pop into the pending-return register
    SetPendingRet,

    // ==================== Type coercion & checks ====================
    ToInt,
    ToFloat,
    ToString,
    ToBool,
    ToArray,
    ToObject,
    IsInt,
    IsFloat,
    IsString,
    IsBool,
    IsArray,
    IsObject,
    IsNull,
    IsCallable,

    // ==================== GC & debug ====================
    /// The collector may run here
    Safepoint,
    /// Record source line `a` for diagnostics
    LineNumber,
    /// Write the string cast of the top of stack to the output
    Echo,
    /// Like Echo, then push int 1
    Print,
    /// Stop the program
    Halt,
}

/// Fixed-width instruction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub a: u16,
    pub b: u16,
    pub flags: u8,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            a: 0,
            b: 0,
            flags: 0,
        }
    }

    pub fn with_a(op: Op, a: u16) -> Self {
        Self {
            op,
            a,
            b: 0,
            flags: 0,
        }
    }

    pub fn with_ab(op: Op, a: u16, b: u16) -> Self {
        Self { op, a, b, flags: 0 }
    }

    pub fn with_abf(op: Op, a: u16, b: u16, flags: u8) -> Self {
        Self { op, a, b, flags }
    }

    /// Argument count for call-family instructions.
    pub fn argc(&self) -> u8 {
        match self.op {
            Op::Call | Op::CallBuiltin | Op::NewObject => self.b as u8,
            Op::CallStatic | Op::CallMethod | Op::NullsafeCall => self.flags,
            Op::ClosureCall => self.a as u8,
            _ => 0,
        }
    }
}

/// Constant-pool entry.
#[derive(Debug, Clone)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Null, Constant::Null) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            _ => false,
        }
    }
}

/// One exception-table entry. Ranges are half-open instruction offsets
/// `[start, end)`; entries for nested constructs precede their enclosing
/// entries, so the first range hit is the innermost.
#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    pub start: u16,
    pub end: u16,
    /// Catch handler offset; the handler receives the exception on the
    /// operand stack.
    pub handler: Option<u16>,
    /// Constant-pool index of the caught class name; `None` catches all.
    pub catch_type: Option<u16>,
    /// Finally block offset.
    pub finally: Option<u16>,
    /// Operand-stack depth at try entry (the static stack-height property
    /// makes this a compile-time constant).
    pub stack_depth: u16,
    /// Open foreach iterators at try entry.
    pub iter_depth: u16,
}

/// Dense dispatch table for `switch_int` / `switch_str`.
#[derive(Debug, Clone)]
pub enum JumpTable {
    Int(Vec<(i64, u16)>),
    Str(Vec<(String, u16)>),
}

impl JumpTable {
    pub fn lookup_int(&self, needle: i64) -> Option<u16> {
        match self {
            JumpTable::Int(pairs) => pairs
                .iter()
                .find(|(k, _)| *k == needle)
                .map(|(_, t)| *t),
            JumpTable::Str(_) => None,
        }
    }

    pub fn lookup_str(&self, needle: &[u8]) -> Option<u16> {
        match self {
            JumpTable::Str(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_bytes() == needle)
                .map(|(_, t)| *t),
            JumpTable::Int(_) => None,
        }
    }
}

/// A compiled function body. Immutable after emission except for the
/// per-call-site inline caches, which warm up as the code runs.
#[derive(Debug)]
pub struct CompiledFunction {
    pub name: String,
    pub bytecode: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Number of local variable slots
    pub local_count: u16,
    /// Local variable names (for diagnostics)
    pub local_names: Vec<String>,
    /// Declared parameter count
    pub arg_count: u8,
    /// Maximum operand-stack depth any path can reach
    pub max_stack: u16,
    pub exception_table: Vec<ExceptionEntry>,
    /// (bytecode offset, source line), sorted by offset
    pub lines: Vec<(u16, u32)>,
    /// Prototypes of closures created by this function
    pub protos: Vec<Arc<UserFunction>>,
    pub jump_tables: Vec<JumpTable>,
    /// Inline caches owned by property/method sites in this function
    pub caches: Vec<RefCell<InlineCache>>,
}

impl CompiledFunction {
    pub fn new(name: String) -> Self {
        Self {
            name,
            bytecode: Vec::new(),
            constants: Vec::new(),
            local_count: 0,
            local_names: Vec::new(),
            arg_count: 0,
            max_stack: 0,
            exception_table: Vec::new(),
            lines: Vec::new(),
            protos: Vec::new(),
            jump_tables: Vec::new(),
            caches: Vec::new(),
        }
    }

    /// Source line for a bytecode offset, from the line table.
    pub fn line_for(&self, offset: u16) -> Option<u32> {
        let mut line = None;
        for &(off, l) in &self.lines {
            if off > offset {
                break;
            }
            line = Some(l);
        }
        line
    }
}

/// Capture declared by a closure prototype.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub name: String,
    pub by_ref: bool,
}

/// A declared parameter, post-compilation.
#[derive(Debug, Clone)]
pub struct PhpParam {
    pub name: String,
    pub type_hint: Option<TypeHint>,
    /// Literal default; richer default expressions are lowered by the
    /// generator into the function prologue.
    pub default: Option<Constant>,
    pub by_ref: bool,
    pub variadic: bool,
    pub promoted: Option<Visibility>,
}

/// A user function: metadata plus its compiled body.
#[derive(Debug)]
pub struct UserFunction {
    pub name: String,
    pub params: Vec<PhpParam>,
    pub return_type: Option<TypeHint>,
    /// Captured variables, for closure prototypes.
    pub captures: Vec<CaptureSpec>,
    pub attributes: Vec<String>,
    pub is_static: bool,
    pub declaring_class: Option<String>,
    pub min_arity: u8,
    /// `u8::MAX` when variadic.
    pub max_arity: u8,
    pub body: CompiledFunction,
}

impl UserFunction {
    pub fn is_variadic(&self) -> bool {
        self.params.last().map_or(false, |p| p.variadic)
    }
}

/// Operand-stack delta of an instruction on its fall-through path.
/// `ForeachNext` pushes key and value when it falls through and pushes
/// nothing on the taken branch; the generator accounts for the branch side
/// explicitly.
pub fn stack_effect(ins: &Instruction) -> i32 {
    match ins.op {
        // Pushes: +1
        Op::PushConst
        | Op::PushLocal
        | Op::PushGlobal
        | Op::Dup
        | Op::PushNull
        | Op::PushTrue
        | Op::PushFalse
        | Op::PushInt0
        | Op::PushInt1
        | Op::PushLocalArray
        | Op::PushGlobalArray
        | Op::PushStaticProp
        | Op::PushClassConst
        | Op::CaptureVar
        | Op::CaptureGlobal => 1,

        // Pops 1, pushes 1: 0
        Op::NegInt
        | Op::NegFloat
        | Op::BitNot
        | Op::LogicNot
        | Op::CloneOp
        | Op::InstanceOf
        | Op::GetProp
        | Op::NullsafeGet
        | Op::ArrayLen
        | Op::ArrayPop
        | Op::ToInt
        | Op::ToFloat
        | Op::ToString
        | Op::ToBool
        | Op::ToArray
        | Op::ToObject
        | Op::IsInt
        | Op::IsFloat
        | Op::IsString
        | Op::IsBool
        | Op::IsArray
        | Op::IsObject
        | Op::IsNull
        | Op::IsCallable
        | Op::Print => 0,

        // Pops 2, pushes 1: -1
        Op::AddInt
        | Op::SubInt
        | Op::MulInt
        | Op::DivInt
        | Op::ModInt
        | Op::PowInt
        | Op::AddFloat
        | Op::SubFloat
        | Op::MulFloat
        | Op::DivFloat
        | Op::ModFloat
        | Op::PowFloat
        | Op::BitAnd
        | Op::BitOr
        | Op::BitXor
        | Op::Shl
        | Op::Shr
        | Op::Concat
        | Op::Eq
        | Op::Neq
        | Op::Identical
        | Op::NotIdentical
        | Op::Lt
        | Op::Le
        | Op::Gt
        | Op::Ge
        | Op::Spaceship
        | Op::LogicAnd
        | Op::LogicOr
        | Op::Coalesce
        | Op::ArrayGet
        | Op::ArrayGetW
        | Op::SetProp => -1,

        // Pops 1, pushes 0: -1
        Op::Pop
        | Op::StoreLocal
        | Op::StoreGlobal
        | Op::Jz
        | Op::Jnz
        | Op::SwitchInt
        | Op::SwitchStr
        | Op::Ret
        | Op::Throw
        | Op::SetPendingRet
        | Op::Echo
        | Op::ForeachInit
        | Op::StoreStaticProp => -1,

        // Neutral
        Op::Nop
        | Op::Swap
        | Op::Jmp
        | Op::RetVoid
        | Op::LoopStart
        | Op::LoopEnd
        | Op::IncLocalInt
        | Op::DecLocalInt
        | Op::IterPop
        | Op::EnterFinally
        | Op::FinallyDispatch
        | Op::DeclareClass
        | Op::DeclareFn
        | Op::Safepoint
        | Op::LineNumber
        | Op::Halt => 0,

        // Strings
        Op::Interpolate => 1 - ins.a as i32,

        // Arrays
        Op::NewArray => 1,
        Op::ArraySet => -2,
        Op::ArrayPush => -1,
        Op::ArrayUnset => -2,
        // Fall-through pushes key and value.
        Op::ForeachNext => 2,

        // Calls
        Op::Call | Op::CallBuiltin => 1 - ins.b as i32,
        Op::CallStatic => 1 - ins.flags as i32,
        Op::CallMethod | Op::NullsafeCall => -(ins.flags as i32),
        Op::ClosureCall => -(ins.a as i32),
        Op::NewObject => 1 - ins.b as i32,

        // Closures
        Op::MakeClosure => 1 - ins.b as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_record_is_compact() {
        // opcode + two operands + flags: a fixed-width record.
        assert!(std::mem::size_of::<Instruction>() <= 8);
    }

    #[test]
    fn call_effects_account_for_arguments() {
        let call = Instruction::with_ab(Op::Call, 0, 3);
        assert_eq!(stack_effect(&call), -2);
        let method = Instruction::with_abf(Op::CallMethod, 0, 0, 2);
        assert_eq!(stack_effect(&method), -2);
        let closure = Instruction::with_a(Op::ClosureCall, 2);
        assert_eq!(stack_effect(&closure), -2);
    }
}
