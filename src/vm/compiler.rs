//! Bytecode generator: lowers the parsed AST into compiled functions.
//!
//! The generator walks the AST depth-first keeping, per function: the
//! instruction buffer, a deduplicating constant pool, a name-to-slot map
//! (slots assigned on first use), jump fix-ups, a loop stack for
//! break/continue, a finally stack for exception-table emission, and a
//! stack-depth counter for `max_stack`. Top-level variables compile to
//! global slots; function bodies use locals.

mod classes;
mod expr;
mod functions;
mod loops;
mod stmt;
mod try_catch;

use crate::ast::{Program, Stmt, StringId, StringPool};
use crate::errors::CompileError;
use crate::vm::class::ClassDef;
use crate::vm::inline_cache::InlineCache;
use crate::vm::opcode::{
    stack_effect, CompiledFunction, Constant, Instruction, Op, UserFunction,
};
use crate::vm::optimizer;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the VM needs to run one compiled program.
#[derive(Debug)]
pub struct CompilationUnit {
    pub main: Arc<UserFunction>,
    /// Functions registered by `declare_fn`, in declaration order.
    pub functions: Vec<Arc<UserFunction>>,
    /// Class declarations registered by `declare_class`.
    pub classes: Vec<ClassDef>,
    /// Top-level variable names, one per global slot.
    pub global_names: Vec<String>,
}

/// Compile a program into a unit.
pub fn compile(program: &Program) -> Result<CompilationUnit, CompileError> {
    let mut compiler = Compiler::new(&program.pool);
    compiler.state.push(FnState::new(
        "{main}".to_string(),
        Scope::Main,
    ));
    compiler.emit_op(Op::Safepoint);
    for stmt in &program.statements {
        compiler.compile_stmt(stmt)?;
    }
    compiler.emit_op(Op::RetVoid);

    let state = compiler.state.pop().expect("main function state");
    let mut body = state.into_function()?;
    optimizer::optimize(&mut body);
    let main = Arc::new(UserFunction {
        name: "{main}".to_string(),
        params: Vec::new(),
        return_type: None,
        captures: Vec::new(),
        attributes: Vec::new(),
        is_static: false,
        declaring_class: None,
        min_arity: 0,
        max_arity: 0,
        body,
    });

    Ok(CompilationUnit {
        main,
        functions: compiler.functions,
        classes: compiler.classes,
        global_names: compiler.global_names,
    })
}

/// Variable scope of the function being compiled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Scope {
    /// Top-level code: variables live in global slots.
    Main,
    /// A named function or closure body.
    Function,
    /// A method body; `$this` occupies local slot 0 unless static.
    Method { class: String, is_static: bool },
}

/// An open loop (or switch, for `break`).
pub(crate) struct LoopCtx {
    pub break_jumps: Vec<usize>,
    pub continue_jumps: Vec<usize>,
    pub is_foreach: bool,
    pub is_switch: bool,
    /// Enclosing-finally count at loop entry; break/continue inline any
    /// finally bodies opened since.
    pub finally_depth: usize,
}

/// An enclosing try-with-finally whose table entry is not yet recorded.
pub(crate) struct FinallyCtx {
    /// The finally body, re-emitted inline for break/continue and emitted
    /// once at the finally offset.
    pub body: Vec<Stmt>,
    /// `enter_finally` sites to patch with the entry index.
    pub enter_sites: Vec<usize>,
}

/// Jump sites of `return` statements inside the finally body currently
/// being compiled; they land on the block's `finally_dispatch`.
pub(crate) struct FinallyBodyCtx {
    pub ret_jumps: Vec<usize>,
}

/// Per-function compilation state.
pub(crate) struct FnState {
    pub func: CompiledFunction,
    pub scope: Scope,
    locals: HashMap<String, u16>,
    next_local: u16,
    const_map: HashMap<ConstKey, u16>,
    pub depth: i32,
    max_depth: i32,
    pub loops: Vec<LoopCtx>,
    pub finallies: Vec<FinallyCtx>,
    pub finally_bodies: Vec<FinallyBodyCtx>,
    pub iter_depth: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
}

fn const_key(c: &Constant) -> ConstKey {
    match c {
        Constant::Null => ConstKey::Null,
        Constant::Bool(b) => ConstKey::Bool(*b),
        Constant::Int(n) => ConstKey::Int(*n),
        Constant::Float(f) => ConstKey::Float(f.to_bits()),
        Constant::Str(s) => ConstKey::Str(s.clone()),
    }
}

impl FnState {
    pub fn new(name: String, scope: Scope) -> Self {
        let mut state = Self {
            func: CompiledFunction::new(name),
            scope: scope.clone(),
            locals: HashMap::new(),
            next_local: 0,
            const_map: HashMap::new(),
            depth: 0,
            max_depth: 0,
            loops: Vec::new(),
            finallies: Vec::new(),
            finally_bodies: Vec::new(),
            iter_depth: 0,
        };
        if let Scope::Method { is_static: false, .. } = scope {
            state
                .local_slot("this")
                .expect("slot 0 is always available");
        }
        state
    }

    /// Allocate (or reuse) a local slot for a name. Names arrive without
    /// the `$` sigil.
    pub fn local_slot(&mut self, name: &str) -> Result<u16, CompileError> {
        if let Some(&slot) = self.locals.get(name) {
            return Ok(slot);
        }
        if self.next_local == u16::MAX {
            return Err(CompileError::TooManyLocals);
        }
        let slot = self.next_local;
        self.locals.insert(name.to_string(), slot);
        self.next_local += 1;
        self.func.local_count = self.next_local;
        self.func.local_names.push(name.to_string());
        Ok(slot)
    }

    pub fn finish(&mut self) {
        self.func.max_stack = self.max_depth.max(0) as u16;
    }

    pub fn into_function(mut self) -> Result<CompiledFunction, CompileError> {
        self.finish();
        if self.func.bytecode.len() > u16::MAX as usize {
            return Err(CompileError::FunctionTooLarge);
        }
        Ok(self.func)
    }
}

/// The compiler: unit-level collections plus a stack of function states
/// (nested function and closure bodies push a fresh state).
pub(crate) struct Compiler<'a> {
    pub pool: &'a StringPool,
    pub state: Vec<FnState>,
    pub globals: HashMap<String, u16>,
    pub global_names: Vec<String>,
    pub functions: Vec<Arc<UserFunction>>,
    pub classes: Vec<ClassDef>,
    /// By-reference parameter flags of functions declared so far, used to
    /// pass variable arguments as reference cells.
    pub fn_sigs: HashMap<String, Vec<bool>>,
}

impl<'a> Compiler<'a> {
    fn new(pool: &'a StringPool) -> Self {
        Self {
            pool,
            state: Vec::new(),
            globals: HashMap::new(),
            global_names: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            fn_sigs: HashMap::new(),
        }
    }

    #[inline]
    pub fn s(&mut self) -> &mut FnState {
        self.state.last_mut().expect("no function state")
    }

    #[inline]
    pub fn st(&self) -> &FnState {
        self.state.last().expect("no function state")
    }

    pub fn name(&self, id: StringId) -> &str {
        self.pool.get(id)
    }

    /// Variable name without the leading `$`.
    pub fn var_name(&self, id: StringId) -> &str {
        let name = self.pool.get(id);
        name.strip_prefix('$').unwrap_or(name)
    }

    // ==================== Emission ====================

    pub fn emit(&mut self, ins: Instruction) -> usize {
        let state = self.s();
        let offset = state.func.bytecode.len();
        state.depth += stack_effect(&ins);
        if state.depth > state.max_depth {
            state.max_depth = state.depth;
        }
        state.func.bytecode.push(ins);
        offset
    }

    pub fn emit_op(&mut self, op: Op) -> usize {
        self.emit(Instruction::new(op))
    }

    pub fn emit_a(&mut self, op: Op, a: u16) -> usize {
        self.emit(Instruction::with_a(op, a))
    }

    pub fn emit_ab(&mut self, op: Op, a: u16, b: u16) -> usize {
        self.emit(Instruction::with_ab(op, a, b))
    }

    pub fn emit_abf(&mut self, op: Op, a: u16, b: u16, flags: u8) -> usize {
        self.emit(Instruction::with_abf(op, a, b, flags))
    }

    /// Emit a jump with a placeholder target, returning its offset for
    /// patching.
    pub fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(Instruction::with_a(op, 0))
    }

    pub fn here(&self) -> usize {
        self.st().func.bytecode.len()
    }

    /// Point a previously emitted jump at the current offset.
    pub fn patch_jump(&mut self, at: usize) -> Result<(), CompileError> {
        let target = self.here();
        self.patch_jump_to(at, target)
    }

    pub fn patch_jump_to(&mut self, at: usize, target: usize) -> Result<(), CompileError> {
        if target > u16::MAX as usize {
            return Err(CompileError::FunctionTooLarge);
        }
        self.s().func.bytecode[at].a = target as u16;
        Ok(())
    }

    /// Reset the tracked stack depth at a label that is only reachable by
    /// jumps (the depth at every instruction boundary is static; linear
    /// tracking just needs re-seeding after unconditional control flow).
    pub fn set_depth(&mut self, depth: i32) {
        self.s().depth = depth;
    }

    // ==================== Pools ====================

    pub fn add_const(&mut self, c: Constant) -> Result<u16, CompileError> {
        let key = const_key(&c);
        let state = self.s();
        if let Some(&idx) = state.const_map.get(&key) {
            return Ok(idx);
        }
        if state.func.constants.len() > u16::MAX as usize {
            return Err(CompileError::TooManyConstants);
        }
        let idx = state.func.constants.len() as u16;
        state.func.constants.push(c);
        state.const_map.insert(key, idx);
        Ok(idx)
    }

    pub fn str_const(&mut self, s: &str) -> Result<u16, CompileError> {
        self.add_const(Constant::Str(s.to_string()))
    }

    /// Reserve an inline-cache slot for a property or method site.
    pub fn add_cache(&mut self) -> u16 {
        let state = self.s();
        let idx = state.func.caches.len() as u16;
        state.func.caches.push(RefCell::new(InlineCache::new()));
        idx
    }

    /// Global slot for a top-level variable name (without `$`).
    pub fn global_slot(&mut self, name: &str) -> u16 {
        if let Some(&slot) = self.globals.get(name) {
            return slot;
        }
        let slot = self.global_names.len() as u16;
        self.globals.insert(name.to_string(), slot);
        self.global_names.push(name.to_string());
        slot
    }

    /// Hidden temporary local (`__switch3`, `__tmp5`, ...).
    pub fn temp_local(&mut self, tag: &str) -> Result<u16, CompileError> {
        let n = self.st().func.local_count;
        let name = format!("__{}{}", tag, n);
        self.s().local_slot(&name)
    }
}
