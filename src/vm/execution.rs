//! The execution loop and unwinding machinery.

use crate::ast::TypeHint;
use crate::errors::{EngineError, FatalError, VmError};
use crate::heap::BoxKind;
use crate::runtime::{ArrayKey, PhpArray, Value};
use crate::vm::class::ClassId;
use crate::vm::compiler::CompilationUnit;
use crate::vm::frame::{CallFrame, Pending};
use crate::vm::opcode::{Constant, UserFunction};
use crate::vm::{ForeachIter, Vm};
use std::io::Write;
use std::sync::Arc;

enum UnwindTarget {
    Catch(usize),
    Finally(usize),
}

impl<W: Write> Vm<W> {
    /// Execute a compiled unit's main function to completion.
    pub fn execute(&mut self, unit: &Arc<CompilationUnit>) -> Result<Value, EngineError> {
        self.unit = Some(Arc::clone(unit));
        self.globals = vec![Value::Null; unit.global_names.len()];
        self.halted = false;
        let base = self.frames.len();
        let frame = CallFrame::new(Arc::clone(&unit.main), self.stack.len(), self.iters.len());
        self.frames.push(frame);
        match self.run_until(base) {
            Ok(v) => Ok(v),
            Err(VmError::Throw(exc)) => Err(self.render_uncaught(exc)),
            Err(VmError::Fatal(f)) => Err(EngineError::Fatal(f)),
        }
    }

    /// Run until the frame stack shrinks back to `base`. Nested invocations
    /// (magic methods, destructors, builtins calling back) run the same
    /// loop with a higher base.
    pub(crate) fn run_until(&mut self, base: usize) -> Result<Value, VmError> {
        loop {
            if self.halted {
                while self.frames.len() > base {
                    self.teardown_top_frame();
                }
                return Ok(Value::Null);
            }
            if self.frames.len() <= base {
                return Ok(self.stack.pop().unwrap_or(Value::Null));
            }

            let frame = self.frames.last_mut().expect("no call frame");
            if frame.ip >= frame.function.body.bytecode.len() {
                // Fell off the end: implicit `return null`.
                self.do_return(Value::Null)?;
                continue;
            }
            let ins = frame.function.body.bytecode[frame.ip];
            frame.ip += 1;

            if let Err(e) = self.execute_instruction(ins) {
                match e {
                    VmError::Throw(exc) => self.dispatch_exception(exc, base)?,
                    fatal => return Err(fatal),
                }
            }

            if self.heap.has_pending_finalizers() && !self.in_finalizer {
                self.drain_finalizers();
            }
        }
    }

    // ==================== Frame teardown ====================

    /// Pop the top frame, releasing its locals, its stack segment, its open
    /// iterators, and any suspended pending action.
    pub(crate) fn teardown_top_frame(&mut self) {
        let frame = self.frames.pop().expect("no call frame");
        while self.iters.len() > frame.iter_base {
            let iter = self.iters.pop().expect("iterator stack out of sync");
            self.release_iter(iter);
        }
        while self.stack.len() > frame.stack_base {
            let v = self.stack.pop().expect("stack out of sync");
            self.heap.release_value(&v);
        }
        for v in &frame.locals {
            self.heap.release_value(v);
        }
        if let Some(p) = frame.pending {
            let v = p.into_value();
            self.heap.release_value(&v);
        }
    }

    pub(crate) fn release_iter(&mut self, iter: ForeachIter) {
        for (_, v) in iter.entries.iter().skip(iter.pos) {
            self.heap.release_value(v);
        }
    }

    /// Return from the current frame, placing the value on the caller's
    /// stack. Runs the return-type check in the callee's context, so a
    /// mismatch unwinds through the callee's own exception table.
    pub(crate) fn do_return(&mut self, value: Value) -> Result<(), VmError> {
        let return_type = self.current_frame().function.return_type.clone();
        let fname = self.current_frame().function.name.clone();
        let discard = self.current_frame().discard_return;
        let value = match return_type {
            Some(TypeHint::Void) | None => value,
            Some(hint) => {
                let what = format!("{}(): Return value", fname);
                self.coerce_to_type(value, &hint, &what)?
            }
        };
        self.teardown_top_frame();
        if discard {
            self.heap.release_value(&value);
        } else {
            self.stack.push(value);
        }
        Ok(())
    }

    // ==================== Exception unwinding ====================

    /// Route a thrown value to the innermost matching handler at or above
    /// `base`. Walks each frame's exception table (inner entries first);
    /// non-matching frames run their covering finally blocks and then pop.
    /// Returns the error when nothing above `base` catches.
    pub(crate) fn dispatch_exception(
        &mut self,
        exc: Value,
        base: usize,
    ) -> Result<(), VmError> {
        let mut exc = exc;
        loop {
            if self.frames.len() <= base {
                return Err(VmError::Throw(exc));
            }
            let fi = self.frames.len() - 1;
            let (pc, resume_from) = match self.resume_hint.take() {
                Some(h) => (h.at_pc as usize, h.from_entry),
                None => (self.frames[fi].ip.saturating_sub(1), 0),
            };

            let entry_count = self.frames[fi].function.body.exception_table.len();
            let mut found = None;
            for i in resume_from..entry_count {
                if self.frames[fi].active_finallies.contains(&(i as u16)) {
                    continue;
                }
                let entry = self.frames[fi].function.body.exception_table[i].clone();
                if (entry.start as usize) > pc || pc >= (entry.end as usize) {
                    continue;
                }
                if entry.handler.is_some() {
                    let matched = match entry.catch_type {
                        None => true,
                        Some(k) => {
                            let name = match &self.frames[fi].function.body.constants
                                [k as usize]
                            {
                                Constant::Str(s) => s.clone(),
                                _ => String::new(),
                            };
                            self.value_instance_of_name(&exc, &name)
                        }
                    };
                    if matched {
                        found = Some(UnwindTarget::Catch(i));
                        break;
                    }
                } else if entry.finally.is_some() {
                    found = Some(UnwindTarget::Finally(i));
                    break;
                }
            }

            match found {
                Some(UnwindTarget::Catch(i)) => {
                    let entry = self.frames[fi].function.body.exception_table[i].clone();
                    self.abandon_inner_finallies(fi, entry.start, entry.end);
                    self.unwind_frame_state(fi, entry.stack_depth, entry.iter_depth);
                    self.frames[fi].ip = entry.handler.expect("catch entry") as usize;
                    self.stack.push(exc);
                    return Ok(());
                }
                Some(UnwindTarget::Finally(i)) => {
                    let entry = self.frames[fi].function.body.exception_table[i].clone();
                    self.abandon_inner_finallies(fi, entry.start, entry.end);
                    self.unwind_frame_state(fi, entry.stack_depth, entry.iter_depth);
                    self.frames[fi].pending = Some(Pending::Throw(exc));
                    self.frames[fi].active_finallies.push(i as u16);
                    self.frames[fi].ip = entry.finally.expect("finally entry") as usize;
                    return Ok(());
                }
                None => {
                    self.teardown_top_frame();
                }
            }
        }
    }

    /// Unwinding to an entry abandons any in-flight finally whose region
    /// nests inside it; only enclosing finallies may still resume.
    fn abandon_inner_finallies(&mut self, fi: usize, start: u16, end: u16) {
        let enclosing: Vec<u16> = {
            let table = &self.frames[fi].function.body.exception_table;
            self.frames[fi]
                .active_finallies
                .iter()
                .copied()
                .filter(|&k| {
                    let e = &table[k as usize];
                    e.start <= start && e.end >= end
                })
                .collect()
        };
        self.frames[fi].active_finallies = enclosing;
    }

    /// Clear the operand stack and iterator stack down to a handler's
    /// recorded depths, and drop any suspended pending action (a new throw
    /// replaces it).
    fn unwind_frame_state(&mut self, fi: usize, stack_depth: u16, iter_depth: u16) {
        let stack_to = self.frames[fi].stack_base + stack_depth as usize;
        while self.stack.len() > stack_to {
            let v = self.stack.pop().expect("stack out of sync");
            self.heap.release_value(&v);
        }
        let iter_to = self.frames[fi].iter_base + iter_depth as usize;
        while self.iters.len() > iter_to {
            let iter = self.iters.pop().expect("iterator stack out of sync");
            self.release_iter(iter);
        }
        if let Some(p) = self.frames[fi].pending.take() {
            let v = p.into_value();
            self.heap.release_value(&v);
        }
    }

    // ==================== Calls ====================

    /// Push a frame for `func`. `this` (an owned object value, when the
    /// callee is an instance method) lands in slot 0; arguments are
    /// validated against the declared arity, coerced against parameter
    /// types, defaulted, and collected into a variadic array as declared.
    pub(crate) fn push_call(
        &mut self,
        func: Arc<UserFunction>,
        this: Option<Value>,
        captured: Vec<Value>,
        mut args: Vec<Value>,
        class_ctx: Option<ClassId>,
        discard_return: bool,
    ) -> Result<(), VmError> {
        if self.frames.len() >= self.options.max_call_depth {
            for v in args.iter().chain(this.iter()).chain(captured.iter()) {
                self.heap.release_value(v);
            }
            return Err(VmError::Fatal(FatalError::StackOverflow(
                self.options.max_call_depth,
            )));
        }

        let argc = args.len();
        let too_few = argc < func.min_arity as usize;
        let too_many = !func.is_variadic() && argc > func.params.len();
        if too_few || too_many {
            let msg = if too_few {
                format!(
                    "Too few arguments to function {}(), {} passed and at least {} expected",
                    func.name, argc, func.min_arity
                )
            } else {
                format!(
                    "Too many arguments to function {}(), {} passed and at most {} expected",
                    func.name,
                    argc,
                    func.params.len()
                )
            };
            for v in args.iter().chain(this.iter()).chain(captured.iter()) {
                self.heap.release_value(v);
            }
            return Err(self.raise("ArgumentCountError", &msg));
        }

        let mut frame = CallFrame::new(Arc::clone(&func), self.stack.len(), self.iters.len());
        frame.class_ctx = class_ctx;
        frame.discard_return = discard_return;

        let has_this_slot = func.declaring_class.is_some() && !func.is_static;
        let mut next_slot = 0usize;
        if has_this_slot {
            frame.locals[0] = this.unwrap_or(Value::Null);
            next_slot = 1;
        } else if let Some(t) = this {
            self.heap.release_value(&t);
        }

        let param_count = func.params.len();
        for (i, param) in func.params.iter().enumerate() {
            let slot = next_slot + i;
            if param.variadic {
                let mut rest = PhpArray::new();
                for v in args.drain(i.min(args.len())..) {
                    rest.push(v);
                }
                let h = self.heap.alloc_array(rest);
                frame.locals[slot] = Value::Array(h);
                break;
            }
            let v = if i < args.len() {
                std::mem::replace(&mut args[i], Value::Null)
            } else {
                match &param.default {
                    Some(c) => self.constant_value(&c.clone()),
                    None => Value::Null,
                }
            };
            let v = match &param.type_hint {
                Some(hint) => {
                    let what =
                        format!("{}(): Argument #{} (${})", func.name, i + 1, param.name);
                    match self.coerce_to_type(v, hint, &what) {
                        Ok(v) => v,
                        Err(e) => {
                            for leftover in args.iter().skip(i + 1) {
                                self.heap.release_value(leftover);
                            }
                            for v in &frame.locals {
                                self.heap.release_value(v);
                            }
                            return Err(e);
                        }
                    }
                }
                None => v,
            };
            frame.locals[slot] = v;
        }

        // Closure captures follow the parameters.
        for (i, v) in captured.into_iter().enumerate() {
            frame.locals[next_slot + param_count + i] = v;
        }

        self.frames.push(frame);
        Ok(())
    }

    /// Call a function and run it to completion, returning its value.
    /// Used wherever native code needs a result mid-instruction: magic
    /// methods, destructors, `__toString`, callback builtins.
    pub(crate) fn call_sync(
        &mut self,
        func: Arc<UserFunction>,
        this: Option<Value>,
        args: Vec<Value>,
        class_ctx: Option<ClassId>,
    ) -> Result<Value, VmError> {
        let base = self.frames.len();
        self.push_call(func, this, Vec::new(), args, class_ctx, false)?;
        self.run_until(base)
    }

    // ==================== Finalizers & GC ====================

    /// Run `__destruct` for boxes whose refcount reached zero, then free
    /// them. A destructor that throws is reported and the remaining
    /// destructors still run; a destructor that stores a new strong
    /// reference resurrects its box.
    pub(crate) fn drain_finalizers(&mut self) {
        if self.in_finalizer {
            return;
        }
        self.in_finalizer = true;
        loop {
            let queue = self.heap.take_finalize_queue();
            if queue.is_empty() {
                break;
            }
            for h in queue {
                if !self.heap.is_live(h) || self.heap.strong_count(h) > 0 {
                    continue;
                }
                if !self.heap.is_pending_destruct(h) {
                    self.heap.free_finalized(h);
                    continue;
                }
                self.heap.mark_finalized(h);
                self.run_destructor(h);
            }
        }
        self.in_finalizer = false;
    }

    /// Invoke `__destruct` on an object box. The box is kept alive for the
    /// duration of the call; afterwards the matching release either frees
    /// it or leaves it resurrected.
    fn run_destructor(&mut self, h: crate::heap::Handle) {
        let class = self.heap.object(h).class;
        let dtor = self.registry.class(class).magic.destruct.clone();
        match dtor {
            Some(func) => {
                self.heap.stats.destructors_run += 1;
                // One reference rides into the frame as $this; the second
                // pins the box until the call returns, so the slot cannot
                // be recycled under us.
                self.heap.retain(h);
                self.heap.retain(h);
                match self.call_sync(func, Some(Value::Object(h)), Vec::new(), Some(class)) {
                    Ok(v) => self.heap.release_value(&v),
                    Err(VmError::Throw(e)) => {
                        let rendered = self
                            .display_string(&e)
                            .unwrap_or_else(|_| "exception".to_string());
                        eprintln!(
                            "Warning: exception thrown in destructor of {}: {}",
                            self.registry.class(class).name,
                            rendered
                        );
                        self.heap.release_value(&e);
                    }
                    Err(VmError::Fatal(f)) => {
                        eprintln!("Warning: fatal condition in destructor: {}", f);
                    }
                }
                self.heap.release(h);
            }
            None => self.heap.free_finalized(h),
        }
    }

    /// Run one full cycle collection: trial deletion, destructors for the
    /// white set, then the sweep. Returns the number of boxes freed.
    pub fn run_cycle_collection(&mut self) -> usize {
        if self.in_gc {
            return 0;
        }
        self.in_gc = true;
        let whites = self.heap.collect_cycles();
        for (h, generation) in whites.iter() {
            if !self.heap.is_live_gen(h, generation) {
                continue;
            }
            if self.heap.kind(h) != BoxKind::Object {
                continue;
            }
            if !self.heap.is_pending_destruct(h) {
                continue;
            }
            self.heap.mark_finalized(h);
            self.run_destructor_in_cycle(h);
        }
        let freed = self.heap.sweep_cycle(whites);
        self.in_gc = false;
        freed
    }

    /// Destructor invocation for a cycle member: the box still has its
    /// internal references, so a bare retain/call/release pair leaves the
    /// counts exactly as the sweep expects.
    fn run_destructor_in_cycle(&mut self, h: crate::heap::Handle) {
        let class = self.heap.object(h).class;
        let dtor = self.registry.class(class).magic.destruct.clone();
        if let Some(func) = dtor {
            self.heap.stats.destructors_run += 1;
            self.heap.retain(h);
            self.heap.retain(h);
            match self.call_sync(func, Some(Value::Object(h)), Vec::new(), Some(class)) {
                Ok(v) => self.heap.release_value(&v),
                Err(VmError::Throw(e)) => {
                    let rendered = self
                        .display_string(&e)
                        .unwrap_or_else(|_| "exception".to_string());
                    eprintln!(
                        "Warning: exception thrown in destructor of {}: {}",
                        self.registry.class(class).name,
                        rendered
                    );
                    self.heap.release_value(&e);
                }
                Err(VmError::Fatal(f)) => {
                    eprintln!("Warning: fatal condition in destructor: {}", f);
                }
            }
            self.heap.release(h);
        }
    }

    // ==================== Raising engine errors ====================

    /// Build a PHP exception object of a builtin class and wrap it for
    /// throwing.
    pub(crate) fn raise(&mut self, class: &str, message: &str) -> VmError {
        match self.make_exception(class, message) {
            Ok(v) => VmError::Throw(v),
            Err(e) => e,
        }
    }

    /// Instantiate a Throwable without running its constructor, stamping
    /// message and line directly.
    pub(crate) fn make_exception(
        &mut self,
        class: &str,
        message: &str,
    ) -> Result<Value, VmError> {
        let id = self.registry.resolve(class).map_err(|e| {
            VmError::Fatal(FatalError::CorruptedBytecode(format!(
                "cannot raise {}: {}",
                class, e
            )))
        })?;
        let line = self
            .frames
            .last()
            .map(|f| f.current_line)
            .unwrap_or(0);
        let msg_handle = self.heap.alloc_string(message.into());
        let shape_id = self.registry.class(id).shape;
        let defaults: Vec<Constant> = self
            .registry
            .class(id)
            .properties
            .iter()
            .map(|p| p.default.clone())
            .collect();
        let mut slots: Vec<Value> = Vec::with_capacity(defaults.len());
        for c in &defaults {
            let v = self.constant_value(c);
            slots.push(v);
        }
        let shape = self.registry.shape(shape_id);
        let msg_off = shape.offset_of("message");
        let line_off = shape.offset_of("line");
        if let Some(off) = msg_off {
            let old = std::mem::replace(&mut slots[off as usize], Value::String(msg_handle));
            self.heap.release_value(&old);
        } else {
            self.heap.release(msg_handle);
        }
        if let Some(off) = line_off {
            slots[off as usize] = Value::Int(line as i64);
        }
        let finalizable = self.registry.class(id).magic.destruct.is_some();
        let h = self.heap.alloc_object(finalizable, |self_handle| {
            crate::runtime::PhpObject::new(id, shape_id, slots, self_handle)
        });
        Ok(Value::Object(h))
    }

    // ==================== Uncaught reporting ====================

    fn render_uncaught(&mut self, exc: Value) -> EngineError {
        let (class, message, trace) = match &exc {
            Value::Object(h) => {
                let obj = self.heap.object(*h);
                let desc = self.registry.class(obj.class);
                let class_name = desc.name.clone();
                let shape = self.registry.shape(obj.shape);
                let message = shape
                    .offset_of("message")
                    .and_then(|off| match &self.heap.object(*h).slots[off as usize] {
                        Value::String(s) => Some(self.heap.string(*s).to_string_lossy()),
                        _ => None,
                    })
                    .unwrap_or_default();
                let trace = shape
                    .offset_of("trace")
                    .map(|off| self.render_trace_slot(*h, off))
                    .unwrap_or_else(|| "#0 {main}".to_string());
                (class_name, message, trace)
            }
            other => (other.type_name().to_string(), String::new(), "#0 {main}".to_string()),
        };
        self.heap.release_value(&exc);
        EngineError::Uncaught {
            class,
            message,
            trace,
        }
    }

    fn render_trace_slot(&self, obj: crate::heap::Handle, off: u16) -> String {
        let trace_val = &self.heap.object(obj).slots[off as usize];
        let Value::Array(arr) = trace_val else {
            return "#0 {main}".to_string();
        };
        let mut lines = Vec::new();
        for (i, (_, entry)) in self.heap.array(*arr).entries().iter().enumerate() {
            let Value::Array(frame) = entry else { continue };
            let frame = self.heap.array(*frame);
            let func = frame
                .get(&ArrayKey::Str("function".to_string()))
                .and_then(|v| match v {
                    Value::String(s) => Some(self.heap.string(*s).to_string_lossy()),
                    _ => None,
                })
                .unwrap_or_default();
            let line = frame
                .get(&ArrayKey::Str("line".to_string()))
                .and_then(|v| match v {
                    Value::Int(n) => Some(*n),
                    _ => None,
                })
                .unwrap_or(0);
            lines.push(format!("#{} {}() at line {}", i, func, line));
        }
        lines.push(format!("#{} {{main}}", lines.len()));
        lines.join("\n")
    }
}
