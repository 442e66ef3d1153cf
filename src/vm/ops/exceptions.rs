//! Throwing and the finally protocol.
//!
//! try/catch/finally is realized by the exception table, not by opcodes;
//! the only instructions here are `throw` and the finally plumbing the
//! generator emits around protected regions (`enter_finally`,
//! `finally_dispatch`, `set_pending_ret`).

use super::arrays::deref_owned;
use crate::errors::{FatalError, VmError};
use crate::runtime::{ArrayKey, PhpArray, Value};
use crate::vm::frame::Pending;
use crate::vm::{ResumeHint, Vm};
use std::io::Write;

pub fn throw<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let exc = vm.pop()?;
    let exc = deref_owned(vm, exc);
    if !vm.value_instance_of_name(&exc, "Throwable") {
        let e = vm.raise(
            "TypeError",
            "Can only throw objects that implement Throwable",
        );
        vm.heap.release_value(&exc);
        return Err(e);
    }

    // Stamp the throw line (unless the constructor already set one) and
    // the backtrace.
    if let Value::Object(h) = &exc {
        let shape = vm.heap.object(*h).shape;
        let line = vm.current_frame().current_line;
        if let Some(off) = vm.registry.shape(shape).offset_of("line") {
            if matches!(vm.heap.object(*h).slots[off as usize], Value::Int(0)) {
                vm.heap.object_mut(*h).slots[off as usize] = Value::Int(line as i64);
            }
        }
        if let Some(off) = vm.registry.shape(shape).offset_of("trace") {
            let trace = capture_backtrace(vm);
            let old = std::mem::replace(&mut vm.heap.object_mut(*h).slots[off as usize], trace);
            vm.heap.release_value(&old);
        }
    }
    Err(VmError::Throw(exc))
}

/// Snapshot the call stack, most recent frame first, as an array of
/// `[function, class?, type?, line]` frames.
pub fn capture_backtrace<W: Write>(vm: &mut Vm<W>) -> Value {
    let raw: Vec<(String, Option<String>, u32)> = vm
        .frames
        .iter()
        .rev()
        .map(|f| {
            (
                f.function.name.clone(),
                f.function.declaring_class.clone(),
                f.current_line,
            )
        })
        .collect();

    let mut trace = PhpArray::with_capacity(raw.len());
    for (func, class, line) in raw {
        let mut entry = PhpArray::new();
        let func_v = Value::String(vm.heap.alloc_string(func.into()));
        entry.insert(ArrayKey::Str("function".to_string()), func_v);
        if let Some(class) = class {
            let class_v = Value::String(vm.heap.alloc_string(class.into()));
            entry.insert(ArrayKey::Str("class".to_string()), class_v);
            let type_v = Value::String(vm.heap.alloc_string("->".into()));
            entry.insert(ArrayKey::Str("type".to_string()), type_v);
        }
        entry.insert(ArrayKey::Str("line".to_string()), Value::Int(line as i64));
        let eh = vm.heap.alloc_array(entry);
        trace.push(Value::Array(eh));
    }
    Value::Array(vm.heap.alloc_array(trace))
}

/// Enter the finally block of exception-table entry `entry_idx` on a
/// non-exceptional path (normal fall-through or a pending return).
pub fn enter_finally<W: Write>(vm: &mut Vm<W>, entry_idx: u16) -> Result<(), VmError> {
    let finally = vm
        .current_code()
        .exception_table
        .get(entry_idx as usize)
        .and_then(|e| e.finally)
        .ok_or_else(|| {
            VmError::Fatal(FatalError::CorruptedBytecode(format!(
                "enter_finally on entry {} without a finally offset",
                entry_idx
            )))
        })?;
    let frame = vm.current_frame_mut();
    frame.active_finallies.push(entry_idx);
    frame.jump_to(finally as usize);
    Ok(())
}

/// Leave a finally block: continue the pending action, or fall through to
/// the normal continuation at `end_target`. A pending return either chains
/// into the next enclosing finally or performs the actual return; a
/// pending exception resumes unwinding past this entry.
pub fn finally_dispatch<W: Write>(vm: &mut Vm<W>, end_target: u16) -> Result<(), VmError> {
    let idx = vm
        .current_frame_mut()
        .active_finallies
        .pop()
        .ok_or_else(|| {
            VmError::Fatal(FatalError::CorruptedBytecode(
                "finally_dispatch without an active finally".to_string(),
            ))
        })? as usize;

    let pending = vm.current_frame_mut().pending.take();
    match pending {
        None => {
            vm.current_frame_mut().jump_to(end_target as usize);
            Ok(())
        }
        Some(Pending::Throw(exc)) => {
            let start = vm.current_code().exception_table[idx].start;
            vm.resume_hint = Some(ResumeHint {
                from_entry: idx + 1,
                at_pc: start,
            });
            Err(VmError::Throw(exc))
        }
        Some(Pending::Return(value)) => {
            // The innermost still-enclosing finally, if any.
            let next = {
                let code = vm.current_code();
                let this_start = code.exception_table[idx].start as usize;
                let active = &vm.current_frame().active_finallies;
                code.exception_table
                    .iter()
                    .enumerate()
                    .skip(idx + 1)
                    .find(|(j, e)| {
                        e.handler.is_none()
                            && e.finally.is_some()
                            && (e.start as usize) <= this_start
                            && this_start < e.end as usize
                            && !active.contains(&(*j as u16))
                    })
                    .map(|(j, e)| (j, e.finally.expect("filtered on finally")))
            };
            match next {
                Some((j, finally)) => {
                    let frame = vm.current_frame_mut();
                    frame.pending = Some(Pending::Return(value));
                    frame.active_finallies.push(j as u16);
                    frame.jump_to(finally as usize);
                    Ok(())
                }
                None => vm.do_return(value),
            }
        }
    }
}

/// Pop into the pending-return register, replacing any suspended action
/// (a `return` inside `finally` wins over a pending exception).
pub fn set_pending_ret<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let v = vm.pop()?;
    if let Some(p) = vm.current_frame_mut().pending.take() {
        let inner = p.into_value();
        vm.heap.release_value(&inner);
    }
    vm.current_frame_mut().pending = Some(Pending::Return(v));
    Ok(())
}
