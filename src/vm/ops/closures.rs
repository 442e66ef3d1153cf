//! Closure handlers.

use crate::errors::VmError;
use crate::runtime::{PhpClosure, Value};
use crate::vm::Vm;
use std::io::Write;

/// Mode operand for `capture_var`: by value.
pub const CAPTURE_BY_VALUE: u16 = 0;
/// Mode operand for `capture_var`: by reference.
pub const CAPTURE_BY_REF: u16 = 1;

/// Capture a local for a pending `make_closure`. By-value pushes a copy;
/// by-reference promotes the slot to a shared reference cell and pushes
/// the cell, so later writes through either side stay visible.
pub fn capture_var<W: Write>(vm: &mut Vm<W>, slot: u16, mode: u16) -> Result<(), VmError> {
    if mode == CAPTURE_BY_VALUE {
        let v = vm.load_local(slot);
        vm.stack.push(v);
        return Ok(());
    }
    let cur = vm.current_frame().locals[slot as usize].clone();
    let h = match cur {
        Value::Ref(h) => {
            vm.heap.retain(h);
            h
        }
        _ => {
            let owned = std::mem::replace(
                &mut vm.current_frame_mut().locals[slot as usize],
                Value::Null,
            );
            let h = vm.heap.alloc_ref(owned);
            vm.current_frame_mut().locals[slot as usize] = Value::Ref(h);
            vm.heap.retain(h);
            h
        }
    };
    vm.stack.push(Value::Ref(h));
    Ok(())
}

/// Same as [`capture_var`] for a global slot (top-level closures).
pub fn capture_global<W: Write>(vm: &mut Vm<W>, slot: u16, mode: u16) -> Result<(), VmError> {
    if mode == CAPTURE_BY_VALUE {
        let v = vm.load_global(slot);
        vm.stack.push(v);
        return Ok(());
    }
    let cur = vm.globals[slot as usize].clone();
    let h = match cur {
        Value::Ref(h) => {
            vm.heap.retain(h);
            h
        }
        _ => {
            let owned = std::mem::replace(&mut vm.globals[slot as usize], Value::Null);
            let h = vm.heap.alloc_ref(owned);
            vm.globals[slot as usize] = Value::Ref(h);
            vm.heap.retain(h);
            h
        }
    };
    vm.stack.push(Value::Ref(h));
    Ok(())
}

/// Build a closure from prototype `proto_k` with the top `captc` captured
/// values, binding `$this` when created inside an instance scope.
pub fn make_closure<W: Write>(vm: &mut Vm<W>, proto_k: u16, captc: u16) -> Result<(), VmError> {
    let captured = vm.pop_n(captc as usize)?;
    let proto = vm.current_code().protos[proto_k as usize].clone();
    let this = if !proto.is_static && proto.declaring_class.is_some() {
        match vm.frames.last().and_then(|f| f.locals.first()).cloned() {
            Some(Value::Object(h)) => {
                vm.heap.retain(h);
                Some(h)
            }
            _ => None,
        }
    } else {
        None
    };
    let scope = vm.frames.last().and_then(|f| f.class_ctx);
    let h = vm.heap.alloc_closure(PhpClosure {
        func: proto,
        captured,
        this,
        scope,
    });
    vm.stack.push(Value::Closure(h));
    Ok(())
}

/// `callable, args... -> result`
pub fn closure_call<W: Write>(vm: &mut Vm<W>, argc: u8) -> Result<(), VmError> {
    let args = vm.pop_n(argc as usize)?;
    let callee = vm.pop()?;
    super::calls::call_value(vm, callee, args)
}
