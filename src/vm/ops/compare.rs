//! Comparison handlers.

use crate::errors::VmError;
use crate::runtime::Value;
use crate::vm::opcode::Op;
use crate::vm::Vm;
use std::cmp::Ordering;
use std::io::Write;

pub fn eq<W: Write>(vm: &mut Vm<W>, negate: bool) -> Result<(), VmError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    let result = vm.loose_eq(&left, &right);
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    vm.stack.push(Value::Bool(result != negate));
    Ok(())
}

pub fn identical<W: Write>(vm: &mut Vm<W>, negate: bool) -> Result<(), VmError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    let result = vm.identical(&left, &right);
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    vm.stack.push(Value::Bool(result != negate));
    Ok(())
}

pub fn relational<W: Write>(vm: &mut Vm<W>, op: Op) -> Result<(), VmError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    let ord = vm.compare_values(&left, &right);
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    let result = match op {
        Op::Lt => ord == Ordering::Less,
        Op::Le => ord != Ordering::Greater,
        Op::Gt => ord == Ordering::Greater,
        Op::Ge => ord != Ordering::Less,
        _ => unreachable!("relational called with {:?}", op),
    };
    vm.stack.push(Value::Bool(result));
    Ok(())
}

pub fn spaceship<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    let ord = vm.compare_values(&left, &right);
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    vm.stack.push(Value::Int(match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }));
    Ok(())
}
