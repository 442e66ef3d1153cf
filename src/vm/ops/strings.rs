//! String handlers.

use crate::errors::VmError;
use crate::runtime::PhpString;
use crate::runtime::Value;
use crate::vm::Vm;
use std::io::Write;

pub fn concat<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    let result: Result<Value, VmError> = (|| {
        let a = vm.cast_to_php_string(&left)?;
        let b = vm.cast_to_php_string(&right)?;
        Ok(Value::String(vm.heap.alloc_string(a.concat(&b))))
    })();
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    vm.stack.push(result?);
    Ok(())
}

/// Concatenate the top `n` values with PHP string casts, in push order.
pub fn interpolate<W: Write>(vm: &mut Vm<W>, n: u16) -> Result<(), VmError> {
    let parts = vm.pop_n(n as usize)?;
    let mut bytes = Vec::new();
    let mut failure = None;
    for part in &parts {
        match vm.cast_to_php_string(part) {
            Ok(s) => bytes.extend_from_slice(s.as_bytes()),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    for part in &parts {
        vm.heap.release_value(part);
    }
    if let Some(e) = failure {
        return Err(e);
    }
    let h = vm.heap.alloc_string(PhpString::from_bytes(bytes));
    vm.stack.push(Value::String(h));
    Ok(())
}
