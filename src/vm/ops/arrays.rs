//! Array handlers, including the snapshot foreach protocol.

use crate::errors::{FatalError, VmError};
use crate::runtime::{ArrayKey, PhpArray, Value};
use crate::vm::{ForeachIter, Vm};
use std::io::Write;

/// Resolve a popped value to its referent (dropping a `Ref` wrapper but
/// keeping ownership of the underlying value).
pub(crate) fn deref_owned<W: Write>(vm: &mut Vm<W>, v: Value) -> Value {
    match v {
        Value::Ref(h) => {
            let inner = vm.heap.ref_get(h).clone();
            vm.heap.retain_value(&inner);
            vm.heap.release(h);
            inner
        }
        other => other,
    }
}

pub fn new_array<W: Write>(vm: &mut Vm<W>, capacity: u16) {
    let h = vm.heap.alloc_array(PhpArray::with_capacity(capacity as usize));
    vm.stack.push(Value::Array(h));
}

pub fn array_get<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let key_v = vm.pop()?;
    let arr_v = vm.pop()?;
    let arr_v = deref_owned(vm, arr_v);
    let result = (|| match &arr_v {
        Value::Array(h) => {
            let key = vm.array_key_for(&key_v)?;
            match vm.heap.array(*h).get(&key) {
                Some(v) => {
                    let v = v.clone();
                    vm.heap.retain_value(&v);
                    Ok(v)
                }
                None => Ok(Value::Null),
            }
        }
        Value::String(h) => {
            // String offset access yields a one-byte string.
            let idx = vm.to_int_value(&key_v);
            let s = vm.heap.string(*h);
            let len = s.len() as i64;
            let idx = if idx < 0 { idx + len } else { idx };
            if idx < 0 || idx >= len {
                return Ok(Value::Null);
            }
            let byte = s.as_bytes()[idx as usize];
            Ok(Value::String(
                vm.heap
                    .alloc_string(crate::runtime::PhpString::from_bytes(vec![byte])),
            ))
        }
        Value::Null => Ok(Value::Null),
        other => Err(vm.raise(
            "TypeError",
            &format!("Cannot access offset on value of type {}", other.type_name()),
        )),
    })();
    vm.heap.release_value(&arr_v);
    vm.heap.release_value(&key_v);
    vm.stack.push(result?);
    Ok(())
}

/// Fetch-for-write: `$a[k]` in the base of a nested write, vivifying a
/// missing or null entry into a fresh array.
pub fn array_get_w<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let key_v = vm.pop()?;
    let arr_v = vm.pop()?;
    let arr_v = deref_owned(vm, arr_v);
    let result = (|| match &arr_v {
        Value::Array(h) => {
            let key = vm.array_key_for(&key_v)?;
            let existing = vm.heap.array(*h).get(&key).cloned();
            match existing {
                Some(Value::Array(inner)) => {
                    vm.heap.retain(inner);
                    Ok(Value::Array(inner))
                }
                Some(Value::Null) | None => {
                    let inner = vm.heap.alloc_array(PhpArray::new());
                    vm.heap.retain(inner);
                    let old = vm.heap.array_mut(*h).insert(key, Value::Array(inner));
                    if let Some(old) = old {
                        vm.heap.release_value(&old);
                    }
                    Ok(Value::Array(inner))
                }
                Some(other) => Err(vm.raise(
                    "TypeError",
                    &format!(
                        "Cannot use a value of type {} as an array",
                        other.type_name()
                    ),
                )),
            }
        }
        other => Err(vm.raise(
            "TypeError",
            &format!("Cannot use a value of type {} as an array", other.type_name()),
        )),
    })();
    vm.heap.release_value(&arr_v);
    vm.heap.release_value(&key_v);
    vm.stack.push(result?);
    Ok(())
}

/// `array, key, value -> value`; writes through the shared box, leaving
/// the assigned value as the expression result.
pub fn array_set<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let value = vm.pop()?;
    let key_v = vm.pop()?;
    let arr_v = vm.pop()?;
    let arr_v = deref_owned(vm, arr_v);
    let result = (|| match &arr_v {
        Value::Array(h) => {
            let key = vm.array_key_for(&key_v)?;
            vm.heap.retain_value(&value);
            let old = vm.heap.array_mut(*h).insert(key, value.clone());
            if let Some(old) = old {
                vm.heap.release_value(&old);
            }
            Ok(())
        }
        other => {
            vm.heap.release_value(&value);
            Err(vm.raise(
                "TypeError",
                &format!("Cannot use a value of type {} as an array", other.type_name()),
            ))
        }
    })();
    vm.heap.release_value(&arr_v);
    vm.heap.release_value(&key_v);
    result?;
    vm.stack.push(value);
    Ok(())
}

/// `array, value -> value`: `[]`-append at `next_index`.
pub fn array_push<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let value = vm.pop()?;
    let arr_v = vm.pop()?;
    let arr_v = deref_owned(vm, arr_v);
    let result = match &arr_v {
        Value::Array(h) => {
            vm.heap.retain_value(&value);
            vm.heap.array_mut(*h).push(value.clone());
            Ok(())
        }
        other => {
            let e = vm.raise(
                "TypeError",
                &format!("Cannot use a value of type {} as an array", other.type_name()),
            );
            vm.heap.release_value(&value);
            Err(e)
        }
    };
    vm.heap.release_value(&arr_v);
    result?;
    vm.stack.push(value);
    Ok(())
}

pub fn array_pop<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let arr_v = vm.pop()?;
    let arr_v = deref_owned(vm, arr_v);
    let result = match &arr_v {
        Value::Array(h) => Ok(vm.heap.array_mut(*h).pop().unwrap_or(Value::Null)),
        other => Err(vm.raise(
            "TypeError",
            &format!("array_pop() expects array, {} given", other.type_name()),
        )),
    };
    vm.heap.release_value(&arr_v);
    vm.stack.push(result?);
    Ok(())
}

pub fn array_len<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let arr_v = vm.pop()?;
    let arr_v = deref_owned(vm, arr_v);
    let result = match &arr_v {
        Value::Array(h) => Ok(Value::Int(vm.heap.array(*h).len() as i64)),
        other => Err(vm.raise(
            "TypeError",
            &format!("count() expects array, {} given", other.type_name()),
        )),
    };
    vm.heap.release_value(&arr_v);
    vm.stack.push(result?);
    Ok(())
}

pub fn array_unset<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let key_v = vm.pop()?;
    let arr_v = vm.pop()?;
    let arr_v = deref_owned(vm, arr_v);
    let result = (|| match &arr_v {
        Value::Array(h) => {
            let key = vm.array_key_for(&key_v)?;
            if let Some(old) = vm.heap.array_mut(*h).remove(&key) {
                vm.heap.release_value(&old);
            }
            Ok(())
        }
        Value::Null => Ok(()),
        other => Err(vm.raise(
            "TypeError",
            &format!("Cannot unset offset on value of type {}", other.type_name()),
        )),
    })();
    vm.heap.release_value(&arr_v);
    vm.heap.release_value(&key_v);
    result
}

// ==================== Write-context slot loads ====================

/// Push a local slot as an array for writing, vivifying null.
pub fn push_local_array<W: Write>(vm: &mut Vm<W>, slot: u16) -> Result<(), VmError> {
    let cur = vm.load_local(slot);
    match cur {
        Value::Array(_) => {
            vm.stack.push(cur);
            Ok(())
        }
        Value::Null => {
            let h = vm.heap.alloc_array(PhpArray::new());
            vm.heap.retain(h);
            vm.store_local(slot, Value::Array(h));
            vm.stack.push(Value::Array(h));
            Ok(())
        }
        other => {
            let e = vm.raise(
                "TypeError",
                &format!("Cannot use a value of type {} as an array", other.type_name()),
            );
            vm.heap.release_value(&other);
            Err(e)
        }
    }
}

pub fn push_global_array<W: Write>(vm: &mut Vm<W>, slot: u16) -> Result<(), VmError> {
    let cur = vm.load_global(slot);
    match cur {
        Value::Array(_) => {
            vm.stack.push(cur);
            Ok(())
        }
        Value::Null => {
            let h = vm.heap.alloc_array(PhpArray::new());
            vm.heap.retain(h);
            vm.store_global(slot, Value::Array(h));
            vm.stack.push(Value::Array(h));
            Ok(())
        }
        other => {
            let e = vm.raise(
                "TypeError",
                &format!("Cannot use a value of type {} as an array", other.type_name()),
            );
            vm.heap.release_value(&other);
            Err(e)
        }
    }
}

// ==================== foreach ====================

/// Pop the iterable and open a snapshot iterator: the (key, value) pairs
/// as they exist now. Mutating the source array afterwards never changes
/// the iteration sequence.
pub fn foreach_init<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let v = vm.pop()?;
    let v = deref_owned(vm, v);
    match &v {
        Value::Array(h) => {
            let entries: Vec<(ArrayKey, Value)> = vm.heap.array(*h).entries().to_vec();
            for (_, value) in &entries {
                vm.heap.retain_value(value);
            }
            vm.heap.release_value(&v);
            vm.iters.push(ForeachIter { entries, pos: 0 });
            Ok(())
        }
        other => {
            let e = vm.raise(
                "TypeError",
                &format!(
                    "foreach() argument must be of type array, {} given",
                    other.type_name()
                ),
            );
            vm.heap.release_value(&v);
            Err(e)
        }
    }
}

/// Push the next key and value, or close the iterator and jump to `end`
/// when exhausted.
pub fn foreach_next<W: Write>(vm: &mut Vm<W>, end: u16) -> Result<(), VmError> {
    let next = {
        let iter = vm.iters.last_mut().ok_or_else(|| {
            VmError::Fatal(FatalError::CorruptedBytecode(
                "foreach_next without an open iterator".to_string(),
            ))
        })?;
        if iter.pos < iter.entries.len() {
            let entry = &mut iter.entries[iter.pos];
            let key = entry.0.clone();
            // Ownership of the snapshot value moves to the stack.
            let value = std::mem::replace(&mut entry.1, Value::Null);
            iter.pos += 1;
            Some((key, value))
        } else {
            None
        }
    };
    match next {
        Some((key, value)) => {
            let key_v = match key {
                ArrayKey::Int(n) => Value::Int(n),
                ArrayKey::Str(s) => Value::String(vm.heap.alloc_string(s.into())),
            };
            vm.stack.push(key_v);
            vm.stack.push(value);
        }
        None => {
            let iter = vm.iters.pop().expect("iterator stack out of sync");
            vm.release_iter(iter);
            vm.current_frame_mut().jump_to(end as usize);
        }
    }
    Ok(())
}

/// Close the innermost iterator early (`break` out of a foreach).
pub fn iter_pop<W: Write>(vm: &mut Vm<W>) {
    if let Some(iter) = vm.iters.pop() {
        vm.release_iter(iter);
    }
}
