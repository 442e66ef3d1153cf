//! Type casts and type predicates.

use crate::errors::VmError;
use crate::runtime::{ArrayKey, PhpArray, PhpObject, Value};
use crate::vm::opcode::Op;
use crate::vm::Vm;
use std::io::Write;

pub fn cast<W: Write>(vm: &mut Vm<W>, op: Op) -> Result<(), VmError> {
    let v = vm.pop()?;
    let result = match op {
        Op::ToInt => {
            let n = vm.to_int_value(&v);
            vm.heap.release_value(&v);
            Value::Int(n)
        }
        Op::ToFloat => {
            let f = vm.to_float_value(&v);
            vm.heap.release_value(&v);
            Value::Float(f)
        }
        Op::ToBool => {
            let b = vm.is_truthy(&v);
            vm.heap.release_value(&v);
            Value::Bool(b)
        }
        Op::ToString => {
            if matches!(v, Value::String(_)) {
                v
            } else {
                let s = vm.cast_to_php_string(&v);
                vm.heap.release_value(&v);
                Value::String(vm.heap.alloc_string(s?))
            }
        }
        Op::ToArray => cast_to_array(vm, v)?,
        Op::ToObject => cast_to_object(vm, v)?,
        other => unreachable!("cast called with {:?}", other),
    };
    vm.stack.push(result);
    Ok(())
}

fn cast_to_array<W: Write>(vm: &mut Vm<W>, v: Value) -> Result<Value, VmError> {
    match &v {
        Value::Array(_) => Ok(v),
        Value::Null => {
            vm.heap.release_value(&v);
            Ok(Value::Array(vm.heap.alloc_array(PhpArray::new())))
        }
        Value::Object(h) => {
            // Property map in declaration order.
            let (shape, slots) = {
                let obj = vm.heap.object(*h);
                (obj.shape, obj.slots.clone())
            };
            let names = vm.registry.shape(shape).slots.clone();
            let mut out = PhpArray::with_capacity(slots.len());
            for (name, value) in names.into_iter().zip(slots.into_iter()) {
                vm.heap.retain_value(&value);
                out.insert(ArrayKey::from_str_key(&name), value);
            }
            vm.heap.release_value(&v);
            Ok(Value::Array(vm.heap.alloc_array(out)))
        }
        _ => {
            let mut out = PhpArray::new();
            out.push(v);
            Ok(Value::Array(vm.heap.alloc_array(out)))
        }
    }
}

fn cast_to_object<W: Write>(vm: &mut Vm<W>, v: Value) -> Result<Value, VmError> {
    match &v {
        Value::Object(_) | Value::Closure(_) => Ok(v),
        Value::Array(src) => {
            let entries: Vec<(ArrayKey, Value)> = vm.heap.array(*src).entries().to_vec();
            let oh = new_std_object(vm);
            for (k, value) in entries {
                vm.heap.retain_value(&value);
                let name = k.to_string();
                let shape = vm.heap.object(oh).shape;
                let (next, off) = vm.registry.transition(shape, &name);
                let o = vm.heap.object_mut(oh);
                o.shape = next;
                debug_assert_eq!(off as usize, o.slots.len());
                o.slots.push(value);
            }
            vm.heap.release_value(&v);
            Ok(Value::Object(oh))
        }
        _ => {
            let oh = new_std_object(vm);
            let shape = vm.heap.object(oh).shape;
            let (next, _) = vm.registry.transition(shape, "scalar");
            let o = vm.heap.object_mut(oh);
            o.shape = next;
            o.slots.push(v);
            Ok(Value::Object(oh))
        }
    }
}

/// Fresh `stdClass` instance; properties arrive through shape transitions.
pub(crate) fn new_std_object<W: Write>(vm: &mut Vm<W>) -> crate::heap::Handle {
    let id = vm
        .registry
        .resolve("stdClass")
        .expect("stdClass is builtin");
    let shape = vm.registry.class(id).shape;
    vm.heap
        .alloc_object(false, |self_handle| PhpObject::new(id, shape, Vec::new(), self_handle))
}

pub fn type_check<W: Write>(vm: &mut Vm<W>, op: Op) -> Result<(), VmError> {
    let v = vm.pop()?;
    let subject = match &v {
        Value::Ref(h) => vm.heap.ref_get(*h).clone(),
        other => other.clone(),
    };
    let result = match op {
        Op::IsInt => matches!(subject, Value::Int(_)),
        Op::IsFloat => matches!(subject, Value::Float(_)),
        Op::IsString => matches!(subject, Value::String(_)),
        Op::IsBool => matches!(subject, Value::Bool(_)),
        Op::IsArray => matches!(subject, Value::Array(_)),
        Op::IsObject => matches!(subject, Value::Object(_) | Value::Closure(_)),
        Op::IsNull => subject.is_null(),
        Op::IsCallable => subject.is_callable(),
        other => unreachable!("type_check called with {:?}", other),
    };
    vm.heap.release_value(&v);
    vm.stack.push(Value::Bool(result));
    Ok(())
}
