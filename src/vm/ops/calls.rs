//! Call handlers: named functions, builtins, static methods, switch
//! dispatch, and calling arbitrary callable values.

use super::arrays::deref_owned;
use super::objects::resolve_class_operand;
use crate::errors::VmError;
use crate::runtime::{PhpArray, Value};
use crate::vm::builtins;
use crate::vm::opcode::{Instruction, Op};
use crate::vm::Vm;
use std::io::Write;
use std::sync::Arc;

pub fn call_named<W: Write>(vm: &mut Vm<W>, name_k: u16, argc: u8) -> Result<(), VmError> {
    let name = vm.const_str(name_k);
    let args = vm.pop_n(argc as usize)?;
    let lower = name.to_lowercase();
    if let Some(func) = vm.functions.get(&lower).cloned() {
        return vm.push_call(func, None, Vec::new(), args, None, false);
    }
    if let Some(def) = builtins::lookup(&lower) {
        return invoke_builtin(vm, def, args);
    }
    for v in &args {
        vm.heap.release_value(v);
    }
    Err(vm.raise(
        "Error",
        &format!("Call to undefined function {}()", name),
    ))
}

pub fn call_builtin<W: Write>(vm: &mut Vm<W>, id: u16, argc: u8) -> Result<(), VmError> {
    let args = vm.pop_n(argc as usize)?;
    let def = builtins::def(id);
    invoke_builtin(vm, def, args)
}

/// Builtin calling convention: arity is validated before dispatch, the
/// handler receives the arguments by value (shared via their boxes) and
/// may retain them; the VM releases the argument references afterwards.
fn invoke_builtin<W: Write>(
    vm: &mut Vm<W>,
    def: &'static builtins::BuiltinDef,
    args: Vec<Value>,
) -> Result<(), VmError> {
    let argc = args.len();
    if argc < def.min_arity as usize || argc > def.max_arity as usize {
        for v in &args {
            vm.heap.release_value(v);
        }
        return Err(vm.raise(
            "ArgumentCountError",
            &format!(
                "{}() expects between {} and {} arguments, {} given",
                def.name, def.min_arity, def.max_arity, argc
            ),
        ));
    }
    let result = builtins::dispatch(vm, def.id, &args);
    for v in &args {
        vm.heap.release_value(v);
    }
    vm.stack.push(result?);
    Ok(())
}

pub fn call_static<W: Write>(
    vm: &mut Vm<W>,
    class_k: u16,
    method_k: u16,
    argc: u8,
) -> Result<(), VmError> {
    let class_name = vm.const_str(class_k);
    let method = vm.const_str(method_k);
    let args = vm.pop_n(argc as usize)?;

    let id = match resolve_class_operand(vm, &class_name) {
        Ok(id) => id,
        Err(e) => {
            for v in &args {
                vm.heap.release_value(v);
            }
            return Err(e);
        }
    };

    let entry = vm
        .registry
        .find_method(id, &method)
        .map(|m| (Arc::clone(&m.func), m.is_static, m.declared_in));
    match entry {
        Some((func, is_static, declared_in)) => {
            // `parent::m()` and `self::m()` on an instance method forward
            // the current `$this`.
            let this = if is_static {
                None
            } else {
                match vm.frames.last().and_then(|f| f.locals.first()).cloned() {
                    Some(Value::Object(h)) => {
                        vm.heap.retain(h);
                        Some(Value::Object(h))
                    }
                    _ => {
                        for v in &args {
                            vm.heap.release_value(v);
                        }
                        let display = vm.registry.class(id).name.clone();
                        return Err(vm.raise(
                            "Error",
                            &format!(
                                "Non-static method {}::{}() cannot be called statically",
                                display, method
                            ),
                        ));
                    }
                }
            };
            vm.push_call(func, this, Vec::new(), args, Some(declared_in), false)
        }
        None => {
            let magic = vm.registry.class(id).magic.call_static.clone();
            match magic {
                Some(func) => {
                    let ctx = func
                        .declaring_class
                        .as_ref()
                        .and_then(|n| vm.registry.lookup(n));
                    let mut packed = PhpArray::with_capacity(args.len());
                    for v in args {
                        packed.push(v);
                    }
                    let args_v = Value::Array(vm.heap.alloc_array(packed));
                    let name_v = Value::String(vm.heap.alloc_string(method.as_str().into()));
                    vm.push_call(func, None, Vec::new(), vec![name_v, args_v], ctx, false)
                }
                None => {
                    for v in &args {
                        vm.heap.release_value(v);
                    }
                    let display = vm.registry.class(id).name.clone();
                    Err(vm.raise(
                        "Error",
                        &format!("Call to undefined method {}::{}()", display, method),
                    ))
                }
            }
        }
    }
}

/// `switch_int` / `switch_str`: jump through the table, or to the default
/// target when no label matches.
pub fn switch_jump<W: Write>(vm: &mut Vm<W>, ins: Instruction) -> Result<(), VmError> {
    let v = vm.pop()?;
    let v = deref_owned(vm, v);
    let target = {
        let table = &vm.current_code().jump_tables[ins.a as usize];
        match (ins.op, &v) {
            (Op::SwitchInt, Value::Int(n)) => table.lookup_int(*n),
            (Op::SwitchInt, Value::Bool(b)) => table.lookup_int(*b as i64),
            (Op::SwitchInt, Value::Float(f)) if f.fract() == 0.0 => table.lookup_int(*f as i64),
            (Op::SwitchStr, Value::String(h)) => table.lookup_str(vm.heap.string(*h).as_bytes()),
            (Op::SwitchStr, Value::Int(n)) => table.lookup_str(n.to_string().as_bytes()),
            _ => None,
        }
    };
    vm.heap.release_value(&v);
    let target = target.unwrap_or(ins.b);
    vm.current_frame_mut().jump_to(target as usize);
    Ok(())
}

/// Invoke an arbitrary callable value: closures, function values, builtin
/// references, callable strings, bound methods, and objects with
/// `__invoke`.
pub fn call_value<W: Write>(vm: &mut Vm<W>, callee: Value, args: Vec<Value>) -> Result<(), VmError> {
    match callee {
        Value::Closure(h) => {
            let (func, this, scope, captured) = {
                let c = vm.heap.closure(h);
                (Arc::clone(&c.func), c.this, c.scope, c.captured.clone())
            };
            for v in &captured {
                vm.heap.retain_value(v);
            }
            let this = this.map(|t| {
                vm.heap.retain(t);
                Value::Object(t)
            });
            let result = vm.push_call(func, this, captured, args, scope, false);
            vm.heap.release(h);
            result
        }
        Value::Function(func) => vm.push_call(func, None, Vec::new(), args, None, false),
        Value::Builtin(id) => invoke_builtin(vm, builtins::def(id), args),
        Value::String(h) => {
            let name = vm.heap.string(h).to_string_lossy();
            vm.heap.release(h);
            let lower = name.to_lowercase();
            if let Some(func) = vm.functions.get(&lower).cloned() {
                return vm.push_call(func, None, Vec::new(), args, None, false);
            }
            if let Some(def) = builtins::lookup(&lower) {
                return invoke_builtin(vm, def, args);
            }
            for v in &args {
                vm.heap.release_value(v);
            }
            Err(vm.raise(
                "TypeError",
                &format!("Value of type string (\"{}\") is not callable", name),
            ))
        }
        Value::BoundMethod { receiver, method } => {
            let class = vm.heap.object(receiver).class;
            let entry = vm
                .registry
                .find_method(class, &method)
                .map(|m| (Arc::clone(&m.func), m.declared_in));
            match entry {
                Some((func, declared_in)) => vm.push_call(
                    func,
                    Some(Value::Object(receiver)),
                    Vec::new(),
                    args,
                    Some(declared_in),
                    false,
                ),
                None => {
                    let display = vm.registry.class(class).name.clone();
                    for v in &args {
                        vm.heap.release_value(v);
                    }
                    vm.heap.release(receiver);
                    Err(vm.raise(
                        "UndefinedMethodError",
                        &format!("Call to undefined method {}::{}()", display, method),
                    ))
                }
            }
        }
        Value::Object(h) => {
            let class = vm.heap.object(h).class;
            let invoke = vm.registry.class(class).magic.invoke.clone();
            match invoke {
                Some(func) => {
                    let ctx = func
                        .declaring_class
                        .as_ref()
                        .and_then(|n| vm.registry.lookup(n));
                    vm.push_call(func, Some(Value::Object(h)), Vec::new(), args, ctx, false)
                }
                None => {
                    let display = vm.registry.class(class).name.clone();
                    for v in &args {
                        vm.heap.release_value(v);
                    }
                    vm.heap.release(h);
                    Err(vm.raise(
                        "Error",
                        &format!("Object of class {} is not callable", display),
                    ))
                }
            }
        }
        Value::Ref(h) => {
            let inner = vm.heap.ref_get(h).clone();
            vm.heap.retain_value(&inner);
            vm.heap.release(h);
            call_value(vm, inner, args)
        }
        other => {
            for v in &args {
                vm.heap.release_value(v);
            }
            let e = vm.raise(
                "TypeError",
                &format!("Value of type {} is not callable", other.type_name()),
            );
            vm.heap.release_value(&other);
            Err(e)
        }
    }
}
