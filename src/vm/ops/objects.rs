//! Object handlers: construction, property access through inline caches,
//! method dispatch, magic-method hooks, statics, class constants, and the
//! declaration instructions.

use super::arrays::deref_owned;
use crate::ast::Visibility;
use crate::errors::{FatalError, VmError};
use crate::heap::Handle;
use crate::runtime::{PhpArray, PhpObject, Value};
use crate::vm::class::{ClassId, ClassKind};
use crate::vm::inline_cache::CacheTarget;
use crate::vm::opcode::{Constant, UserFunction};
use crate::vm::Vm;
use std::io::Write;
use std::sync::Arc;

fn corrupted(msg: &str) -> VmError {
    VmError::Fatal(FatalError::CorruptedBytecode(msg.to_string()))
}

/// Visibility gate for a member declared in `declared_in`, seen from the
/// current frame's class context.
fn visible<W: Write>(
    vm: &Vm<W>,
    visibility: Visibility,
    declared_in: ClassId,
    ctx: Option<ClassId>,
) -> bool {
    match visibility {
        Visibility::Public => true,
        Visibility::Private => ctx == Some(declared_in),
        Visibility::Protected => match ctx {
            Some(c) => {
                c == declared_in
                    || vm.registry.is_instance_of(c, declared_in)
                    || vm.registry.is_instance_of(declared_in, c)
            }
            None => false,
        },
    }
}

/// Class context a callee runs under: the class that declared it.
fn callee_ctx<W: Write>(vm: &Vm<W>, func: &Arc<UserFunction>) -> Option<ClassId> {
    func.declaring_class
        .as_ref()
        .and_then(|name| vm.registry.lookup(name))
}

/// Resolve a class-name operand, handling `self`, `parent` and `static`
/// against the current frame's context.
pub(crate) fn resolve_class_operand<W: Write>(
    vm: &mut Vm<W>,
    name: &str,
) -> Result<ClassId, VmError> {
    match name.to_lowercase().as_str() {
        "self" | "static" => {
            let ctx = vm.frames.last().and_then(|f| f.class_ctx);
            match ctx {
                Some(c) => Ok(c),
                None => Err(vm.raise("Error", "Cannot use \"self\" outside of a class")),
            }
        }
        "parent" => {
            let ctx = vm.frames.last().and_then(|f| f.class_ctx);
            match ctx {
                Some(c) => {
                    let parent = vm.registry.class(c).parent;
                    match parent {
                        Some(p) => Ok(p),
                        None => Err(vm.raise(
                            "Error",
                            "Cannot use \"parent\" when current class has no parent",
                        )),
                    }
                }
                None => Err(vm.raise("Error", "Cannot use \"parent\" outside of a class")),
            }
        }
        _ => {
            let resolved = vm.registry.resolve(name);
            resolved.map_err(|m| vm.raise("Error", &m))
        }
    }
}

// ==================== Construction ====================

pub fn new_object<W: Write>(vm: &mut Vm<W>, class_k: u16, argc: u8) -> Result<(), VmError> {
    let name = vm.const_str(class_k);
    let args = vm.pop_n(argc as usize)?;

    let id = match resolve_class_operand(vm, &name) {
        Ok(id) => id,
        Err(e) => {
            for v in &args {
                vm.heap.release_value(v);
            }
            return Err(e);
        }
    };
    let desc = vm.registry.class(id);
    let blocked = if desc.is_abstract {
        Some(format!("Cannot instantiate abstract class {}", desc.name))
    } else {
        match desc.kind {
            ClassKind::Interface => Some(format!("Cannot instantiate interface {}", desc.name)),
            ClassKind::Trait => Some(format!("Cannot instantiate trait {}", desc.name)),
            ClassKind::Enum(_) => Some(format!("Cannot instantiate enum {}", desc.name)),
            ClassKind::Class => None,
        }
    };
    if let Some(msg) = blocked {
        for v in &args {
            vm.heap.release_value(v);
        }
        return Err(vm.raise("Error", &msg));
    }

    let h = instantiate(vm, id);
    vm.stack.push(Value::Object(h));

    let ctor = vm
        .registry
        .find_method(id, "__construct")
        .map(|m| (Arc::clone(&m.func), m.declared_in));
    match ctor {
        Some((func, declared_in)) => {
            vm.heap.retain(h);
            vm.push_call(
                func,
                Some(Value::Object(h)),
                Vec::new(),
                args,
                Some(declared_in),
                true,
            )?;
        }
        None => {
            for v in &args {
                vm.heap.release_value(v);
            }
        }
    }
    Ok(())
}

/// Allocate an instance with its class defaults in shape order.
pub(crate) fn instantiate<W: Write>(vm: &mut Vm<W>, id: ClassId) -> Handle {
    let defaults: Vec<Constant> = vm
        .registry
        .class(id)
        .properties
        .iter()
        .map(|p| p.default.clone())
        .collect();
    let shape = vm.registry.class(id).shape;
    let finalizable = vm.registry.class(id).magic.destruct.is_some();
    let mut slots = Vec::with_capacity(defaults.len());
    for c in &defaults {
        let v = vm.constant_value(c);
        slots.push(v);
    }
    vm.heap.alloc_object(finalizable, |self_handle| {
        PhpObject::new(id, shape, slots, self_handle)
    })
}

// ==================== Property access ====================

pub fn get_prop<W: Write>(
    vm: &mut Vm<W>,
    name_k: u16,
    cache_idx: u16,
    nullsafe: bool,
) -> Result<(), VmError> {
    let obj_v = vm.pop()?;
    let obj_v = deref_owned(vm, obj_v);
    if nullsafe && obj_v.is_null() {
        vm.stack.push(Value::Null);
        return Ok(());
    }
    let name = vm.const_str(name_k);
    let h = match obj_v {
        Value::Object(h) => h,
        other => {
            let e = vm.raise(
                "TypeError",
                &format!(
                    "Attempt to read property \"{}\" on {}",
                    name,
                    other.type_name()
                ),
            );
            vm.heap.release_value(&other);
            return Err(e);
        }
    };

    let shape = vm.heap.object(h).shape;
    let cached = vm.current_code().caches[cache_idx as usize]
        .borrow_mut()
        .lookup(shape);
    if let Some(CacheTarget::Slot(off)) = cached {
        let v = vm.heap.object(h).slots[off as usize].clone();
        vm.heap.retain_value(&v);
        vm.heap.release(h);
        vm.stack.push(v);
        return Ok(());
    }

    // Slow path: shape lookup, then __get.
    let ctx = vm.frames.last().and_then(|f| f.class_ctx);
    match vm.registry.shape(shape).offset_of(&name) {
        Some(off) => {
            let class = vm.heap.object(h).class;
            let gate = vm
                .registry
                .class(class)
                .find_property(&name)
                .map(|p| (p.visibility, p.declared_in));
            if let Some((vis, declared_in)) = gate {
                if !visible(vm, vis, declared_in, ctx) {
                    let class_name = vm.registry.class(class).name.clone();
                    vm.heap.release(h);
                    return Err(vm.raise(
                        "Error",
                        &format!("Cannot access non-public property {}::${}", class_name, name),
                    ));
                }
            }
            vm.current_code().caches[cache_idx as usize]
                .borrow_mut()
                .install(shape, CacheTarget::Slot(off));
            let v = vm.heap.object(h).slots[off as usize].clone();
            vm.heap.retain_value(&v);
            vm.heap.release(h);
            vm.stack.push(v);
            Ok(())
        }
        None => {
            let class = vm.heap.object(h).class;
            let getter = vm.registry.class(class).magic.get.clone();
            match getter {
                Some(func) => {
                    let ctx = callee_ctx(vm, &func);
                    let name_v = Value::String(vm.heap.alloc_string(name.as_str().into()));
                    vm.push_call(
                        func,
                        Some(Value::Object(h)),
                        Vec::new(),
                        vec![name_v],
                        ctx,
                        false,
                    )
                }
                None => {
                    let class_name = vm.registry.class(class).name.clone();
                    vm.heap.release(h);
                    Err(vm.raise(
                        "UndefinedPropertyError",
                        &format!("Undefined property: {}::${}", class_name, name),
                    ))
                }
            }
        }
    }
}

pub fn set_prop<W: Write>(vm: &mut Vm<W>, name_k: u16, cache_idx: u16) -> Result<(), VmError> {
    let value = vm.pop()?;
    let obj_v = vm.pop()?;
    let obj_v = deref_owned(vm, obj_v);
    let name = vm.const_str(name_k);
    let h = match obj_v {
        Value::Object(h) => h,
        other => {
            let e = vm.raise(
                "TypeError",
                &format!(
                    "Attempt to assign property \"{}\" on {}",
                    name,
                    other.type_name()
                ),
            );
            vm.heap.release_value(&other);
            vm.heap.release_value(&value);
            return Err(e);
        }
    };

    let shape = vm.heap.object(h).shape;
    let cached = vm.current_code().caches[cache_idx as usize]
        .borrow_mut()
        .lookup(shape);
    if let Some(CacheTarget::Slot(off)) = cached {
        vm.heap.retain_value(&value);
        let old = std::mem::replace(
            &mut vm.heap.object_mut(h).slots[off as usize],
            value.clone(),
        );
        vm.heap.release_value(&old);
        vm.heap.release(h);
        vm.stack.push(value);
        return Ok(());
    }

    let ctx = vm.frames.last().and_then(|f| f.class_ctx);
    match vm.registry.shape(shape).offset_of(&name) {
        Some(off) => {
            let class = vm.heap.object(h).class;
            let gate = vm
                .registry
                .class(class)
                .find_property(&name)
                .map(|p| (p.visibility, p.readonly, p.declared_in));
            let mut cacheable = true;
            if let Some((vis, readonly, declared_in)) = gate {
                if !visible(vm, vis, declared_in, ctx) {
                    let class_name = vm.registry.class(class).name.clone();
                    vm.heap.release(h);
                    vm.heap.release_value(&value);
                    return Err(vm.raise(
                        "Error",
                        &format!("Cannot access non-public property {}::${}", class_name, name),
                    ));
                }
                if readonly {
                    // Writable only from the declaring scope; never cached
                    // so the gate stays on every write.
                    cacheable = false;
                    if ctx != Some(declared_in) {
                        let class_name = vm.registry.class(class).name.clone();
                        vm.heap.release(h);
                        vm.heap.release_value(&value);
                        return Err(vm.raise(
                            "Error",
                            &format!(
                                "Cannot modify readonly property {}::${}",
                                class_name, name
                            ),
                        ));
                    }
                }
            }
            if cacheable {
                vm.current_code().caches[cache_idx as usize]
                    .borrow_mut()
                    .install(shape, CacheTarget::Slot(off));
            }
            vm.heap.retain_value(&value);
            let old = std::mem::replace(
                &mut vm.heap.object_mut(h).slots[off as usize],
                value.clone(),
            );
            vm.heap.release_value(&old);
            vm.heap.release(h);
            vm.stack.push(value);
            Ok(())
        }
        None => {
            let class = vm.heap.object(h).class;
            let setter = vm.registry.class(class).magic.set.clone();
            match setter {
                Some(func) => {
                    let ctx = callee_ctx(vm, &func);
                    let name_v = Value::String(vm.heap.alloc_string(name.as_str().into()));
                    vm.heap.retain_value(&value);
                    let result = vm.call_sync(
                        func,
                        Some(Value::Object(h)),
                        vec![name_v, value.clone()],
                        ctx,
                    )?;
                    vm.heap.release_value(&result);
                    vm.stack.push(value);
                    Ok(())
                }
                None => {
                    // Dynamic property: transition to the derived shape.
                    let (next_shape, off) = vm.registry.transition(shape, &name);
                    vm.heap.retain_value(&value);
                    {
                        let obj = vm.heap.object_mut(h);
                        obj.shape = next_shape;
                        debug_assert_eq!(off as usize, obj.slots.len());
                        obj.slots.push(value.clone());
                    }
                    // Future writes on the transitioned shape hit the cache.
                    vm.current_code().caches[cache_idx as usize]
                        .borrow_mut()
                        .install(next_shape, CacheTarget::Slot(off));
                    vm.heap.release(h);
                    vm.stack.push(value);
                    Ok(())
                }
            }
        }
    }
}

// ==================== Method dispatch ====================

pub fn call_method<W: Write>(
    vm: &mut Vm<W>,
    name_k: u16,
    cache_idx: u16,
    argc: u8,
    nullsafe: bool,
) -> Result<(), VmError> {
    let args = vm.pop_n(argc as usize)?;
    let obj_v = vm.pop()?;
    let obj_v = deref_owned(vm, obj_v);
    if nullsafe && obj_v.is_null() {
        for v in &args {
            vm.heap.release_value(v);
        }
        vm.stack.push(Value::Null);
        return Ok(());
    }
    let name = vm.const_str(name_k);
    let h = match obj_v {
        Value::Object(h) => h,
        other => {
            let e = vm.raise(
                "Error",
                &format!(
                    "Call to a member function {}() on {}",
                    name,
                    other.type_name()
                ),
            );
            for v in &args {
                vm.heap.release_value(v);
            }
            vm.heap.release_value(&other);
            return Err(e);
        }
    };

    let shape = vm.heap.object(h).shape;
    let cached = vm.current_code().caches[cache_idx as usize]
        .borrow_mut()
        .lookup(shape);
    if let Some(CacheTarget::Method(func, declared_in)) = cached {
        let this = if func.is_static {
            vm.heap.release(h);
            None
        } else {
            Some(Value::Object(h))
        };
        return vm.push_call(func, this, Vec::new(), args, Some(declared_in), false);
    }

    let class = vm.heap.object(h).class;
    let entry = vm
        .registry
        .find_method(class, &name)
        .map(|m| (Arc::clone(&m.func), m.visibility, m.is_static, m.declared_in));
    match entry {
        Some((func, vis, is_static, declared_in)) => {
            let ctx = vm.frames.last().and_then(|f| f.class_ctx);
            if !visible(vm, vis, declared_in, ctx) {
                let class_name = vm.registry.class(class).name.clone();
                for v in &args {
                    vm.heap.release_value(v);
                }
                vm.heap.release(h);
                return Err(vm.raise(
                    "Error",
                    &format!(
                        "Call to non-public method {}::{}() from global scope",
                        class_name, name
                    ),
                ));
            }
            vm.current_code().caches[cache_idx as usize]
                .borrow_mut()
                .install(shape, CacheTarget::Method(Arc::clone(&func), declared_in));
            let this = if is_static {
                vm.heap.release(h);
                None
            } else {
                Some(Value::Object(h))
            };
            vm.push_call(func, this, Vec::new(), args, Some(declared_in), false)
        }
        None => {
            let magic = vm.registry.class(class).magic.call.clone();
            match magic {
                Some(func) => {
                    let ctx = callee_ctx(vm, &func);
                    let mut packed = PhpArray::with_capacity(args.len());
                    for v in args {
                        packed.push(v);
                    }
                    let args_v = Value::Array(vm.heap.alloc_array(packed));
                    let name_v = Value::String(vm.heap.alloc_string(name.as_str().into()));
                    vm.push_call(
                        func,
                        Some(Value::Object(h)),
                        Vec::new(),
                        vec![name_v, args_v],
                        ctx,
                        false,
                    )
                }
                None => {
                    let class_name = vm.registry.class(class).name.clone();
                    for v in &args {
                        vm.heap.release_value(v);
                    }
                    vm.heap.release(h);
                    Err(vm.raise(
                        "UndefinedMethodError",
                        &format!("Call to undefined method {}::{}()", class_name, name),
                    ))
                }
            }
        }
    }
}

// ==================== instanceof / clone ====================

pub fn instance_of<W: Write>(vm: &mut Vm<W>, class_k: u16) -> Result<(), VmError> {
    let name = vm.const_str(class_k);
    let v = vm.pop()?;
    let result = vm.value_instance_of_name(&v, &name);
    vm.heap.release_value(&v);
    vm.stack.push(Value::Bool(result));
    Ok(())
}

pub fn clone_object<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let v = vm.pop()?;
    let v = deref_owned(vm, v);
    let h = match v {
        Value::Object(h) => h,
        other => {
            let e = vm.raise("Error", "__clone method called on non-object");
            vm.heap.release_value(&other);
            return Err(e);
        }
    };

    let (class, shape, slots) = {
        let obj = vm.heap.object(h);
        (obj.class, obj.shape, obj.slots.clone())
    };
    for s in &slots {
        vm.heap.retain_value(s);
    }
    let finalizable = vm.registry.class(class).magic.destruct.is_some();
    let copy = vm.heap.alloc_object(finalizable, |self_handle| {
        PhpObject::new(class, shape, slots, self_handle)
    });
    vm.heap.release(h);
    vm.stack.push(Value::Object(copy));

    let hook = vm
        .registry
        .find_method(class, "__clone")
        .map(|m| (Arc::clone(&m.func), m.declared_in));
    if let Some((func, declared_in)) = hook {
        vm.heap.retain(copy);
        vm.push_call(
            func,
            Some(Value::Object(copy)),
            Vec::new(),
            Vec::new(),
            Some(declared_in),
            true,
        )?;
    }
    Ok(())
}

// ==================== Statics & class constants ====================

pub fn push_static_prop<W: Write>(vm: &mut Vm<W>, class_k: u16, name_k: u16) -> Result<(), VmError> {
    let class_name = vm.const_str(class_k);
    let name = vm.const_str(name_k);
    let id = resolve_class_operand(vm, &class_name)?;
    if !vm.registry.class(id).statics.contains_key(&name) {
        let display = vm.registry.class(id).name.clone();
        return Err(vm.raise(
            "Error",
            &format!("Access to undeclared static property {}::${}", display, name),
        ));
    }
    let needs_init = vm.registry.class(id).statics[&name].value.is_none();
    if needs_init {
        let default = vm.registry.class(id).statics[&name].default.clone();
        let v = vm.constant_value(&default);
        vm.registry
            .class_mut(id)
            .statics
            .get_mut(&name)
            .expect("static just checked")
            .value = Some(v);
    }
    let v = vm.registry.class(id).statics[&name]
        .value
        .clone()
        .expect("static just initialized");
    vm.heap.retain_value(&v);
    vm.stack.push(v);
    Ok(())
}

pub fn store_static_prop<W: Write>(
    vm: &mut Vm<W>,
    class_k: u16,
    name_k: u16,
) -> Result<(), VmError> {
    let class_name = vm.const_str(class_k);
    let name = vm.const_str(name_k);
    let value = vm.pop()?;
    let id = match resolve_class_operand(vm, &class_name) {
        Ok(id) => id,
        Err(e) => {
            vm.heap.release_value(&value);
            return Err(e);
        }
    };
    if !vm.registry.class(id).statics.contains_key(&name) {
        let display = vm.registry.class(id).name.clone();
        vm.heap.release_value(&value);
        return Err(vm.raise(
            "Error",
            &format!("Access to undeclared static property {}::${}", display, name),
        ));
    }
    let old = {
        let slot = vm
            .registry
            .class_mut(id)
            .statics
            .get_mut(&name)
            .expect("static just checked");
        std::mem::replace(&mut slot.value, Some(value))
    };
    if let Some(old) = old {
        vm.heap.release_value(&old);
    }
    Ok(())
}

pub fn push_class_const<W: Write>(vm: &mut Vm<W>, class_k: u16, name_k: u16) -> Result<(), VmError> {
    let class_name = vm.const_str(class_k);
    let name = vm.const_str(name_k);
    let id = resolve_class_operand(vm, &class_name)?;

    // Enum case access shares the `Class::NAME` syntax.
    if matches!(vm.registry.class(id).kind, ClassKind::Enum(_)) {
        let is_case = vm
            .registry
            .class(id)
            .enum_cases
            .iter()
            .any(|(n, _)| n == &name);
        if is_case {
            let v = enum_case(vm, id, &name)?;
            vm.stack.push(v);
            return Ok(());
        }
    }

    match vm.registry.class(id).constants.get(&name).cloned() {
        Some(c) => {
            let v = vm.constant_value(&c);
            vm.stack.push(v);
            Ok(())
        }
        None => {
            let display = vm.registry.class(id).name.clone();
            Err(vm.raise(
                "Error",
                &format!("Undefined constant {}::{}", display, name),
            ))
        }
    }
}

/// Enum case singleton, instantiated on first access.
fn enum_case<W: Write>(vm: &mut Vm<W>, id: ClassId, name: &str) -> Result<Value, VmError> {
    if let Some(v) = vm.enum_cases.get(&(id, name.to_string())) {
        let v = v.clone();
        vm.heap.retain_value(&v);
        return Ok(v);
    }
    let backing = vm
        .registry
        .class(id)
        .enum_cases
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, c)| c.clone());
    let h = instantiate(vm, id);
    let shape = vm.heap.object(h).shape;
    if let Some(off) = vm.registry.shape(shape).offset_of("name") {
        let name_v = Value::String(vm.heap.alloc_string(name.into()));
        let old = std::mem::replace(&mut vm.heap.object_mut(h).slots[off as usize], name_v);
        vm.heap.release_value(&old);
    }
    if let Some(c) = backing {
        if let Some(off) = vm.registry.shape(shape).offset_of("value") {
            let v = vm.constant_value(&c);
            let old = std::mem::replace(&mut vm.heap.object_mut(h).slots[off as usize], v);
            vm.heap.release_value(&old);
        }
    }
    // One reference lives in the singleton table, one goes to the caller.
    vm.heap.retain(h);
    vm.enum_cases
        .insert((id, name.to_string()), Value::Object(h));
    Ok(Value::Object(h))
}

// ==================== Declarations ====================

pub fn declare_class<W: Write>(vm: &mut Vm<W>, idx: u16) -> Result<(), VmError> {
    let unit = vm
        .unit
        .clone()
        .ok_or_else(|| corrupted("declare_class outside of a unit"))?;
    let def = unit
        .classes
        .get(idx as usize)
        .ok_or_else(|| corrupted("declare_class index out of range"))?
        .clone();
    vm.registry
        .declare(def)
        .map_err(|m| vm.raise("Error", &m))
}

pub fn declare_fn<W: Write>(vm: &mut Vm<W>, idx: u16) -> Result<(), VmError> {
    let unit = vm
        .unit
        .clone()
        .ok_or_else(|| corrupted("declare_fn outside of a unit"))?;
    let func = unit
        .functions
        .get(idx as usize)
        .ok_or_else(|| corrupted("declare_fn index out of range"))?
        .clone();
    let key = func.name.to_lowercase();
    if vm.functions.contains_key(&key) || crate::vm::builtins::lookup(&key).is_some() {
        let msg = format!("Cannot redeclare function {}()", func.name);
        return Err(vm.raise("Error", &msg));
    }
    vm.functions.insert(key, func);
    Ok(())
}
