//! The class registry: registration, finalization, shapes, and the builtin
//! class hierarchy.
//!
//! Classes register at the class-declaration instruction and stay pending
//! until first use (instantiation, static access, `instanceof` against a
//! live instance chain). Finalization resolves parent, interface and trait
//! references, flattens the method table, stamps the shape, and detects
//! magic methods. Finalized classes are immutable apart from static
//! property storage.

use crate::ast::Visibility;
use crate::vm::class::{
    ClassDef, ClassDescriptor, ClassId, ClassKind, MagicMethods, MethodDef, MethodEntry,
    PropertyDef, PropertySlot, Shape, ShapeId, StaticProp,
};
use crate::vm::inline_cache::InlineCache;
use crate::vm::opcode::{
    CompiledFunction, Constant, Instruction, Op, PhpParam, UserFunction,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ClassRegistry {
    classes: Vec<ClassDescriptor>,
    by_name: HashMap<String, ClassId>,
    pending: HashMap<String, ClassDef>,
    shapes: Vec<Shape>,
    transitions: HashMap<(ShapeId, String), ShapeId>,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            classes: Vec::new(),
            by_name: HashMap::new(),
            pending: HashMap::new(),
            shapes: Vec::new(),
            transitions: HashMap::new(),
        };
        registry.register_builtin_classes();
        registry
    }

    // ==================== Registration ====================

    /// Register a class declaration. Finalization is deferred.
    pub fn declare(&mut self, def: ClassDef) -> Result<(), String> {
        let lower = def.name.to_lowercase();
        if self.by_name.contains_key(&lower) || self.pending.contains_key(&lower) {
            return Err(format!("Cannot redeclare class {}", def.name));
        }
        self.pending.insert(lower, def);
        Ok(())
    }

    /// Look up a finalized class.
    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    pub fn is_declared(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.by_name.contains_key(&lower) || self.pending.contains_key(&lower)
    }

    pub fn class(&self, id: ClassId) -> &ClassDescriptor {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut ClassDescriptor {
        &mut self.classes[id.0 as usize]
    }

    pub fn shape(&self, id: ShapeId) -> &Shape {
        &self.shapes[id.0 as usize]
    }

    /// Resolve a class by name, finalizing it (and everything it depends
    /// on) if still pending.
    pub fn resolve(&mut self, name: &str) -> Result<ClassId, String> {
        let lower = name.to_lowercase();
        if let Some(&id) = self.by_name.get(&lower) {
            return Ok(id);
        }
        let mut in_progress = Vec::new();
        self.finalize(&lower, name, &mut in_progress)
    }

    // ==================== Finalization ====================

    fn finalize(
        &mut self,
        lower: &str,
        display: &str,
        in_progress: &mut Vec<String>,
    ) -> Result<ClassId, String> {
        if let Some(&id) = self.by_name.get(lower) {
            return Ok(id);
        }
        if in_progress.iter().any(|n| n == lower) {
            return Err(format!("Circular inheritance involving {}", display));
        }
        let def = self
            .pending
            .get(lower)
            .cloned()
            .ok_or_else(|| format!("Class \"{}\" not found", display))?;
        in_progress.push(lower.to_string());

        let parent_id = match &def.parent {
            Some(p) => Some(self.finalize(&p.to_lowercase(), p, in_progress)?),
            None => None,
        };
        let mut direct_interfaces = Vec::new();
        for i in &def.interfaces {
            direct_interfaces.push(self.finalize(&i.to_lowercase(), i, in_progress)?);
        }
        let mut trait_ids = Vec::new();
        for t in &def.traits {
            trait_ids.push(self.finalize(&t.to_lowercase(), t, in_progress)?);
        }
        in_progress.pop();

        let id = ClassId(self.classes.len() as u32);

        // Inherited members first.
        let mut properties: Vec<PropertySlot> = Vec::new();
        let mut methods: HashMap<String, MethodEntry> = HashMap::new();
        let mut constants: HashMap<String, Constant> = HashMap::new();
        let mut statics: HashMap<String, StaticProp> = HashMap::new();
        let mut ancestors: Vec<ClassId> = Vec::new();
        let mut interfaces: Vec<ClassId> = Vec::new();

        if let Some(pid) = parent_id {
            let parent = &self.classes[pid.0 as usize];
            if parent.is_final {
                return Err(format!(
                    "Class {} cannot extend final class {}",
                    def.name, parent.name
                ));
            }
            properties = parent.properties.clone();
            methods = parent.methods.clone();
            constants = parent.constants.clone();
            statics = parent.statics.clone();
            ancestors.push(pid);
            ancestors.extend(parent.ancestors.iter().copied());
            interfaces.extend(parent.interfaces.iter().copied());
        }
        for &iid in &direct_interfaces {
            if !interfaces.contains(&iid) {
                interfaces.push(iid);
            }
            let iface = &self.classes[iid.0 as usize];
            for &t in &iface.interfaces {
                if !interfaces.contains(&t) {
                    interfaces.push(t);
                }
            }
            for (k, v) in &iface.constants {
                constants.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        // Trait members override inherited ones; own members override both.
        for &tid in &trait_ids {
            let tr = &self.classes[tid.0 as usize];
            let trait_methods: Vec<(String, MethodEntry)> = tr
                .methods
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (name, mut entry) in trait_methods {
                entry.declared_in = id;
                methods.insert(name, entry);
            }
            let trait_props = tr.properties.clone();
            for p in trait_props {
                if !properties.iter().any(|q| q.name == p.name) {
                    let offset = properties.len() as u16;
                    properties.push(PropertySlot {
                        offset,
                        declared_in: id,
                        ..p
                    });
                }
            }
            for (k, v) in tr.statics.clone() {
                statics.entry(k).or_insert(v);
            }
        }

        for m in &def.methods {
            let key = m.func.name.to_lowercase();
            methods.insert(
                key,
                MethodEntry {
                    func: Arc::clone(&m.func),
                    visibility: m.visibility,
                    is_static: m.is_static,
                    declared_in: id,
                },
            );
        }
        for p in &def.properties {
            if p.is_static {
                statics.insert(
                    p.name.clone(),
                    StaticProp {
                        default: p.default.clone().unwrap_or(Constant::Null),
                        value: None,
                        visibility: p.visibility,
                    },
                );
                continue;
            }
            if let Some(existing) = properties.iter_mut().find(|q| q.name == p.name) {
                // Redeclared parent property: same slot, refreshed modifiers.
                existing.visibility = p.visibility;
                existing.readonly = p.readonly;
                existing.type_hint = p.type_hint.clone();
                existing.default = p.default.clone().unwrap_or(Constant::Null);
                existing.declared_in = id;
            } else {
                let offset = properties.len() as u16;
                properties.push(PropertySlot {
                    name: p.name.clone(),
                    offset,
                    visibility: p.visibility,
                    readonly: p.readonly,
                    type_hint: p.type_hint.clone(),
                    default: p.default.clone().unwrap_or(Constant::Null),
                    declared_in: id,
                });
            }
        }
        for (k, v) in &def.constants {
            constants.insert(k.clone(), v.clone());
        }

        // Enum cases expose `name` (and `value` when backed) as readonly
        // instance properties of the case singletons.
        if let ClassKind::Enum(backing) = def.kind {
            let mut inject = vec!["name".to_string()];
            if backing != crate::ast::EnumBacking::None {
                inject.push("value".to_string());
            }
            for prop in inject {
                if !properties.iter().any(|q| q.name == prop) {
                    let offset = properties.len() as u16;
                    properties.push(PropertySlot {
                        name: prop,
                        offset,
                        visibility: Visibility::Public,
                        readonly: true,
                        type_hint: None,
                        default: Constant::Null,
                        declared_in: id,
                    });
                }
            }
        }

        let magic = MagicMethods {
            construct: methods.get("__construct").map(|m| Arc::clone(&m.func)),
            destruct: methods.get("__destruct").map(|m| Arc::clone(&m.func)),
            get: methods.get("__get").map(|m| Arc::clone(&m.func)),
            set: methods.get("__set").map(|m| Arc::clone(&m.func)),
            call: methods.get("__call").map(|m| Arc::clone(&m.func)),
            call_static: methods.get("__callstatic").map(|m| Arc::clone(&m.func)),
            invoke: methods.get("__invoke").map(|m| Arc::clone(&m.func)),
            to_string: methods.get("__tostring").map(|m| Arc::clone(&m.func)),
            clone_: methods.get("__clone").map(|m| Arc::clone(&m.func)),
        };

        let shape_id = ShapeId(self.shapes.len() as u32);
        let slots: Vec<String> = properties.iter().map(|p| p.name.clone()).collect();
        self.shapes.push(Shape::new(shape_id, slots));

        let descriptor = ClassDescriptor {
            id,
            name: def.name.clone(),
            kind: def.kind,
            parent: parent_id,
            interfaces,
            ancestors,
            is_abstract: def.is_abstract,
            is_final: def.is_final,
            properties,
            methods,
            constants,
            statics,
            enum_cases: def.enum_cases.clone(),
            attributes: def.attributes.clone(),
            shape: shape_id,
            magic,
        };
        self.classes.push(descriptor);
        self.by_name.insert(lower.to_string(), id);
        self.pending.remove(lower);
        Ok(id)
    }

    // ==================== Queries ====================

    /// Flattened method lookup; names compare case-insensitively.
    pub fn find_method(&self, class: ClassId, name: &str) -> Option<&MethodEntry> {
        self.classes[class.0 as usize]
            .methods
            .get(&name.to_lowercase())
    }

    pub fn is_instance_of(&self, class: ClassId, target: ClassId) -> bool {
        if class == target {
            return true;
        }
        let desc = &self.classes[class.0 as usize];
        desc.ancestors.contains(&target) || desc.interfaces.contains(&target)
    }

    /// `instanceof` / catch-type matching against a class name. Unknown or
    /// still-pending names never match (an instance's ancestry is always
    /// finalized).
    pub fn is_instance_of_name(&self, class: ClassId, name: &str) -> bool {
        match self.lookup(name) {
            Some(target) => self.is_instance_of(class, target),
            None => false,
        }
    }

    /// Shape transition for a dynamic property write. Identical transitions
    /// share the derived shape, keeping inline caches monomorphic.
    pub fn transition(&mut self, from: ShapeId, prop: &str) -> (ShapeId, u16) {
        let key = (from, prop.to_string());
        if let Some(&to) = self.transitions.get(&key) {
            let offset = self.shapes[to.0 as usize]
                .offset_of(prop)
                .expect("transition target lost its property");
            return (to, offset);
        }
        let mut slots = self.shapes[from.0 as usize].slots.clone();
        let offset = slots.len() as u16;
        slots.push(prop.to_string());
        let to = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape::new(to, slots));
        self.transitions.insert(key, to);
        (to, offset)
    }

    // ==================== Builtin classes ====================

    /// Exception hierarchy and `stdClass`, built the same way user classes
    /// are: descriptors with small bytecode-backed methods.
    fn register_builtin_classes(&mut self) {
        let throwable = ClassDef::new("Throwable".to_string(), ClassKind::Interface);
        self.pending.insert("throwable".into(), throwable);

        for (name, parent) in [
            ("Exception", None),
            ("Error", None),
            ("ArithmeticError", Some("Error")),
            ("DivisionByZeroError", Some("ArithmeticError")),
            ("TypeError", Some("Error")),
            ("ArgumentCountError", Some("TypeError")),
            ("ValueError", Some("Error")),
            ("UndefinedMethodError", Some("Error")),
            ("UndefinedPropertyError", Some("Error")),
            ("UnhandledMatchError", Some("Error")),
            ("RuntimeException", Some("Exception")),
            ("LogicException", Some("Exception")),
            ("InvalidArgumentException", Some("LogicException")),
        ] {
            let def = match parent {
                None => throwable_base_def(name),
                Some(p) => {
                    let mut def = ClassDef::new(name.to_string(), ClassKind::Class);
                    def.parent = Some(p.to_string());
                    def
                }
            };
            self.pending.insert(name.to_lowercase(), def);
        }

        self.pending.insert(
            "stdclass".into(),
            ClassDef::new("stdClass".to_string(), ClassKind::Class),
        );

        for name in [
            "Throwable",
            "Exception",
            "Error",
            "ArithmeticError",
            "DivisionByZeroError",
            "TypeError",
            "ArgumentCountError",
            "ValueError",
            "UndefinedMethodError",
            "UndefinedPropertyError",
            "UnhandledMatchError",
            "RuntimeException",
            "LogicException",
            "InvalidArgumentException",
            "stdClass",
        ] {
            self.resolve(name)
                .expect("builtin class hierarchy must finalize");
        }
    }
}

/// Base definition shared by `Exception` and `Error`: the message/code/
/// line/trace properties and their accessors, with bodies emitted directly
/// as bytecode.
fn throwable_base_def(name: &str) -> ClassDef {
    let mut def = ClassDef::new(name.to_string(), ClassKind::Class);
    def.interfaces.push("Throwable".to_string());
    for (prop, default) in [
        ("message", Constant::Str(String::new())),
        ("code", Constant::Int(0)),
        ("line", Constant::Int(0)),
        ("trace", Constant::Null),
    ] {
        def.properties.push(PropertyDef {
            name: prop.to_string(),
            visibility: Visibility::Protected,
            is_static: false,
            readonly: false,
            type_hint: None,
            default: Some(default),
        });
    }
    def.methods.push(throwable_constructor(name));
    for (method, prop) in [
        ("getMessage", "message"),
        ("getCode", "code"),
        ("getLine", "line"),
        ("getTrace", "trace"),
    ] {
        def.methods.push(property_getter(name, method, prop));
    }
    def
}

/// `__construct($message = "", $code = 0)`
fn throwable_constructor(class: &str) -> MethodDef {
    let mut body = CompiledFunction::new(format!("{}::__construct", class));
    body.constants = vec![
        Constant::Str("message".to_string()),
        Constant::Str("code".to_string()),
    ];
    body.local_count = 3;
    body.local_names = vec!["this".into(), "message".into(), "code".into()];
    body.arg_count = 2;
    body.max_stack = 2;
    body.caches = vec![
        RefCell::new(InlineCache::new()),
        RefCell::new(InlineCache::new()),
    ];
    body.bytecode = vec![
        Instruction::with_a(Op::PushLocal, 0),
        Instruction::with_a(Op::PushLocal, 1),
        Instruction::with_ab(Op::SetProp, 0, 0),
        Instruction::new(Op::Pop),
        Instruction::with_a(Op::PushLocal, 0),
        Instruction::with_a(Op::PushLocal, 2),
        Instruction::with_ab(Op::SetProp, 1, 1),
        Instruction::new(Op::Pop),
        Instruction::new(Op::RetVoid),
    ];
    MethodDef {
        func: Arc::new(UserFunction {
            name: "__construct".to_string(),
            params: vec![
                PhpParam {
                    name: "message".to_string(),
                    type_hint: None,
                    default: Some(Constant::Str(String::new())),
                    by_ref: false,
                    variadic: false,
                    promoted: None,
                },
                PhpParam {
                    name: "code".to_string(),
                    type_hint: None,
                    default: Some(Constant::Int(0)),
                    by_ref: false,
                    variadic: false,
                    promoted: None,
                },
            ],
            return_type: None,
            captures: Vec::new(),
            attributes: Vec::new(),
            is_static: false,
            declaring_class: Some(class.to_string()),
            min_arity: 0,
            max_arity: 2,
            body,
        }),
        visibility: Visibility::Public,
        is_static: false,
        is_abstract: false,
        is_final: false,
    }
}

/// `getX()` accessor reading one property of `$this`.
fn property_getter(class: &str, method: &str, prop: &str) -> MethodDef {
    let mut body = CompiledFunction::new(format!("{}::{}", class, method));
    body.constants = vec![Constant::Str(prop.to_string())];
    body.local_count = 1;
    body.local_names = vec!["this".into()];
    body.max_stack = 1;
    body.caches = vec![RefCell::new(InlineCache::new())];
    body.bytecode = vec![
        Instruction::with_a(Op::PushLocal, 0),
        Instruction::with_ab(Op::GetProp, 0, 0),
        Instruction::new(Op::Ret),
    ];
    MethodDef {
        func: Arc::new(UserFunction {
            name: method.to_string(),
            params: Vec::new(),
            return_type: None,
            captures: Vec::new(),
            attributes: Vec::new(),
            is_static: false,
            declaring_class: Some(class.to_string()),
            min_arity: 0,
            max_arity: 0,
            body,
        }),
        visibility: Visibility::Public,
        is_static: false,
        is_abstract: false,
        is_final: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_hierarchy_is_finalized() {
        let registry = ClassRegistry::new();
        let div = registry.lookup("DivisionByZeroError").unwrap();
        assert!(registry.is_instance_of_name(div, "ArithmeticError"));
        assert!(registry.is_instance_of_name(div, "Error"));
        assert!(registry.is_instance_of_name(div, "Throwable"));
        assert!(!registry.is_instance_of_name(div, "Exception"));
    }

    #[test]
    fn case_insensitive_lookup() {
        let registry = ClassRegistry::new();
        assert!(registry.lookup("exception").is_some());
        assert!(registry.lookup("EXCEPTION").is_some());
    }

    #[test]
    fn deferred_finalization_resolves_forward_parent() {
        let mut registry = ClassRegistry::new();
        // Child declared before parent; nothing finalizes until resolve.
        let mut child = ClassDef::new("Child".into(), ClassKind::Class);
        child.parent = Some("Base".into());
        registry.declare(child).unwrap();
        assert!(registry.lookup("Child").is_none());
        registry.declare(ClassDef::new("Base".into(), ClassKind::Class)).unwrap();
        let id = registry.resolve("Child").unwrap();
        assert!(registry.is_instance_of_name(id, "Base"));
    }

    #[test]
    fn shape_transitions_are_shared() {
        let mut registry = ClassRegistry::new();
        let base = registry.resolve("stdClass").unwrap();
        let shape = registry.class(base).shape;
        let (s1, o1) = registry.transition(shape, "x");
        let (s2, o2) = registry.transition(shape, "x");
        assert_eq!(s1, s2);
        assert_eq!(o1, o2);
        let (s3, _) = registry.transition(s1, "y");
        assert_ne!(s1, s3);
        assert_eq!(registry.shape(s3).offset_of("x"), Some(o1));
    }

    #[test]
    fn exception_shape_has_message_slot() {
        let mut registry = ClassRegistry::new();
        let exc = registry.resolve("RuntimeException").unwrap();
        let shape = registry.class(exc).shape;
        assert_eq!(registry.shape(shape).offset_of("message"), Some(0));
        assert!(registry.find_method(exc, "getmessage").is_some());
    }
}
