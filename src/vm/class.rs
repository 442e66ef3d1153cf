//! Class descriptors and shapes.
//!
//! Compilation produces [`ClassDef`]s; the class-declaration instruction
//! registers them and [`super::registry`] finalizes them into immutable
//! [`ClassDescriptor`]s on first use. Each finalized class is stamped with a
//! shape describing its property layout; shapes drive the property inline
//! caches.

use crate::ast::{EnumBacking, TypeHint, Visibility};
use crate::vm::opcode::{Constant, UserFunction};
use std::collections::HashMap;
use std::sync::Arc;

/// Stable index of a finalized class in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Stable index of a property layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
    Trait,
    Enum(EnumBacking),
}

/// Property declaration carried by a [`ClassDef`].
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub visibility: Visibility,
    pub is_static: bool,
    pub readonly: bool,
    pub type_hint: Option<TypeHint>,
    pub default: Option<Constant>,
}

/// Method declaration carried by a [`ClassDef`].
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub func: Arc<UserFunction>,
    pub visibility: Visibility,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_final: bool,
}

/// A registered-but-not-finalized class, as emitted by the compiler.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub kind: ClassKind,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub traits: Vec<String>,
    pub is_abstract: bool,
    pub is_final: bool,
    pub constants: Vec<(String, Constant)>,
    pub properties: Vec<PropertyDef>,
    pub methods: Vec<MethodDef>,
    pub enum_cases: Vec<(String, Option<Constant>)>,
    pub attributes: Vec<String>,
}

impl ClassDef {
    pub fn new(name: String, kind: ClassKind) -> Self {
        Self {
            name,
            kind,
            parent: None,
            interfaces: Vec::new(),
            traits: Vec::new(),
            is_abstract: false,
            is_final: false,
            constants: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
            enum_cases: Vec::new(),
            attributes: Vec::new(),
        }
    }
}

/// An instance property in its finalized slot position.
#[derive(Debug, Clone)]
pub struct PropertySlot {
    pub name: String,
    pub offset: u16,
    pub visibility: Visibility,
    pub readonly: bool,
    pub type_hint: Option<TypeHint>,
    pub default: Constant,
    pub declared_in: ClassId,
}

/// A finalized method-table entry.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub func: Arc<UserFunction>,
    pub visibility: Visibility,
    pub is_static: bool,
    pub declared_in: ClassId,
}

/// Magic methods resolved once at finalization.
#[derive(Debug, Clone, Default)]
pub struct MagicMethods {
    pub construct: Option<Arc<UserFunction>>,
    pub destruct: Option<Arc<UserFunction>>,
    pub get: Option<Arc<UserFunction>>,
    pub set: Option<Arc<UserFunction>>,
    pub call: Option<Arc<UserFunction>>,
    pub call_static: Option<Arc<UserFunction>>,
    pub invoke: Option<Arc<UserFunction>>,
    pub to_string: Option<Arc<UserFunction>>,
    pub clone_: Option<Arc<UserFunction>>,
}

/// Mutable storage for one static property.
#[derive(Debug, Clone)]
pub struct StaticProp {
    pub default: Constant,
    /// Materialized lazily on first access.
    pub value: Option<crate::runtime::Value>,
    pub visibility: Visibility,
}

/// A finalized class. Immutable after finalization except for static
/// property storage.
#[derive(Debug)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: String,
    pub kind: ClassKind,
    pub parent: Option<ClassId>,
    /// All implemented interfaces, transitively.
    pub interfaces: Vec<ClassId>,
    /// Parent chain, nearest first.
    pub ancestors: Vec<ClassId>,
    pub is_abstract: bool,
    pub is_final: bool,
    /// Instance properties in slot order (inherited first).
    pub properties: Vec<PropertySlot>,
    /// Flattened method table keyed by lowercased name.
    pub methods: HashMap<String, MethodEntry>,
    pub constants: HashMap<String, Constant>,
    pub statics: HashMap<String, StaticProp>,
    pub enum_cases: Vec<(String, Option<Constant>)>,
    pub attributes: Vec<String>,
    pub shape: ShapeId,
    pub magic: MagicMethods,
}

impl ClassDescriptor {
    pub fn find_property(&self, name: &str) -> Option<&PropertySlot> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// A property layout: slot names in declaration order plus the offset map.
/// Shapes are immutable once created; adding a dynamic property transitions
/// the instance to a derived shape through the registry.
#[derive(Debug, Clone)]
pub struct Shape {
    pub id: ShapeId,
    pub slots: Vec<String>,
    offsets: HashMap<String, u16>,
}

impl Shape {
    pub fn new(id: ShapeId, slots: Vec<String>) -> Self {
        let offsets = slots
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u16))
            .collect();
        Self { id, slots, offsets }
    }

    pub fn offset_of(&self, name: &str) -> Option<u16> {
        self.offsets.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
