//! Reference-counted heap boxes.
//!
//! Every composite value lives in a box carrying a strong count, a GC color,
//! and a kind discriminant the collector uses to traverse children. Boxes
//! are addressed by [`Handle`]s into a slab; slots carry generation counters
//! so the roots buffer survives slot reuse.
//!
//! Releasing the last strong reference frees a box immediately unless it
//! needs a destructor, in which case it is parked on the finalize queue for
//! the VM to run `__destruct` before the children are released. Composite
//! boxes whose count drops to a nonzero value are colored purple and
//! buffered as possible cycle roots; `gc.rs` holds the trial-deletion
//! collector that reclaims them.

pub mod gc;

pub use gc::{CycleWhites, GcStats};

use crate::runtime::{PhpArray, PhpClosure, PhpObject, PhpResource, PhpString, Value};
use std::collections::HashMap;

/// Default roots-buffer size that triggers a cycle collection.
pub const DEFAULT_GC_THRESHOLD: usize = 10_000;

/// Index of a heap box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u32);

impl Handle {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// GC color of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// In use, or proven reachable during a scan.
    Black,
    /// Possible cycle root.
    Purple,
    /// Visited by the trial-deletion pass.
    Gray,
    /// Proven garbage.
    White,
}

/// Kind discriminant; tells the collector how to traverse children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Str,
    Array,
    Object,
    Closure,
    Ref,
    Resource,
}

impl BoxKind {
    /// Acyclic kinds never participate in cycle collection.
    pub fn is_acyclic(self) -> bool {
        matches!(self, BoxKind::Str | BoxKind::Resource)
    }
}

/// Box payload.
#[derive(Debug)]
pub enum Payload {
    Str(PhpString),
    Array(PhpArray),
    Object(PhpObject),
    Closure(PhpClosure),
    /// Reference cell for by-reference bindings.
    Ref(Value),
    Resource(PhpResource),
}

#[derive(Debug)]
struct BoxEntry {
    strong: u32,
    color: Color,
    buffered: bool,
    /// The box needs `__destruct` before it may be freed.
    finalizable: bool,
    /// `__destruct` already ran; it fires exactly once.
    finalized: bool,
    kind: BoxKind,
    /// Trial refcount used by the cycle collector; valid only while
    /// `trial_epoch` matches the heap's current collection epoch.
    trial: i64,
    trial_epoch: u64,
    payload: Option<Payload>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<BoxEntry>,
}

/// The reference-counted heap.
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Possible cycle roots: (slot index, generation at buffering time).
    roots: Vec<(u32, u32)>,
    /// Content-keyed pool for short strings.
    interned: HashMap<Vec<u8>, Handle>,
    /// Zero-count boxes waiting for the VM to run their destructor.
    finalize_queue: Vec<Handle>,
    pub gc_threshold: usize,
    pub gc_debug: bool,
    pub stats: GcStats,
    epoch: u64,
    live: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            roots: Vec::new(),
            interned: HashMap::new(),
            finalize_queue: Vec::new(),
            gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_debug: false,
            stats: GcStats::default(),
            epoch: 0,
            live: 0,
        }
    }

    /// Number of live boxes, interned pool included.
    pub fn live_count(&self) -> usize {
        self.live
    }

    // ==================== Allocation ====================

    fn alloc(&mut self, kind: BoxKind, payload: Payload, finalizable: bool) -> Handle {
        let entry = BoxEntry {
            strong: 1,
            color: Color::Black,
            buffered: false,
            finalizable,
            finalized: false,
            kind,
            trial: 0,
            trial_epoch: 0,
            payload: Some(payload),
        };
        self.live += 1;
        if let Some(idx) = self.free_list.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.entry = Some(entry);
            Handle(idx)
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            Handle((self.slots.len() - 1) as u32)
        }
    }

    /// Allocate a string box, deduplicating short strings through the
    /// content-keyed pool. Interning changes identity speed only.
    pub fn alloc_string(&mut self, s: PhpString) -> Handle {
        if s.is_interned_size() {
            if let Some(&h) = self.interned.get(s.as_bytes()) {
                self.retain(h);
                return h;
            }
            let key = s.as_bytes().to_vec();
            let h = self.alloc(BoxKind::Str, Payload::Str(s), false);
            // The pool holds its own strong reference.
            self.retain(h);
            self.interned.insert(key, h);
            return h;
        }
        self.alloc(BoxKind::Str, Payload::Str(s), false)
    }

    pub fn intern(&mut self, s: &str) -> Handle {
        self.alloc_string(PhpString::from(s))
    }

    pub fn alloc_array(&mut self, a: PhpArray) -> Handle {
        self.alloc(BoxKind::Array, Payload::Array(a), false)
    }

    /// Allocate an object box. The payload is built after the slot is
    /// reserved so the instance can carry its own (weak) handle.
    pub fn alloc_object<F>(&mut self, finalizable: bool, build: F) -> Handle
    where
        F: FnOnce(Handle) -> PhpObject,
    {
        let h = self.alloc(
            BoxKind::Object,
            Payload::Object(PhpObject::new(
                crate::vm::class::ClassId(0),
                crate::vm::class::ShapeId(0),
                Vec::new(),
                Handle(u32::MAX),
            )),
            finalizable,
        );
        let obj = build(h);
        if let Some(entry) = self.entry_mut(h) {
            entry.payload = Some(Payload::Object(obj));
        }
        h
    }

    pub fn alloc_closure(&mut self, c: PhpClosure) -> Handle {
        self.alloc(BoxKind::Closure, Payload::Closure(c), false)
    }

    pub fn alloc_ref(&mut self, v: Value) -> Handle {
        self.alloc(BoxKind::Ref, Payload::Ref(v), false)
    }

    pub fn alloc_resource(&mut self, r: PhpResource) -> Handle {
        self.alloc(BoxKind::Resource, Payload::Resource(r), false)
    }

    // ==================== Accessors ====================

    fn entry(&self, h: Handle) -> Option<&BoxEntry> {
        self.slots.get(h.0 as usize).and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(&mut self, h: Handle) -> Option<&mut BoxEntry> {
        self.slots.get_mut(h.0 as usize).and_then(|s| s.entry.as_mut())
    }

    fn expect(&self, h: Handle) -> &BoxEntry {
        self.entry(h).unwrap_or_else(|| panic!("use of freed heap box #{}", h.0))
    }

    fn expect_mut(&mut self, h: Handle) -> &mut BoxEntry {
        self.entry_mut(h)
            .unwrap_or_else(|| panic!("use of freed heap box #{}", h.0))
    }

    pub fn is_live(&self, h: Handle) -> bool {
        self.entry(h).is_some()
    }

    pub(crate) fn is_live_gen(&self, h: Handle, generation: u32) -> bool {
        match self.slots.get(h.0 as usize) {
            Some(slot) => slot.entry.is_some() && slot.generation == generation,
            None => false,
        }
    }

    pub(crate) fn generation(&self, h: Handle) -> u32 {
        self.slots[h.0 as usize].generation
    }

    pub fn kind(&self, h: Handle) -> BoxKind {
        self.expect(h).kind
    }

    pub fn strong_count(&self, h: Handle) -> u32 {
        self.expect(h).strong
    }

    pub fn string(&self, h: Handle) -> &PhpString {
        match self.expect(h).payload.as_ref() {
            Some(Payload::Str(s)) => s,
            _ => panic!("heap box #{} is not a string", h.0),
        }
    }

    pub fn array(&self, h: Handle) -> &PhpArray {
        match self.expect(h).payload.as_ref() {
            Some(Payload::Array(a)) => a,
            _ => panic!("heap box #{} is not an array", h.0),
        }
    }

    pub fn array_mut(&mut self, h: Handle) -> &mut PhpArray {
        match self.expect_mut(h).payload.as_mut() {
            Some(Payload::Array(a)) => a,
            _ => panic!("heap box #{} is not an array", h.0),
        }
    }

    pub fn object(&self, h: Handle) -> &PhpObject {
        match self.expect(h).payload.as_ref() {
            Some(Payload::Object(o)) => o,
            _ => panic!("heap box #{} is not an object", h.0),
        }
    }

    pub fn object_mut(&mut self, h: Handle) -> &mut PhpObject {
        match self.expect_mut(h).payload.as_mut() {
            Some(Payload::Object(o)) => o,
            _ => panic!("heap box #{} is not an object", h.0),
        }
    }

    pub fn closure(&self, h: Handle) -> &PhpClosure {
        match self.expect(h).payload.as_ref() {
            Some(Payload::Closure(c)) => c,
            _ => panic!("heap box #{} is not a closure", h.0),
        }
    }

    pub fn resource(&self, h: Handle) -> &PhpResource {
        match self.expect(h).payload.as_ref() {
            Some(Payload::Resource(r)) => r,
            _ => panic!("heap box #{} is not a resource", h.0),
        }
    }

    pub fn ref_get(&self, h: Handle) -> &Value {
        match self.expect(h).payload.as_ref() {
            Some(Payload::Ref(v)) => v,
            _ => panic!("heap box #{} is not a reference cell", h.0),
        }
    }

    /// Replace the value inside a reference cell, returning the old value
    /// for release.
    pub fn ref_replace(&mut self, h: Handle, v: Value) -> Value {
        match self.expect_mut(h).payload.as_mut() {
            Some(Payload::Ref(slot)) => std::mem::replace(slot, v),
            _ => panic!("heap box #{} is not a reference cell", h.0),
        }
    }

    // ==================== Retain / release ====================

    pub fn retain(&mut self, h: Handle) {
        let entry = self.expect_mut(h);
        entry.strong += 1;
        entry.color = Color::Black;
    }

    pub fn retain_value(&mut self, v: &Value) {
        if let Some(h) = v.handle() {
            self.retain(h);
        }
    }

    /// Copy a value, taking a new strong reference on its box.
    pub fn clone_value(&mut self, v: &Value) -> Value {
        self.retain_value(v);
        v.clone()
    }

    /// Drop one strong reference. A count reaching zero frees the box at
    /// once, except boxes that need a destructor, which park on the
    /// finalize queue until the VM runs `__destruct`. A composite count
    /// landing on a nonzero value buffers the box as a possible cycle root.
    pub fn release(&mut self, h: Handle) {
        let mut work = vec![h];
        while let Some(h) = work.pop() {
            let Some(entry) = self.entry_mut(h) else {
                continue;
            };
            if entry.strong == 0 {
                // Parked on the finalize queue; nothing further to drop.
                continue;
            }
            entry.strong -= 1;
            let strong = entry.strong;
            let kind = entry.kind;
            let needs_destruct = entry.finalizable && !entry.finalized;
            if strong == 0 {
                if needs_destruct {
                    entry.color = Color::Black;
                    self.finalize_queue.push(h);
                } else {
                    self.free_now(h, &mut work);
                }
            } else if !kind.is_acyclic() {
                self.possible_root(h);
            }
        }
    }

    pub fn release_value(&mut self, v: &Value) {
        if let Some(h) = v.handle() {
            self.release(h);
        }
    }

    /// Free a zero-count box: take the payload, recycle the slot, and queue
    /// the children for release.
    fn free_now(&mut self, h: Handle, work: &mut Vec<Handle>) {
        let slot = &mut self.slots[h.0 as usize];
        let entry = slot.entry.take().expect("double free of heap box");
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(h.0);
        self.live -= 1;
        self.stats.boxes_freed += 1;
        if let Some(payload) = entry.payload {
            payload_handles(&payload, work);
        }
    }

    fn possible_root(&mut self, h: Handle) {
        let generation = self.slots[h.0 as usize].generation;
        let entry = self.expect_mut(h);
        entry.color = Color::Purple;
        if !entry.buffered {
            entry.buffered = true;
            self.roots.push((h.0, generation));
        }
    }

    /// True when the roots buffer has outgrown the collection threshold.
    pub fn needs_collection(&self) -> bool {
        self.roots.len() > self.gc_threshold
    }

    pub(crate) fn roots_len(&self) -> usize {
        self.roots.len()
    }

    // ==================== Finalization ====================

    pub fn has_pending_finalizers(&self) -> bool {
        !self.finalize_queue.is_empty()
    }

    pub fn take_finalize_queue(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.finalize_queue)
    }

    /// Record that `__destruct` ran for this box (it fires exactly once).
    pub fn mark_finalized(&mut self, h: Handle) {
        if let Some(entry) = self.entry_mut(h) {
            entry.finalized = true;
        }
    }

    pub(crate) fn is_pending_destruct(&self, h: Handle) -> bool {
        match self.entry(h) {
            Some(e) => e.finalizable && !e.finalized,
            None => false,
        }
    }

    /// Free a box whose destructor has run, unless the destructor
    /// resurrected it with a new strong reference.
    pub fn free_finalized(&mut self, h: Handle) {
        let Some(entry) = self.entry(h) else { return };
        if entry.strong > 0 {
            // Resurrected; it lives on as an ordinary box.
            return;
        }
        let mut work = Vec::new();
        self.free_now(h, &mut work);
        for child in work {
            self.release(child);
        }
    }

    // ==================== Traversal ====================

    /// Child handles of a box, for the collector and for release cascades.
    pub fn children_of(&self, h: Handle) -> Vec<Handle> {
        let mut out = Vec::new();
        if let Some(entry) = self.entry(h) {
            if let Some(payload) = entry.payload.as_ref() {
                payload_handles(payload, &mut out);
            }
        }
        out
    }

    // Internal accessors for the collector.

    pub(crate) fn color(&self, h: Handle) -> Color {
        self.expect(h).color
    }

    pub(crate) fn set_color(&mut self, h: Handle, c: Color) {
        self.expect_mut(h).color = c;
    }

    pub(crate) fn buffered(&self, h: Handle) -> bool {
        self.expect(h).buffered
    }

    pub(crate) fn set_buffered(&mut self, h: Handle, b: bool) {
        self.expect_mut(h).buffered = b;
    }

    pub(crate) fn take_roots(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.roots)
    }

    pub(crate) fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Initialize the trial count from the strong count on first touch in
    /// the current collection epoch.
    pub(crate) fn touch_trial(&mut self, h: Handle) {
        let epoch = self.epoch;
        let entry = self.expect_mut(h);
        if entry.trial_epoch != epoch {
            entry.trial = entry.strong as i64;
            entry.trial_epoch = epoch;
        }
    }

    pub(crate) fn trial(&self, h: Handle) -> i64 {
        self.expect(h).trial
    }

    pub(crate) fn add_trial(&mut self, h: Handle, delta: i64) {
        self.expect_mut(h).trial += delta;
    }

    pub(crate) fn free_cycle_member(&mut self, h: Handle) -> Option<Payload> {
        let slot = &mut self.slots[h.0 as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(h.0);
        self.live -= 1;
        self.stats.boxes_freed += 1;
        self.stats.cycle_boxes_freed += 1;
        entry.payload
    }
}

/// Collect the heap handles a value holds.
pub fn value_handles(v: &Value, out: &mut Vec<Handle>) {
    if let Some(h) = v.handle() {
        out.push(h);
    }
}

/// Collect the strong child handles of a payload. The object's own weak
/// `self_handle` is deliberately excluded.
pub fn payload_handles(payload: &Payload, out: &mut Vec<Handle>) {
    match payload {
        Payload::Str(_) | Payload::Resource(_) => {}
        Payload::Array(a) => {
            for (_, v) in a.entries() {
                value_handles(v, out);
            }
        }
        Payload::Object(o) => {
            for v in &o.slots {
                value_handles(v, out);
            }
        }
        Payload::Closure(c) => {
            for v in &c.captured {
                value_handles(v, out);
            }
            if let Some(this) = c.this {
                out.push(this);
            }
        }
        Payload::Ref(v) => value_handles(v, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_interning_dedupes_short_strings() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        assert_eq!(heap.strong_count(a), 3); // pool + two callers
    }

    #[test]
    fn long_strings_are_not_interned() {
        let mut heap = Heap::new();
        let s = "x".repeat(64);
        let a = heap.alloc_string(PhpString::from(s.as_str()));
        let b = heap.alloc_string(PhpString::from(s.as_str()));
        assert_ne!(a, b);
    }

    #[test]
    fn release_frees_acyclic_graph() {
        let mut heap = Heap::new();
        let baseline = heap.live_count();
        let s = heap.alloc_string(PhpString::from("a much longer string, not interned"));
        let mut arr = PhpArray::new();
        arr.push(Value::String(s));
        let a = heap.alloc_array(arr);
        assert_eq!(heap.live_count(), baseline + 2);
        heap.release(a);
        assert_eq!(heap.live_count(), baseline);
    }

    #[test]
    fn decrement_to_nonzero_buffers_composite_roots() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(PhpArray::new());
        heap.retain(a);
        assert_eq!(heap.roots_len(), 0);
        heap.release(a);
        assert_eq!(heap.roots_len(), 1);
        assert_eq!(heap.color(a), Color::Purple);
        heap.release(a);
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(PhpArray::new());
        let gen = heap.generation(a);
        heap.release(a);
        let b = heap.alloc_array(PhpArray::new());
        assert_eq!(a, b); // slot reused
        assert_eq!(heap.generation(b), gen.wrapping_add(1));
    }
}
