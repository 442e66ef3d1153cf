//! Per-call-site inline caches for property and method dispatch.
//!
//! Every `get_prop`, `set_prop` and `call_method` site owns a cache of up
//! to four (shape, target) entries. A receiver whose shape matches an entry
//! skips the class-table walk entirely. Once all four slots are taken by
//! distinct shapes the site goes megamorphic and always resolves through
//! the registry. Entries are never invalidated: the class table is
//! write-once, so a cached resolution stays correct for the process
//! lifetime.

use crate::vm::class::{ClassId, ShapeId};
use crate::vm::opcode::UserFunction;
use std::sync::Arc;

/// Entries per cache before a site goes megamorphic.
pub const IC_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

/// What a cache entry resolves to.
#[derive(Debug, Clone)]
pub enum CacheTarget {
    /// Property slot offset within the shape's layout.
    Slot(u16),
    /// Resolved method and its declaring class.
    Method(Arc<UserFunction>, ClassId),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub shape: ShapeId,
    pub target: CacheTarget,
}

#[derive(Debug, Clone)]
pub struct InlineCache {
    pub state: IcState,
    entries: [Option<CacheEntry>; IC_CAPACITY],
    pub hits: u32,
    pub misses: u32,
}

impl Default for InlineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineCache {
    pub fn new() -> Self {
        Self {
            state: IcState::Uninitialized,
            entries: [None, None, None, None],
            hits: 0,
            misses: 0,
        }
    }

    /// Look up the cached target for a shape.
    #[inline]
    pub fn lookup(&mut self, shape: ShapeId) -> Option<CacheTarget> {
        for entry in self.entries.iter().flatten() {
            if entry.shape == shape {
                self.hits += 1;
                return Some(entry.target.clone());
            }
        }
        self.misses += 1;
        None
    }

    /// Install a resolution if capacity permits, else go megamorphic.
    pub fn install(&mut self, shape: ShapeId, target: CacheTarget) {
        if self.state == IcState::Megamorphic {
            return;
        }
        for entry in self.entries.iter_mut() {
            match entry {
                Some(e) if e.shape == shape => {
                    e.target = target;
                    return;
                }
                None => {
                    *entry = Some(CacheEntry { shape, target });
                    self.state = match self.state {
                        IcState::Uninitialized => IcState::Monomorphic,
                        _ => IcState::Polymorphic,
                    };
                    return;
                }
                Some(_) => {}
            }
        }
        self.state = IcState::Megamorphic;
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_to_megamorphic_after_capacity() {
        let mut ic = InlineCache::new();
        for i in 0..IC_CAPACITY as u32 {
            ic.install(ShapeId(i), CacheTarget::Slot(i as u16));
        }
        assert_eq!(ic.state, IcState::Polymorphic);
        ic.install(ShapeId(99), CacheTarget::Slot(0));
        assert_eq!(ic.state, IcState::Megamorphic);
        // Previously installed shapes still hit.
        assert!(matches!(ic.lookup(ShapeId(0)), Some(CacheTarget::Slot(0))));
        assert!(ic.lookup(ShapeId(99)).is_none());
    }

    #[test]
    fn monomorphic_after_first_install() {
        let mut ic = InlineCache::new();
        assert!(ic.lookup(ShapeId(7)).is_none());
        ic.install(ShapeId(7), CacheTarget::Slot(3));
        assert_eq!(ic.state, IcState::Monomorphic);
        assert!(matches!(ic.lookup(ShapeId(7)), Some(CacheTarget::Slot(3))));
    }
}
