//! Synchronous trial-deletion cycle collector.
//!
//! Composite boxes whose refcount drops to a nonzero value are buffered as
//! purple root candidates. A collection runs the classic three phases over
//! the candidate subgraph using per-box trial counters (the real counts are
//! never disturbed):
//!
//! 1. mark gray — simulate removing each candidate's contribution by
//!    decrementing a trial counter on every child edge;
//! 2. scan — boxes whose trial count stayed positive have external
//!    references and are recolored black (restoring trial counts through
//!    their subtree); the rest turn white;
//! 3. collect white — the white set is garbage.
//!
//! The VM runs `__destruct` on white objects between phases 3 and the final
//! sweep; a destructor may resurrect boxes, which the sweep detects and
//! re-traces instead of freeing.

use super::{payload_handles, Color, Handle, Heap};
use std::collections::{HashMap, HashSet};

/// Collector counters. `gc_debug` on the heap makes collections narrate
/// themselves on stderr.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub collections: u64,
    pub boxes_freed: u64,
    pub cycle_boxes_freed: u64,
    pub destructors_run: u64,
}

/// The white set of one collection, with generations captured so destructor
/// side effects (which may free members early) cannot confuse the sweep.
#[derive(Debug)]
pub struct CycleWhites {
    members: Vec<(Handle, u32)>,
}

impl CycleWhites {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, u32)> + '_ {
        self.members.iter().copied()
    }
}

impl Heap {
    /// Phase 1-3: identify garbage cycles among the buffered root
    /// candidates. Returns the white set; the caller runs destructors on
    /// white objects, then calls [`Heap::sweep_cycle`].
    pub fn collect_cycles(&mut self) -> CycleWhites {
        self.stats.collections += 1;
        self.bump_epoch();

        let roots = self.take_roots();
        if self.gc_debug {
            eprintln!(
                "[gc] collection #{}: {} root candidates, {} live boxes",
                self.stats.collections,
                roots.len(),
                self.live_count()
            );
        }

        let mut candidates: Vec<Handle> = Vec::new();
        for (idx, generation) in roots {
            let h = Handle(idx);
            if !self.is_live_gen(h, generation) {
                continue;
            }
            if self.color(h) == Color::Purple && self.strong_count(h) > 0 {
                candidates.push(h);
            } else {
                self.set_buffered(h, false);
            }
        }

        for &h in &candidates {
            if self.color(h) == Color::Purple {
                self.mark_gray(h);
            }
        }
        for &h in &candidates {
            self.scan(h);
        }

        let mut whites = Vec::new();
        for &h in &candidates {
            self.set_buffered(h, false);
            self.collect_white(h, &mut whites);
        }

        if self.gc_debug && !whites.is_empty() {
            eprintln!("[gc] {} boxes in garbage cycles", whites.len());
        }

        let members = whites
            .into_iter()
            .map(|h| (h, self.generation(h)))
            .collect();
        CycleWhites { members }
    }

    fn mark_gray(&mut self, start: Handle) {
        let mut stack = vec![start];
        self.touch_trial(start);
        while let Some(h) = stack.pop() {
            if self.color(h) == Color::Gray {
                continue;
            }
            self.set_color(h, Color::Gray);
            for c in self.children_of(h) {
                if !self.is_live(c) {
                    continue;
                }
                self.touch_trial(c);
                self.add_trial(c, -1);
                if self.color(c) != Color::Gray {
                    stack.push(c);
                }
            }
        }
    }

    fn scan(&mut self, start: Handle) {
        let mut stack = vec![start];
        while let Some(h) = stack.pop() {
            if self.color(h) != Color::Gray {
                continue;
            }
            if self.trial(h) > 0 {
                self.scan_black(h);
            } else {
                self.set_color(h, Color::White);
                for c in self.children_of(h) {
                    if self.is_live(c) && self.color(c) == Color::Gray {
                        stack.push(c);
                    }
                }
            }
        }
    }

    /// Restore trial counts below a box proven externally reachable.
    fn scan_black(&mut self, start: Handle) {
        self.set_color(start, Color::Black);
        let mut stack = vec![start];
        while let Some(h) = stack.pop() {
            for c in self.children_of(h) {
                if !self.is_live(c) {
                    continue;
                }
                self.touch_trial(c);
                self.add_trial(c, 1);
                if self.color(c) != Color::Black {
                    self.set_color(c, Color::Black);
                    stack.push(c);
                }
            }
        }
    }

    fn collect_white(&mut self, start: Handle, whites: &mut Vec<Handle>) {
        let mut stack = vec![start];
        while let Some(h) = stack.pop() {
            if !self.is_live(h) {
                continue;
            }
            if self.color(h) == Color::White && !self.buffered(h) {
                // Recolor so a shared member is collected once.
                self.set_color(h, Color::Black);
                whites.push(h);
                for c in self.children_of(h) {
                    stack.push(c);
                }
            }
        }
    }

    /// Final sweep: free the white set, minus anything a destructor
    /// resurrected. Resurrected boxes (strong count above their in-set
    /// reference count) are kept together with everything they reach inside
    /// the set, and are re-buffered as root candidates.
    pub fn sweep_cycle(&mut self, whites: CycleWhites) -> usize {
        let survivors: Vec<Handle> = whites
            .members
            .iter()
            .filter(|&&(h, generation)| self.is_live_gen(h, generation))
            .map(|&(h, _)| h)
            .collect();
        if survivors.is_empty() {
            return 0;
        }

        let in_set: HashSet<Handle> = survivors.iter().copied().collect();
        let mut internal: HashMap<Handle, u32> = HashMap::new();
        for &h in &survivors {
            for c in self.children_of(h) {
                if in_set.contains(&c) {
                    *internal.entry(c).or_insert(0) += 1;
                }
            }
        }

        // Resurrection: any member with more strong references than in-set
        // edges gained an external reference during destruction.
        let mut keep: HashSet<Handle> = HashSet::new();
        let mut stack: Vec<Handle> = survivors
            .iter()
            .copied()
            .filter(|&h| self.strong_count(h) > internal.get(&h).copied().unwrap_or(0))
            .collect();
        while let Some(h) = stack.pop() {
            if !keep.insert(h) {
                continue;
            }
            for c in self.children_of(h) {
                if in_set.contains(&c) && !keep.contains(&c) {
                    stack.push(c);
                }
            }
        }
        for &h in &keep {
            self.set_color(h, Color::Black);
            // Back under normal refcounting; candidate again later.
        }

        let mut freed = 0usize;
        let dying: Vec<Handle> = survivors
            .iter()
            .copied()
            .filter(|h| !keep.contains(h))
            .collect();
        let dying_set: HashSet<Handle> = dying.iter().copied().collect();
        for &h in &dying {
            let Some(payload) = self.free_cycle_member(h) else {
                continue;
            };
            freed += 1;
            let mut children = Vec::new();
            payload_handles(&payload, &mut children);
            for c in children {
                if !dying_set.contains(&c) {
                    self.release(c);
                }
            }
        }

        if self.gc_debug {
            eprintln!(
                "[gc] swept {} cycle boxes ({} resurrected)",
                freed,
                keep.len()
            );
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{PhpArray, Value};

    #[test]
    fn two_array_cycle_is_collected() {
        let mut heap = Heap::new();
        let baseline = heap.live_count();

        let a = heap.alloc_array(PhpArray::new());
        let b = heap.alloc_array(PhpArray::new());
        heap.retain(b);
        heap.array_mut(a).push(Value::Array(b));
        heap.retain(a);
        heap.array_mut(b).push(Value::Array(a));

        // Drop the external references; the cycle keeps both alive.
        heap.release(a);
        heap.release(b);
        assert_eq!(heap.live_count(), baseline + 2);

        let whites = heap.collect_cycles();
        assert_eq!(whites.len(), 2);
        let freed = heap.sweep_cycle(whites);
        assert_eq!(freed, 2);
        assert_eq!(heap.live_count(), baseline);
    }

    #[test]
    fn externally_referenced_cycle_survives() {
        let mut heap = Heap::new();

        let a = heap.alloc_array(PhpArray::new());
        let b = heap.alloc_array(PhpArray::new());
        heap.retain(b);
        heap.array_mut(a).push(Value::Array(b));
        heap.retain(a);
        heap.array_mut(b).push(Value::Array(a));

        // Keep our external reference to `a`, drop only `b`'s.
        heap.release(b);
        let whites = heap.collect_cycles();
        assert!(whites.is_empty());
        assert!(heap.is_live(a));
        assert!(heap.is_live(b));

        heap.release(a);
        let whites = heap.collect_cycles();
        let freed = heap.sweep_cycle(whites);
        assert_eq!(freed, 2);
    }

    #[test]
    fn self_cycle_is_collected() {
        let mut heap = Heap::new();
        let baseline = heap.live_count();
        let a = heap.alloc_array(PhpArray::new());
        heap.retain(a);
        heap.array_mut(a).push(Value::Array(a));
        heap.release(a);
        assert_eq!(heap.live_count(), baseline + 1);

        let whites = heap.collect_cycles();
        let freed = heap.sweep_cycle(whites);
        assert_eq!(freed, 1);
        assert_eq!(heap.live_count(), baseline);
    }

    #[test]
    fn acyclic_garbage_never_reaches_the_collector() {
        let mut heap = Heap::new();
        let baseline = heap.live_count();
        let a = heap.alloc_array(PhpArray::new());
        let b = heap.alloc_array(PhpArray::new());
        heap.array_mut(a).push(Value::Array(b));
        heap.release(a);
        assert_eq!(heap.live_count(), baseline);
        let whites = heap.collect_cycles();
        assert!(whites.is_empty());
    }
}
