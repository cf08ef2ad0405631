use std::time::Instant;

use super::{gc_trace, GarbageCollector, Roots, TraceMode, GC_PROMOTION_AGE};
use crate::objects::object::{Generation, ObjRef};
use crate::objects::object_manager::ObjectManager;

impl GarbageCollector {
    /// Minor collection: trace young objects reachable from the roots, the
    /// remembered set and every old object, then sweep the young generation.
    pub fn collect_young(&mut self, heap: &mut ObjectManager, roots: &Roots) {
        if self.sweep.is_some() {
            self.finish_sweep(heap);
        }
        self.pending_young = false;
        let started = Instant::now();
        let before = heap.young_bytes();
        self.report(format_args!(
            "-- gc begin (minor) young={} old={} remembered={}",
            before,
            heap.old_bytes(),
            self.remembered.len()
        ));

        self.prepare_collection();
        self.mark_roots(heap, roots);
        for &owner in &self.remembered {
            heap.object(owner).trace(&mut self.tracer);
        }
        for &owner in heap.old.iter() {
            if !heap.header(owner).remembered {
                heap.object(owner).trace(&mut self.tracer);
            }
        }
        self.trace_references(heap, TraceMode::Young);
        for env in self.visited_envs.drain(..) {
            heap.env_mut(env).marked = false;
        }

        let (freed, promoted) = self.sweep_young(heap, false);
        self.prune_remembered(heap);
        self.update_young_next(heap);
        if heap.total_bytes() > self.full_next {
            self.pending_full = true;
        }

        self.stats.minor_cycles += 1;
        self.stats.promoted += promoted as u64;
        let next = self.young_next;
        self.record_cycle(before, freed, heap.young_bytes(), next);
        self.report(format_args!(
            "-- gc end (minor) freed={} promoted={} young={} old={} next={} in {:?}",
            freed,
            promoted,
            heap.young_bytes(),
            heap.old_bytes(),
            next,
            started.elapsed()
        ));
    }

    /// Free unmarked young objects and age the rest, promoting those that have
    /// survived `GC_PROMOTION_AGE` collections. During a major collection
    /// promoted objects keep their mark so the old sweep that follows retains them.
    pub(crate) fn sweep_young(&mut self, heap: &mut ObjectManager, full: bool) -> (usize, usize) {
        let young = std::mem::take(&mut heap.young);
        let mut survivors = Vec::with_capacity(young.len());
        let mut promoted = Vec::new();
        let mut freed = 0;
        for object in young {
            let header = heap.header_mut(object);
            if !header.marked {
                let size = heap.free_object(object);
                heap.young_bytes -= size;
                freed += size;
                continue;
            }
            header.age = header.age.saturating_add(1);
            if header.age < GC_PROMOTION_AGE {
                header.marked = false;
                survivors.push(object);
                continue;
            }
            header.generation = Generation::Old;
            header.age = 0;
            header.remembered = false;
            if !full {
                header.marked = false;
            }
            let size = header.size;
            heap.young_bytes -= size;
            heap.old_bytes += size;
            heap.old.push(object);
            promoted.push(object);
            gc_trace!("promote {:?} bytes={}", object, size);
        }
        heap.young = survivors;
        if !full {
            for &object in &promoted {
                if self.has_young_refs(heap, object) {
                    self.remember(heap, object);
                }
            }
        }
        (freed, promoted.len())
    }

    /// True when `object` directly references a young object, or closes over
    /// an environment whose binding maps are young.
    pub(crate) fn has_young_refs(&mut self, heap: &ObjectManager, object: ObjRef) -> bool {
        self.scratch.clear();
        heap.object(object).trace(&mut self.scratch);
        let direct = self.scratch.objects.iter().any(|child| heap.header(*child).is_young());
        direct
            || self.scratch.envs.iter().any(|env| {
                let record = heap.env(*env);
                heap.header(record.values).is_young() || heap.header(record.consts).is_young()
            })
    }

    /// Drop remembered entries that no longer point into the young generation.
    pub(crate) fn prune_remembered(&mut self, heap: &mut ObjectManager) {
        let remembered = std::mem::take(&mut self.remembered);
        for owner in remembered {
            if !heap.is_live(owner) {
                continue;
            }
            let keep = !heap.header(owner).is_young() && self.has_young_refs(heap, owner);
            if keep {
                self.remembered.push(owner);
            } else {
                heap.header_mut(owner).remembered = false;
            }
        }
    }
}
