use std::time::Instant;

use super::{gc_trace, GarbageCollector};
use crate::env::{Env, EnvRef};
use crate::objects::object::ObjRef;
use crate::objects::object_manager::ObjectManager;

/// Old objects and envs detached from the heap at the end of a major mark,
/// walked a batch at a time. Survivors go back to the heap's lists; anything
/// allocated meanwhile was never in these lists and cannot be freed by them.
pub struct SweepState {
    old: Vec<ObjRef>,
    old_cursor: usize,
    envs: Vec<EnvRef>,
    env_cursor: usize,
    before: usize,
    freed: usize,
    started: Instant,
}

impl SweepState {
    pub fn new(old: Vec<ObjRef>, envs: Vec<EnvRef>, before: usize, freed: usize, started: Instant) -> Self {
        SweepState {
            old,
            old_cursor: 0,
            envs,
            env_cursor: 0,
            before,
            freed,
            started,
        }
    }

    fn is_done(&self) -> bool {
        self.old_cursor >= self.old.len() && self.env_cursor >= self.envs.len()
    }
}

impl GarbageCollector {
    /// Examine up to `budget` entries. Returns true once both lists are exhausted.
    pub fn sweep_step(&mut self, heap: &mut ObjectManager, budget: usize) -> bool {
        let Some(state) = self.sweep.as_mut() else {
            return true;
        };
        let mut budget = budget;
        while budget > 0 && state.old_cursor < state.old.len() {
            let object = state.old[state.old_cursor];
            state.old_cursor += 1;
            budget -= 1;
            let header = heap.header_mut(object);
            if header.marked {
                header.marked = false;
                heap.old.push(object);
            } else {
                let size = heap.free_object(object);
                heap.old_bytes -= size;
                state.freed += size;
            }
        }
        while budget > 0 && state.env_cursor < state.envs.len() {
            let env = state.envs[state.env_cursor];
            state.env_cursor += 1;
            budget -= 1;
            let record = heap.env_mut(env);
            if record.marked {
                record.marked = false;
                heap.envs.push(env);
            } else {
                heap.free_env(env);
                state.freed += Env::SIZE;
            }
        }
        gc_trace!("sweep step old={}/{} envs={}/{}", state.old_cursor, state.old.len(), state.env_cursor, state.envs.len());
        state.is_done()
    }

    /// Complete an in-progress sweep without yielding.
    pub fn finish_sweep(&mut self, heap: &mut ObjectManager) {
        if self.sweep.is_none() {
            return;
        }
        while !self.sweep_step(heap, usize::MAX) {}
        self.finish_full_sweep(heap);
    }

    /// Close out a major collection once the sweep has covered every list.
    pub(crate) fn finish_full_sweep(&mut self, heap: &mut ObjectManager) {
        let Some(state) = self.sweep.take() else {
            return;
        };
        self.rebuild_remembered(heap);
        self.update_full_next(heap);
        self.stats.major_cycles += 1;
        let next = self.full_next;
        self.record_cycle(state.before, state.freed, heap.total_bytes(), next);
        self.report(format_args!(
            "-- gc end (major) freed={} young={} old={} env={} next={} in {:?}",
            state.freed,
            heap.young_bytes(),
            heap.old_bytes(),
            heap.env_bytes(),
            next,
            state.started.elapsed()
        ));
    }

    /// Recompute the remembered set from scratch over the surviving old objects.
    fn rebuild_remembered(&mut self, heap: &mut ObjectManager) {
        for owner in std::mem::take(&mut self.remembered) {
            if heap.is_live(owner) {
                heap.header_mut(owner).remembered = false;
            }
        }
        let old = std::mem::take(&mut heap.old);
        for &owner in &old {
            if self.has_young_refs(heap, owner) {
                self.remember(heap, owner);
            }
        }
        heap.old = old;
    }
}
