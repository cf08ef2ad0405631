pub mod sweep;
pub mod trace;
pub mod young;

use std::time::Instant;

use log::{debug, info, trace};

use crate::call_frame::{CallFrame, TryFrame};
use crate::env::EnvRef;
use crate::objects::{object::ObjRef, object_manager::ObjectManager};
use crate::value::Value;

use self::sweep::SweepState;
use self::trace::Tracer;

pub const GC_MIN_HEAP_BYTES: usize = 4 * 1024 * 1024;
pub const GC_MIN_YOUNG_HEAP_BYTES: usize = 1024 * 1024;
pub const GC_HEAP_GROW_FACTOR: usize = 3;
pub const GC_YOUNG_GROW_FACTOR: usize = 3;
/// Old objects (then envs) examined per incremental sweep step.
pub const GC_SWEEP_BATCH: usize = 256;
/// Minor collections a young object must survive before promotion.
pub const GC_PROMOTION_AGE: u8 = 2;

/// Aggregated GC statistics (does not include currently-live total bytes; the heap tracks that).
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub minor_cycles: u64,
    pub major_cycles: u64,
    pub promoted: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => { } }
pub(crate) use gc_trace;

/// Everything the engine holds outside the heap that can reference heap data.
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub frames: &'a [CallFrame],
    pub try_frames: &'a [TryFrame],
    pub globals: EnvRef,
    pub env: EnvRef,
    pub modules: ObjRef,
    pub args: ObjRef,
    /// Values held by natives across re-entrant calls.
    pub pinned: &'a [Value],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TraceMode {
    Full,
    Young,
}

pub struct GarbageCollector {
    tracer: Tracer,
    scratch: Tracer,
    remembered: Vec<ObjRef>,
    visited_envs: Vec<EnvRef>,
    young_next: usize,
    full_next: usize,
    pending_young: bool,
    pending_full: bool,
    sweep: Option<SweepState>,
    log: bool,
    stats: GCStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            tracer: Tracer::new(),
            scratch: Tracer::new(),
            remembered: Vec::new(),
            visited_envs: Vec::new(),
            young_next: GC_MIN_YOUNG_HEAP_BYTES,
            full_next: GC_MIN_HEAP_BYTES,
            pending_young: false,
            pending_full: false,
            sweep: None,
            log: false,
            stats: GCStats::default(),
        }
    }

    /// Report collection begin/end lines at `info` instead of `debug`.
    pub fn set_logging(&mut self, enabled: bool) {
        self.log = enabled;
    }

    pub(crate) fn set_thresholds(&mut self, young_next: usize, full_next: usize) {
        self.young_next = young_next;
        self.full_next = full_next;
    }

    pub fn young_next(&self) -> usize {
        self.young_next
    }

    pub fn full_next(&self) -> usize {
        self.full_next
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_young || self.pending_full
    }

    pub fn remembered(&self) -> &[ObjRef] {
        &self.remembered
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }

    /// Record a completed GC cycle.
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    fn report(&self, message: std::fmt::Arguments) {
        if self.log {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }

    /// Called after every allocation or resize. Only sets flags; collection
    /// happens at the next checkpoint.
    pub fn note_allocation(&mut self, heap: &ObjectManager) {
        if !self.pending_young && heap.young_bytes() > self.young_next {
            trace!("young threshold crossed: {} > {}", heap.young_bytes(), self.young_next);
            self.pending_young = true;
        }
        if !self.pending_full && heap.total_bytes() > self.full_next {
            trace!("heap threshold crossed: {} > {}", heap.total_bytes(), self.full_next);
            self.pending_full = true;
        }
    }

    /// Record that old `owner` now references `value`, if that value is a young object.
    #[inline]
    pub fn write_barrier(&mut self, heap: &mut ObjectManager, owner: ObjRef, value: Value) {
        let Value::Obj(child) = value else {
            return;
        };
        if heap.header(owner).is_young() || !heap.header(child).is_young() {
            return;
        }
        self.remember(heap, owner);
    }

    fn remember(&mut self, heap: &mut ObjectManager, owner: ObjRef) {
        let header = heap.header_mut(owner);
        if header.remembered {
            return;
        }
        header.remembered = true;
        gc_trace!("remember {:?}", owner);
        self.remembered.push(owner);
    }

    /// Safe-point entry: advance an in-progress sweep, or run whatever collection is pending.
    pub fn gc_maybe(&mut self, heap: &mut ObjectManager, roots: &Roots) {
        if self.sweep.is_some() {
            if self.sweep_step(heap, GC_SWEEP_BATCH) {
                self.finish_full_sweep(heap);
            }
            return;
        }
        self.note_allocation(heap);
        if self.pending_full {
            self.collect(heap, roots);
        } else if self.pending_young {
            self.collect_young(heap, roots);
        }
    }

    /// Start a major collection: mark everything reachable, sweep the young
    /// generation now and leave the old generation and envs to incremental steps.
    pub fn collect(&mut self, heap: &mut ObjectManager, roots: &Roots) {
        if self.sweep.is_some() {
            self.finish_sweep(heap);
        }
        self.pending_young = false;
        self.pending_full = false;
        let started = Instant::now();
        let before = heap.total_bytes();
        self.report(format_args!(
            "-- gc begin (major) young={} old={} env={}",
            heap.young_bytes(),
            heap.old_bytes(),
            heap.env_bytes()
        ));

        self.prepare_collection();
        self.mark_roots(heap, roots);
        self.trace_references(heap, TraceMode::Full);
        let (freed_young, promoted) = self.sweep_young(heap, true);
        self.stats.promoted += promoted as u64;
        self.update_young_next(heap);

        self.sweep = Some(SweepState::new(
            std::mem::take(&mut heap.old),
            std::mem::take(&mut heap.envs),
            before,
            freed_young,
            started,
        ));
    }

    /// Run a major collection to completion.
    pub fn collect_garbage(&mut self, heap: &mut ObjectManager, roots: &Roots) {
        self.collect(heap, roots);
        self.finish_sweep(heap);
    }

    pub fn prepare_collection(&mut self) {
        self.tracer.clear();
        self.visited_envs.clear();
    }

    pub fn mark_object(&mut self, object: ObjRef) {
        self.tracer.push_object(object);
    }

    pub fn mark_value(&mut self, value: Value) {
        self.tracer.push_value(value);
    }

    pub fn mark_env(&mut self, env: EnvRef) {
        self.tracer.push_env(env);
    }

    pub fn mark_roots(&mut self, heap: &ObjectManager, roots: &Roots) {
        for value in roots.stack {
            self.mark_value(*value);
        }
        for frame in roots.frames {
            frame.trace(&mut self.tracer);
        }
        for try_frame in roots.try_frames {
            self.mark_env(try_frame.env);
        }
        self.mark_env(roots.globals);
        self.mark_env(roots.env);
        self.mark_object(roots.modules);
        self.mark_object(roots.args);
        for value in roots.pinned {
            self.mark_value(*value);
        }
        for string in heap.interned() {
            self.mark_object(string);
        }
    }

    /// Drain the gray lists. In young mode old objects are treated as already
    /// black and envs are only visited once per collection.
    pub(crate) fn trace_references(&mut self, heap: &mut ObjectManager, mode: TraceMode) {
        loop {
            if let Some(object) = self.tracer.objects.pop() {
                self.blacken_object(heap, object, mode);
                continue;
            }
            if let Some(env) = self.tracer.envs.pop() {
                let record = heap.env_mut(env);
                if record.marked {
                    continue;
                }
                record.marked = true;
                let (values, consts, enclosing) = (record.values, record.consts, record.enclosing);
                if mode == TraceMode::Young {
                    self.visited_envs.push(env);
                }
                self.tracer.push_object(values);
                self.tracer.push_object(consts);
                if let Some(enclosing) = enclosing {
                    self.tracer.push_env(enclosing);
                }
                continue;
            }
            break;
        }
    }

    fn blacken_object(&mut self, heap: &mut ObjectManager, object: ObjRef, mode: TraceMode) {
        let header = heap.header_mut(object);
        if header.marked || (mode == TraceMode::Young && !header.is_young()) {
            return;
        }
        header.marked = true;
        gc_trace!("blacken {:?}", object);
        heap.object(object).trace(&mut self.tracer);
    }

    fn update_young_next(&mut self, heap: &ObjectManager) {
        self.young_next = (heap.young_bytes() * GC_YOUNG_GROW_FACTOR).max(GC_MIN_YOUNG_HEAP_BYTES);
    }

    fn update_full_next(&mut self, heap: &ObjectManager) {
        self.full_next = (heap.total_bytes() * GC_HEAP_GROW_FACTOR).max(GC_MIN_HEAP_BYTES);
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}
