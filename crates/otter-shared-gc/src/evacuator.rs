//! Shared heap evacuation
//!
//! [`Evacuator::evacuate`] runs two stages back to back, with every mutator
//! stopped:
//!
//! 1. copy phase: every marked object of the collect set is copied into the
//!    compress space and its old header is turned into a forwarding entry.
//!    Single threaded.
//! 2. fix-up phase: every remembered slot and every root that may reference
//!    the collect set is rewritten. Remembered sets are split into
//!    per-region workloads drained by pool workers and the calling thread;
//!    roots are visited by the calling thread.
//!
//! All forwarding entries are installed before the first one is read, so
//! the header accesses need no synchronization beyond the stage boundary.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::allocator::BumpAllocator;
use crate::error::{GcError, GcResult, fatal};
use crate::heap::SharedHeap;
use crate::hooks::MoveListener;
use crate::object::{MarkWord, ObjectHeader};
use crate::region::RegionSpace;
use crate::resolver::{FieldRecorder, FixupCounts, ReferenceResolver, RootFixup};
use crate::roots::RootProvider;
use crate::taskpool::TaskPool;
use crate::value::Address;
use crate::workload::{Workload, WorkloadQueue, update_thread_count};

/// Evacuator settings
#[derive(Debug, Clone)]
pub struct EvacuatorConfig {
    /// Drain fix-up workloads on pool workers as well as the calling
    /// thread (default: true)
    pub parallel_gc: bool,
}

impl Default for EvacuatorConfig {
    fn default() -> Self {
        Self { parallel_gc: true }
    }
}

/// Evacuation statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvacuationStats {
    /// Number of evacuations run
    pub cycles: u64,
    /// Total time spent evacuating (nanoseconds)
    pub total_time_ns: u64,
    /// Collect-set regions evacuated in the last cycle
    pub last_regions: usize,
    /// Objects copied in the last cycle
    pub last_objects_moved: usize,
    /// Bytes copied in the last cycle
    pub last_bytes_moved: usize,
    /// Slots rewritten in the last cycle
    pub last_slots_updated: usize,
    /// Slots cleared in the last cycle
    pub last_slots_cleared: usize,
    /// Workloads queued in the last cycle
    pub last_workloads: usize,
    /// Worker tasks posted in the last cycle
    pub last_workers: usize,
}

/// Result of the copy phase
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopySummary {
    /// Collect-set regions visited
    pub regions: usize,
    /// Objects copied
    pub objects: usize,
    /// Bytes copied
    pub bytes: usize,
    /// Copy fields recorded in cross-region bits
    pub recorded_slots: usize,
}

/// Result of the fix-up phase
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixupSummary {
    /// Workloads queued
    pub workloads: usize,
    /// Worker tasks posted
    pub workers: usize,
    /// Slot counts, roots included
    pub counts: FixupCounts,
}

#[derive(Debug, Default)]
struct SharedCounters {
    slots_updated: CachePadded<AtomicUsize>,
    slots_cleared: CachePadded<AtomicUsize>,
}

impl SharedCounters {
    fn add(&self, counts: FixupCounts) {
        self.slots_updated
            .fetch_add(counts.slots_updated, Ordering::Relaxed);
        self.slots_cleared
            .fetch_add(counts.slots_cleared, Ordering::Relaxed);
    }

    fn load(&self) -> FixupCounts {
        FixupCounts {
            slots_updated: self.slots_updated.load(Ordering::Relaxed),
            slots_cleared: self.slots_cleared.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the calling thread and the posted workers
struct UpdateContext {
    heap: Arc<SharedHeap>,
    queue: WorkloadQueue,
    counters: SharedCounters,
}

impl UpdateContext {
    fn process_workloads(&self, is_main: bool) {
        let _finished = (!is_main).then(|| self.queue.worker_guard());
        let resolver = ReferenceResolver::new(&self.heap);
        let mut counts = FixupCounts::default();
        let mut processed = 0usize;
        while let Some(workload) = self.queue.try_pop() {
            tracing::trace!(target: "otter::gc", ?workload, is_main, "processing workload");
            counts += resolver.process_workload(workload);
            processed += 1;
        }
        self.counters.add(counts);
        tracing::trace!(target: "otter::gc", is_main, processed, "workload queue drained");
    }
}

/// Evacuates the collect set of a [`SharedHeap`]
pub struct Evacuator {
    heap: Arc<SharedHeap>,
    pool: Arc<dyn TaskPool>,
    listener: Arc<dyn MoveListener>,
    config: EvacuatorConfig,
    stats: Mutex<EvacuationStats>,
}

impl Evacuator {
    /// Create an evacuator for `heap`, posting fix-up work to `pool` and
    /// reporting moves to `listener`
    pub fn new(
        heap: Arc<SharedHeap>,
        pool: Arc<dyn TaskPool>,
        listener: Arc<dyn MoveListener>,
        config: EvacuatorConfig,
    ) -> Self {
        Self {
            heap,
            pool,
            listener,
            config,
            stats: Mutex::new(EvacuationStats::default()),
        }
    }

    /// Heap being evacuated
    pub fn heap(&self) -> &Arc<SharedHeap> {
        &self.heap
    }

    /// Settings
    pub fn config(&self) -> &EvacuatorConfig {
        &self.config
    }

    /// Statistics of past cycles
    pub fn stats(&self) -> EvacuationStats {
        self.stats.lock().clone()
    }

    /// Relocate the collect set and fix up every reference to it.
    ///
    /// Every registered mutator must be suspended. Failures abort the
    /// process: a partially evacuated heap cannot be recovered.
    pub fn evacuate(&self) {
        assert!(
            self.heap.all_threads_suspended(),
            "evacuation started while a mutator is running"
        );
        let start = Instant::now();

        let copy = match self.evacuate_regions() {
            Ok(copy) => copy,
            Err(err) => fatal(&err),
        };
        let fixup = self.update_reference();
        self.heap.clear_marks();

        let elapsed = start.elapsed();
        let mut stats = self.stats.lock();
        stats.cycles += 1;
        stats.total_time_ns += elapsed.as_nanos() as u64;
        stats.last_regions = copy.regions;
        stats.last_objects_moved = copy.objects;
        stats.last_bytes_moved = copy.bytes;
        stats.last_slots_updated = fixup.counts.slots_updated;
        stats.last_slots_cleared = fixup.counts.slots_cleared;
        stats.last_workloads = fixup.workloads;
        stats.last_workers = fixup.workers;

        tracing::info!(
            target: "otter::gc",
            regions = copy.regions,
            objects = copy.objects,
            bytes = copy.bytes,
            slots_updated = fixup.counts.slots_updated,
            slots_cleared = fixup.counts.slots_cleared,
            workloads = fixup.workloads,
            workers = fixup.workers,
            pause_us = elapsed.as_micros() as u64,
            "shared heap evacuated"
        );
    }

    /// Copy phase: move every marked collect-set object into the compress
    /// space, then merge the compress space into the old space.
    pub fn evacuate_regions(&self) -> GcResult<CopySummary> {
        let mut allocator = BumpAllocator::new(RegionSpace::SharedCompress);
        let mut summary = CopySummary::default();
        let collect_set = self.heap.collect_set();
        tracing::debug!(target: "otter::gc", regions = collect_set.len(), "copy phase started");

        for index in collect_set {
            let region = self.heap.region(index);
            assert!(region.in_collect_set(), "region {index} left the collect set");
            summary.regions += 1;

            for object in region.drain_marked() {
                let size = self.heap.model().size_of(object);
                let to = allocator
                    .allocate(&self.heap, size)
                    .ok_or(GcError::AllocationExhausted { size, from: object })?;
                self.copy_object(object, to, size)?;
                self.listener.on_object_moved(object, to, size);

                // SAFETY: `object` is a marked, initialized object
                unsafe { ObjectHeader::at(object) }.set_mark_word(MarkWord::forwarded(to));

                let holder = self
                    .heap
                    .region_of(to)
                    .ok_or(GcError::CopyFailed { from: object, to, size })?;
                let mut recorder = FieldRecorder::new(&self.heap, holder);
                self.heap.model().visit_body(to, &mut recorder);
                summary.recorded_slots += recorder.recorded();

                region.deduct_evacuated(size);
                summary.objects += 1;
                summary.bytes += size;
            }
        }

        let merged = self.heap.merge_compress_space();
        tracing::debug!(
            target: "otter::gc",
            objects = summary.objects,
            bytes = summary.bytes,
            merged,
            "copy phase finished"
        );
        Ok(summary)
    }

    fn copy_object(&self, from: Address, to: Address, size: usize) -> GcResult<()> {
        let in_compress_space = self.heap.region_of(to).is_some_and(|region| {
            region.space() == RegionSpace::SharedCompress
                && region.contains(to)
                && to.offset(size) <= region.end()
        });
        if !in_compress_space || !to.is_word_aligned() {
            return Err(GcError::CopyFailed { from, to, size });
        }
        // SAFETY: the source is a live object of `size` bytes; the
        // destination was just allocated with that size in another region
        unsafe { ptr::copy_nonoverlapping(from.as_ptr(), to.as_ptr(), size) };
        Ok(())
    }

    /// Fix-up phase: rewrite remembered slots and roots that reference the
    /// collect set.
    pub fn update_reference(&self) -> FixupSummary {
        let context = Arc::new(UpdateContext {
            heap: Arc::clone(&self.heap),
            queue: WorkloadQueue::new(),
            counters: SharedCounters::default(),
        });

        let threads = self.heap.threads();
        for thread in &threads {
            for index in thread.local_regions() {
                context.queue.push(Workload::LocalToShare(index));
            }
        }
        for index in self.heap.old_space_regions() {
            context.queue.push(Workload::CrossRegion(index));
        }
        let workloads = context.queue.len();

        let workers = if self.config.parallel_gc {
            update_thread_count(workloads, self.pool.total_thread_num())
        } else {
            0
        };
        context.queue.add_workers(workers);
        for i in 0..workers {
            let context = Arc::clone(&context);
            self.pool
                .post_task(Some(i), Box::new(move |_| context.process_workloads(false)));
        }
        tracing::debug!(target: "otter::gc", workloads, workers, "reference update started");

        let resolver = ReferenceResolver::new(&self.heap);
        let mut roots = RootFixup::new(&resolver);
        self.heap.shared_roots().iterate_roots(&mut roots);
        for provider in self.heap.root_providers() {
            provider.iterate_roots(&mut roots);
        }
        for thread in &threads {
            assert!(
                thread.is_suspended(),
                "mutator {} running during root fix-up",
                thread.id()
            );
            thread.roots().iterate_roots(&mut roots);
        }
        context.counters.add(roots.counts());

        context.process_workloads(true);
        context.queue.wait_finished();
        assert!(
            !context.queue.worker_panicked(),
            "reference update worker panicked"
        );

        FixupSummary {
            workloads,
            workers,
            counts: context.counters.load(),
        }
    }
}

impl std::fmt::Debug for Evacuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evacuator")
            .field("config", &self.config)
            .field("pool_threads", &self.pool.total_thread_num())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;
    use crate::hooks::{MoveLog, NoopMoveListener};
    use crate::object::{ClassId, ClassKind, ClassTable, HEADER_SIZE, HeaderState};
    use crate::taskpool::Task;
    use crate::value::TaggedValue;

    /// Pool that claims threads but never runs posted tasks itself
    #[derive(Default)]
    struct CountingPool {
        threads: usize,
        posted: Mutex<Vec<Task>>,
    }

    impl TaskPool for CountingPool {
        fn post_task(&self, _affinity: Option<usize>, task: Task) {
            self.posted.lock().push(task);
        }

        fn total_thread_num(&self) -> usize {
            self.threads
        }
    }

    fn heap(max_regions: usize) -> (Arc<SharedHeap>, ClassId) {
        let mut classes = ClassTable::new();
        let array = classes.register("Array", ClassKind::TaggedArray);
        let config = HeapConfig {
            region_size_log2: 12,
            max_regions,
            ..HeapConfig::default()
        };
        (SharedHeap::new(config, Arc::new(classes)).unwrap(), array)
    }

    fn field(object: Address, index: usize) -> crate::value::Slot {
        // SAFETY: test objects are allocated before use
        unsafe { ObjectHeader::at(object) }.body_slot(index)
    }

    #[test]
    fn test_copy_phase_forwards_marked_objects() {
        let (heap, array) = heap(4);
        let x = heap.allocate_shared(array, 2).unwrap();
        let y = heap.allocate_shared(array, 1).unwrap();
        let _dead = heap.allocate_shared(array, 1).unwrap();
        field(x, 0).store(TaggedValue::object(y));
        field(x, 1).store(TaggedValue::int(9));
        heap.mark_object(x);
        heap.mark_object(y);
        let from = heap.region_of(x).unwrap().index();
        heap.add_to_collect_set(from);

        let log = Arc::new(MoveLog::new());
        let pool = Arc::new(CountingPool::default());
        let evacuator = Evacuator::new(Arc::clone(&heap), pool, log.clone(), EvacuatorConfig::default());
        let summary = evacuator.evacuate_regions().unwrap();

        assert_eq!(summary.objects, 2);
        assert_eq!(summary.bytes, 2 * HEADER_SIZE + 24);
        assert_eq!(summary.recorded_slots, 1);
        assert_eq!(log.len(), 2);

        let x_new = log.new_address(x).unwrap();
        // SAFETY: evacuated above
        let header = unsafe { ObjectHeader::at(x) };
        assert_eq!(header.state(), HeaderState::Forwarded(x_new));
        assert_eq!(field(x_new, 1).load().as_int(), Some(9));
        // Copy still points at the old y until fix-up
        assert_eq!(field(x_new, 0).load(), TaggedValue::object(y));

        let dest = heap.region_of(x_new).unwrap();
        assert_eq!(dest.space(), RegionSpace::SharedOld);
        assert!(heap.compress_space_regions().is_empty());
        assert_eq!(heap.region(from).live_bytes(), 0);
        assert!(heap.region(from).marked_bits().is_empty());
    }

    #[test]
    fn test_copy_phase_reports_exhaustion() {
        let (heap, array) = heap(1);
        let x = heap.allocate_shared(array, 1).unwrap();
        heap.mark_object(x);
        heap.add_to_collect_set(heap.region_of(x).unwrap().index());

        let evacuator = Evacuator::new(
            Arc::clone(&heap),
            Arc::new(CountingPool::default()),
            Arc::new(NoopMoveListener),
            EvacuatorConfig::default(),
        );
        assert_eq!(
            evacuator.evacuate_regions(),
            Err(GcError::AllocationExhausted {
                size: HEADER_SIZE + 8,
                from: x,
            })
        );
    }

    #[test]
    fn test_copy_outside_compress_space_fails() {
        let (heap, array) = heap(4);
        let x = heap.allocate_shared(array, 1).unwrap();
        let old_dest = heap.allocate_shared(array, 1).unwrap();
        let size = HEADER_SIZE + 8;
        field(x, 0).store(TaggedValue::int(5));
        field(old_dest, 0).store(TaggedValue::int(1));

        let evacuator = Evacuator::new(
            Arc::clone(&heap),
            Arc::new(CountingPool::default()),
            Arc::new(NoopMoveListener),
            EvacuatorConfig::default(),
        );
        for to in [old_dest, Address::new(8)] {
            assert_eq!(
                evacuator.copy_object(x, to, size),
                Err(GcError::CopyFailed { from: x, to, size })
            );
        }
        // Nothing was written to the rejected destination
        assert_eq!(field(old_dest, 0).load().as_int(), Some(1));
    }

    #[test]
    fn test_update_reference_posts_workers_and_main_drains() {
        let (heap, array) = heap(32);
        // 16 old-space regions, one CrossRegion workload each
        for _ in 0..16 {
            heap.allocate_shared(array, 500).unwrap();
        }
        assert_eq!(heap.old_space_regions().len(), 16);

        let pool = Arc::new(CountingPool {
            threads: 8,
            ..CountingPool::default()
        });
        let evacuator = Evacuator::new(
            Arc::clone(&heap),
            pool.clone(),
            Arc::new(NoopMoveListener),
            EvacuatorConfig::default(),
        );

        // Posted tasks run on a helper thread standing in for the pool
        let runner = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                loop {
                    let tasks: Vec<Task> = pool.posted.lock().drain(..).collect();
                    if !tasks.is_empty() {
                        let n = tasks.len();
                        for task in tasks {
                            task(0);
                        }
                        return n;
                    }
                    std::thread::yield_now();
                }
            })
        };

        let summary = evacuator.update_reference();
        assert_eq!(summary.workloads, 16);
        assert_eq!(summary.workers, 2);
        assert_eq!(runner.join().unwrap(), 2);
    }

    #[test]
    fn test_sequential_mode_posts_nothing() {
        let (heap, array) = heap(4);
        heap.allocate_shared(array, 1).unwrap();
        let pool = Arc::new(CountingPool {
            threads: 8,
            ..CountingPool::default()
        });
        let evacuator = Evacuator::new(
            Arc::clone(&heap),
            pool.clone(),
            Arc::new(NoopMoveListener),
            EvacuatorConfig { parallel_gc: false },
        );

        let summary = evacuator.update_reference();
        assert_eq!(summary.workloads, 1);
        assert_eq!(summary.workers, 0);
        assert!(pool.posted.lock().is_empty());
    }

    #[test]
    #[should_panic(expected = "mutator is running")]
    fn test_evacuate_requires_suspended_mutators() {
        let (heap, _array) = heap(4);
        let _mutator = heap.register_thread();
        let evacuator = Evacuator::new(
            Arc::clone(&heap),
            Arc::new(CountingPool::default()),
            Arc::new(NoopMoveListener),
            EvacuatorConfig::default(),
        );
        evacuator.evacuate();
    }
}
