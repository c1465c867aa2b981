//! Shared heap evacuation tests
//!
//! These tests drive full evacuation cycles over a small heap and check
//! that every reference into the collect set ends up pointing at the
//! relocated object, or is cleared when its referent died.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use otter_shared_gc::{
    Address, ClassId, ClassKind, ClassTable, EvacuatorConfig, Evacuator, HEADER_SIZE, HeapConfig,
    HeaderState, MoveLog, ObjectHeader, RegionSpace, RootProvider, RootVisitor, SharedHeap, Slot,
    TaggedValue, Taskpool,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct World {
    heap: Arc<SharedHeap>,
    array: ClassId,
    log: Arc<MoveLog>,
    evacuator: Evacuator,
}

fn world_with(threads: usize, config: EvacuatorConfig) -> World {
    init_tracing();
    let mut classes = ClassTable::new();
    let array = classes.register("Array", ClassKind::TaggedArray);
    let heap_config = HeapConfig {
        region_size_log2: 12,
        max_regions: 64,
        ..HeapConfig::default()
    };
    let heap = SharedHeap::new(heap_config, Arc::new(classes)).unwrap();
    let pool = Arc::new(Taskpool::new(threads).unwrap());
    let log = Arc::new(MoveLog::new());
    let evacuator = Evacuator::new(Arc::clone(&heap), pool, log.clone(), config);
    World {
        heap,
        array,
        log,
        evacuator,
    }
}

fn world() -> World {
    world_with(4, EvacuatorConfig::default())
}

fn field(object: Address, index: usize) -> Slot {
    unsafe { ObjectHeader::at(object) }.body_slot(index)
}

fn state(object: Address) -> HeaderState {
    unsafe { ObjectHeader::at(object) }.state()
}

impl World {
    fn shared(&self, length: u32) -> Address {
        self.heap.allocate_shared(self.array, length).unwrap()
    }

    /// Store `value` into a field and record it like the write barrier would
    fn store(&self, object: Address, index: usize, value: TaggedValue) {
        let slot = field(object, index);
        slot.store(value);
        self.heap.record_slot(slot);
    }

    fn evacuate_region_of(&self, object: Address) {
        let index = self.heap.region_of(object).unwrap().index();
        self.heap.add_to_collect_set(index);
    }

    fn moved(&self, object: Address) -> Address {
        self.log.new_address(object).unwrap()
    }
}

#[test]
fn test_scenario_live_objects_and_incoming_slot() {
    let w = world();
    let x = w.shared(2);
    let y = w.shared(1);
    w.heap.mark_object(x);
    w.heap.mark_object(y);
    w.evacuate_region_of(x);

    let z = w.shared(2);
    w.heap.mark_object(z);
    w.store(z, 0, TaggedValue::object(x));

    w.evacuator.evacuate();

    let (x_new, y_new) = (w.moved(x), w.moved(y));
    assert_eq!(state(x), HeaderState::Forwarded(x_new));
    assert_eq!(state(y), HeaderState::Forwarded(y_new));
    assert_eq!(field(z, 0).load(), TaggedValue::object(x_new));
    assert_eq!(state(z), HeaderState::Unmarked);

    let stats = w.evacuator.stats();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.last_objects_moved, 2);
    assert_eq!(stats.last_bytes_moved, 2 * HEADER_SIZE + 24);
    assert_eq!(stats.last_slots_updated, 1);
}

#[test]
fn test_scenario_weak_slot_to_dead_object_cleared() {
    let w = world();
    let dead = w.shared(1);
    let live = w.shared(1);
    w.heap.mark_object(live);
    w.evacuate_region_of(dead);

    let z = w.shared(3);
    w.store(z, 0, TaggedValue::weak(dead));
    w.store(z, 1, TaggedValue::object(dead));
    w.store(z, 2, TaggedValue::weak(live));

    w.evacuator.evacuate();

    assert!(field(z, 0).load().is_hole());
    assert!(field(z, 1).load().is_hole());
    assert_eq!(state(dead), HeaderState::Unmarked);
    assert!(w.log.new_address(dead).is_none());

    // Weak reference to a live object keeps its weakness
    let slot = field(z, 2).load();
    assert!(slot.is_weak());
    assert_eq!(slot.heap_object(), Some(w.moved(live)));
    assert_eq!(w.evacuator.stats().last_slots_cleared, 2);
}

#[test]
fn test_scenario_thread_count_for_sixteen_workloads() {
    let w = world_with(8, EvacuatorConfig::default());
    for _ in 0..16 {
        w.shared(500);
    }
    assert_eq!(w.heap.old_space_regions().len(), 16);

    w.evacuator.evacuate();

    let stats = w.evacuator.stats();
    assert_eq!(stats.last_workloads, 16);
    assert_eq!(stats.last_workers, 2);
}

#[test]
fn test_pointers_between_evacuated_objects() {
    let w = world();
    let x = w.shared(2);
    let y = w.shared(1);
    w.store(x, 0, TaggedValue::object(y));
    w.store(x, 1, TaggedValue::object(x));
    w.store(y, 0, TaggedValue::weak(x));
    w.heap.mark_object(x);
    w.heap.mark_object(y);
    w.evacuate_region_of(x);

    w.evacuator.evacuate();

    let (x_new, y_new) = (w.moved(x), w.moved(y));
    assert_eq!(field(x_new, 0).load(), TaggedValue::object(y_new));
    assert_eq!(field(x_new, 1).load(), TaggedValue::object(x_new));
    assert_eq!(field(y_new, 0).load(), TaggedValue::weak(x_new));
}

#[test]
fn test_forwarding_complete_and_contents_preserved() {
    let w = world();
    let mut objects = Vec::new();
    for i in 0..120u32 {
        let object = w.shared(i % 7 + 1);
        field(object, 0).store(TaggedValue::int(i as i32));
        objects.push(object);
    }
    let regions: Vec<usize> = {
        let mut r: Vec<usize> = objects
            .iter()
            .map(|&o| w.heap.region_of(o).unwrap().index())
            .collect();
        r.dedup();
        r
    };
    assert!(regions.len() >= 2);

    let mut live_bytes = 0;
    for (i, &object) in objects.iter().enumerate() {
        if i % 3 != 0 {
            w.heap.mark_object(object);
            live_bytes += w.heap.model().size_of(object);
        }
    }
    for &index in &regions {
        w.heap.add_to_collect_set(index);
    }

    w.evacuator.evacuate();

    for (i, &object) in objects.iter().enumerate() {
        if i % 3 == 0 {
            assert_eq!(state(object), HeaderState::Unmarked);
            continue;
        }
        let HeaderState::Forwarded(to) = state(object) else {
            panic!("live object {object} was not forwarded");
        };
        assert_eq!(w.moved(object), to);
        assert_eq!(field(to, 0).load().as_int(), Some(i as i32));
        assert_eq!(unsafe { ObjectHeader::at(to) }.length(), i as u32 % 7 + 1);
        assert_eq!(state(to), HeaderState::Unmarked);
        assert_eq!(w.heap.region_of(to).unwrap().space(), RegionSpace::SharedOld);
    }
    assert_eq!(w.log.total_bytes(), live_bytes);
    assert_eq!(w.evacuator.stats().last_regions, regions.len());
}

#[test]
fn test_local_heap_slots_fixed_up() {
    let w = world();
    let x = w.shared(1);
    let dead = w.shared(1);
    w.heap.mark_object(x);
    w.evacuate_region_of(x);

    let mutator = w.heap.register_thread();
    let local = mutator.allocate(&w.heap, w.array, 3).unwrap();
    w.store(local, 0, TaggedValue::object(x));
    w.store(local, 1, TaggedValue::object(dead));
    w.store(local, 2, TaggedValue::int(5));
    let root = mutator.roots().push(TaggedValue::object(local));

    mutator.suspend();
    w.evacuator.evacuate();

    assert_eq!(field(local, 0).load(), TaggedValue::object(w.moved(x)));
    assert!(field(local, 1).load().is_hole());
    assert_eq!(field(local, 2).load().as_int(), Some(5));
    // Local objects never move
    assert_eq!(mutator.roots().get(root), TaggedValue::object(local));
    assert!(w.evacuator.stats().last_workloads >= 1);
}

#[test]
fn test_roots_and_derived_pointers_fixed_up() {
    let w = world();
    let x = w.shared(4);
    let dead = w.shared(1);
    w.heap.mark_object(x);
    w.evacuate_region_of(x);

    let mutator = w.heap.register_thread();
    let roots = mutator.roots();
    let base = roots.push(TaggedValue::object(x));
    let range = roots.push_range(&[TaggedValue::weak(dead), TaggedValue::UNDEFINED]);
    let derived = roots.push_derived(base, HEADER_SIZE + 16);
    let global = w.heap.shared_roots().push(TaggedValue::weak(x));

    mutator.suspend();
    w.evacuator.evacuate();

    let x_new = w.moved(x);
    assert_eq!(roots.get(base), TaggedValue::object(x_new));
    assert!(roots.get(range).is_hole());
    assert_eq!(roots.get(roots.range_element(range, 1)), TaggedValue::UNDEFINED);
    assert_eq!(w.heap.shared_roots().get(global), TaggedValue::weak(x_new));

    let new_base = roots.get(base).heap_object().unwrap();
    assert_eq!(roots.get_raw(derived) - new_base.as_usize(), HEADER_SIZE + 16);
}

/// Embedder handle table
struct Handles {
    words: Vec<AtomicU64>,
}

impl RootProvider for Handles {
    fn iterate_roots(&self, visitor: &mut dyn RootVisitor) {
        for word in &self.words {
            visitor.visit_root(unsafe { Slot::from_atomic(word) });
        }
    }
}

#[test]
fn test_extra_root_provider_visited() {
    let w = world();
    let x = w.shared(1);
    w.heap.mark_object(x);
    w.evacuate_region_of(x);

    let handles = Arc::new(Handles {
        words: vec![
            AtomicU64::new(TaggedValue::object(x).raw()),
            AtomicU64::new(TaggedValue::NULL.raw()),
        ],
    });
    w.heap.add_root_provider(handles.clone());

    w.evacuator.evacuate();

    let first = unsafe { Slot::from_atomic(&handles.words[0]) }.load();
    let second = unsafe { Slot::from_atomic(&handles.words[1]) }.load();
    assert_eq!(first, TaggedValue::object(w.moved(x)));
    assert_eq!(second, TaggedValue::NULL);
}

#[test]
fn test_parallel_fixup_many_regions() {
    let w = world_with(4, EvacuatorConfig::default());
    let targets: Vec<Address> = (0..100).map(|_| w.shared(1)).collect();
    for (i, &target) in targets.iter().enumerate() {
        if i % 2 == 0 {
            w.heap.mark_object(target);
        }
    }
    w.evacuate_region_of(targets[0]);
    assert_eq!(w.heap.collect_set().len(), 1);

    let holders: Vec<Address> = (0..40).map(|_| w.shared(500)).collect();
    for (h, &holder) in holders.iter().enumerate() {
        for i in 0..500 {
            let target = targets[(h + i) % targets.len()];
            let value = if i % 2 == 0 {
                TaggedValue::object(target)
            } else {
                TaggedValue::weak(target)
            };
            w.store(holder, i, value);
        }
    }

    w.evacuator.evacuate();

    for (h, &holder) in holders.iter().enumerate() {
        for i in 0..500 {
            let index = (h + i) % targets.len();
            let value = field(holder, i).load();
            if index % 2 == 1 {
                assert!(value.is_hole(), "slot {i} of holder {h} still set");
                continue;
            }
            assert_eq!(value.heap_object(), Some(w.moved(targets[index])));
            assert_eq!(value.is_weak(), i % 2 == 1);
        }
    }

    let stats = w.evacuator.stats();
    assert_eq!(stats.last_slots_updated + stats.last_slots_cleared, 40 * 500);
    assert!(stats.last_workers >= 1);
}

#[test]
fn test_pool_without_threads_runs_on_caller() {
    let w = world_with(0, EvacuatorConfig::default());
    let x = w.shared(1);
    w.heap.mark_object(x);
    w.evacuate_region_of(x);
    let z = w.shared(1);
    w.store(z, 0, TaggedValue::object(x));

    w.evacuator.evacuate();

    assert_eq!(field(z, 0).load(), TaggedValue::object(w.moved(x)));
    assert_eq!(w.evacuator.stats().last_workers, 0);
}

#[test]
fn test_sequential_configuration() {
    let w = world_with(4, EvacuatorConfig { parallel_gc: false });
    let x = w.shared(1);
    w.heap.mark_object(x);
    w.evacuate_region_of(x);
    let z = w.shared(1);
    w.store(z, 0, TaggedValue::object(x));

    w.evacuator.evacuate();

    assert_eq!(field(z, 0).load(), TaggedValue::object(w.moved(x)));
    assert_eq!(w.evacuator.stats().last_workers, 0);
}

#[test]
fn test_reclaim_and_second_cycle() {
    let w = world();
    let x = w.shared(1);
    w.heap.mark_object(x);
    w.evacuate_region_of(x);
    let first_region = w.heap.region_of(x).unwrap().index();
    let z = w.shared(1);
    w.store(z, 0, TaggedValue::object(x));

    w.evacuator.evacuate();
    let x1 = w.moved(x);
    assert_eq!(w.heap.reclaim_collect_set(), w.heap.region_size());
    assert_eq!(w.heap.region(first_region).space(), RegionSpace::Free);

    // Marking and barriers rebuild the remembered sets for the next cycle
    w.log.clear();
    w.heap.mark_object(x1);
    w.heap.record_slot(field(z, 0));
    w.evacuate_region_of(x1);

    w.evacuator.evacuate();
    let x2 = w.moved(x1);
    assert_ne!(x2, x1);
    assert_eq!(field(z, 0).load(), TaggedValue::object(x2));
    assert_eq!(w.evacuator.stats().cycles, 2);
}

#[test]
fn test_marks_do_not_survive_into_next_cycle() {
    let w = world();
    let x = w.shared(1);
    w.heap.mark_object(x);
    w.evacuate_region_of(x);
    // Allocated after its region left the allocator, so d sits elsewhere
    let d = w.shared(1);
    w.heap.mark_object(d);
    let d_region = w.heap.region_of(d).unwrap();
    assert!(!d_region.in_collect_set());

    w.evacuator.evacuate();
    assert!(w.log.new_address(d).is_none());
    assert!(d_region.marked_bits().is_empty());
    assert_eq!(d_region.live_bytes(), 0);

    // d is not reached by the second cycle's marking
    w.log.clear();
    w.evacuate_region_of(d);
    let z = w.shared(1);
    w.store(z, 0, TaggedValue::weak(d));

    w.evacuator.evacuate();

    assert!(field(z, 0).load().is_hole());
    assert!(w.log.new_address(d).is_none());
    assert_eq!(state(d), HeaderState::Unmarked);
    let stats = w.evacuator.stats();
    assert_eq!(stats.last_objects_moved, 0);
    assert_eq!(stats.last_slots_cleared, 1);
}

#[test]
fn test_select_collect_set_then_evacuate() {
    let w = world();
    let dense = w.shared(500);
    let sparse = w.shared(10);
    let _garbage = w.shared(200);
    w.heap.mark_object(dense);
    w.heap.mark_object(sparse);
    let z = w.shared(1);
    w.store(z, 0, TaggedValue::object(sparse));

    // z landed in the sparse region too; it is unmarked and dies
    assert_eq!(w.heap.select_collect_set(), 1);
    assert!(w.heap.region_of(sparse).unwrap().in_collect_set());
    assert!(!w.heap.region_of(dense).unwrap().in_collect_set());

    let holder = w.shared(1);
    w.store(holder, 0, TaggedValue::object(sparse));

    w.evacuator.evacuate();

    assert_eq!(field(holder, 0).load(), TaggedValue::object(w.moved(sparse)));
    assert!(w.log.new_address(dense).is_none());
    assert!(w.log.new_address(z).is_none());
}
