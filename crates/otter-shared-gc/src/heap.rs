//! Shared heap management
//!
//! The shared heap owns the region arena and sorts its regions into spaces:
//!
//! * old space: where shared objects live and are allocated,
//! * compress space: evacuation destinations of the running cycle,
//! * collect set: old-space regions chosen for evacuation.
//!
//! Local regions belong to their [`MutatorThread`]; the heap only keeps the
//! thread registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::allocator::BumpAllocator;
use crate::error::{GcError, GcResult};
use crate::object::{ClassId, ObjectHeader, ObjectModel};
use crate::region::{Region, RegionArena, RegionSpace, ThreadId};
use crate::roots::{RootProvider, RootStack};
use crate::thread::MutatorThread;
use crate::value::{Address, Slot};

/// Smallest accepted region size (4 KiB)
pub const MIN_REGION_SIZE_LOG2: u32 = 12;
/// Largest accepted region size (16 MiB)
pub const MAX_REGION_SIZE_LOG2: u32 = 24;

/// Shared heap configuration
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// log2 of the region size (default: 18, 256 KiB)
    pub region_size_log2: u32,
    /// Number of regions in the arena (default: 256)
    pub max_regions: usize,
    /// Old-space regions whose live/committed ratio is below this are
    /// evacuated by [`SharedHeap::select_collect_set`] (default: 0.75)
    pub collect_set_live_ratio: f64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_size_log2: 18,
            max_regions: 256,
            collect_set_live_ratio: 0.75,
        }
    }
}

impl HeapConfig {
    /// Region size in bytes
    pub fn region_size(&self) -> usize {
        1 << self.region_size_log2
    }

    /// Check the configuration
    pub fn validate(&self) -> GcResult<()> {
        if self.region_size_log2 < MIN_REGION_SIZE_LOG2 {
            return Err(GcError::InvalidConfig("region size below 4 KiB"));
        }
        if self.region_size_log2 > MAX_REGION_SIZE_LOG2 {
            return Err(GcError::InvalidConfig("region size above 16 MiB"));
        }
        if self.max_regions == 0 {
            return Err(GcError::InvalidConfig("max_regions must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.collect_set_live_ratio) {
            return Err(GcError::InvalidConfig(
                "collect_set_live_ratio must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

/// The heap shared by every mutator thread
pub struct SharedHeap {
    config: HeapConfig,
    model: Arc<dyn ObjectModel>,
    arena: RegionArena,
    old_space: RwLock<Vec<usize>>,
    compress_space: RwLock<Vec<usize>>,
    collect_set: RwLock<Vec<usize>>,
    /// Allocation buffer for shared objects
    old_allocator: Mutex<BumpAllocator>,
    threads: RwLock<Vec<Arc<MutatorThread>>>,
    next_thread_id: AtomicUsize,
    shared_roots: RootStack,
    root_providers: RwLock<Vec<Arc<dyn RootProvider>>>,
}

impl SharedHeap {
    /// Create a heap with `config`, reading object layouts through `model`
    pub fn new(config: HeapConfig, model: Arc<dyn ObjectModel>) -> GcResult<Arc<Self>> {
        config.validate()?;
        let arena = RegionArena::new(config.region_size_log2, config.max_regions)?;

        tracing::debug!(
            target: "otter::gc",
            region_size = config.region_size(),
            regions = config.max_regions,
            "shared heap created"
        );

        Ok(Arc::new(Self {
            config,
            model,
            arena,
            old_space: RwLock::new(Vec::new()),
            compress_space: RwLock::new(Vec::new()),
            collect_set: RwLock::new(Vec::new()),
            old_allocator: Mutex::new(BumpAllocator::new(RegionSpace::SharedOld)),
            threads: RwLock::new(Vec::new()),
            next_thread_id: AtomicUsize::new(0),
            shared_roots: RootStack::new(),
            root_providers: RwLock::new(Vec::new()),
        }))
    }

    /// Heap configuration
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Object layout introspection
    pub fn model(&self) -> &dyn ObjectModel {
        &*self.model
    }

    /// Underlying region arena
    pub fn arena(&self) -> &RegionArena {
        &self.arena
    }

    /// Region size in bytes
    #[inline]
    pub fn region_size(&self) -> usize {
        self.arena.region_size()
    }

    /// Region containing `addr`, if it is a heap address
    #[inline]
    pub fn region_of(&self, addr: Address) -> Option<&Region> {
        self.arena.region_of(addr)
    }

    /// Region by index
    #[inline]
    pub fn region(&self, index: usize) -> &Region {
        self.arena.region(index)
    }

    /// Take a free region for `space`. Shared regions join the space's
    /// region list; local regions are tracked by their thread.
    pub fn expand_space(&self, space: RegionSpace) -> Option<&Region> {
        let region = self.arena.take(space)?;
        match space {
            RegionSpace::SharedOld => self.old_space.write().push(region.index()),
            RegionSpace::SharedCompress => self.compress_space.write().push(region.index()),
            RegionSpace::Local(_) | RegionSpace::Free => {}
        }
        tracing::trace!(target: "otter::gc", region = region.index(), ?space, "region taken");
        Some(region)
    }

    /// Allocate an object in the shared old space
    pub fn allocate_shared(&self, class: ClassId, length: u32) -> Option<Address> {
        let size = self.model.instance_size(class, length);
        let addr = self.old_allocator.lock().allocate(self, size)?;
        // SAFETY: freshly allocated, word aligned and zeroed
        unsafe { ObjectHeader::initialize(addr, class, length) };
        Some(addr)
    }

    /// Indices of the old-space regions
    pub fn old_space_regions(&self) -> Vec<usize> {
        self.old_space.read().clone()
    }

    /// Indices of the compress-space regions
    pub fn compress_space_regions(&self) -> Vec<usize> {
        self.compress_space.read().clone()
    }

    /// Indices of the collect-set regions
    pub fn collect_set(&self) -> Vec<usize> {
        self.collect_set.read().clone()
    }

    /// Bytes committed in the old and compress spaces
    pub fn used_bytes(&self) -> usize {
        let old = self.old_space.read();
        let compress = self.compress_space.read();
        old.iter()
            .chain(compress.iter())
            .map(|&i| self.region(i).committed_bytes())
            .sum()
    }

    /// Mark a shared object live. Returns true if it was not marked yet.
    pub fn mark_object(&self, object: Address) -> bool {
        let region = match self.region_of(object) {
            Some(region) if region.in_shared_heap() => region,
            _ => panic!("mark of {object} outside the shared heap"),
        };
        if !region.mark(object) {
            return false;
        }
        region.add_live_bytes(self.model.size_of(object));
        true
    }

    /// Drop the marks and live bytes of every shared region. Marks are only
    /// valid for the cycle that set them.
    pub fn clear_marks(&self) {
        let old = self.old_space.read();
        let compress = self.compress_space.read();
        let collect = self.collect_set.read();
        for &index in old.iter().chain(compress.iter()).chain(collect.iter()) {
            self.region(index).clear_marks();
        }
    }

    /// Move an old-space region into the collect set
    pub fn add_to_collect_set(&self, index: usize) {
        let region = self.region(index);
        assert_eq!(
            region.space(),
            RegionSpace::SharedOld,
            "region {index} is not in the old space"
        );
        assert!(!region.in_collect_set(), "region {index} already in the collect set");

        self.old_space.write().retain(|&i| i != index);
        region.set_in_collect_set(true);
        self.collect_set.write().push(index);

        // Shared allocation must not continue in a region being evacuated
        let mut allocator = self.old_allocator.lock();
        if allocator.current_region() == Some(index) {
            allocator.reset();
        }
    }

    /// Put every sparse old-space region into the collect set; returns the
    /// number of regions chosen.
    pub fn select_collect_set(&self) -> usize {
        let ratio = self.config.collect_set_live_ratio;
        let candidates: Vec<usize> = self
            .old_space
            .read()
            .iter()
            .copied()
            .filter(|&i| {
                let region = self.region(i);
                let committed = region.committed_bytes();
                committed > 0 && (region.live_bytes() as f64) < committed as f64 * ratio
            })
            .collect();

        for &index in &candidates {
            self.add_to_collect_set(index);
        }

        tracing::debug!(
            target: "otter::gc",
            regions = candidates.len(),
            ratio,
            "collect set selected"
        );
        candidates.len()
    }

    /// Move every compress-space region into the old space
    pub fn merge_compress_space(&self) -> usize {
        let merged = std::mem::take(&mut *self.compress_space.write());
        for &index in &merged {
            self.region(index).set_space(RegionSpace::SharedOld);
        }
        let count = merged.len();
        self.old_space.write().extend(merged);
        count
    }

    /// Remember `slot` in the right remembered set for the reference it
    /// now holds. Returns true if a bit was recorded.
    pub fn record_slot(&self, slot: Slot) -> bool {
        let Some(target) = slot
            .load()
            .heap_object()
            .and_then(|addr| self.region_of(addr))
        else {
            return false;
        };
        if !target.in_shared_heap() {
            return false;
        }
        let Some(holder) = self.region_of(slot.address()) else {
            return false;
        };

        match holder.space() {
            RegionSpace::Local(_) => holder.insert_local_to_share_bit(slot.address()),
            space if space.is_shared() && holder.index() != target.index() => {
                holder.insert_cross_region_bit(slot.address())
            }
            _ => false,
        }
    }

    /// Return the evacuated collect-set regions to the arena; returns the
    /// number of bytes freed.
    pub fn reclaim_collect_set(&self) -> usize {
        let regions = std::mem::take(&mut *self.collect_set.write());
        let mut bytes = 0;
        for index in regions {
            bytes += self.region(index).size();
            self.arena.release(index);
        }
        tracing::debug!(target: "otter::gc", bytes, "collect set reclaimed");
        bytes
    }

    /// Register a new mutator thread
    pub fn register_thread(&self) -> Arc<MutatorThread> {
        let id: ThreadId = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(MutatorThread::new(id));
        self.threads.write().push(Arc::clone(&thread));
        tracing::debug!(target: "otter::gc", thread = id, "mutator registered");
        thread
    }

    /// Unregister a thread and free its local heap
    pub fn unregister_thread(&self, id: ThreadId) {
        let removed = {
            let mut threads = self.threads.write();
            let position = threads.iter().position(|t| t.id() == id);
            position.map(|p| threads.remove(p))
        };
        if let Some(thread) = removed {
            for index in thread.take_local_regions() {
                self.arena.release(index);
            }
            tracing::debug!(target: "otter::gc", thread = id, "mutator unregistered");
        }
    }

    /// Snapshot of the registered threads
    pub fn threads(&self) -> Vec<Arc<MutatorThread>> {
        self.threads.read().clone()
    }

    /// Check if every registered thread is suspended
    pub fn all_threads_suspended(&self) -> bool {
        self.threads.read().iter().all(|t| t.is_suspended())
    }

    /// Global roots not owned by any thread
    pub fn shared_roots(&self) -> &RootStack {
        &self.shared_roots
    }

    /// Add an extra root source (handle tables, embedder globals)
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.root_providers.write().push(provider);
    }

    /// Extra root sources
    pub fn root_providers(&self) -> Vec<Arc<dyn RootProvider>> {
        self.root_providers.read().clone()
    }
}

impl std::fmt::Debug for SharedHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHeap")
            .field("config", &self.config)
            .field("old_space", &self.old_space.read().len())
            .field("compress_space", &self.compress_space.read().len())
            .field("collect_set", &self.collect_set.read().len())
            .field("threads", &self.threads.read().len())
            .finish()
    }
}
