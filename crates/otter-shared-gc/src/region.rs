//! Fixed-size heap regions
//!
//! All regions, shared or thread-local, are carved out of one
//! [`RegionArena`]. The arena is aligned to the region size, so mapping an
//! address to its region is a subtraction and a shift.
//!
//! ```text
//! arena base (aligned to region_size)
//! ┌────────────┬────────────┬────────────┬─────
//! │ region 0   │ region 1   │ region 2   │ ...
//! └────────────┴────────────┴────────────┴─────
//! region_of(addr) = regions[(addr - base) >> region_size_log2]
//! ```

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bitset::{Drain, RegionBitSet};
use crate::error::{GcError, GcResult};
use crate::value::{Address, WORD_SIZE};

/// Identifier of a mutator thread owning a local heap
pub type ThreadId = usize;

/// Space a region currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSpace {
    /// In the arena free list
    Free,
    /// Shared heap old space
    SharedOld,
    /// Shared heap compaction (evacuation destination) space
    SharedCompress,
    /// Local heap of a mutator thread
    Local(ThreadId),
}

impl RegionSpace {
    /// Regions of these spaces belong to the shared heap
    #[inline]
    pub fn is_shared(self) -> bool {
        matches!(self, RegionSpace::SharedOld | RegionSpace::SharedCompress)
    }

    fn code(self) -> u8 {
        match self {
            RegionSpace::Free => 0,
            RegionSpace::SharedOld => 1,
            RegionSpace::SharedCompress => 2,
            RegionSpace::Local(_) => 3,
        }
    }
}

/// Region flag bits
pub mod flags {
    /// Region is being evacuated this cycle
    pub const IN_COLLECT_SET: u8 = 1 << 0;
    /// Region belongs to the shared heap
    pub const IN_SHARED_HEAP: u8 = 1 << 1;
}

/// One fixed-size, size-aligned block of heap memory.
pub struct Region {
    index: usize,
    begin: Address,
    size: usize,
    flags: AtomicU8,
    space: AtomicU8,
    owner: AtomicUsize,
    /// Bump allocation top
    top: AtomicUsize,
    committed_bytes: AtomicUsize,
    live_bytes: AtomicUsize,
    marked_bits: RegionBitSet,
    local_to_share_bits: RegionBitSet,
    cross_region_bits: RegionBitSet,
}

impl Region {
    fn new(index: usize, begin: Address, size: usize) -> Self {
        Self {
            index,
            begin,
            size,
            flags: AtomicU8::new(0),
            space: AtomicU8::new(RegionSpace::Free.code()),
            owner: AtomicUsize::new(0),
            top: AtomicUsize::new(begin.as_usize()),
            committed_bytes: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            marked_bits: RegionBitSet::new(size),
            local_to_share_bits: RegionBitSet::new(size),
            cross_region_bits: RegionBitSet::new(size),
        }
    }

    /// Index in the arena
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// First address
    #[inline]
    pub fn begin(&self) -> Address {
        self.begin
    }

    /// One past the last address
    #[inline]
    pub fn end(&self) -> Address {
        self.begin.offset(self.size)
    }

    /// Region size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if `addr` lies in this region
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.end()
    }

    /// Current space
    pub fn space(&self) -> RegionSpace {
        match self.space.load(Ordering::Acquire) {
            1 => RegionSpace::SharedOld,
            2 => RegionSpace::SharedCompress,
            3 => RegionSpace::Local(self.owner.load(Ordering::Acquire)),
            _ => RegionSpace::Free,
        }
    }

    pub(crate) fn set_space(&self, space: RegionSpace) {
        if let RegionSpace::Local(owner) = space {
            self.owner.store(owner, Ordering::Release);
        }
        self.space.store(space.code(), Ordering::Release);
        if space.is_shared() {
            self.flags.fetch_or(flags::IN_SHARED_HEAP, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flags::IN_SHARED_HEAP, Ordering::AcqRel);
        }
    }

    /// Is the region being evacuated this cycle
    #[inline]
    pub fn in_collect_set(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flags::IN_COLLECT_SET != 0
    }

    pub(crate) fn set_in_collect_set(&self, value: bool) {
        if value {
            self.flags.fetch_or(flags::IN_COLLECT_SET, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flags::IN_COLLECT_SET, Ordering::AcqRel);
        }
    }

    /// Does the region belong to the shared heap
    #[inline]
    pub fn in_shared_heap(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flags::IN_SHARED_HEAP != 0
    }

    /// Bump allocation top
    #[inline]
    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    /// Bump-allocate `size` bytes (word aligned) in this region
    pub fn allocate(&self, size: usize) -> Option<Address> {
        let size = size.next_multiple_of(WORD_SIZE);
        let end = self.end().as_usize();
        let start = self
            .top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                top.checked_add(size).filter(|&new_top| new_top <= end)
            })
            .ok()?;
        self.committed_bytes.fetch_add(size, Ordering::Relaxed);
        Some(Address::new(start))
    }

    /// Bytes handed out by the allocator and not yet evacuated
    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes.load(Ordering::Relaxed)
    }

    /// Bytes of marked objects
    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Forget the marks and live bytes of the previous cycle
    pub(crate) fn clear_marks(&self) {
        self.marked_bits.clear();
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    /// Deduct an evacuated object from the live and committed counters
    pub(crate) fn deduct_evacuated(&self, bytes: usize) {
        let saturating = |v: usize| Some(v.saturating_sub(bytes));
        let _ = self
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, saturating);
        let _ = self
            .committed_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, saturating);
    }

    #[inline]
    fn offset_of(&self, addr: Address) -> usize {
        assert!(
            self.contains(addr),
            "address {addr} outside region {} [{}, {})",
            self.index,
            self.begin,
            self.end()
        );
        addr.offset_from(self.begin)
    }

    /// Record `object` as live. Returns true if it was not marked yet.
    pub fn mark(&self, object: Address) -> bool {
        self.marked_bits.insert(self.offset_of(object))
    }

    /// Check if `object` is marked live
    pub fn is_marked(&self, object: Address) -> bool {
        self.marked_bits.contains(self.offset_of(object))
    }

    /// Marked objects in ascending order; consumes the marks
    pub fn drain_marked(&self) -> Drain<'_> {
        self.marked_bits.drain(self.begin)
    }

    /// Remember a slot in this region that points into the shared heap
    pub fn insert_local_to_share_bit(&self, slot: Address) -> bool {
        self.local_to_share_bits.insert(self.offset_of(slot))
    }

    /// Remembered local-to-share slots; consumes the bits
    pub fn drain_local_to_share(&self) -> Drain<'_> {
        self.local_to_share_bits.drain(self.begin)
    }

    /// Remember a slot in this region that points into another region
    pub fn insert_cross_region_bit(&self, slot: Address) -> bool {
        self.cross_region_bits.insert(self.offset_of(slot))
    }

    /// Remembered cross-region slots; consumes the bits
    pub fn drain_cross_region(&self) -> Drain<'_> {
        self.cross_region_bits.drain(self.begin)
    }

    /// Local-to-share remembered set
    pub fn local_to_share_bits(&self) -> &RegionBitSet {
        &self.local_to_share_bits
    }

    /// Cross-region remembered set
    pub fn cross_region_bits(&self) -> &RegionBitSet {
        &self.cross_region_bits
    }

    /// Mark bitmap
    pub fn marked_bits(&self) -> &RegionBitSet {
        &self.marked_bits
    }

    /// Forget everything; the region goes back to the free list
    fn reset(&self) {
        self.flags.store(0, Ordering::Release);
        self.space.store(RegionSpace::Free.code(), Ordering::Release);
        self.owner.store(0, Ordering::Release);
        self.top.store(self.begin.as_usize(), Ordering::Release);
        self.committed_bytes.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.marked_bits.clear();
        self.local_to_share_bits.clear();
        self.cross_region_bits.clear();
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("index", &self.index)
            .field("begin", &self.begin)
            .field("space", &self.space())
            .field("in_collect_set", &self.in_collect_set())
            .field("committed_bytes", &self.committed_bytes())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

/// Reservation of `count` regions of `1 << region_size_log2` bytes each.
pub struct RegionArena {
    base: NonNull<u8>,
    layout: Layout,
    region_size_log2: u32,
    regions: Box<[Region]>,
    /// Free region indices, highest first so `pop` hands out low addresses
    free: Mutex<Vec<usize>>,
}

// SAFETY: the arena memory is only reached through Region and Slot
// accessors, which use atomic word operations; the free list is locked.
unsafe impl Send for RegionArena {}
unsafe impl Sync for RegionArena {}

impl RegionArena {
    /// Reserve and zero the arena
    pub fn new(region_size_log2: u32, count: usize) -> GcResult<Self> {
        let region_size = 1usize << region_size_log2;
        let bytes = region_size
            .checked_mul(count)
            .ok_or(GcError::ArenaReservation { bytes: usize::MAX })?;
        if bytes == 0 {
            return Err(GcError::InvalidConfig("arena must hold at least one region"));
        }
        let layout = Layout::from_size_align(bytes, region_size)
            .map_err(|_| GcError::ArenaReservation { bytes })?;
        // SAFETY: layout has non-zero size
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(GcError::ArenaReservation { bytes })?;

        let base_addr = Address::from_ptr(base.as_ptr());
        let regions = (0..count)
            .map(|i| Region::new(i, base_addr.offset(i * region_size), region_size))
            .collect();

        Ok(Self {
            base,
            layout,
            region_size_log2,
            regions,
            free: Mutex::new((0..count).rev().collect()),
        })
    }

    /// Region size in bytes
    #[inline]
    pub fn region_size(&self) -> usize {
        1 << self.region_size_log2
    }

    /// First arena address
    #[inline]
    pub fn base(&self) -> Address {
        Address::from_ptr(self.base.as_ptr())
    }

    /// Region containing `addr`, if it is a heap address
    #[inline]
    pub fn region_of(&self, addr: Address) -> Option<&Region> {
        let offset = addr.as_usize().checked_sub(self.base().as_usize())?;
        self.regions.get(offset >> self.region_size_log2)
    }

    /// Region by index
    #[inline]
    pub fn region(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    /// Total number of regions
    pub fn capacity(&self) -> usize {
        self.regions.len()
    }

    /// Number of regions in the free list
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Take a zeroed region from the free list for `space`
    pub fn take(&self, space: RegionSpace) -> Option<&Region> {
        let index = self.free.lock().pop()?;
        let region = &self.regions[index];
        // SAFETY: the region is free, nothing else references its memory
        unsafe { ptr::write_bytes(region.begin().as_ptr(), 0, region.size()) };
        region.set_space(space);
        Some(region)
    }

    /// Return a region to the free list
    pub fn release(&self, index: usize) {
        let region = &self.regions[index];
        debug_assert!(region.space() != RegionSpace::Free, "double release of region {index}");
        region.reset();
        self.free.lock().push(index);
    }
}

impl Drop for RegionArena {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}
