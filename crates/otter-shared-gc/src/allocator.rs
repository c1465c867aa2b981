//! Bump allocation over heap regions
//!
//! A [`BumpAllocator`] is a thread/task-local allocation buffer: it bumps
//! inside its current region and asks the heap for a fresh region of its
//! space when that one is full. The evacuator uses one over the compaction
//! space; mutator threads use one over their local heap.

use crate::heap::SharedHeap;
use crate::region::RegionSpace;
use crate::value::{Address, WORD_SIZE};

/// Region-backed bump allocator
#[derive(Debug)]
pub struct BumpAllocator {
    space: RegionSpace,
    /// Region currently bumped into
    current: Option<usize>,
}

impl BumpAllocator {
    /// Create an allocator for regions of `space`
    pub fn new(space: RegionSpace) -> Self {
        Self {
            space,
            current: None,
        }
    }

    /// Space this allocator fills
    pub fn space(&self) -> RegionSpace {
        self.space
    }

    /// Region currently bumped into
    pub fn current_region(&self) -> Option<usize> {
        self.current
    }

    /// Allocate `size` bytes (rounded up to a word).
    ///
    /// Returns `None` when the object cannot fit in a region or the heap has
    /// no free region left.
    pub fn allocate(&mut self, heap: &SharedHeap, size: usize) -> Option<Address> {
        let size = size.next_multiple_of(WORD_SIZE);

        if let Some(index) = self.current {
            if let Some(addr) = heap.region(index).allocate(size) {
                return Some(addr);
            }
        }

        if size > heap.region_size() {
            return None;
        }

        let region = heap.expand_space(self.space)?;
        self.current = Some(region.index());
        region.allocate(size)
    }

    /// Drop the current region (after a GC or when the buffer is retired)
    pub fn reset(&mut self) {
        self.current = None;
    }
}
