//! Reference fix-up after the copy phase
//!
//! Every slot that may point into the collect set is resolved the same
//! way, whether it came from a remembered set or from a root:
//!
//! 1. not a heap reference: nothing to do
//! 2. referent outside the collect set: nothing to do
//! 3. referent forwarded: rewrite to the new address, keeping weakness
//! 4. referent not forwarded (dead): clear the slot
//!
//! [`FieldRecorder`] runs during the copy phase and fills the remembered
//! sets that make step 3 reach the slots of freshly copied objects.

use std::ops::AddAssign;

use crate::heap::SharedHeap;
use crate::object::{BodyVisitor, HeaderState, ObjectHeader, Representation};
use crate::region::Region;
use crate::roots::RootVisitor;
use crate::value::{Address, Reference, Slot, TaggedValue};
use crate::workload::Workload;

/// What resolving a slot did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Slot left as it was
    Untouched,
    /// Slot rewritten to the forwarded address
    Forwarded,
    /// Slot cleared because its referent died
    Cleared,
}

/// Slot counts of a fix-up pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixupCounts {
    /// Slots rewritten to a new address
    pub slots_updated: usize,
    /// Slots cleared
    pub slots_cleared: usize,
}

impl FixupCounts {
    #[inline]
    fn record(&mut self, outcome: SlotOutcome) {
        match outcome {
            SlotOutcome::Untouched => {}
            SlotOutcome::Forwarded => self.slots_updated += 1,
            SlotOutcome::Cleared => self.slots_cleared += 1,
        }
    }
}

impl AddAssign for FixupCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.slots_updated += rhs.slots_updated;
        self.slots_cleared += rhs.slots_cleared;
    }
}

/// Resolves slots against the forwarding state of the collect set.
///
/// Only valid between the end of the copy phase and
/// [`SharedHeap::reclaim_collect_set`]: forwarding entries live in the old
/// headers of collect-set objects.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceResolver<'h> {
    heap: &'h SharedHeap,
}

impl<'h> ReferenceResolver<'h> {
    /// Create a resolver over `heap`
    pub fn new(heap: &'h SharedHeap) -> Self {
        Self { heap }
    }

    /// Relocation state of `object` if it lies in the collect set
    #[inline]
    fn collect_set_state(&self, object: Address) -> Option<HeaderState> {
        let region = self.heap.region_of(object)?;
        if !region.in_collect_set() {
            return None;
        }
        // SAFETY: collect-set objects stay readable until the region is reclaimed
        Some(unsafe { ObjectHeader::at(object) }.state())
    }

    /// New address of `object` if it was evacuated, `None` if it did not move
    pub fn forwarded(&self, object: Address) -> Option<Address> {
        match self.collect_set_state(object)? {
            HeaderState::Forwarded(to) => Some(to),
            HeaderState::Unmarked => None,
        }
    }

    /// Resolve one slot
    pub fn update_slot(&self, slot: Slot) -> SlotOutcome {
        let (object, weak) = match slot.load().decode() {
            Reference::Strong(addr) => (addr, false),
            Reference::Weak(addr) => (addr, true),
            Reference::Empty | Reference::Primitive(_) => return SlotOutcome::Untouched,
        };

        match self.collect_set_state(object) {
            None => SlotOutcome::Untouched,
            Some(HeaderState::Forwarded(to)) => {
                let updated = if weak {
                    Reference::Weak(to)
                } else {
                    Reference::Strong(to)
                };
                slot.store(updated.encode());
                SlotOutcome::Forwarded
            }
            Some(HeaderState::Unmarked) => {
                slot.store(TaggedValue::HOLE);
                SlotOutcome::Cleared
            }
        }
    }

    /// Drain the remembered set named by `workload` and resolve every slot
    pub fn process_workload(&self, workload: Workload) -> FixupCounts {
        let mut counts = FixupCounts::default();
        let region = self.heap.region(workload.region());
        let slots = match workload {
            Workload::LocalToShare(_) => region.drain_local_to_share(),
            Workload::CrossRegion(_) => region.drain_cross_region(),
        };
        for addr in slots {
            // SAFETY: remembered bits name word aligned slots inside the region
            let slot = unsafe { Slot::at(addr) };
            counts.record(self.update_slot(slot));
        }
        counts
    }
}

/// Root visitor rewriting roots through a [`ReferenceResolver`]
#[derive(Debug)]
pub struct RootFixup<'r, 'h> {
    resolver: &'r ReferenceResolver<'h>,
    counts: FixupCounts,
}

impl<'r, 'h> RootFixup<'r, 'h> {
    /// Create a visitor resolving through `resolver`
    pub fn new(resolver: &'r ReferenceResolver<'h>) -> Self {
        Self {
            resolver,
            counts: FixupCounts::default(),
        }
    }

    /// Counts accumulated so far
    pub fn counts(&self) -> FixupCounts {
        self.counts
    }
}

impl RootVisitor for RootFixup<'_, '_> {
    fn visit_root(&mut self, slot: Slot) {
        self.counts.record(self.resolver.update_slot(slot));
    }

    fn visit_range_roots(&mut self, start: Slot, end: Slot) {
        let mut slot = start;
        while slot != end {
            self.counts.record(self.resolver.update_slot(slot));
            slot = slot.next();
        }
    }

    fn visit_base_and_derived(&mut self, _base: Slot, derived: Slot, base_old: TaggedValue) {
        let Some(old_base) = base_old.heap_object() else {
            return;
        };
        let Some(new_base) = self.resolver.forwarded(old_base) else {
            return;
        };
        let offset = derived.load_raw().wrapping_sub(old_base.as_usize());
        derived.store_raw(new_base.as_usize().wrapping_add(offset));
        self.counts.slots_updated += 1;
    }
}

/// Body visitor run over each fresh copy: remembers every field still
/// pointing into the collect set in the copy's cross-region bits.
pub struct FieldRecorder<'h> {
    heap: &'h SharedHeap,
    holder: &'h Region,
    recorded: usize,
}

impl<'h> FieldRecorder<'h> {
    /// Recorder for fields of objects living in `holder`
    pub fn new(heap: &'h SharedHeap, holder: &'h Region) -> Self {
        Self {
            heap,
            holder,
            recorded: 0,
        }
    }

    /// Number of slots recorded
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    #[inline]
    fn record(&mut self, slot: Slot) {
        let Some(target) = slot.load().heap_object() else {
            return;
        };
        if self
            .heap
            .region_of(target)
            .is_some_and(|region| region.in_collect_set())
        {
            self.holder.insert_cross_region_bit(slot.address());
            self.recorded += 1;
        }
    }
}

impl BodyVisitor for FieldRecorder<'_> {
    fn visit_range(&mut self, start: Slot, end: Slot) {
        let mut slot = start;
        while slot != end {
            self.record(slot);
            slot = slot.next();
        }
    }

    fn visit_in_object_properties(&mut self, start: Slot, layout: &[Representation]) {
        let mut slot = start;
        for repr in layout {
            if repr.is_tagged() {
                self.record(slot);
            }
            slot = slot.next();
        }
    }
}
