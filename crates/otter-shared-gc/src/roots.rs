//! Execution roots
//!
//! Roots come in three shapes: single slots, contiguous ranges of slots,
//! and base/derived pairs where the derived slot holds an untagged interior
//! pointer computed from the base object (compiled-code fast paths).

use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;

use crate::value::{Slot, TaggedValue};

/// Receives roots during enumeration.
pub trait RootVisitor {
    /// A single root slot
    fn visit_root(&mut self, slot: Slot);

    /// Every slot in `[start, end)`
    fn visit_range_roots(&mut self, start: Slot, end: Slot);

    /// An interior pointer in `derived` computed from the object that
    /// `base` held before enumeration started (`base_old`).
    fn visit_base_and_derived(&mut self, base: Slot, derived: Slot, base_old: TaggedValue);
}

/// Anything that owns roots.
pub trait RootProvider: Send + Sync {
    /// Hand every root to `visitor`
    fn iterate_roots(&self, visitor: &mut dyn RootVisitor);
}

/// Index of a root slot in a [`RootStack`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootHandle(usize);

#[derive(Debug, Clone, Copy)]
enum RootEntry {
    Single(usize),
    Range { start: usize, len: usize },
    Derived { base: usize, derived: usize },
}

#[derive(Debug, Default)]
struct RootStackState {
    len: usize,
    entries: Vec<RootEntry>,
}

/// Fixed-capacity root storage: a thread's stack roots or the shared
/// global table.
pub struct RootStack {
    slots: Box<[AtomicU64]>,
    state: Mutex<RootStackState>,
}

/// Default number of root slots per stack
pub const DEFAULT_ROOT_CAPACITY: usize = 1024;

impl RootStack {
    /// Create an empty root stack
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ROOT_CAPACITY)
    }

    /// Create an empty root stack with room for `capacity` slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            state: Mutex::new(RootStackState::default()),
        }
    }

    fn reserve(state: &mut RootStackState, count: usize, capacity: usize) -> usize {
        let start = state.len;
        assert!(start + count <= capacity, "root stack overflow");
        state.len += count;
        start
    }

    #[inline]
    fn slot(&self, index: usize) -> Slot {
        // SAFETY: slots live as long as the stack
        unsafe { Slot::from_atomic(&self.slots[index]) }
    }

    /// Push a single root
    pub fn push(&self, value: TaggedValue) -> RootHandle {
        let mut state = self.state.lock();
        let index = Self::reserve(&mut state, 1, self.slots.len());
        state.entries.push(RootEntry::Single(index));
        self.slot(index).store(value);
        RootHandle(index)
    }

    /// Push contiguous roots visited as one range; returns the first handle
    pub fn push_range(&self, values: &[TaggedValue]) -> RootHandle {
        let mut state = self.state.lock();
        let start = Self::reserve(&mut state, values.len(), self.slots.len());
        state.entries.push(RootEntry::Range {
            start,
            len: values.len(),
        });
        for (i, value) in values.iter().enumerate() {
            self.slot(start + i).store(*value);
        }
        RootHandle(start)
    }

    /// Push an interior pointer `offset` bytes into the object held by `base`
    pub fn push_derived(&self, base: RootHandle, offset: usize) -> RootHandle {
        let base_value = self.get(base);
        let mut state = self.state.lock();
        let index = Self::reserve(&mut state, 1, self.slots.len());
        state.entries.push(RootEntry::Derived {
            base: base.0,
            derived: index,
        });
        let raw = base_value.heap_object().map_or(0, |a| a.as_usize()) + offset;
        self.slot(index).store_raw(raw);
        RootHandle(index)
    }

    /// Nth slot after a range handle
    pub fn range_element(&self, start: RootHandle, index: usize) -> RootHandle {
        RootHandle(start.0 + index)
    }

    /// Read a root
    pub fn get(&self, handle: RootHandle) -> TaggedValue {
        self.slot(handle.0).load()
    }

    /// Overwrite a root
    pub fn set(&self, handle: RootHandle, value: TaggedValue) {
        self.slot(handle.0).store(value);
    }

    /// Read a derived (untagged) root
    pub fn get_raw(&self, handle: RootHandle) -> usize {
        self.slot(handle.0).load_raw()
    }

    /// Number of slots in use
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Check if no root is pushed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop every root
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for slot in &self.slots[..state.len] {
            slot.store(0, std::sync::atomic::Ordering::Relaxed);
        }
        *state = RootStackState::default();
    }
}

impl Default for RootStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RootStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RootStack")
            .field("len", &state.len)
            .field("entries", &state.entries.len())
            .finish()
    }
}

impl RootProvider for RootStack {
    fn iterate_roots(&self, visitor: &mut dyn RootVisitor) {
        let state = self.state.lock();

        // Base values are captured before any root is rewritten
        let derived: Vec<(Slot, Slot, TaggedValue)> = state
            .entries
            .iter()
            .filter_map(|entry| match *entry {
                RootEntry::Derived { base, derived } => {
                    let base_slot = self.slot(base);
                    Some((base_slot, self.slot(derived), base_slot.load()))
                }
                _ => None,
            })
            .collect();

        for entry in &state.entries {
            match *entry {
                RootEntry::Single(index) => visitor.visit_root(self.slot(index)),
                RootEntry::Range { start, len } => {
                    visitor.visit_range_roots(self.slot(start), self.slot(start).offset_words(len))
                }
                RootEntry::Derived { .. } => {}
            }
        }

        for (base, derived, base_old) in derived {
            visitor.visit_base_and_derived(base, derived, base_old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Address;

    #[derive(Default)]
    struct Recorder {
        singles: Vec<TaggedValue>,
        ranges: Vec<Vec<TaggedValue>>,
        derived: Vec<(TaggedValue, usize)>,
    }

    impl RootVisitor for Recorder {
        fn visit_root(&mut self, slot: Slot) {
            self.singles.push(slot.load());
        }

        fn visit_range_roots(&mut self, start: Slot, end: Slot) {
            let mut values = Vec::new();
            let mut slot = start;
            while slot != end {
                values.push(slot.load());
                slot = slot.next();
            }
            self.ranges.push(values);
        }

        fn visit_base_and_derived(&mut self, _base: Slot, derived: Slot, base_old: TaggedValue) {
            self.derived.push((base_old, derived.load_raw()));
        }
    }

    #[test]
    fn test_push_and_iterate() {
        let roots = RootStack::with_capacity(16);
        let obj = Address::new(0x8000);
        let base = roots.push(TaggedValue::object(obj));
        roots.push(TaggedValue::int(3));
        roots.push_range(&[TaggedValue::NULL, TaggedValue::weak(obj)]);
        let derived = roots.push_derived(base, 24);

        assert_eq!(roots.len(), 5);
        assert_eq!(roots.get_raw(derived), 0x8018);

        let mut recorder = Recorder::default();
        roots.iterate_roots(&mut recorder);
        assert_eq!(
            recorder.singles,
            vec![TaggedValue::object(obj), TaggedValue::int(3)]
        );
        assert_eq!(
            recorder.ranges,
            vec![vec![TaggedValue::NULL, TaggedValue::weak(obj)]]
        );
        assert_eq!(recorder.derived, vec![(TaggedValue::object(obj), 0x8018)]);
    }

    #[test]
    fn test_clear() {
        let roots = RootStack::with_capacity(4);
        roots.push(TaggedValue::TRUE);
        roots.clear();
        assert!(roots.is_empty());
        let handle = roots.push(TaggedValue::FALSE);
        assert_eq!(roots.get(handle), TaggedValue::FALSE);
    }

    #[test]
    #[should_panic(expected = "root stack overflow")]
    fn test_overflow_panics() {
        let roots = RootStack::with_capacity(1);
        roots.push(TaggedValue::TRUE);
        roots.push(TaggedValue::TRUE);
    }
}
