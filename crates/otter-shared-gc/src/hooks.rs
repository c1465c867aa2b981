//! Object move notifications
//!
//! Heap profilers and snapshot tools track object identity across
//! evacuation. The evacuator calls its [`MoveListener`] once per relocated
//! object, right after the bytes are copied.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::value::Address;

/// Receives object relocations
pub trait MoveListener: Send + Sync {
    /// `size` bytes moved from `from` to `to`
    fn on_object_moved(&self, from: Address, to: Address, size: usize);
}

/// Listener that ignores every move
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMoveListener;

impl MoveListener for NoopMoveListener {
    #[inline]
    fn on_object_moved(&self, _from: Address, _to: Address, _size: usize) {}
}

/// Records every move of a cycle, keyed by old address
#[derive(Debug, Default)]
pub struct MoveLog {
    moves: Mutex<FxHashMap<Address, (Address, usize)>>,
}

impl MoveLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// New address of the object that lived at `from`
    pub fn new_address(&self, from: Address) -> Option<Address> {
        self.moves.lock().get(&from).map(|&(to, _)| to)
    }

    /// Number of recorded moves
    pub fn len(&self) -> usize {
        self.moves.lock().len()
    }

    /// Check if nothing moved
    pub fn is_empty(&self) -> bool {
        self.moves.lock().is_empty()
    }

    /// Total bytes moved
    pub fn total_bytes(&self) -> usize {
        self.moves.lock().values().map(|&(_, size)| size).sum()
    }

    /// Forget recorded moves (start of a new cycle)
    pub fn clear(&self) {
        self.moves.lock().clear();
    }
}

impl MoveListener for MoveLog {
    fn on_object_moved(&self, from: Address, to: Address, size: usize) {
        self.moves.lock().insert(from, (to, size));
    }
}
