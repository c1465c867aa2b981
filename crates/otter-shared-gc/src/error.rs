//! Error types for the shared-heap collector
//!
//! Construction errors are returned to the caller. Errors raised once
//! evacuation has started are never recovered: earlier fix-ups may already
//! assume later objects have moved, so they end in [`fatal`].

use thiserror::Error;

use crate::value::Address;

/// Errors produced by the shared heap and the evacuator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// Heap configuration rejected by validation
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),

    /// The region arena could not be reserved
    #[error("failed to reserve {bytes} bytes for the region arena")]
    ArenaReservation {
        /// Requested arena size
        bytes: usize,
    },

    /// The compaction space cannot hold a copy of a live object
    #[error("compaction space exhausted copying {size} bytes from {from}")]
    AllocationExhausted {
        /// Size of the object being evacuated
        size: usize,
        /// Old address of the object
        from: Address,
    },

    /// The copy destination is not a valid heap range
    #[error("failed to copy {size} bytes from {from} to {to}")]
    CopyFailed {
        /// Old address of the object
        from: Address,
        /// Destination returned by the allocator
        to: Address,
        /// Number of bytes to copy
        size: usize,
    },
}

/// Result alias for collector operations
pub type GcResult<T> = Result<T, GcError>;

/// Log a fatal collector error and abort the process.
pub fn fatal(err: &GcError) -> ! {
    tracing::error!(target: "otter::gc", error = %err, "fatal error during shared heap evacuation");
    std::process::abort()
}
