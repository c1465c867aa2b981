//! # Otter shared heap collector
//!
//! Evacuation and reference fix-up for the heap shared by every Otter
//! execution context.
//!
//! ## Design
//!
//! - **Regions**: fixed-size, size-aligned blocks of one arena; shared old
//!   space, compress space and thread-local heaps are all made of regions
//! - **Remembered sets**: per-region bitmaps of slots pointing from a local
//!   heap into the shared heap, or across shared regions
//! - **Evacuation**: a single-threaded copy of the collect set followed by a
//!   parallel fix-up of remembered slots and roots
//!
//! Marking, collection triggering and the mutation barrier live outside this
//! crate; [`SharedHeap::mark_object`] and [`SharedHeap::record_slot`] are
//! their entry points.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod bitset;
pub mod error;
pub mod evacuator;
pub mod heap;
pub mod hooks;
pub mod object;
pub mod region;
pub mod resolver;
pub mod roots;
pub mod taskpool;
pub mod thread;
pub mod value;
pub mod workload;

pub use allocator::BumpAllocator;
pub use error::{GcError, GcResult};
pub use evacuator::{CopySummary, EvacuationStats, Evacuator, EvacuatorConfig, FixupSummary};
pub use heap::{HeapConfig, SharedHeap};
pub use hooks::{MoveListener, MoveLog, NoopMoveListener};
pub use object::{
    BodyVisitor, ClassId, ClassKind, ClassTable, HEADER_SIZE, HeaderState, ObjectHeader,
    ObjectModel, Representation,
};
pub use region::{Region, RegionArena, RegionSpace, ThreadId};
pub use resolver::{FixupCounts, ReferenceResolver, SlotOutcome};
pub use roots::{RootHandle, RootProvider, RootStack, RootVisitor};
pub use taskpool::{Task, TaskPool, Taskpool};
pub use thread::{MutatorThread, ThreadState};
pub use value::{Address, Reference, Slot, TaggedValue, WORD_SIZE};
pub use workload::{WorkerGuard, Workload, WorkloadQueue, update_thread_count};
