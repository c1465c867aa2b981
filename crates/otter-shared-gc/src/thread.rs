//! Mutator threads and their local heaps
//!
//! Every execution context owns a local heap (regions only it allocates in)
//! and a root stack. Local objects may point into the shared heap; such
//! slots are remembered in the local region's local-to-share bits. The
//! shared heap never points into a local heap.
//!
//! Evacuation requires every mutator to be suspended. A running mutator
//! reaches a safepoint with [`MutatorThread::park_at_safepoint`] once a
//! suspension was requested; a thread sitting in native code can be marked
//! [`MutatorThread::suspend`]ed directly.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::allocator::BumpAllocator;
use crate::heap::SharedHeap;
use crate::object::{ClassId, ObjectHeader};
use crate::region::{RegionSpace, ThreadId};
use crate::roots::RootStack;
use crate::value::Address;

/// Mutator execution state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Mutating the heap
    Running = 0,
    /// Asked to stop at the next safepoint
    SuspendRequested = 1,
    /// Stopped; the heap may be collected
    Suspended = 2,
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            1 => ThreadState::SuspendRequested,
            2 => ThreadState::Suspended,
            _ => ThreadState::Running,
        }
    }
}

/// Regions a thread allocates in
#[derive(Debug)]
pub struct LocalHeap {
    regions: Vec<usize>,
    allocator: BumpAllocator,
}

impl LocalHeap {
    fn new(owner: ThreadId) -> Self {
        Self {
            regions: Vec::new(),
            allocator: BumpAllocator::new(RegionSpace::Local(owner)),
        }
    }

    fn allocate(&mut self, heap: &SharedHeap, size: usize) -> Option<Address> {
        let before = self.allocator.current_region();
        let addr = self.allocator.allocate(heap, size)?;
        let current = self.allocator.current_region();
        if current != before {
            self.regions.extend(current);
        }
        Some(addr)
    }
}

/// A registered execution context
pub struct MutatorThread {
    id: ThreadId,
    state: AtomicU8,
    condvar: Condvar,
    mutex: Mutex<()>,
    local_heap: Mutex<LocalHeap>,
    roots: RootStack,
}

impl MutatorThread {
    pub(crate) fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: AtomicU8::new(ThreadState::Running as u8),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            local_heap: Mutex::new(LocalHeap::new(id)),
            roots: RootStack::new(),
        }
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    /// Check if stopped
    pub fn is_suspended(&self) -> bool {
        self.state() == ThreadState::Suspended
    }

    /// Ask the thread to stop at its next safepoint
    pub fn request_suspend(&self) {
        let _ = self.state.compare_exchange(
            ThreadState::Running as u8,
            ThreadState::SuspendRequested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Check if a suspension is pending (polled by the mutator)
    pub fn suspend_requested(&self) -> bool {
        self.state() == ThreadState::SuspendRequested
    }

    /// Mark the thread stopped without blocking (thread is in native code)
    pub fn suspend(&self) {
        let _guard = self.mutex.lock();
        self.state
            .store(ThreadState::Suspended as u8, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Called by the mutator itself: stop and wait until resumed
    pub fn park_at_safepoint(&self) {
        let mut guard = self.mutex.lock();
        self.state
            .store(ThreadState::Suspended as u8, Ordering::Release);
        self.condvar.notify_all();
        while self.state.load(Ordering::Acquire) == ThreadState::Suspended as u8 {
            self.condvar.wait(&mut guard);
        }
    }

    /// Block until the thread reports suspended
    pub fn wait_until_suspended(&self) {
        let mut guard = self.mutex.lock();
        while self.state.load(Ordering::Acquire) != ThreadState::Suspended as u8 {
            self.condvar.wait(&mut guard);
        }
    }

    /// Let the thread run again
    pub fn resume(&self) {
        let _guard = self.mutex.lock();
        self.state
            .store(ThreadState::Running as u8, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Allocate an object in this thread's local heap
    pub fn allocate(&self, heap: &SharedHeap, class: ClassId, length: u32) -> Option<Address> {
        let size = heap.model().instance_size(class, length);
        let addr = self.local_heap.lock().allocate(heap, size)?;
        // SAFETY: freshly allocated, word aligned and zeroed
        unsafe { ObjectHeader::initialize(addr, class, length) };
        Some(addr)
    }

    /// Regions of the local heap
    pub fn local_regions(&self) -> Vec<usize> {
        self.local_heap.lock().regions.clone()
    }

    /// Drop the local heap's regions (thread exit); returns them
    pub(crate) fn take_local_regions(&self) -> Vec<usize> {
        let mut local = self.local_heap.lock();
        local.allocator.reset();
        std::mem::take(&mut local.regions)
    }

    /// Stack roots
    pub fn roots(&self) -> &RootStack {
        &self.roots
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
