//! Fix-up workloads and the queue they are drained from
//!
//! One [`Workload`] is created per eligible region when the fix-up phase
//! starts. The main thread and the posted workers pop from the same
//! [`WorkloadQueue`]; the pop under the queue lock is the only point where
//! ownership of a workload is decided, so each one is processed once.
//!
//! The queue also tracks how many posted workers are still draining it.
//! [`WorkloadQueue::wait_finished`] blocks until that count is zero. Workers
//! hold a [`WorkerGuard`] so the count drops even when one panics.

use std::collections::VecDeque;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Remembered set of one region to fix up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// Local-heap region: resolve its local-to-share slots
    LocalToShare(usize),
    /// Shared old-space region: resolve its cross-region slots
    CrossRegion(usize),
}

impl Workload {
    /// Region the workload covers
    #[inline]
    pub fn region(self) -> usize {
        match self {
            Workload::LocalToShare(index) | Workload::CrossRegion(index) => index,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    workloads: VecDeque<Workload>,
    running: usize,
    panicked: bool,
}

/// Shared queue of workloads plus the outstanding-worker counter
#[derive(Debug, Default)]
pub struct WorkloadQueue {
    state: CachePadded<Mutex<QueueState>>,
    finished: Condvar,
}

impl WorkloadQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a workload
    pub fn push(&self, workload: Workload) {
        self.state.lock().workloads.push_back(workload);
    }

    /// Take the next workload, if any is left
    pub fn try_pop(&self) -> Option<Workload> {
        self.state.lock().workloads.pop_front()
    }

    /// Number of queued workloads
    pub fn len(&self) -> usize {
        self.state.lock().workloads.len()
    }

    /// Check if no workload is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count `n` workers as running. Must be called before they are posted.
    pub fn add_workers(&self, n: usize) {
        self.state.lock().running += n;
    }

    /// Number of workers still running
    pub fn running_workers(&self) -> usize {
        self.state.lock().running
    }

    /// Called by a worker once the queue is empty for it
    pub fn worker_finished(&self) {
        let mut state = self.state.lock();
        assert!(state.running > 0, "worker finished without being added");
        state.running -= 1;
        if state.running == 0 {
            self.finished.notify_all();
        }
    }

    /// Guard calling [`worker_finished`](Self::worker_finished) on drop
    pub fn worker_guard(&self) -> WorkerGuard<'_> {
        WorkerGuard { queue: self }
    }

    /// Check if a worker unwound instead of finishing normally
    pub fn worker_panicked(&self) -> bool {
        self.state.lock().panicked
    }

    /// Block until every added worker has finished
    pub fn wait_finished(&self) {
        let mut state = self.state.lock();
        while state.running != 0 {
            self.finished.wait(&mut state);
        }
    }
}

/// Finishes a worker when dropped, also on unwind
#[derive(Debug)]
pub struct WorkerGuard<'q> {
    queue: &'q WorkloadQueue,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(target: "otter::gc", "reference update worker panicked");
            self.queue.state.lock().panicked = true;
        }
        self.queue.worker_finished();
    }
}

/// Number of workers to post for `workloads` queued workloads on a pool of
/// `total_threads`: `round(workloads^(1/4))`, clamped to `1..=total_threads`.
/// A pool without threads gets none.
pub fn update_thread_count(workloads: usize, total_threads: usize) -> usize {
    if total_threads == 0 {
        return 0;
    }
    let n = (workloads as f64).powf(0.25).round() as usize;
    n.clamp(1, total_threads)
}
