//! Background task pool used for parallel GC work
//!
//! The evacuator only needs [`TaskPool`]: post a closure, ask how many
//! workers exist. [`Taskpool`] is the default implementation: a fixed set
//! of named worker threads draining one job queue.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// A unit of background work; receives the index of the worker running it
pub type Task = Box<dyn FnOnce(usize) + Send + 'static>;

/// Posting interface of a worker pool
pub trait TaskPool: Send + Sync {
    /// Queue `task`. `affinity` is a hint naming the preferred worker.
    fn post_task(&self, affinity: Option<usize>, task: Task);

    /// Number of worker threads
    fn total_thread_num(&self) -> usize;
}

struct PoolState {
    jobs: VecDeque<Task>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    condvar: Condvar,
}

/// Fixed-size worker pool
pub struct Taskpool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl Taskpool {
    /// Start a pool with `threads` workers
    pub fn new(threads: usize) -> io::Result<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("otter-gc-worker-{index}"))
                    .spawn(move || worker_loop(&shared, index))
            })
            .collect::<io::Result<Vec<_>>>()?;

        tracing::debug!(target: "otter::gc", threads, "task pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            threads,
        })
    }

    /// Start a pool sized to the machine, leaving one core to the caller
    pub fn with_default_threads() -> io::Result<Self> {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(cores.saturating_sub(1).max(1))
    }

    /// Stop accepting work, finish queued jobs and join the workers
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.condvar.notify_all();

        for handle in self.workers.lock().drain(..) {
            let name = handle.thread().name().unwrap_or("otter-gc-worker").to_owned();
            if let Err(payload) = handle.join() {
                tracing::error!(
                    target: "otter::gc",
                    worker = %name,
                    panic = panic_message(payload.as_ref()),
                    "task pool worker exited with a panic"
                );
            }
        }
    }
}

fn worker_loop(shared: &PoolShared, index: usize) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.jobs.pop_front() {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.condvar.wait(&mut state);
            }
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(index))) {
            tracing::error!(
                target: "otter::gc",
                worker = index,
                panic = panic_message(payload.as_ref()),
                "task panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl TaskPool for Taskpool {
    fn post_task(&self, affinity: Option<usize>, task: Task) {
        let mut state = self.shared.state.lock();
        assert!(!state.shutdown, "task posted to a stopped pool");
        tracing::trace!(target: "otter::gc", ?affinity, queued = state.jobs.len(), "task posted");
        state.jobs.push_back(task);
        drop(state);
        self.shared.condvar.notify_one();
    }

    fn total_thread_num(&self) -> usize {
        self.threads
    }
}

impl Drop for Taskpool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Taskpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Taskpool")
            .field("threads", &self.threads)
            .finish()
    }
}
