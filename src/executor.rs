//! Process-wide executors for blocking and CPU-bound work.
//!
//! Two pools are exposed: a blocking-optimised one that grows with demand
//! and retires idle threads, and a compute-optimised one fixed at the
//! available parallelism. Lifecycle is lazy-init with no explicit
//! shutdown.
//!
//! # Cancellation
//!
//! Work cannot be interrupted mid-execution. Cancelling a [`via`] task
//! that has not started yet aborts the dispatch; cancelling one that has
//! started is soft: the thunk runs to completion but its terminal event
//! was already delivered as a cancellation, so its own outcome is
//! suppressed.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::task::{Cancel, Settler, Task};
use crate::tracing_compat::trace;

/// Idle timeout before retiring excess blocking threads.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on blocking pool growth.
const MAX_BLOCKING_THREADS: usize = 512;

/// Selects one of the two process-wide pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    /// Blocking-optimised pool: grows up to a high bound, retires idle
    /// threads.
    Blocking,
    /// CPU-optimised pool: fixed at the available parallelism.
    Compute,
}

struct Pool {
    name: &'static str,
    queue: SegQueue<Box<dyn FnOnce() + Send>>,
    /// Threads currently alive.
    active: AtomicUsize,
    /// Threads parked waiting for work.
    idle: AtomicUsize,
    min_threads: usize,
    max_threads: usize,
    /// Whether idle threads above the minimum retire after a timeout.
    retire_idle: bool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Pool {
    fn new(name: &'static str, min_threads: usize, max_threads: usize, retire_idle: bool) -> Self {
        Self {
            name,
            queue: SegQueue::new(),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            min_threads,
            max_threads,
            retire_idle,
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn submit(self: &Arc<Self>, work: Box<dyn FnOnce() + Send>) {
        self.queue.push(work);
        if self.idle.load(Ordering::Acquire) == 0
            && self.active.load(Ordering::Acquire) < self.max_threads
        {
            self.spawn_worker();
        }
        let _guard = self.mutex.lock();
        self.condvar.notify_one();
    }

    fn spawn_worker(self: &Arc<Self>) {
        let id = self.active.fetch_add(1, Ordering::AcqRel);
        if id >= self.max_threads {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let pool = Arc::clone(self);
        let name = format!("{}-{id}", self.name);
        let spawned = thread::Builder::new().name(name).spawn(move || pool.run());
        if spawned.is_err() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn run(self: Arc<Self>) {
        trace!(pool = self.name, "worker started");
        loop {
            if let Some(work) = self.queue.pop() {
                work();
                continue;
            }
            self.idle.fetch_add(1, Ordering::AcqRel);
            let mut guard = self.mutex.lock();
            // Re-check under the lock so a submit between pop and park
            // cannot strand work.
            if !self.queue.is_empty() {
                drop(guard);
                self.idle.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            let timed_out = if self.retire_idle {
                self.condvar
                    .wait_for(&mut guard, IDLE_TIMEOUT)
                    .timed_out()
            } else {
                self.condvar.wait(&mut guard);
                false
            };
            drop(guard);
            self.idle.fetch_sub(1, Ordering::AcqRel);
            if timed_out
                && self.queue.is_empty()
                && self.active.load(Ordering::Acquire) > self.min_threads
            {
                self.active.fetch_sub(1, Ordering::AcqRel);
                trace!(pool = self.name, "idle worker retired");
                return;
            }
        }
    }
}

fn blocking_pool() -> &'static Arc<Pool> {
    static POOL: OnceLock<Arc<Pool>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(Pool::new("freshet-blocking", 1, MAX_BLOCKING_THREADS, true)))
}

fn compute_pool() -> &'static Arc<Pool> {
    static POOL: OnceLock<Arc<Pool>> = OnceLock::new();
    POOL.get_or_init(|| {
        let n = thread::available_parallelism().map_or(4, |n| n.get());
        Arc::new(Pool::new("freshet-compute", n, n, false))
    })
}

fn pool_for(executor: Executor) -> &'static Arc<Pool> {
    match executor {
        Executor::Blocking => blocking_pool(),
        Executor::Compute => compute_pool(),
    }
}

/// Schedules `thunk` on the selected pool, completing with its return
/// value or failing with its error. A panicking thunk fails the task with
/// a `User` error instead of unwinding into the pool.
pub fn via<T: Send + 'static>(
    executor: Executor,
    thunk: impl FnOnce() -> Result<T> + Send + 'static,
) -> Task<T> {
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let aborted = Arc::new(AtomicBool::new(false));
        let work = {
            let settler = settler.clone();
            let aborted = Arc::clone(&aborted);
            Box::new(move || {
                if aborted.load(Ordering::Acquire) {
                    return;
                }
                match catch_unwind(AssertUnwindSafe(thunk)) {
                    Ok(Ok(v)) => {
                        settler.succeed(v);
                    }
                    Ok(Err(e)) => {
                        settler.fail(e);
                    }
                    Err(_panic) => {
                        settler.fail(Error::msg("thunk panicked on executor"));
                    }
                }
            })
        };
        pool_for(executor).submit(work);
        Cancel::new(move || {
            aborted.store(true, Ordering::Release);
            settler.fail(Error::cancelled());
        })
    })
}
