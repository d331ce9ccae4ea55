//! Shared timer thread.
//!
//! One lazily-started thread owns a min-heap of deadlines and fires each
//! entry's callback when its instant passes. Entries are never removed
//! early: a cancelled sleep has already settled, so its callback becomes
//! a no-op and the stale entry is simply drained on schedule.

use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

use crate::tracing_compat::trace;

struct Entry {
    deadline: Instant,
    seq: u64,
    fire: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

struct Timer {
    heap: Mutex<(BinaryHeap<Reverse<Entry>>, u64)>,
    condvar: Condvar,
}

impl Timer {
    fn schedule(&self, deadline: Instant, fire: Box<dyn FnOnce() + Send>) {
        let mut guard = self.heap.lock();
        let seq = guard.1;
        guard.1 += 1;
        guard.0.push(Reverse(Entry {
            deadline,
            seq,
            fire,
        }));
        drop(guard);
        self.condvar.notify_one();
    }

    fn run(self: Arc<Self>) {
        trace!("timer thread started");
        let mut guard = self.heap.lock();
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            while guard.0.peek().is_some_and(|entry| entry.0.deadline <= now) {
                let Reverse(entry) = guard.0.pop().expect("peeked entry present");
                due.push(entry.fire);
            }
            if !due.is_empty() {
                drop(guard);
                for fire in due {
                    fire();
                }
                guard = self.heap.lock();
                continue;
            }
            match guard.0.peek() {
                Some(Reverse(next)) => {
                    let wait = next.deadline.saturating_duration_since(now);
                    self.condvar.wait_for(&mut guard, wait);
                }
                None => self.condvar.wait(&mut guard),
            }
        }
    }
}

fn timer() -> &'static Arc<Timer> {
    static TIMER: OnceLock<Arc<Timer>> = OnceLock::new();
    TIMER.get_or_init(|| {
        let timer = Arc::new(Timer {
            heap: Mutex::new((BinaryHeap::new(), 0)),
            condvar: Condvar::new(),
        });
        let runner = Arc::clone(&timer);
        thread::Builder::new()
            .name("freshet-timer".into())
            .spawn(move || runner.run())
            .expect("failed to spawn timer thread");
        timer
    })
}

/// Fires `fire` once `deadline` has passed.
pub(crate) fn schedule(deadline: Instant, fire: impl FnOnce() + Send + 'static) {
    timer().schedule(deadline, Box::new(fire));
}
