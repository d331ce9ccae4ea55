//! Counted semaphore with FIFO waiters.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::task::{Cancel, Settler, Task};

struct SemaphoreState {
    permits: usize,
    waiters: VecDeque<(u64, Settler<()>)>,
    next_id: u64,
}

/// A counted semaphore; `new(1)` behaves as a mutex.
///
/// `acquire` is a task completing when a token is available, atomically
/// consuming it. `release` hands the token directly to the oldest live
/// waiter, or increments the count when nobody waits. A cancelled pending
/// acquire fails without consuming a token.
pub struct Semaphore {
    inner: Arc<Mutex<SemaphoreState>>,
}

impl Clone for Semaphore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Semaphore {
    /// Creates a semaphore holding `permits` tokens.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SemaphoreState {
                permits,
                waiters: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// Returns the number of currently available tokens.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().expect("semaphore lock poisoned").permits
    }

    /// Returns a token, waking the oldest live waiter if one is pending.
    pub fn release(&self) {
        loop {
            let waiter = {
                let mut state = self.inner.lock().expect("semaphore lock poisoned");
                match state.waiters.pop_front() {
                    Some((_, waiter)) => waiter,
                    None => {
                        state.permits += 1;
                        return;
                    }
                }
            };
            // The token passes directly; a waiter settled by a racing
            // cancel did not consume it, so try the next.
            if waiter.offer(()).is_none() {
                return;
            }
        }
    }

    /// A task completing once a token is available, consuming it.
    pub fn acquire(&self) -> Task<()> {
        let inner = Arc::clone(&self.inner);
        Task::new(move |on_success, on_failure| {
            let settler = Settler::new(on_success, on_failure);
            let id;
            {
                let mut state = inner.lock().expect("semaphore lock poisoned");
                if state.permits > 0 {
                    state.permits -= 1;
                    drop(state);
                    settler.succeed(());
                    return Cancel::noop();
                }
                id = state.next_id;
                state.next_id += 1;
                state.waiters.push_back((id, settler.clone()));
            }
            Cancel::new(move || {
                inner
                    .lock()
                    .expect("semaphore lock poisoned")
                    .waiters
                    .retain(|(wid, _)| *wid != id);
                settler.fail(Error::cancelled());
            })
        })
    }

    /// Runs `task` while holding one token, releasing it on every exit
    /// path: success, failure, and cancellation.
    pub fn holding<T: Send + 'static>(&self, task: Task<T>) -> Task<T> {
        let sem = self.clone();
        Task::new(move |on_success, on_failure| {
            let settler = Settler::new(on_success, on_failure);
            let state: Arc<Mutex<HoldingState>> = Arc::new(Mutex::new(HoldingState {
                current: None,
                acquired: false,
                cancelled: false,
            }));
            let acquire_cancel = sem.acquire().subscribe(
                {
                    let sem = sem.clone();
                    let settler = settler.clone();
                    let state = Arc::clone(&state);
                    move |()| {
                        let inner_cancel = task.subscribe(
                            {
                                let sem = sem.clone();
                                let settler = settler.clone();
                                move |v| {
                                    sem.release();
                                    settler.succeed(v);
                                }
                            },
                            {
                                let sem = sem.clone();
                                let settler = settler.clone();
                                move |e| {
                                    sem.release();
                                    settler.fail(e);
                                }
                            },
                        );
                        let mut guard = state.lock().expect("holding lock poisoned");
                        guard.acquired = true;
                        if guard.cancelled {
                            drop(guard);
                            inner_cancel.cancel();
                        } else {
                            guard.current = Some(inner_cancel);
                        }
                    }
                },
                {
                    let settler = settler.clone();
                    move |e| {
                        // Acquire failed (cancelled); no token was consumed.
                        settler.fail(e);
                    }
                },
            );
            {
                let mut guard = state.lock().expect("holding lock poisoned");
                if !guard.acquired {
                    guard.current = Some(acquire_cancel);
                }
            }
            Cancel::new(move || {
                let taken = {
                    let mut guard = state.lock().expect("holding lock poisoned");
                    guard.cancelled = true;
                    guard.current.take()
                };
                if let Some(cancel) = taken {
                    cancel.cancel();
                }
            })
        })
    }
}

struct HoldingState {
    current: Option<Cancel>,
    acquired: bool,
    cancelled: bool,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn acquire_consumes_and_release_restores() {
        let sem = Semaphore::new(2);
        sem.acquire().block_on().unwrap();
        sem.acquire().block_on().unwrap();
        assert_eq!(sem.available(), 0);
        sem.release();
        sem.release();
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn waiters_are_served_fifo() {
        let sem = Semaphore::new(0);
        let (tx, rx) = std::sync::mpsc::channel();
        for tag in 0..3u32 {
            let tx = tx.clone();
            let _ = sem
                .acquire()
                .subscribe(move |()| tx.send(tag).unwrap(), |_| {});
        }
        sem.release();
        sem.release();
        sem.release();
        assert_eq!(rx.recv().unwrap(), 0);
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn cancelled_acquire_consumes_no_token() {
        let sem = Semaphore::new(0);
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = sem
            .acquire()
            .subscribe(|()| panic!("cancelled acquire must not complete"), move |e| {
                tx.send(e).unwrap();
            });
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
        sem.release();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn holding_releases_on_success() {
        let sem = Semaphore::new(1);
        let v = sem.holding(Task::ready(5)).block_on().unwrap();
        assert_eq!(v, 5);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn holding_releases_on_failure() {
        let sem = Semaphore::new(1);
        let err = sem
            .holding(Task::<i32>::fail(Error::msg("inner failed")))
            .block_on()
            .unwrap_err();
        assert_eq!(err.to_string(), "user error: inner failed");
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn holding_releases_on_cancel() {
        let sem = Semaphore::new(1);
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = sem
            .holding(sleep(Duration::from_secs(60), ()))
            .subscribe(|()| panic!("cancelled holding must not complete"), move |e| {
                tx.send(e).unwrap();
            });
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn holding_cancel_before_token_consumes_nothing() {
        let sem = Semaphore::new(0);
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = sem
            .holding(Task::ready(1))
            .subscribe(|_| panic!("must not run without a token"), move |e| {
                tx.send(e).unwrap();
            });
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
        sem.release();
        assert_eq!(sem.available(), 1);
    }
}
