//! Buffer: bounded read-ahead for a discrete flow.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

struct BufferState<T> {
    upstream: Option<Arc<Handle<T>>>,
    ready: bool,
    up_done: bool,
    queue: VecDeque<T>,
    capacity: usize,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// Accumulates up to `capacity` upstream values ahead of the consumer.
///
/// The upstream is transferred eagerly while the queue has room. A value
/// arriving with the queue full fails the flow with `Overflow` and
/// cancels the upstream.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn buffer<T: Send + 'static>(capacity: usize, flow: Flow<T>) -> Flow<T> {
    assert!(capacity > 0, "buffer capacity must be positive");
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(BufferState::<T> {
            upstream: None,
            ready: false,
            up_done: false,
            queue: VecDeque::with_capacity(capacity),
            capacity,
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
        }));
        let handle = flow.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("buffer lock poisoned").ready = true;
                    process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("buffer lock poisoned").up_done = true;
                    process(&state, &notifier, &terminator);
                }
            },
        );
        state.lock().expect("buffer lock poisoned").upstream = Some(Arc::new(handle));
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let out = {
                    let mut guard = state.lock().expect("buffer lock poisoned");
                    if !guard.down_notified {
                        return Err(Error::protocol("transfer before notify"));
                    }
                    guard.down_notified = false;
                    if guard.cancelled {
                        guard.queue.clear();
                        guard.terminated = true;
                        drop(guard);
                        terminator();
                        return Err(Error::cancelled());
                    }
                    match guard.queue.pop_front() {
                        Some(value) => value,
                        None => {
                            let error = guard.failed.take().unwrap_or_else(Error::cancelled);
                            guard.terminated = true;
                            drop(guard);
                            terminator();
                            return Err(error);
                        }
                    }
                };
                process(&state, &notifier, &terminator);
                Ok(out)
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let upstream = {
                    let mut guard = state.lock().expect("buffer lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    guard.queue.clear();
                    guard.upstream.clone()
                };
                if let Some(upstream) = upstream {
                    upstream.cancel();
                }
                process(&state, &notifier, &terminator);
            }
        });
        Handle::new(transfer, cancel)
    })
}

fn process<T: Send + 'static>(
    state: &Arc<Mutex<BufferState<T>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) {
    loop {
        enum Action<T> {
            Pull(Arc<Handle<T>>),
            Discard(Arc<Handle<T>>),
            Overflow(Option<Arc<Handle<T>>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("buffer lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if guard.ready && aborted && guard.upstream.is_some() {
                guard.busy = true;
                guard.ready = false;
                Action::Discard(guard.upstream.clone().expect("checked above"))
            } else if guard.ready && guard.queue.len() == guard.capacity {
                // The producer outran the consumer past the read-ahead
                // window: fail the flow.
                guard.failed = Some(Error::overflow(format!(
                    "buffer of {} exceeded",
                    guard.capacity
                )));
                guard.queue.clear();
                Action::Overflow(guard.upstream.clone())
            } else if guard.ready {
                match guard.upstream.clone() {
                    Some(upstream) => {
                        guard.busy = true;
                        guard.ready = false;
                        Action::Pull(upstream)
                    }
                    None => Action::Idle,
                }
            } else if !guard.down_notified
                && (!guard.queue.is_empty() || guard.cancelled || guard.failed.is_some())
            {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified && guard.queue.is_empty() && guard.up_done {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Pull(upstream) => {
                let outcome = upstream.transfer();
                let mut guard = state.lock().expect("buffer lock poisoned");
                guard.busy = false;
                match outcome {
                    Ok(value) => {
                        if !guard.cancelled && guard.failed.is_none() {
                            guard.queue.push_back(value);
                        }
                    }
                    Err(error) => {
                        guard.queue.clear();
                        guard.failed = Some(error);
                    }
                }
            }
            Action::Discard(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("buffer lock poisoned").busy = false;
            }
            Action::Overflow(upstream) => {
                if let Some(upstream) = upstream {
                    upstream.cancel();
                }
            }
            Action::Notify => notifier(),
            Action::Terminate => {
                terminator();
                return;
            }
            Action::Idle => return,
        }
    }
}
