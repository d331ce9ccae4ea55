//! Relieve: decouple a fast producer from a slow consumer.

use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

struct RelieveState<T, F> {
    upstream: Option<Arc<Handle<T>>>,
    ready: bool,
    up_done: bool,
    rf: Option<F>,
    pending: Option<T>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// Turns a discrete flow into a continuous one by combining overflow.
///
/// The upstream is transferred eagerly, so it is never backpressured by
/// the consumer. When values arrive faster than downstream transfers,
/// each overflowing value is folded into the pending one with `rf`;
/// downstream always transfers the latest reduction.
pub fn relieve<T, F>(rf: F, flow: Flow<T>) -> Flow<T>
where
    T: Send + 'static,
    F: FnMut(T, T) -> T + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(RelieveState::<T, F> {
            upstream: None,
            ready: false,
            up_done: false,
            rf: Some(rf),
            pending: None,
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
                    state.lock().expect("relieve lock poisoned").ready = true;
                    process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("relieve lock poisoned").up_done = true;
                    process(&state, &notifier, &terminator);
                }
            },
        );
        state.lock().expect("relieve lock poisoned").upstream = Some(Arc::new(handle));
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let out = {
                    let mut guard = state.lock().expect("relieve lock poisoned");
                    if !guard.down_notified {
                        return Err(Error::protocol("transfer before notify"));
                    }
                    guard.down_notified = false;
                    if guard.cancelled {
                        guard.pending = None;
                        guard.terminated = true;
                        drop(guard);
                        terminator();
                        return Err(Error::cancelled());
                    }
                    match guard.pending.take() {
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
                    let mut guard = state.lock().expect("relieve lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    guard.pending = None;
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

fn process<T, F>(
    state: &Arc<Mutex<RelieveState<T, F>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) where
    T: Send + 'static,
    F: FnMut(T, T) -> T + Send + 'static,
{
    loop {
        enum Action<T, F> {
            Pull(Arc<Handle<T>>, F, Option<T>),
            Discard(Arc<Handle<T>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("relieve lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if guard.ready && aborted && guard.upstream.is_some() {
                guard.busy = true;
                guard.ready = false;
                Action::Discard(guard.upstream.clone().expect("checked above"))
            } else if guard.ready {
                match (guard.upstream.clone(), guard.rf.take()) {
                    (Some(upstream), Some(rf)) => {
                        guard.busy = true;
                        guard.ready = false;
                        let pending = guard.pending.take();
                        Action::Pull(upstream, rf, pending)
                    }
                    (_, rf) => {
                        if let Some(rf) = rf {
                            guard.rf = Some(rf);
                        }
                        Action::Idle
                    }
                }
            } else if !guard.down_notified
                && (guard.pending.is_some() || guard.cancelled || guard.failed.is_some())
            {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified && guard.pending.is_none() && guard.up_done {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Pull(upstream, mut rf, pending) => {
                let outcome = upstream.transfer();
                let merged = match outcome {
                    Ok(value) => Ok(match pending {
                        Some(prev) => rf(prev, value),
                        None => value,
                    }),
                    Err(error) => Err(error),
                };
                let mut guard = state.lock().expect("relieve lock poisoned");
                guard.busy = false;
                guard.rf = Some(rf);
                match merged {
                    Ok(value) => {
                        if !guard.cancelled && guard.failed.is_none() {
                            guard.pending = Some(value);
                        }
                    }
                    Err(error) => {
                        guard.pending = None;
                        guard.failed = Some(error);
                    }
                }
            }
            Action::Discard(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("relieve lock poisoned").busy = false;
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
