//! Observe: a discrete flow over a callback-style subject.

use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::{Error, Result};
use crate::task::Cancel;

struct ObserveState<T> {
    pending: Option<T>,
    notified: bool,
    failed: Option<Error>,
    cancelled: bool,
    terminated: bool,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

/// Producer-side handle given to an [`observe`] subject.
///
/// `emit` may be called from any thread. The subject is not
/// backpressured, so it must not overflow: emitting while a previous
/// value is still pending transfer fails the flow with `Overflow` and
/// returns the error to the producer. Emitting after cancellation is a
/// silent no-op.
pub struct Emitter<T> {
    state: Arc<Mutex<ObserveState<T>>>,
    notifier: super::Notifier,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    /// Hands one value to the subscriber.
    pub fn emit(&self, value: T) -> Result<()> {
        let outcome = {
            let mut guard = self.state.lock().expect("observe lock poisoned");
            if guard.cancelled || guard.terminated {
                return Ok(());
            }
            if guard.failed.is_some() {
                return Err(Error::overflow("subject already failed"));
            }
            if guard.pending.is_some() {
                let error = Error::overflow("subject emitted while a value was pending");
                guard.failed = Some(error.clone());
                Err(error)
            } else {
                guard.pending = Some(value);
                let fire = !guard.notified;
                guard.notified = true;
                Ok(fire)
            }
        };
        match outcome {
            Ok(fire) => {
                if fire {
                    (self.notifier)();
                }
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Emitter")
    }
}

/// A discrete flow fed by a non-backpressured subject.
///
/// At subscription `subject` receives an [`Emitter`] and returns a
/// cleanup thunk, invoked once when the subscription ends (cancellation
/// or failure).
pub fn observe<T, F, C>(subject: F) -> Flow<T>
where
    T: Send + 'static,
    F: FnOnce(Emitter<T>) -> C + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(ObserveState::<T> {
            pending: None,
            notified: false,
            failed: None,
            cancelled: false,
            terminated: false,
            cleanup: None,
        }));
        let emitter = Emitter {
            state: Arc::clone(&state),
            notifier: Arc::clone(&notifier),
        };
        let cleanup = subject(emitter);
        {
            let mut guard = state.lock().expect("observe lock poisoned");
            if guard.cancelled || guard.terminated {
                drop(guard);
                cleanup();
            } else {
                guard.cleanup = Some(Box::new(cleanup));
            }
        }
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let (out, renotify, cleanup) = {
                    let mut guard = state.lock().expect("observe lock poisoned");
                    if guard.cancelled {
                        guard.pending = None;
                        guard.terminated = true;
                        (Err(Error::cancelled()), false, guard.cleanup.take())
                    } else if !guard.notified {
                        return Err(Error::protocol("transfer before notify"));
                    } else {
                        guard.notified = false;
                        match guard.pending.take() {
                            Some(value) => {
                                // A failure recorded behind this value is
                                // raised on the following transfer.
                                let renotify = guard.failed.is_some();
                                guard.notified = renotify;
                                (Ok(value), renotify, None)
                            }
                            None => {
                                let error =
                                    guard.failed.take().unwrap_or_else(Error::cancelled);
                                guard.terminated = true;
                                (Err(error), false, guard.cleanup.take())
                            }
                        }
                    }
                };
                let terminate = out.is_err();
                if let Some(cleanup) = cleanup {
                    cleanup();
                }
                if renotify {
                    notifier();
                }
                if terminate {
                    terminator();
                }
                out
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            move || {
                let (fire, cleanup) = {
                    let mut guard = state.lock().expect("observe lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    let fire = if guard.notified {
                        false
                    } else {
                        guard.notified = true;
                        true
                    };
                    (fire, guard.cleanup.take())
                };
                if let Some(cleanup) = cleanup {
                    cleanup();
                }
                if fire {
                    notifier();
                }
            }
        });
        Handle::new(transfer, cancel)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn values_flow_from_subject_to_subscriber() {
        let slot: Arc<Mutex<Option<Emitter<i32>>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let handle = observe(move |emitter| {
            *slot2.lock().unwrap() = Some(emitter);
            || {}
        })
        .subscribe(|| {}, || {});
        let emitter = slot.lock().unwrap().clone().unwrap();
        emitter.emit(1).unwrap();
        assert_eq!(handle.transfer().unwrap(), 1);
        emitter.emit(2).unwrap();
        assert_eq!(handle.transfer().unwrap(), 2);
    }

    #[test]
    fn overflow_fails_producer_and_flow() {
        let slot: Arc<Mutex<Option<Emitter<i32>>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&terminated);
        let handle = observe(move |emitter| {
            *slot2.lock().unwrap() = Some(emitter);
            || {}
        })
        .subscribe(
            || {},
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        let emitter = slot.lock().unwrap().clone().unwrap();
        emitter.emit(1).unwrap();
        assert!(emitter.emit(2).unwrap_err().is_overflow());
        // The first value is still delivered, then the overflow raises.
        assert_eq!(handle.transfer().unwrap(), 1);
        assert!(handle.transfer().unwrap_err().is_overflow());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_runs_cleanup_and_silences_emits() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let cleaned2 = Arc::clone(&cleaned);
        let slot: Arc<Mutex<Option<Emitter<i32>>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let handle = observe(move |emitter| {
            *slot2.lock().unwrap() = Some(emitter);
            move || {
                cleaned2.fetch_add(1, Ordering::SeqCst);
            }
        })
        .subscribe(|| {}, || {});
        handle.cancel();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        let emitter = slot.lock().unwrap().clone().unwrap();
        // Post-cancel emit is a no-op.
        emitter.emit(9).unwrap();
        assert!(handle.transfer().unwrap_err().is_cancelled());
    }
}
