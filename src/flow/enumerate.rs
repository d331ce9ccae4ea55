//! Enumerate: a discrete flow over an in-memory sequence.

use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

struct EnumerateState<I: Iterator> {
    iter: I,
    pending: Option<I::Item>,
    cancelled: bool,
    terminated: bool,
}

/// A discrete flow emitting the elements of `items` in order, one per
/// transfer. The next notification is issued from inside the current
/// transfer, so a synchronous consumer drains the whole sequence without
/// ever parking.
///
/// # Cancellation
///
/// Cancelling mid-stream fails the flow immediately: the pending element
/// is replaced by a `Cancelled` failure raised on the next transfer.
pub fn enumerate<T, I>(items: I) -> Flow<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Send + 'static,
    I::IntoIter: Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let mut iter = items.into_iter();
        let first = iter.next();
        let state = Arc::new(Mutex::new(EnumerateState {
            iter,
            pending: first,
            cancelled: false,
            terminated: false,
        }));
        let has_first = state
            .lock()
            .expect("enumerate lock poisoned")
            .pending
            .is_some();
        if has_first {
            notifier();
        } else {
            state.lock().expect("enumerate lock poisoned").terminated = true;
            terminator();
        }
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                enum After {
                    Notify,
                    Terminate,
                }
                let (out, after) = {
                    let mut guard = state.lock().expect("enumerate lock poisoned");
                    if guard.cancelled {
                        guard.pending = None;
                        guard.terminated = true;
                        (Err(Error::cancelled()), After::Terminate)
                    } else {
                        match guard.pending.take() {
                            Some(value) => {
                                guard.pending = guard.iter.next();
                                if guard.pending.is_some() {
                                    (Ok(value), After::Notify)
                                } else {
                                    guard.terminated = true;
                                    (Ok(value), After::Terminate)
                                }
                            }
                            None => {
                                return Err(Error::protocol("transfer before notify"));
                            }
                        }
                    }
                };
                match after {
                    After::Notify => notifier(),
                    After::Terminate => terminator(),
                }
                out
            }
        };
        let cancel = Cancel::new(move || {
            let mut guard = state.lock().expect("enumerate lock poisoned");
            if !guard.terminated {
                guard.cancelled = true;
            }
        });
        Handle::new(transfer, cancel)
    })
}
