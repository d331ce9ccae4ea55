//! The task contract: one-shot asynchronous computations.
//!
//! A [`Task`] is a value representing a computation that completes exactly
//! once, with either a success value or an [`Error`]. Subscribing installs
//! a success continuation and a failure continuation and returns a
//! [`Cancel`] handle.
//!
//! # Contract
//!
//! - Exactly one of the two continuations is eventually called, from
//!   whatever thread produced the terminal event.
//! - `Cancel` is idempotent and safe to invoke at any time, including
//!   concurrently with the subscription taking effect.
//! - Cancellation is advisory: a task may still succeed after being
//!   cancelled, but it must still deliver exactly one terminal event.
//! - No callback arrives after the terminal event.
//!
//! There is no implicit event loop. Work progresses by synchronous calls
//! of continuations on whatever thread invoked the triggering event;
//! continuations must therefore tolerate re-entrant invocation.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};

/// Success continuation installed by [`Task::subscribe`].
pub type OnSuccess<T> = Box<dyn FnOnce(T) + Send>;

/// Failure continuation installed by [`Task::subscribe`].
pub type OnFailure = Box<dyn FnOnce(Error) + Send>;

/// An idempotent cancellation handle.
///
/// The wrapped action runs at most once; every later invocation is a
/// no-op. Handles are cheap to clone and safe to invoke from any thread.
#[derive(Clone)]
pub struct Cancel {
    action: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Cancel {
    /// Wraps a cancellation action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Arc::new(Mutex::new(Some(Box::new(action)))),
        }
    }

    /// A handle that does nothing, for operations that complete
    /// synchronously or refuse cancellation.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            action: Arc::new(Mutex::new(None)),
        }
    }

    /// Requests early termination. Idempotent.
    pub fn cancel(&self) {
        let action = self.action.lock().expect("cancel lock poisoned").take();
        if let Some(action) = action {
            action();
        }
    }
}

impl std::fmt::Debug for Cancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let armed = self
            .action
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        f.debug_struct("Cancel").field("armed", &armed).finish()
    }
}

/// Exactly-one-terminal helper for task implementations.
///
/// Holds both continuations of a subscription and hands them out once:
/// the first `succeed`/`fail` wins, every later call is a no-op. The
/// continuation runs on the calling thread, outside any lock held by the
/// settler itself.
pub struct Settler<T> {
    slot: Arc<Mutex<Option<(OnSuccess<T>, OnFailure)>>>,
}

impl<T> Clone for Settler<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Settler<T> {
    /// Captures the two continuations of a fresh subscription.
    #[must_use]
    pub fn new(on_success: OnSuccess<T>, on_failure: OnFailure) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some((on_success, on_failure)))),
        }
    }

    /// Delivers the success continuation. Returns false if the
    /// subscription already settled.
    pub fn succeed(&self, value: T) -> bool {
        let taken = self.slot.lock().expect("settler lock poisoned").take();
        match taken {
            Some((on_success, _)) => {
                on_success(value);
                true
            }
            None => false,
        }
    }

    /// Delivers the failure continuation. Returns false if the
    /// subscription already settled.
    pub fn fail(&self, error: Error) -> bool {
        let taken = self.slot.lock().expect("settler lock poisoned").take();
        match taken {
            Some((_, on_failure)) => {
                on_failure(error);
                true
            }
            None => false,
        }
    }

    /// Attempts delivery, handing the value back if the subscription
    /// already settled. Lets a producer route a value to the next waiter
    /// instead of losing it to a racing cancellation.
    pub fn offer(&self, value: T) -> Option<T> {
        let taken = self.slot.lock().expect("settler lock poisoned").take();
        match taken {
            Some((on_success, _)) => {
                on_success(value);
                None
            }
            None => Some(value),
        }
    }

    /// True once a terminal event has been delivered.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.slot.lock().expect("settler lock poisoned").is_none()
    }
}

impl<T> std::fmt::Debug for Settler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settler")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// A one-shot asynchronous computation.
///
/// Tasks are plain values: they do nothing until subscribed, and
/// subscription consumes them. Variants are tagged by construction, not
/// by a trait hierarchy.
pub struct Task<T> {
    subscribe: Box<dyn FnOnce(OnSuccess<T>, OnFailure) -> Cancel + Send>,
}

impl<T: Send + 'static> Task<T> {
    /// Wraps a subscribe function obeying the task contract.
    pub fn new(subscribe: impl FnOnce(OnSuccess<T>, OnFailure) -> Cancel + Send + 'static) -> Self {
        Self {
            subscribe: Box::new(subscribe),
        }
    }

    /// Installs the continuations, starting the computation.
    pub fn subscribe(
        self,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
    ) -> Cancel {
        (self.subscribe)(Box::new(on_success), Box::new(on_failure))
    }

    /// A task that completes immediately with `value`.
    pub fn ready(value: T) -> Self {
        Self::new(move |on_success, _| {
            on_success(value);
            Cancel::noop()
        })
    }

    /// A task that fails immediately with `error`.
    pub fn fail(error: Error) -> Self {
        Self::new(move |_, on_failure| {
            on_failure(error);
            Cancel::noop()
        })
    }

    /// A task evaluating `f` synchronously at subscription.
    pub fn from_fn(f: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        Self::new(move |on_success, on_failure| {
            match f() {
                Ok(v) => on_success(v),
                Err(e) => on_failure(e),
            }
            Cancel::noop()
        })
    }

    /// A task that never succeeds. Cancellation fails it immediately.
    pub fn never() -> Self {
        Self::new(|on_success, on_failure| {
            let settler: Settler<T> = Settler::new(on_success, on_failure);
            Cancel::new(move || {
                settler.fail(Error::cancelled());
            })
        })
    }

    /// Parks the calling thread until the task settles.
    ///
    /// This is the top-level awaiter: a failed task surfaces its error
    /// here. Intended for program edges and tests; never call it from
    /// inside a continuation.
    pub fn block_on(self) -> Result<T> {
        struct Parked<T> {
            slot: Mutex<Option<Result<T>>>,
            cond: Condvar,
        }
        let parked = Arc::new(Parked {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        let on_success = {
            let parked = Arc::clone(&parked);
            move |v| {
                *parked.slot.lock().expect("block_on lock poisoned") = Some(Ok(v));
                parked.cond.notify_all();
            }
        };
        let on_failure = {
            let parked = Arc::clone(&parked);
            move |e| {
                *parked.slot.lock().expect("block_on lock poisoned") = Some(Err(e));
                parked.cond.notify_all();
            }
        };
        let _cancel = self.subscribe(on_success, on_failure);
        let mut guard = parked.slot.lock().expect("block_on lock poisoned");
        while guard.is_none() {
            guard = parked.cond.wait(guard).expect("block_on lock poisoned");
        }
        guard.take().expect("terminal event delivered")
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}
