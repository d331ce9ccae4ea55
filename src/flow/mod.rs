//! The flow contract: backpressured, cancellable value streams.
//!
//! A [`Flow`] is a value representing a potentially-multi-valued producer.
//! Subscribing installs a *notifier* callback ("a value is ready to be
//! transferred") and a *terminator* callback ("no more values will come")
//! and returns a [`Handle`] that both transfers pending values and cancels
//! the subscription.
//!
//! # Signalling discipline
//!
//! - **One outstanding**: for every notifier call there is exactly one
//!   subsequent transfer before the next notifier call. This rule *is*
//!   the backpressure mechanism: a producer with a pending value pauses
//!   until the consumer transfers it.
//! - The terminator is called exactly once per subscription, after all
//!   notifications and after any final transfer.
//! - A failed flow raises its error on the next transfer and then
//!   terminates.
//! - After cancellation the flow still delivers exactly one terminal
//!   event. Cancellation is idempotent.
//!
//! Callbacks may be invoked synchronously from inside a transfer and from
//! arbitrary threads; consumers are written flag-first so re-entry is
//! harmless.
//!
//! # Classification
//!
//! - **Discrete** flows emit each value once; the terminator marks
//!   end-of-stream.
//! - **Continuous** flows represent a time-varying current value: the
//!   first notification is immediate, later ones mean "changed since last
//!   transfer", and sampling is mandatory after each notification.

mod buffer;
mod enumerate;
mod gather;
mod integrate;
mod latest;
mod observe;
mod publisher;
mod relieve;
mod sample;
mod transform;
pub mod watch;
mod zip;

pub use buffer::buffer;
pub use enumerate::enumerate;
pub use gather::gather;
pub use integrate::{aggregate, integrate};
pub use latest::latest;
pub use observe::{observe, Emitter};
pub use publisher::{from_publisher, into_publisher, Publisher, Subscriber, Subscription};
pub use relieve::relieve;
pub use sample::sample;
pub use transform::transform;
pub use watch::watch;
pub use zip::zip;

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::task::{Cancel, Task};

/// Notifier callback: a value is ready to be transferred.
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

/// Terminator callback: no more values will come.
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

/// Subscription handle: transfer role plus cancel role.
///
/// `transfer` yields the pending value (or raises the pending failure)
/// and re-arms the flow; it must be called exactly once per notification.
/// The handle is shareable behind an `Arc`; the one-outstanding rule
/// keeps the interior lock uncontended.
pub struct Handle<T> {
    transfer: Mutex<Box<dyn FnMut() -> Result<T> + Send>>,
    cancel: Cancel,
}

impl<T> Handle<T> {
    /// Builds a handle from a transfer function and a cancel handle.
    pub fn new(transfer: impl FnMut() -> Result<T> + Send + 'static, cancel: Cancel) -> Self {
        Self {
            transfer: Mutex::new(Box::new(transfer)),
            cancel,
        }
    }

    /// Yields the pending value or raises the pending failure, re-arming
    /// the flow.
    pub fn transfer(&self) -> Result<T> {
        (self.transfer.lock().expect("transfer lock poisoned"))()
    }

    /// Requests early termination of the subscription.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clones the cancel role of this handle.
    #[must_use]
    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

/// A potentially-multi-valued producer.
///
/// Flows are plain values: nothing runs until subscription, and
/// subscription consumes the flow. Variants are tagged by construction.
pub struct Flow<T> {
    subscribe: Box<dyn FnOnce(Notifier, Terminator) -> Handle<T> + Send>,
}

impl<T: Send + 'static> Flow<T> {
    /// Wraps a subscribe function obeying the flow contract.
    pub fn new(subscribe: impl FnOnce(Notifier, Terminator) -> Handle<T> + Send + 'static) -> Self {
        Self {
            subscribe: Box::new(subscribe),
        }
    }

    /// Installs the callbacks, starting the producer.
    pub fn subscribe(
        self,
        notifier: impl Fn() + Send + Sync + 'static,
        terminator: impl Fn() + Send + Sync + 'static,
    ) -> Handle<T> {
        (self.subscribe)(Arc::new(notifier), Arc::new(terminator))
    }

    pub(crate) fn subscribe_shared(self, notifier: Notifier, terminator: Terminator) -> Handle<T> {
        (self.subscribe)(notifier, terminator)
    }

    /// A discrete flow that terminates immediately without emitting.
    pub fn empty() -> Self {
        Self::new(|_notifier, terminator| {
            terminator();
            Handle::new(
                || Err(Error::protocol("transfer on an empty flow")),
                Cancel::noop(),
            )
        })
    }

    /// Lifts a task into a one-value discrete flow.
    ///
    /// The task's success is emitted as the single value; its failure is
    /// raised on transfer. Cancelling the flow cancels the task.
    pub fn once(task: Task<T>) -> Self {
        Self::new(move |notifier, terminator| {
            let slot: Arc<Mutex<Option<Result<T>>>> = Arc::new(Mutex::new(None));
            let on_success = {
                let slot = Arc::clone(&slot);
                let notifier = Arc::clone(&notifier);
                move |v| {
                    *slot.lock().expect("once lock poisoned") = Some(Ok(v));
                    notifier();
                }
            };
            let on_failure = {
                let slot = Arc::clone(&slot);
                let notifier = Arc::clone(&notifier);
                move |e| {
                    *slot.lock().expect("once lock poisoned") = Some(Err(e));
                    notifier();
                }
            };
            let cancel = task.subscribe(on_success, on_failure);
            let transfer = {
                let slot = Arc::clone(&slot);
                move || {
                    let taken = slot.lock().expect("once lock poisoned").take();
                    let out =
                        taken.unwrap_or_else(|| Err(Error::protocol("transfer before notify")));
                    terminator();
                    out
                }
            };
            Handle::new(transfer, cancel)
        })
    }
}

impl<T> std::fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Flow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_terminates_without_values() {
        let terms = Arc::new(AtomicUsize::new(0));
        let terms2 = Arc::clone(&terms);
        let _handle = Flow::<i32>::empty().subscribe(
            || panic!("empty flow must not notify"),
            move || {
                terms2.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(terms.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_emits_single_value_then_terminates() {
        let notes = Arc::new(AtomicUsize::new(0));
        let terms = Arc::new(AtomicUsize::new(0));
        let (n, t) = (Arc::clone(&notes), Arc::clone(&terms));
        let handle = Flow::once(Task::ready(11)).subscribe(
            move || {
                n.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(notes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.transfer().unwrap(), 11);
        assert_eq!(terms.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_raises_failure_on_transfer() {
        let handle = Flow::<i32>::once(Task::fail(Error::msg("bad"))).subscribe(|| {}, || {});
        let err = handle.transfer().unwrap_err();
        assert_eq!(err.to_string(), "user error: bad");
    }

    #[test]
    fn once_cancel_reaches_task() {
        let handle = Flow::<i32>::once(Task::never()).subscribe(|| {}, || {});
        handle.cancel();
        let err = handle.transfer().unwrap_err();
        assert!(err.is_cancelled());
    }
}
