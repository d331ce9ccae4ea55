//! Sleep: a task completing with a value after a delay.

use std::time::{Duration, Instant};

use super::timer;
use crate::error::Error;
use crate::task::{Cancel, Settler, Task};

/// A task completing with `value` once `delay` has elapsed from
/// subscription.
///
/// # Cancellation
///
/// Cancelling a pending sleep fails it immediately; the timer entry is
/// left to expire as a no-op.
pub fn sleep<T: Send + 'static>(delay: Duration, value: T) -> Task<T> {
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let deadline = Instant::now() + delay;
        {
            let settler = settler.clone();
            timer::schedule(deadline, move || {
                settler.succeed(value);
            });
        }
        Cancel::new(move || {
            settler.fail(Error::cancelled());
        })
    })
}
