//! Timeout: bound a task's completion with a deadline.

use std::time::Duration;

use super::{absolve, attempt, race};
use crate::error::{Error, Result};
use crate::task::Task;
use crate::time::sleep;

/// Bounds `task` with a deadline.
///
/// Built from the existing primitives, with no privileged timer:
/// `absolve(race([sleep(delay, Err(timeout)), attempt(task)]))`. If the
/// task completes within `delay` its outcome is restored by `absolve`;
/// otherwise the sleep wins the race, the task is cancelled, and the
/// composite fails with a `Timeout` carrying `delay`.
pub fn timeout<T: Send + 'static>(delay: Duration, task: Task<T>) -> Task<T> {
    let deadline: Task<Result<T>> = sleep(delay, Err(Error::timeout(delay)));
    absolve(race(vec![deadline, attempt(task)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Cancel;

    #[test]
    fn completes_within_deadline() {
        let out = timeout(
            Duration::from_millis(200),
            sleep(Duration::from_millis(10), 5),
        )
        .block_on()
        .unwrap();
        assert_eq!(out, 5);
    }

    #[test]
    fn expires_and_cancels_the_task() {
        let (tx, rx) = std::sync::mpsc::channel();
        let stubborn = Task::<i32>::new({
            move |_s, on_failure: crate::task::OnFailure| {
                Cancel::new(move || {
                    tx.send("task cancelled").unwrap();
                    on_failure(Error::cancelled());
                })
            }
        });
        let err = timeout(Duration::from_millis(30), stubborn)
            .block_on()
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.duration(), Some(Duration::from_millis(30)));
        assert_eq!(rx.recv().unwrap(), "task cancelled");
    }

    #[test]
    fn inner_failure_beats_the_deadline() {
        let err = timeout(
            Duration::from_millis(200),
            Task::<i32>::fail(Error::msg("inner")),
        )
        .block_on()
        .unwrap_err();
        assert_eq!(err.to_string(), "user error: inner");
    }
}
