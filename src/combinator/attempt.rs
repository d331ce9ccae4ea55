//! Attempt and absolve: reify an outcome, and undo the reification.

use crate::error::Result;
use crate::task::{Settler, Task};

/// A task that always succeeds, its success value reifying the inner
/// task's outcome. Cancellation still propagates to the inner task.
///
/// `attempt` is the sole mechanism by which the core turns a failure into
/// a success value; [`absolve`] is its inverse.
pub fn attempt<T: Send + 'static>(task: Task<T>) -> Task<Result<T>> {
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let on_inner_success = {
            let settler = settler.clone();
            move |v| {
                settler.succeed(Ok(v));
            }
        };
        let on_inner_failure = move |e| {
            settler.succeed(Err(e));
        };
        task.subscribe(on_inner_success, on_inner_failure)
    })
}

/// Runs a task whose success value is a reified outcome and unwraps it:
/// success with `Ok(v)` becomes success with `v`, success with `Err(e)`
/// becomes failure with `e`.
pub fn absolve<T: Send + 'static>(task: Task<Result<T>>) -> Task<T> {
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let on_inner_success = {
            let settler = settler.clone();
            move |outcome: Result<T>| match outcome {
                Ok(v) => {
                    settler.succeed(v);
                }
                Err(e) => {
                    settler.fail(e);
                }
            }
        };
        let on_inner_failure = move |e| {
            settler.fail(e);
        };
        task.subscribe(on_inner_success, on_inner_failure)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn attempt_reifies_success() {
        let out = attempt(Task::ready(4)).block_on().unwrap();
        assert_eq!(out.unwrap(), 4);
    }

    #[test]
    fn attempt_reifies_failure() {
        let out = attempt(Task::<i32>::fail(Error::msg("oops")))
            .block_on()
            .unwrap();
        assert_eq!(out.unwrap_err().to_string(), "user error: oops");
    }

    #[test]
    fn absolve_after_attempt_is_identity() {
        assert_eq!(absolve(attempt(Task::ready(9))).block_on().unwrap(), 9);
        let err = absolve(attempt(Task::<i32>::fail(Error::msg("kept"))))
            .block_on()
            .unwrap_err();
        assert_eq!(err.to_string(), "user error: kept");
    }

    #[test]
    fn attempt_after_absolve_is_identity() {
        let reified: Task<Result<i32>> = Task::ready(Ok(3));
        let out = attempt(absolve(reified)).block_on().unwrap();
        assert_eq!(out.unwrap(), 3);

        let reified: Task<Result<i32>> = Task::ready(Err(Error::msg("still here")));
        let out = attempt(absolve(reified)).block_on().unwrap();
        assert_eq!(out.unwrap_err().to_string(), "user error: still here");
    }

    #[test]
    fn attempt_propagates_cancel() {
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = attempt(Task::<i32>::never()).subscribe(
            move |outcome| tx.send(outcome).unwrap(),
            |_| panic!("attempt never fails"),
        );
        cancel.cancel();
        assert!(rx.recv().unwrap().unwrap_err().is_cancelled());
    }
}
