//! Task combinators.
//!
//! All combinators are defined purely in terms of the task contract:
//! subscribe, two continuations, an idempotent cancel. Tie-break rules:
//! children are subscribed in listed order, and the winner (first
//! success for `race`, first failure for `join`) is the first terminal
//! event observed under the combinator's state lock, regardless of
//! subscription order.

mod attempt;
mod join;
mod race;
mod timeout;

pub use attempt::{absolve, attempt};
pub use join::join;
pub use race::race;
pub use timeout::timeout;

use crate::task::{Cancel, Task};

/// Subscribes to `task` while hiding cancellation from it: the returned
/// task's cancel handle is a no-op, so the inner task always runs to its
/// own terminal event.
pub fn compel<T: Send + 'static>(task: Task<T>) -> Task<T> {
    Task::new(move |on_success, on_failure| {
        let _inner = task.subscribe(
            move |v| on_success(v),
            move |e| on_failure(e),
        );
        Cancel::noop()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn compel_ignores_cancellation() {
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = compel(sleep(Duration::from_millis(30), "ran anyway")).subscribe(
            move |v| tx.send(v).unwrap(),
            |_| panic!("compelled task must not observe cancel"),
        );
        cancel.cancel();
        assert_eq!(rx.recv().unwrap(), "ran anyway");
    }
}
