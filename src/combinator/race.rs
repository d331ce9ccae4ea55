//! Race: run tasks concurrently, first success wins.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::task::{Cancel, Settler, Task};

struct RaceState {
    errors: Vec<Option<Error>>,
    pending: usize,
    won: bool,
    cancels: Vec<Option<Cancel>>,
}

/// Subscribes to every task in listed order; the first success cancels
/// the rest and wins. If every candidate fails, the race fails with a
/// `RaceFailure` aggregating all child errors in subscription order.
///
/// An empty candidate list fails immediately with an empty aggregate.
pub fn race<T: Send + 'static>(tasks: Vec<Task<T>>) -> Task<T> {
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let arity = tasks.len();
        if arity == 0 {
            settler.fail(Error::race(Vec::new()));
            return Cancel::noop();
        }
        let state = Arc::new(Mutex::new(RaceState {
            errors: (0..arity).map(|_| None).collect(),
            pending: arity,
            won: false,
            cancels: (0..arity).map(|_| None).collect(),
        }));
        for (index, task) in tasks.into_iter().enumerate() {
            let on_child_success = {
                let state = Arc::clone(&state);
                let settler = settler.clone();
                move |value: T| {
                    let losers = {
                        let mut guard = state.lock().expect("race lock poisoned");
                        if guard.won {
                            return;
                        }
                        guard.won = true;
                        guard
                            .cancels
                            .iter_mut()
                            .filter_map(Option::take)
                            .collect::<Vec<_>>()
                    };
                    for cancel in losers {
                        cancel.cancel();
                    }
                    settler.succeed(value);
                }
            };
            let on_child_failure = {
                let state = Arc::clone(&state);
                let settler = settler.clone();
                move |error: Error| {
                    let aggregate = {
                        let mut guard = state.lock().expect("race lock poisoned");
                        guard.errors[index] = Some(error);
                        guard.pending -= 1;
                        if guard.pending == 0 && !guard.won {
                            Some(
                                guard
                                    .errors
                                    .iter_mut()
                                    .map(|slot| slot.take().expect("all errors present"))
                                    .collect::<Vec<_>>(),
                            )
                        } else {
                            None
                        }
                    };
                    if let Some(children) = aggregate {
                        settler.fail(Error::race(children));
                    }
                }
            };
            let cancel = task.subscribe(on_child_success, on_child_failure);
            let already_won = {
                let mut guard = state.lock().expect("race lock poisoned");
                if guard.won {
                    true
                } else {
                    guard.cancels[index] = Some(cancel.clone());
                    false
                }
            };
            if already_won {
                cancel.cancel();
            }
        }
        Cancel::new(move || {
            let children = {
                let mut guard = state.lock().expect("race lock poisoned");
                guard
                    .cancels
                    .iter_mut()
                    .filter_map(Option::take)
                    .collect::<Vec<_>>()
            };
            for cancel in children {
                cancel.cancel();
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn first_success_wins() {
        let t1 = sleep(Duration::from_millis(10), "fast");
        let t2 = sleep(Duration::from_millis(80), "slow");
        assert_eq!(race(vec![t1, t2]).block_on().unwrap(), "fast");
    }

    #[test]
    fn loser_observes_cancellation() {
        let (tx, rx) = std::sync::mpsc::channel();
        let loser = Task::new({
            move |_s, on_failure: crate::task::OnFailure| {
                Cancel::new(move || {
                    tx.send("loser cancelled").unwrap();
                    on_failure(Error::cancelled());
                })
            }
        });
        let winner = Task::ready("won");
        assert_eq!(race(vec![loser, winner]).block_on().unwrap(), "won");
        assert_eq!(rx.recv().unwrap(), "loser cancelled");
    }

    #[test]
    fn all_failures_aggregate_in_order() {
        let t1 = Task::<i32>::fail(Error::msg("one"));
        let t2 = Task::<i32>::fail(Error::msg("two"));
        let err = race(vec![t1, t2]).block_on().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RaceFailure);
        assert_eq!(err.children().len(), 2);
        assert_eq!(err.children()[0].to_string(), "user error: one");
        assert_eq!(err.children()[1].to_string(), "user error: two");
    }

    #[test]
    fn empty_arity_fails_immediately() {
        let err = race(Vec::<Task<i32>>::new()).block_on().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RaceFailure);
        assert!(err.children().is_empty());
    }

    #[test]
    fn cancel_propagates_and_aggregates() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tasks = (0..2)
            .map(|_| sleep(Duration::from_secs(60), 0))
            .collect::<Vec<_>>();
        let cancel = race(tasks).subscribe(
            |_| panic!("cancelled race must not succeed"),
            move |e| tx.send(e).unwrap(),
        );
        cancel.cancel();
        let err = rx.recv().unwrap();
        assert_eq!(err.kind(), ErrorKind::RaceFailure);
        assert!(err.children().iter().all(Error::is_cancelled));
    }
}
