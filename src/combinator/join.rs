//! Join: run tasks concurrently and combine every success.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::task::{Cancel, Settler, Task};

type Combine<T, R> = Box<dyn FnOnce(Vec<T>) -> R + Send>;

struct JoinState<T, R> {
    results: Vec<Option<T>>,
    pending: usize,
    failed: bool,
    cancels: Vec<Option<Cancel>>,
    combine: Option<Combine<T, R>>,
}

/// Subscribes to every task in listed order and completes with
/// `combine(values)` once all succeed, values ordered by subscription
/// regardless of completion order.
///
/// The first failure observed wins: the remaining children are cancelled
/// and their later failures are discarded. Cancelling the join cancels
/// every child; the resulting cancellation failure then propagates
/// through the same first-failure path. An empty task list completes
/// immediately with `combine(vec![])`.
pub fn join<T, R>(
    combine: impl FnOnce(Vec<T>) -> R + Send + 'static,
    tasks: Vec<Task<T>>,
) -> Task<R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let arity = tasks.len();
        if arity == 0 {
            settler.succeed(combine(Vec::new()));
            return Cancel::noop();
        }
        let state = Arc::new(Mutex::new(JoinState {
            results: (0..arity).map(|_| None).collect(),
            pending: arity,
            failed: false,
            cancels: (0..arity).map(|_| None).collect(),
            combine: Some(Box::new(combine) as Combine<T, R>),
        }));
        for (index, task) in tasks.into_iter().enumerate() {
            let on_child_success = {
                let state = Arc::clone(&state);
                let settler = settler.clone();
                move |value: T| {
                    let ready = {
                        let mut guard = state.lock().expect("join lock poisoned");
                        guard.results[index] = Some(value);
                        guard.pending -= 1;
                        if guard.pending == 0 && !guard.failed {
                            let combine = guard.combine.take().expect("combine still present");
                            let values = guard
                                .results
                                .iter_mut()
                                .map(|slot| slot.take().expect("all results present"))
                                .collect::<Vec<_>>();
                            Some((combine, values))
                        } else {
                            None
                        }
                    };
                    if let Some((combine, values)) = ready {
                        settler.succeed(combine(values));
                    }
                }
            };
            let on_child_failure = {
                let state = Arc::clone(&state);
                let settler = settler.clone();
                move |error: Error| {
                    let siblings = {
                        let mut guard = state.lock().expect("join lock poisoned");
                        if guard.failed {
                            return;
                        }
                        guard.failed = true;
                        guard
                            .cancels
                            .iter_mut()
                            .filter_map(Option::take)
                            .collect::<Vec<_>>()
                    };
                    for cancel in siblings {
                        cancel.cancel();
                    }
                    settler.fail(error);
                }
            };
            let cancel = task.subscribe(on_child_success, on_child_failure);
            let already_failed = {
                let mut guard = state.lock().expect("join lock poisoned");
                if guard.failed {
                    true
                } else {
                    guard.cancels[index] = Some(cancel.clone());
                    false
                }
            };
            if already_failed {
                cancel.cancel();
            }
        }
        Cancel::new(move || {
            let children = {
                let mut guard = state.lock().expect("join lock poisoned");
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
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn combines_in_subscription_order() {
        // The first task completes last; ordering must follow
        // subscription, not completion.
        let t1 = sleep(Duration::from_millis(60), 1);
        let t2 = sleep(Duration::from_millis(10), 2);
        let out = join(|vs| vs, vec![t1, t2]).block_on().unwrap();
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn empty_arity_completes_immediately() {
        let out = join(|vs: Vec<i32>| vs.len(), Vec::new()).block_on().unwrap();
        assert_eq!(out, 0);
    }

    #[test]
    fn first_failure_wins_and_cancels_siblings() {
        let (tx, rx) = std::sync::mpsc::channel();
        let slow = Task::new({
            let tx = tx.clone();
            move |_s, on_failure: crate::task::OnFailure| {
                Cancel::new(move || {
                    tx.send("sibling cancelled").unwrap();
                    on_failure(Error::cancelled());
                })
            }
        });
        let failing = Task::<i32>::fail(Error::msg("early"));
        let err = join(|vs| vs, vec![slow, failing]).block_on().unwrap_err();
        assert_eq!(err.to_string(), "user error: early");
        assert_eq!(rx.recv().unwrap(), "sibling cancelled");
    }

    #[test]
    fn cancel_propagates_to_all_children() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tasks = (0..3)
            .map(|_| sleep(Duration::from_secs(60), 0))
            .collect::<Vec<_>>();
        let cancel = join(|vs| vs, tasks).subscribe(
            |_| panic!("cancelled join must not succeed"),
            move |e| tx.send(e).unwrap(),
        );
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
    }
}
