//! Integrate and aggregate: running and terminal reductions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::{Error, Result};
use crate::task::{Cancel, Settler, Task};

struct IntegrateState<T, R, F> {
    upstream: Option<Arc<Handle<T>>>,
    up_notified: bool,
    up_done: bool,
    rf: Option<F>,
    acc: Option<R>,
    outputs: VecDeque<R>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// A discrete flow of running reductions: emits `init` immediately, then
/// `rf(prev, v)` after each upstream value.
///
/// An `rf` error cancels the upstream, discards the unemitted output,
/// and raises on the next transfer. Early termination of a reduction is
/// expressed upstream, with `transform` and a terminating stage.
pub fn integrate<T, R, F>(rf: F, init: R, flow: Flow<T>) -> Flow<R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
    F: FnMut(R, T) -> Result<R> + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(IntegrateState::<T, R, F> {
            upstream: None,
            up_notified: false,
            up_done: false,
            rf: Some(rf),
            acc: Some(init.clone()),
            outputs: VecDeque::from([init]),
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
        }));
        let handle = flow.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("integrate lock poisoned").up_notified = true;
                    process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("integrate lock poisoned").up_done = true;
                    process(&state, &notifier, &terminator);
                }
            },
        );
        state.lock().expect("integrate lock poisoned").upstream = Some(Arc::new(handle));
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let out = {
                    let mut guard = state.lock().expect("integrate lock poisoned");
                    if !guard.down_notified {
                        return Err(Error::protocol("transfer before notify"));
                    }
                    guard.down_notified = false;
                    if guard.cancelled {
                        guard.terminated = true;
                        drop(guard);
                        terminator();
                        return Err(Error::cancelled());
                    }
                    if guard.outputs.is_empty() {
                        let error = guard.failed.take().unwrap_or_else(Error::cancelled);
                        guard.terminated = true;
                        drop(guard);
                        terminator();
                        return Err(error);
                    }
                    guard.outputs.pop_front().expect("non-empty checked")
                };
                process(&state, &notifier, &terminator);
                Ok(out)
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let upstream = {
                    let mut guard = state.lock().expect("integrate lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    guard.outputs.clear();
                    guard.upstream.clone()
                };
                if let Some(upstream) = upstream {
                    upstream.cancel();
                }
                process(&state, &notifier, &terminator);
            }
        });
        Handle::new(transfer, cancel)
    })
}

fn process<T, R, F>(
    state: &Arc<Mutex<IntegrateState<T, R, F>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) where
    T: Send + 'static,
    R: Clone + Send + 'static,
    F: FnMut(R, T) -> Result<R> + Send + 'static,
{
    loop {
        enum Action<T, R, F> {
            Pull(Arc<Handle<T>>, F, R),
            Discard(Arc<Handle<T>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("integrate lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if guard.up_notified && aborted && guard.upstream.is_some() {
                guard.busy = true;
                guard.up_notified = false;
                Action::Discard(guard.upstream.clone().expect("checked above"))
            } else if guard.up_notified && guard.outputs.is_empty() {
                match (guard.upstream.clone(), guard.rf.take(), guard.acc.take()) {
                    (Some(upstream), Some(rf), Some(acc)) => {
                        guard.busy = true;
                        guard.up_notified = false;
                        Action::Pull(upstream, rf, acc)
                    }
                    (_, rf, acc) => {
                        if let Some(rf) = rf {
                            guard.rf = Some(rf);
                        }
                        if let Some(acc) = acc {
                            guard.acc = Some(acc);
                        }
                        Action::Idle
                    }
                }
            } else if !guard.down_notified
                && (!guard.outputs.is_empty() || guard.cancelled || guard.failed.is_some())
            {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified && guard.outputs.is_empty() && guard.up_done {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Pull(upstream, mut rf, acc) => {
                let outcome = upstream.transfer().and_then(|value| rf(acc.clone(), value));
                let cancel_upstream = {
                    let mut guard = state.lock().expect("integrate lock poisoned");
                    guard.busy = false;
                    guard.rf = Some(rf);
                    match outcome {
                        Ok(next) => {
                            guard.acc = Some(next.clone());
                            guard.outputs.push_back(next);
                            false
                        }
                        Err(error) => {
                            guard.outputs.clear();
                            guard.failed = Some(error);
                            true
                        }
                    }
                };
                if cancel_upstream {
                    let upstream = state
                        .lock()
                        .expect("integrate lock poisoned")
                        .upstream
                        .clone();
                    if let Some(upstream) = upstream {
                        upstream.cancel();
                    }
                }
            }
            Action::Discard(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("integrate lock poisoned").busy = false;
            }
            Action::Notify => notifier(),
            Action::Terminate => {
                terminator();
                return;
            }
            Action::Idle => return,
        }
    }
}

/// The terminal fold: drives `flow` to termination, combining every
/// value with `rf`, and completes with the final accumulator.
///
/// An `rf` error (or an upstream failure) cancels the upstream and fails
/// the task. Cancelling the task cancels the upstream, which then
/// surfaces as a `Cancelled` failure.
pub fn aggregate<T, R, F>(rf: F, init: R, flow: Flow<T>) -> Task<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnMut(R, T) -> Result<R> + Send + 'static,
{
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let state = Arc::new(Mutex::new(AggregateFoldState {
            rf: Some(rf),
            acc: Some(init),
            upstream: None,
            ready: false,
            done: false,
            failed: None,
            busy: false,
        }));
        let handle = flow.subscribe(
            {
                let state = Arc::clone(&state);
                let settler = settler.clone();
                move || {
                    state.lock().expect("aggregate lock poisoned").ready = true;
                    drive(&state, &settler);
                }
            },
            {
                let state = Arc::clone(&state);
                let settler = settler.clone();
                move || {
                    state.lock().expect("aggregate lock poisoned").done = true;
                    drive(&state, &settler);
                }
            },
        );
        let handle = Arc::new(handle);
        state.lock().expect("aggregate lock poisoned").upstream = Some(Arc::clone(&handle));
        drive(&state, &settler);
        Cancel::new(move || {
            handle.cancel();
        })
    })
}

struct AggregateFoldState<T, R, F> {
    rf: Option<F>,
    acc: Option<R>,
    upstream: Option<Arc<Handle<T>>>,
    ready: bool,
    done: bool,
    failed: Option<Error>,
    busy: bool,
}

fn drive<T, R, F>(state: &Arc<Mutex<AggregateFoldState<T, R, F>>>, settler: &Settler<R>)
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnMut(R, T) -> Result<R> + Send + 'static,
{
    loop {
        enum Action<T, R, F> {
            Pull(Arc<Handle<T>>, F, R),
            Discard(Arc<Handle<T>>),
            Succeed(R),
            Fail(Error),
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("aggregate lock poisoned");
            if guard.busy {
                return;
            }
            if guard.ready && guard.failed.is_some() && guard.upstream.is_some() {
                // Keep draining a failed/cancelled upstream so its
                // terminator can fire.
                guard.busy = true;
                guard.ready = false;
                Action::Discard(guard.upstream.clone().expect("checked above"))
            } else if guard.ready {
                match (guard.upstream.clone(), guard.rf.take(), guard.acc.take()) {
                    (Some(upstream), Some(rf), Some(acc)) => {
                        guard.busy = true;
                        guard.ready = false;
                        Action::Pull(upstream, rf, acc)
                    }
                    (_, rf, acc) => {
                        if let Some(rf) = rf {
                            guard.rf = Some(rf);
                        }
                        if let Some(acc) = acc {
                            guard.acc = Some(acc);
                        }
                        Action::Idle
                    }
                }
            } else if guard.done {
                guard.done = false;
                match guard.failed.take() {
                    Some(error) => Action::Fail(error),
                    None => match guard.acc.take() {
                        Some(acc) => Action::Succeed(acc),
                        None => Action::Idle,
                    },
                }
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Pull(upstream, mut rf, acc) => {
                let outcome = upstream.transfer().and_then(|value| rf(acc, value));
                let cancel_upstream = {
                    let mut guard = state.lock().expect("aggregate lock poisoned");
                    guard.busy = false;
                    guard.rf = Some(rf);
                    match outcome {
                        Ok(next) => {
                            guard.acc = Some(next);
                            false
                        }
                        Err(error) => {
                            if guard.failed.is_none() {
                                guard.failed = Some(error);
                            }
                            true
                        }
                    }
                };
                if cancel_upstream {
                    let upstream = state
                        .lock()
                        .expect("aggregate lock poisoned")
                        .upstream
                        .clone();
                    if let Some(upstream) = upstream {
                        upstream.cancel();
                    }
                }
            }
            Action::Discard(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("aggregate lock poisoned").busy = false;
            }
            Action::Succeed(acc) => {
                settler.succeed(acc);
                return;
            }
            Action::Fail(error) => {
                settler.fail(error);
                return;
            }
            Action::Idle => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::enumerate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn drain<T: Send + 'static>(flow: Flow<T>) -> Vec<T> {
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&terminated);
        let handle = flow.subscribe(
            || {},
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        let mut out = Vec::new();
        while terminated.load(Ordering::SeqCst) == 0 {
            out.push(handle.transfer().unwrap());
        }
        out
    }

    #[test]
    fn aggregate_sums_a_sequence() {
        let total = aggregate(|acc, v| Ok(acc + v), 0, enumerate(vec![1, 2, 3, 4, 5]))
            .block_on()
            .unwrap();
        assert_eq!(total, 15);
    }

    #[test]
    fn aggregate_collects_into_vec() {
        let out = aggregate(
            |mut acc: Vec<i32>, v| {
                acc.push(v);
                Ok(acc)
            },
            Vec::new(),
            enumerate(vec![7, 8, 9]),
        )
        .block_on()
        .unwrap();
        assert_eq!(out, vec![7, 8, 9]);
    }

    #[test]
    fn aggregate_rf_error_cancels_upstream() {
        let err = aggregate(
            |acc: i32, v: i32| {
                if v == 3 {
                    Err(Error::msg("no threes"))
                } else {
                    Ok(acc + v)
                }
            },
            0,
            enumerate(0..),
        )
        .block_on()
        .unwrap_err();
        assert_eq!(err.to_string(), "user error: no threes");
    }

    #[test]
    fn aggregate_cancel_fails_the_fold() {
        let flow = Flow::once(Task::<i32>::never());
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = aggregate(|acc, v: i32| Ok(acc + v), 0, flow).subscribe(
            |_| panic!("cancelled fold must not complete"),
            move |e| tx.send(e).unwrap(),
        );
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
    }

    #[test]
    fn integrate_emits_init_then_running_sums() {
        let out = drain(integrate(|acc, v| Ok(acc + v), 0, enumerate(vec![1, 2, 3])));
        assert_eq!(out, vec![0, 1, 3, 6]);
    }

    #[test]
    fn integrate_rf_error_raises_downstream() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&terminated);
        let handle = integrate(
            |acc: i32, v: i32| {
                if v == 2 {
                    Err(Error::msg("stop"))
                } else {
                    Ok(acc + v)
                }
            },
            0,
            enumerate(0..),
        )
        .subscribe(
            || {},
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(handle.transfer().unwrap(), 0);
        assert_eq!(handle.transfer().unwrap(), 0);
        assert_eq!(handle.transfer().unwrap(), 1);
        let err = handle.transfer().unwrap_err();
        assert_eq!(err.to_string(), "user error: stop");
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }
}
