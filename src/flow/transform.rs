//! Transform: drive a transducer under the flow protocol.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;
use crate::transducer::{Step, Transducer};

struct TransformState<A, B, X> {
    upstream: Option<Arc<Handle<A>>>,
    up_notified: bool,
    up_done: bool,
    xf: Option<X>,
    outputs: VecDeque<B>,
    flushed: bool,
    /// The transducer requested early termination.
    stopping: bool,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
    _marker: std::marker::PhantomData<A>,
}

/// Applies a transducer to a discrete flow.
///
/// Each upstream transfer drives the transducer, which may produce zero
/// or more downstream values; these are buffered and emitted one per
/// downstream transfer. The upstream is pulled lazily — only when the
/// output buffer is empty — so backpressure propagates end-to-end.
///
/// Early termination (`Step::Done`) cancels the upstream; already
/// buffered values and the transducer's flush output still drain before
/// the terminator. A failing stage also cancels upstream, discards the
/// unemitted buffer, and raises on the next transfer.
pub fn transform<A, B, X>(xf: X, flow: Flow<A>) -> Flow<B>
where
    A: Send + 'static,
    B: Send + 'static,
    X: Transducer<A, B>,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(TransformState::<A, B, X> {
            upstream: None,
            up_notified: false,
            up_done: false,
            xf: Some(xf),
            outputs: VecDeque::new(),
            flushed: false,
            stopping: false,
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
            _marker: std::marker::PhantomData,
        }));
        let handle = flow.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("transform lock poisoned").up_notified = true;
                    process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("transform lock poisoned").up_done = true;
                    process(&state, &notifier, &terminator);
                }
            },
        );
        let handle = Arc::new(handle);
        state.lock().expect("transform lock poisoned").upstream = Some(Arc::clone(&handle));
        // Catch anything that fired during subscription.
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || transfer_one(&state, &notifier, &terminator)
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let upstream = {
                    let mut guard = state.lock().expect("transform lock poisoned");
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

/// Serialized worker: pulls from upstream when appropriate and delivers
/// downstream signals. Re-entrant invocations (a pull synchronously
/// re-notifying) fall through the `busy` guard and are handled by the
/// running loop's next iteration.
fn process<A, B, X>(
    state: &Arc<Mutex<TransformState<A, B, X>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) where
    A: Send + 'static,
    B: Send + 'static,
    X: Transducer<A, B>,
{
    loop {
        enum Action<A, X> {
            Pull(Arc<Handle<A>>, X),
            Discard(Arc<Handle<A>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("transform lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some() || guard.stopping;
            if guard.up_notified && aborted && guard.upstream.is_some() {
                // Keep draining a cancelled upstream so it can terminate.
                guard.busy = true;
                guard.up_notified = false;
                Action::Discard(guard.upstream.clone().expect("checked above"))
            } else if guard.up_notified && guard.outputs.is_empty() {
                match (guard.upstream.clone(), guard.xf.take()) {
                    (Some(upstream), Some(xf)) => {
                        guard.busy = true;
                        guard.up_notified = false;
                        Action::Pull(upstream, xf)
                    }
                    (upstream, xf) => {
                        if let Some(xf) = xf {
                            guard.xf = Some(xf);
                        }
                        let _ = upstream;
                        Action::Idle
                    }
                }
            } else if !guard.down_notified
                && (!guard.outputs.is_empty() || guard.cancelled || guard.failed.is_some())
            {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified
                && guard.outputs.is_empty()
                && (guard.up_done || guard.stopping)
            {
                if !guard.flushed {
                    if let Some(mut xf) = guard.xf.take() {
                        guard.flushed = true;
                        guard.busy = true;
                        drop(guard);
                        let mut out = Vec::new();
                        let flushed = xf.flush(&mut out);
                        let mut guard = state.lock().expect("transform lock poisoned");
                        guard.busy = false;
                        match flushed {
                            Ok(()) => guard.outputs.extend(out),
                            Err(e) => guard.failed = Some(e),
                        }
                        continue;
                    }
                    guard.flushed = true;
                }
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Pull(upstream, mut xf) => {
                let pulled = upstream.transfer();
                let mut out = Vec::new();
                let outcome = pulled.map(|value| xf.step(value, &mut out));
                let cancel_upstream = {
                    let mut guard = state.lock().expect("transform lock poisoned");
                    guard.busy = false;
                    guard.xf = Some(xf);
                    match outcome {
                        Ok(Ok(Step::Continue)) => {
                            guard.outputs.extend(out);
                            false
                        }
                        Ok(Ok(Step::Done)) => {
                            guard.outputs.extend(out);
                            guard.stopping = true;
                            true
                        }
                        Ok(Err(stage_error)) => {
                            guard.outputs.clear();
                            guard.failed = Some(stage_error);
                            true
                        }
                        Err(upstream_error) => {
                            guard.outputs.clear();
                            guard.failed = Some(upstream_error);
                            false
                        }
                    }
                };
                if cancel_upstream {
                    let upstream = state
                        .lock()
                        .expect("transform lock poisoned")
                        .upstream
                        .clone();
                    if let Some(upstream) = upstream {
                        upstream.cancel();
                    }
                }
            }
            Action::Discard(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("transform lock poisoned").busy = false;
            }
            Action::Notify => {
                notifier();
            }
            Action::Terminate => {
                terminator();
                return;
            }
            Action::Idle => return,
        }
    }
}

fn transfer_one<A, B, X>(
    state: &Arc<Mutex<TransformState<A, B, X>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) -> crate::error::Result<B>
where
    A: Send + 'static,
    B: Send + 'static,
    X: Transducer<A, B>,
{
    let out = {
        let mut guard = state.lock().expect("transform lock poisoned");
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
    // Refill, re-notify, or terminate as the new state dictates.
    process(state, notifier, terminator);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::enumerate;
    use crate::transducer::{compose, filter, flat_map, map, partition_all, take};
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
    fn map_over_flow() {
        let out = drain(transform(map(|x: i32| x * 10), enumerate(vec![1, 2, 3])));
        assert_eq!(out, vec![10, 20, 30]);
    }

    #[test]
    fn expanding_stage_buffers_per_transfer() {
        let out = drain(transform(flat_map(|x: i32| 0..x), enumerate(vec![2, 3])));
        assert_eq!(out, vec![0, 1, 0, 1, 2]);
    }

    #[test]
    fn composed_pipeline_matches_transducer_semantics() {
        let xf = compose(
            compose(filter(|x: &i32| x % 2 == 1), flat_map(|x: i32| 0..x)),
            partition_all(4),
        );
        let out = drain(transform(xf, enumerate(0..10)));
        assert_eq!(
            out,
            vec![
                vec![0, 0, 1, 2],
                vec![0, 1, 2, 3],
                vec![4, 0, 1, 2],
                vec![3, 4, 5, 6],
                vec![0, 1, 2, 3],
                vec![4, 5, 6, 7],
                vec![8],
            ]
        );
    }

    #[test]
    fn early_termination_cancels_upstream() {
        // An unbounded upstream: only early termination lets this finish.
        let out = drain(transform(take(3), enumerate(0..)));
        assert_eq!(out, vec![0, 1, 2]);
    }

    #[test]
    fn partial_chunk_flushes_at_end() {
        let out = drain(transform(partition_all(2), enumerate(0..5)));
        assert_eq!(out, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn failing_stage_raises_downstream() {
        struct Explode;
        impl Transducer<i32, i32> for Explode {
            fn step(
                &mut self,
                input: i32,
                out: &mut Vec<i32>,
            ) -> crate::error::Result<Step> {
                if input == 2 {
                    return Err(Error::msg("stage blew up"));
                }
                out.push(input);
                Ok(Step::Continue)
            }
        }
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&terminated);
        let handle = transform(Explode, enumerate(0..10)).subscribe(
            || {},
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(handle.transfer().unwrap(), 0);
        assert_eq!(handle.transfer().unwrap(), 1);
        let err = handle.transfer().unwrap_err();
        assert_eq!(err.to_string(), "user error: stage blew up");
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_propagates_upstream() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&terminated);
        let handle = transform(map(|x: i32| x), enumerate(0..)).subscribe(
            || {},
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(handle.transfer().unwrap(), 0);
        handle.cancel();
        assert!(handle.transfer().unwrap_err().is_cancelled());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }
}
