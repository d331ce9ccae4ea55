//! Gather: interleave several discrete flows.

use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

struct GatherState<T> {
    handles: SmallVec<[Option<Arc<Handle<T>>>; 4]>,
    /// Upstreams with an outstanding notification, oldest first.
    queue: VecDeque<usize>,
    done: usize,
    total: usize,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// Emits upstream values as they arrive, from any source, serving ready
/// upstreams oldest-notification-first. Upstreams stay backpressured:
/// a ready upstream is transferred only when the consumer takes its
/// value. The composite terminates when every upstream has terminated;
/// any failure cancels the rest.
pub fn gather<T: Send + 'static>(flows: Vec<Flow<T>>) -> Flow<T> {
    Flow::new(move |notifier, terminator| {
        if flows.is_empty() {
            terminator();
            return Handle::new(
                || Err(Error::protocol("transfer on an empty gather")),
                Cancel::noop(),
            );
        }
        let total = flows.len();
        let state = Arc::new(Mutex::new(GatherState::<T> {
            handles: flows.iter().map(|_| None).collect(),
            queue: VecDeque::new(),
            done: 0,
            total,
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
        }));
        for (index, flow) in flows.into_iter().enumerate() {
            let handle = flow.subscribe(
                {
                    let state = Arc::clone(&state);
                    let notifier = Arc::clone(&notifier);
                    let terminator = Arc::clone(&terminator);
                    move || {
                        state
                            .lock()
                            .expect("gather lock poisoned")
                            .queue
                            .push_back(index);
                        process(&state, &notifier, &terminator);
                    }
                },
                {
                    let state = Arc::clone(&state);
                    let notifier = Arc::clone(&notifier);
                    let terminator = Arc::clone(&terminator);
                    move || {
                        state.lock().expect("gather lock poisoned").done += 1;
                        process(&state, &notifier, &terminator);
                    }
                },
            );
            state.lock().expect("gather lock poisoned").handles[index] = Some(Arc::new(handle));
        }
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let source = {
                    let mut guard = state.lock().expect("gather lock poisoned");
                    if !guard.down_notified {
                        return Err(Error::protocol("transfer before notify"));
                    }
                    guard.down_notified = false;
                    if guard.cancelled || guard.failed.is_some() {
                        let error = if guard.cancelled {
                            Error::cancelled()
                        } else {
                            guard.failed.take().expect("failure present")
                        };
                        guard.terminated = true;
                        drop(guard);
                        terminator();
                        return Err(error);
                    }
                    let index = guard.queue.pop_front().expect("a source is ready");
                    guard.handles[index].clone().expect("handle installed")
                };
                let pulled = source.transfer();
                match pulled {
                    Ok(value) => {
                        process(&state, &notifier, &terminator);
                        Ok(value)
                    }
                    Err(error) => {
                        let others = {
                            let mut guard = state.lock().expect("gather lock poisoned");
                            guard.terminated = true;
                            guard
                                .handles
                                .iter()
                                .filter_map(Option::clone)
                                .collect::<Vec<_>>()
                        };
                        for handle in others {
                            handle.cancel();
                        }
                        terminator();
                        Err(error)
                    }
                }
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let handles = {
                    let mut guard = state.lock().expect("gather lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    guard
                        .handles
                        .iter()
                        .filter_map(Option::clone)
                        .collect::<Vec<_>>()
                };
                for handle in handles {
                    handle.cancel();
                }
                process(&state, &notifier, &terminator);
            }
        });
        Handle::new(transfer, cancel)
    })
}

fn process<T: Send + 'static>(
    state: &Arc<Mutex<GatherState<T>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) {
    loop {
        enum Action<T> {
            Discard(Arc<Handle<T>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("gather lock poisoned");
            if guard.busy {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if aborted && !guard.queue.is_empty() {
                // Drain cancelled upstreams so they can terminate; this
                // continues even after the composite's own terminator.
                let index = *guard.queue.front().expect("non-empty checked");
                match guard.handles[index].clone() {
                    Some(handle) => {
                        guard.queue.pop_front();
                        guard.busy = true;
                        Action::Discard(handle)
                    }
                    // Subscription still being installed; retry later.
                    None => Action::Idle,
                }
            } else if guard.terminated {
                return;
            } else if !guard.down_notified
                && (guard.cancelled
                    || guard.failed.is_some()
                    || guard
                        .queue
                        .front()
                        .is_some_and(|index| guard.handles[*index].is_some()))
            {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified && guard.queue.is_empty() && guard.done == guard.total {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Discard(handle) => {
                let _ = handle.transfer();
                state.lock().expect("gather lock poisoned").busy = false;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{enumerate, observe, Emitter};
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
    fn collects_all_upstream_values() {
        let mut out = drain(gather(vec![
            enumerate(vec![1, 2, 3]),
            enumerate(vec![4, 5]),
        ]));
        out.sort_unstable();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn serves_ready_upstreams_oldest_first() {
        let mk = || {
            let slot: Arc<Mutex<Option<Emitter<i32>>>> = Arc::new(Mutex::new(None));
            let slot2 = Arc::clone(&slot);
            let flow = observe(move |emitter| {
                *slot2.lock().unwrap() = Some(emitter);
                || {}
            });
            (slot, flow)
        };
        let (a, fa) = mk();
        let (b, fb) = mk();
        let handle = gather(vec![fa, fb]).subscribe(|| {}, || {});
        let ea = a.lock().unwrap().clone().unwrap();
        let eb = b.lock().unwrap().clone().unwrap();
        eb.emit(20).unwrap();
        ea.emit(10).unwrap();
        assert_eq!(handle.transfer().unwrap(), 20);
        assert_eq!(handle.transfer().unwrap(), 10);
    }

    #[test]
    fn terminates_when_all_upstreams_terminate() {
        let out = drain(gather(vec![
            enumerate(Vec::<i32>::new()),
            enumerate(vec![7]),
        ]));
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn empty_gather_terminates_immediately() {
        assert!(drain(gather(Vec::<Flow<i32>>::new())).is_empty());
    }

    #[test]
    fn cancel_reaches_every_upstream() {
        let handle = gather(vec![enumerate(0..), enumerate(100..)]).subscribe(|| {}, || {});
        let first = handle.transfer().unwrap();
        assert!(first == 0 || first == 100);
        handle.cancel();
        assert!(handle.transfer().unwrap_err().is_cancelled());
    }
}
