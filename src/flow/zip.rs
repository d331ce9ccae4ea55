//! Zip: combine flows in lockstep.

use smallvec::SmallVec;
use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

struct ZipSlot<T> {
    handle: Option<Arc<Handle<T>>>,
    ready: bool,
    done: bool,
    value: Option<T>,
}

struct ZipState<T, F> {
    slots: SmallVec<[ZipSlot<T>; 4]>,
    f: Option<F>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// Waits until every upstream has emitted one value, emits
/// `f(v1, .., vn)`, then repeats: the composite proceeds in lockstep and
/// truncates to the shortest upstream. Termination of any upstream
/// (without a value in hand for the current round) terminates the
/// composite and cancels the rest.
pub fn zip<T, R, F>(f: F, flows: Vec<Flow<T>>) -> Flow<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnMut(Vec<T>) -> R + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        if flows.is_empty() {
            terminator();
            return Handle::new(
                || Err(Error::protocol("transfer on an empty zip")),
                Cancel::noop(),
            );
        }
        let state = Arc::new(Mutex::new(ZipState::<T, F> {
            slots: flows
                .iter()
                .map(|_| ZipSlot {
                    handle: None,
                    ready: false,
                    done: false,
                    value: None,
                })
                .collect(),
            f: Some(f),
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
                        state.lock().expect("zip lock poisoned").slots[index].ready = true;
                        process(&state, &notifier, &terminator);
                    }
                },
                {
                    let state = Arc::clone(&state);
                    let notifier = Arc::clone(&notifier);
                    let terminator = Arc::clone(&terminator);
                    move || {
                        state.lock().expect("zip lock poisoned").slots[index].done = true;
                        process(&state, &notifier, &terminator);
                    }
                },
            );
            state.lock().expect("zip lock poisoned").slots[index].handle = Some(Arc::new(handle));
        }
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let (values, mut f) = {
                    let mut guard = state.lock().expect("zip lock poisoned");
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
                    if guard.failed.is_some() {
                        let error = guard.failed.take().expect("failure present");
                        guard.terminated = true;
                        drop(guard);
                        terminator();
                        return Err(error);
                    }
                    let values: Vec<T> = guard
                        .slots
                        .iter_mut()
                        .map(|slot| slot.value.take().expect("round complete"))
                        .collect();
                    let f = guard.f.take().expect("combiner present");
                    (values, f)
                };
                let out = f(values);
                state.lock().expect("zip lock poisoned").f = Some(f);
                process(&state, &notifier, &terminator);
                Ok(out)
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let handles = {
                    let mut guard = state.lock().expect("zip lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    collect_handles(&guard.slots)
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

fn collect_handles<T>(slots: &SmallVec<[ZipSlot<T>; 4]>) -> Vec<Arc<Handle<T>>> {
    slots.iter().filter_map(|slot| slot.handle.clone()).collect()
}

fn process<T: Send + 'static, F>(
    state: &Arc<Mutex<ZipState<T, F>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) {
    loop {
        enum Action<T> {
            Pull(usize, Arc<Handle<T>>),
            Discard(Arc<Handle<T>>),
            Notify,
            Terminate(Vec<Arc<Handle<T>>>),
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("zip lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if aborted {
                match guard
                    .slots
                    .iter_mut()
                    .find(|slot| slot.ready && slot.handle.is_some())
                {
                    Some(slot) => {
                        slot.ready = false;
                        let handle = slot.handle.clone().expect("checked above");
                        guard.busy = true;
                        Action::Discard(handle)
                    }
                    None => {
                        if !guard.down_notified {
                            guard.down_notified = true;
                            Action::Notify
                        } else {
                            Action::Idle
                        }
                    }
                }
            } else if let Some(index) = guard
                .slots
                .iter()
                .position(|slot| slot.ready && slot.value.is_none())
            {
                match guard.slots[index].handle.clone() {
                    Some(handle) => {
                        guard.busy = true;
                        guard.slots[index].ready = false;
                        Action::Pull(index, handle)
                    }
                    None => Action::Idle,
                }
            } else if guard.slots.iter().all(|slot| slot.value.is_some()) {
                if guard.down_notified {
                    Action::Idle
                } else {
                    guard.down_notified = true;
                    Action::Notify
                }
            } else if !guard.down_notified
                && guard
                    .slots
                    .iter()
                    .any(|slot| slot.done && slot.value.is_none())
            {
                // A finished upstream cannot contribute to the next
                // round: the composite ends here.
                guard.terminated = true;
                Action::Terminate(collect_handles(&guard.slots))
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Pull(index, handle) => {
                let outcome = handle.transfer();
                let cancel_all = {
                    let mut guard = state.lock().expect("zip lock poisoned");
                    guard.busy = false;
                    match outcome {
                        Ok(value) => {
                            guard.slots[index].value = Some(value);
                            None
                        }
                        Err(error) => {
                            guard.failed = Some(error);
                            for slot in &mut guard.slots {
                                slot.value = None;
                            }
                            Some(collect_handles(&guard.slots))
                        }
                    }
                };
                if let Some(handles) = cancel_all {
                    for handle in handles {
                        handle.cancel();
                    }
                }
            }
            Action::Discard(handle) => {
                let _ = handle.transfer();
                state.lock().expect("zip lock poisoned").busy = false;
            }
            Action::Notify => notifier(),
            Action::Terminate(handles) => {
                for handle in handles {
                    handle.cancel();
                }
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
    fn combines_in_lockstep() {
        let out = drain(zip(
            |vs| (vs[0], vs[1]),
            vec![enumerate(vec![1, 2, 3]), enumerate(vec![10, 20, 30])],
        ));
        assert_eq!(out, vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn truncates_to_shortest_upstream() {
        let out = drain(zip(
            |vs| vs[0] + vs[1],
            vec![enumerate(vec![1, 2, 3, 4, 5]), enumerate(vec![10, 20])],
        ));
        assert_eq!(out, vec![11, 22]);
    }

    #[test]
    fn infinite_upstream_is_cancelled_at_truncation() {
        let out = drain(zip(
            |vs| vs[0] * vs[1],
            vec![enumerate(0..), enumerate(vec![1, 2, 3])],
        ));
        assert_eq!(out, vec![0, 2, 6]);
    }

    #[test]
    fn empty_zip_terminates_immediately() {
        let out = drain(zip(|_vs: Vec<i32>| 0, Vec::new()));
        assert!(out.is_empty());
    }

    #[test]
    fn cancel_reaches_all_upstreams() {
        let handle = zip(
            |vs: Vec<i32>| vs[0] + vs[1],
            vec![enumerate(0..), enumerate(0..)],
        )
        .subscribe(|| {}, || {});
        assert_eq!(handle.transfer().unwrap(), 0);
        handle.cancel();
        assert!(handle.transfer().unwrap_err().is_cancelled());
    }
}
