//! Latest: a continuous combination of continuous flows.

use smallvec::SmallVec;
use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

struct LatestSlot<T> {
    handle: Option<Arc<Handle<T>>>,
    ready: bool,
    done: bool,
    current: Option<T>,
}

struct LatestState<T, F> {
    slots: SmallVec<[LatestSlot<T>; 4]>,
    f: Option<F>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// Combines the current values of several continuous flows.
///
/// Upstream notifications are sampled eagerly, as the continuous
/// contract requires. The first downstream notification fires once every
/// upstream has produced its first value; afterwards every upstream
/// change notifies again, and each transfer combines the then-current
/// tuple. The composite terminates once every upstream has terminated,
/// and cancels everything on any failure.
pub fn latest<T, R, F>(f: F, flows: Vec<Flow<T>>) -> Flow<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: FnMut(Vec<T>) -> R + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        if flows.is_empty() {
            terminator();
            return Handle::new(
                || Err(Error::protocol("transfer on an empty latest")),
                Cancel::noop(),
            );
        }
        let state = Arc::new(Mutex::new(LatestState::<T, F> {
            slots: flows
                .iter()
                .map(|_| LatestSlot {
                    handle: None,
                    ready: false,
                    done: false,
                    current: None,
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
                        state.lock().expect("latest lock poisoned").slots[index].ready = true;
                        process(&state, &notifier, &terminator);
                    }
                },
                {
                    let state = Arc::clone(&state);
                    let notifier = Arc::clone(&notifier);
                    let terminator = Arc::clone(&terminator);
                    move || {
                        state.lock().expect("latest lock poisoned").slots[index].done = true;
                        process(&state, &notifier, &terminator);
                    }
                },
            );
            state.lock().expect("latest lock poisoned").slots[index].handle = Some(Arc::new(handle));
        }
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let (values, mut f) = {
                    let mut guard = state.lock().expect("latest lock poisoned");
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
                        .iter()
                        .map(|slot| slot.current.clone().expect("warmed up"))
                        .collect();
                    let f = guard.f.take().expect("combiner present");
                    (values, f)
                };
                let out = f(values);
                state.lock().expect("latest lock poisoned").f = Some(f);
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
                    let mut guard = state.lock().expect("latest lock poisoned");
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

fn collect_handles<T>(slots: &SmallVec<[LatestSlot<T>; 4]>) -> Vec<Arc<Handle<T>>> {
    slots.iter().filter_map(|slot| slot.handle.clone()).collect()
}

fn process<T, F>(
    state: &Arc<Mutex<LatestState<T, F>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) where
    T: Clone + Send + 'static,
{
    loop {
        enum Action<T> {
            Pull(usize, Arc<Handle<T>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("latest lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if let Some(index) = guard.slots.iter().position(|slot| slot.ready) {
                match guard.slots[index].handle.clone() {
                    Some(handle) => {
                        guard.busy = true;
                        guard.slots[index].ready = false;
                        Action::Pull(index, handle)
                    }
                    None => Action::Idle,
                }
            } else if !guard.down_notified
                && (aborted || guard.slots.iter().all(|slot| slot.current.is_some()))
            {
                // Warm-up complete (or a terminal failure to surface).
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified && guard.slots.iter().all(|slot| slot.done) {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Pull(index, handle) => {
                let outcome = handle.transfer();
                let cancel_all = {
                    let mut guard = state.lock().expect("latest lock poisoned");
                    guard.busy = false;
                    match outcome {
                        Ok(value) => {
                            if !guard.cancelled && guard.failed.is_none() {
                                guard.slots[index].current = Some(value);
                                // A change after warm-up re-notifies; the
                                // loop's next turn handles it.
                            }
                            None
                        }
                        Err(error) => {
                            if guard.failed.is_none() && !guard.cancelled {
                                guard.failed = Some(error);
                                Some(collect_handles(&guard.slots))
                            } else {
                                None
                            }
                        }
                    }
                };
                if let Some(handles) = cancel_all {
                    for handle in handles {
                        handle.cancel();
                    }
                }
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
    use crate::flow::watch::{watch, Ref};

    #[test]
    fn warms_up_then_combines_current_values() {
        let a = Ref::new(1);
        let b = Ref::new(10);
        let handle = latest(
            |vs| vs[0] + vs[1],
            vec![watch(a.clone()), watch(b.clone())],
        )
        .subscribe(|| {}, || {});
        assert_eq!(handle.transfer().unwrap(), 11);
        a.set(2);
        assert_eq!(handle.transfer().unwrap(), 12);
        b.set(20);
        assert_eq!(handle.transfer().unwrap(), 22);
    }

    #[test]
    fn changes_between_transfers_collapse_to_newest() {
        let a = Ref::new(0);
        let handle = latest(|vs| vs[0], vec![watch(a.clone())]).subscribe(|| {}, || {});
        assert_eq!(handle.transfer().unwrap(), 0);
        a.set(1);
        a.set(2);
        a.set(3);
        assert_eq!(handle.transfer().unwrap(), 3);
    }

    #[test]
    fn cancel_reaches_all_upstreams() {
        let a = Ref::new(1);
        let b = Ref::new(2);
        let handle = latest(
            |vs: Vec<i32>| vs[0] + vs[1],
            vec![watch(a.clone()), watch(b.clone())],
        )
        .subscribe(|| {}, || {});
        assert_eq!(handle.transfer().unwrap(), 3);
        handle.cancel();
        assert!(handle.transfer().unwrap_err().is_cancelled());
        // Mutations after cancel reach no subscription.
        a.set(5);
        b.set(6);
    }
}
