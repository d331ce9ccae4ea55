//! Sample: read a continuous flow at the pace of a discrete one.

use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

struct SampleState<A, B, F> {
    sampled: Option<Arc<Handle<A>>>,
    sampler: Option<Arc<Handle<B>>>,
    current: Option<A>,
    sampled_ready: bool,
    sampler_ready: bool,
    sampler_done: bool,
    f: Option<F>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// For every `sampler` value, emits `f(current, value)` where `current`
/// is the sampled continuous flow's value at that moment.
///
/// The sampled flow is transferred eagerly (mandatory sampling of a
/// continuous flow); the sampler is pulled lazily, one value per
/// downstream transfer. Sampler termination terminates the composite and
/// cancels the sampled flow. A failure in either side, or a sampler
/// value arriving before the sampled flow has produced its first value,
/// cancels both and propagates.
pub fn sample<A, B, R, F>(f: F, sampled: Flow<A>, sampler: Flow<B>) -> Flow<R>
where
    A: Clone + Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    F: FnMut(A, B) -> R + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(SampleState::<A, B, F> {
            sampled: None,
            sampler: None,
            current: None,
            sampled_ready: false,
            sampler_ready: false,
            sampler_done: false,
            f: Some(f),
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
        }));
        let sampled_handle = sampled.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("sample lock poisoned").sampled_ready = true;
                    process(&state, &notifier, &terminator);
                }
            },
            {
                // Sampled termination leaves the current value in place;
                // only the sampler paces and ends the composite.
                || {}
            },
        );
        state.lock().expect("sample lock poisoned").sampled = Some(Arc::new(sampled_handle));
        process(&state, &notifier, &terminator);
        let sampler_handle = sampler.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("sample lock poisoned").sampler_ready = true;
                    process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("sample lock poisoned").sampler_done = true;
                    process(&state, &notifier, &terminator);
                }
            },
        );
        state.lock().expect("sample lock poisoned").sampler = Some(Arc::new(sampler_handle));
        process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let (sampler, current, mut f) = {
                    let mut guard = state.lock().expect("sample lock poisoned");
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
                        let sampled = guard.sampled.clone();
                        drop(guard);
                        if let Some(sampled) = sampled {
                            sampled.cancel();
                        }
                        terminator();
                        return Err(error);
                    }
                    guard.sampler_ready = false;
                    (
                        guard.sampler.clone().expect("sampler installed"),
                        guard.current.clone().expect("sampled value available"),
                        guard.f.take().expect("combiner present"),
                    )
                };
                let pulled = sampler.transfer();
                match pulled {
                    Ok(value) => {
                        let out = f(current, value);
                        state.lock().expect("sample lock poisoned").f = Some(f);
                        process(&state, &notifier, &terminator);
                        Ok(out)
                    }
                    Err(error) => {
                        let sampled = {
                            let mut guard = state.lock().expect("sample lock poisoned");
                            guard.f = Some(f);
                            guard.terminated = true;
                            guard.sampled.clone()
                        };
                        if let Some(sampled) = sampled {
                            sampled.cancel();
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
                let (sampled, sampler) = {
                    let mut guard = state.lock().expect("sample lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    (guard.sampled.clone(), guard.sampler.clone())
                };
                if let Some(sampled) = sampled {
                    sampled.cancel();
                }
                if let Some(sampler) = sampler {
                    sampler.cancel();
                }
                process(&state, &notifier, &terminator);
            }
        });
        Handle::new(transfer, cancel)
    })
}

fn process<A, B, F>(
    state: &Arc<Mutex<SampleState<A, B, F>>>,
    notifier: &super::Notifier,
    terminator: &super::Terminator,
) where
    A: Clone + Send + 'static,
    B: Send + 'static,
{
    loop {
        enum Action<A, B> {
            PullSampled(Arc<Handle<A>>),
            DiscardSampled(Arc<Handle<A>>),
            DiscardSampler(Arc<Handle<B>>),
            Refuse(Option<Arc<Handle<A>>>, Option<Arc<Handle<B>>>),
            Notify,
            Terminate(Option<Arc<Handle<A>>>),
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("sample lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if guard.sampled_ready && aborted && guard.sampled.is_some() {
                guard.busy = true;
                guard.sampled_ready = false;
                Action::DiscardSampled(guard.sampled.clone().expect("checked above"))
            } else if guard.sampled_ready && !aborted && guard.sampled.is_some() {
                guard.busy = true;
                guard.sampled_ready = false;
                Action::PullSampled(guard.sampled.clone().expect("checked above"))
            } else if guard.sampled_ready {
                Action::Idle
            } else if guard.sampler_ready && aborted && guard.sampler.is_some() {
                guard.busy = true;
                guard.sampler_ready = false;
                Action::DiscardSampler(guard.sampler.clone().expect("checked above"))
            } else if guard.sampler_ready && guard.current.is_none() {
                // Sampling before the first continuous value: refuse.
                guard.failed = Some(Error::protocol(
                    "sampler produced a value before the sampled flow warmed up",
                ));
                Action::Refuse(guard.sampled.clone(), guard.sampler.clone())
            } else if !guard.down_notified
                && (aborted
                    || (guard.sampler_ready
                        && guard.current.is_some()
                        && guard.sampler.is_some()))
            {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified && guard.sampler_done && !guard.sampler_ready {
                guard.terminated = true;
                Action::Terminate(guard.sampled.clone())
            } else {
                Action::Idle
            }
        };
        match action {
            Action::PullSampled(handle) => {
                let outcome = handle.transfer();
                let cancel_sampler = {
                    let mut guard = state.lock().expect("sample lock poisoned");
                    guard.busy = false;
                    match outcome {
                        Ok(value) => {
                            if !guard.cancelled && guard.failed.is_none() {
                                guard.current = Some(value);
                            }
                            None
                        }
                        Err(error) => {
                            if guard.failed.is_none() && !guard.cancelled {
                                guard.failed = Some(error);
                                guard.sampler.clone()
                            } else {
                                None
                            }
                        }
                    }
                };
                if let Some(sampler) = cancel_sampler {
                    sampler.cancel();
                }
            }
            Action::DiscardSampled(handle) => {
                let _ = handle.transfer();
                state.lock().expect("sample lock poisoned").busy = false;
            }
            Action::DiscardSampler(handle) => {
                let _ = handle.transfer();
                state.lock().expect("sample lock poisoned").busy = false;
            }
            Action::Refuse(sampled, sampler) => {
                if let Some(sampled) = sampled {
                    sampled.cancel();
                }
                if let Some(sampler) = sampler {
                    sampler.cancel();
                }
            }
            Action::Notify => notifier(),
            Action::Terminate(sampled) => {
                if let Some(sampled) = sampled {
                    sampled.cancel();
                }
                terminator();
                return;
            }
            Action::Idle => return,
        }
    }
}
