//! Ambiguous processes: discrete flows built from a fork discipline.
//!
//! Each combinator re-enters a body closure with every source value; the
//! body returns a flow whose values become the process's output (a
//! one-value body is lifted with [`Flow::once`](crate::flow::Flow::once)).
//! The disciplines differ in how concurrent bodies are scheduled:
//!
//! - [`concat`]: one body at a time, source pulled only between bodies —
//!   backpressured end-to-end.
//! - [`switch`]: a new source value cancels the running body; only the
//!   latest fork contributes output.
//! - [`gather`]: a concurrent body per source value; outputs interleave,
//!   with at most one value pending downstream at a time.
//!
//! Errors from any fork cancel its siblings and the source, and
//! propagate as the flow's failure. Cancelling the process cancels the
//! running forks and starts no new ones.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::flow::{Flow, Handle, Notifier, Terminator};
use crate::task::Cancel;

// ---------------------------------------------------------------------------
// concat
// ---------------------------------------------------------------------------

struct ConcatState<T, U, F> {
    upstream: Option<Arc<Handle<T>>>,
    up_ready: bool,
    up_done: bool,
    inner: Option<Arc<Handle<U>>>,
    inner_active: bool,
    inner_ready: bool,
    inner_done: bool,
    body: Option<F>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// Concat fork: iterates the source one value at a time, running each
/// body to completion before requesting the next value.
pub fn concat<T, U, F>(source: Flow<T>, body: F) -> Flow<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Flow<U> + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(ConcatState::<T, U, F> {
            upstream: None,
            up_ready: false,
            up_done: false,
            inner: None,
            inner_active: false,
            inner_ready: false,
            inner_done: false,
            body: Some(body),
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
        }));
        let handle = source.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("concat lock poisoned").up_ready = true;
                    concat_process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("concat lock poisoned").up_done = true;
                    concat_process(&state, &notifier, &terminator);
                }
            },
        );
        state.lock().expect("concat lock poisoned").upstream = Some(Arc::new(handle));
        concat_process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let inner = {
                    let mut guard = state.lock().expect("concat lock poisoned");
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
                    guard.inner_ready = false;
                    guard.inner.clone().expect("active fork present")
                };
                match inner.transfer() {
                    Ok(value) => {
                        concat_process(&state, &notifier, &terminator);
                        Ok(value)
                    }
                    Err(error) => {
                        let upstream = {
                            let mut guard = state.lock().expect("concat lock poisoned");
                            guard.terminated = true;
                            guard.upstream.clone()
                        };
                        if let Some(upstream) = upstream {
                            upstream.cancel();
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
                let (upstream, inner) = {
                    let mut guard = state.lock().expect("concat lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    (guard.upstream.clone(), guard.inner.clone())
                };
                if let Some(upstream) = upstream {
                    upstream.cancel();
                }
                if let Some(inner) = inner {
                    inner.cancel();
                }
                concat_process(&state, &notifier, &terminator);
            }
        });
        Handle::new(transfer, cancel)
    })
}

fn concat_process<T, U, F>(
    state: &Arc<Mutex<ConcatState<T, U, F>>>,
    notifier: &Notifier,
    terminator: &Terminator,
) where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Flow<U> + Send + 'static,
{
    loop {
        enum Action<T, U, F> {
            Spawn(Arc<Handle<T>>, F),
            DiscardUp(Arc<Handle<T>>),
            DiscardInner(Arc<Handle<U>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("concat lock poisoned");
            if guard.busy || guard.terminated {
                return;
            }
            if guard.inner_done {
                guard.inner_done = false;
                guard.inner_active = false;
                guard.inner = None;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if aborted && guard.up_ready && guard.upstream.is_some() {
                guard.busy = true;
                guard.up_ready = false;
                Action::DiscardUp(guard.upstream.clone().expect("checked above"))
            } else if aborted && guard.inner_ready && guard.inner.is_some() {
                guard.busy = true;
                guard.inner_ready = false;
                Action::DiscardInner(guard.inner.clone().expect("checked above"))
            } else if !aborted
                && guard.up_ready
                && !guard.inner_active
                && guard.upstream.is_some()
                && guard.body.is_some()
            {
                guard.busy = true;
                guard.up_ready = false;
                Action::Spawn(
                    guard.upstream.clone().expect("checked above"),
                    guard.body.take().expect("checked above"),
                )
            } else if !guard.down_notified && (guard.inner_ready || aborted) {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified
                && guard.up_done
                && !guard.inner_active
                && !guard.up_ready
            {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Spawn(upstream, mut body) => {
                let pulled = upstream.transfer();
                match pulled {
                    Ok(value) => {
                        let fork = body(value);
                        let inner_handle = fork.subscribe_shared(
                            Arc::new({
                                let state = Arc::clone(state);
                                let notifier = Arc::clone(notifier);
                                let terminator = Arc::clone(terminator);
                                move || {
                                    state.lock().expect("concat lock poisoned").inner_ready = true;
                                    concat_process(&state, &notifier, &terminator);
                                }
                            }),
                            Arc::new({
                                let state = Arc::clone(state);
                                let notifier = Arc::clone(notifier);
                                let terminator = Arc::clone(terminator);
                                move || {
                                    state.lock().expect("concat lock poisoned").inner_done = true;
                                    concat_process(&state, &notifier, &terminator);
                                }
                            }),
                        );
                        let inner_handle = Arc::new(inner_handle);
                        let cancel_inner = {
                            let mut guard = state.lock().expect("concat lock poisoned");
                            guard.busy = false;
                            guard.body = Some(body);
                            guard.inner = Some(Arc::clone(&inner_handle));
                            guard.inner_active = true;
                            guard.cancelled || guard.failed.is_some()
                        };
                        if cancel_inner {
                            inner_handle.cancel();
                        }
                    }
                    Err(error) => {
                        let mut guard = state.lock().expect("concat lock poisoned");
                        guard.busy = false;
                        guard.body = Some(body);
                        guard.failed = Some(error);
                    }
                }
            }
            Action::DiscardUp(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("concat lock poisoned").busy = false;
            }
            Action::DiscardInner(inner) => {
                let _ = inner.transfer();
                state.lock().expect("concat lock poisoned").busy = false;
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

// ---------------------------------------------------------------------------
// switch
// ---------------------------------------------------------------------------

struct SwitchState<T, U, F> {
    upstream: Option<Arc<Handle<T>>>,
    up_ready: bool,
    up_done: bool,
    /// Generation of the live fork; events from older forks are stale.
    generation: u64,
    /// Every not-yet-terminated fork, by generation.
    forks: HashMap<u64, Arc<Handle<U>>>,
    inner_ready: bool,
    /// Cancelled forks with an undrained notification.
    stale: Vec<Arc<Handle<U>>>,
    pending: Option<U>,
    body: Option<F>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

impl<T, U, F> SwitchState<T, U, F> {
    fn live_fork(&self) -> Option<Arc<Handle<U>>> {
        self.forks.get(&self.generation).cloned()
    }
}

/// Switch fork: each new source value cancels the running body and
/// starts a fresh one; only the latest fork contributes output.
pub fn switch<T, U, F>(source: Flow<T>, body: F) -> Flow<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Flow<U> + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(SwitchState::<T, U, F> {
            upstream: None,
            up_ready: false,
            up_done: false,
            generation: 0,
            forks: HashMap::new(),
            inner_ready: false,
            stale: Vec::new(),
            pending: None,
            body: Some(body),
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
        }));
        let handle = source.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("switch lock poisoned").up_ready = true;
                    switch_process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("switch lock poisoned").up_done = true;
                    switch_process(&state, &notifier, &terminator);
                }
            },
        );
        state.lock().expect("switch lock poisoned").upstream = Some(Arc::new(handle));
        switch_process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let out = {
                    let mut guard = state.lock().expect("switch lock poisoned");
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
                        guard.pending = None;
                        guard.terminated = true;
                        drop(guard);
                        terminator();
                        return Err(error);
                    }
                    guard.pending.take().expect("a value is pending")
                };
                switch_process(&state, &notifier, &terminator);
                Ok(out)
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let (upstream, forks) = {
                    let mut guard = state.lock().expect("switch lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    guard.pending = None;
                    (
                        guard.upstream.clone(),
                        guard.forks.values().cloned().collect::<Vec<_>>(),
                    )
                };
                if let Some(upstream) = upstream {
                    upstream.cancel();
                }
                for fork in forks {
                    fork.cancel();
                }
                switch_process(&state, &notifier, &terminator);
            }
        });
        Handle::new(transfer, cancel)
    })
}

fn switch_process<T, U, F>(
    state: &Arc<Mutex<SwitchState<T, U, F>>>,
    notifier: &Notifier,
    terminator: &Terminator,
) where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Flow<U> + Send + 'static,
{
    loop {
        enum Action<T, U, F> {
            Spawn(Arc<Handle<T>>, F, Option<Arc<Handle<U>>>),
            PullInner(Arc<Handle<U>>),
            DiscardUp(Arc<Handle<T>>),
            DiscardFork(Arc<Handle<U>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("switch lock poisoned");
            if guard.busy {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if let Some(handle) = guard.stale.pop() {
                // Drain cancelled forks so they can terminate, even
                // after the composite's own terminator.
                guard.busy = true;
                Action::DiscardFork(handle)
            } else if guard.terminated {
                return;
            } else if guard.up_ready && aborted && guard.upstream.is_some() {
                guard.busy = true;
                guard.up_ready = false;
                Action::DiscardUp(guard.upstream.clone().expect("checked above"))
            } else if guard.up_ready
                && !aborted
                && guard.upstream.is_some()
                && guard.body.is_some()
            {
                guard.busy = true;
                guard.up_ready = false;
                guard.generation += 1;
                let old = guard.forks.get(&(guard.generation - 1)).cloned();
                if guard.inner_ready {
                    // The outgoing fork still owes a notification; move
                    // it to the stale drain.
                    guard.inner_ready = false;
                    if let Some(old) = old.clone() {
                        guard.stale.push(old);
                    }
                }
                Action::Spawn(
                    guard.upstream.clone().expect("checked above"),
                    guard.body.take().expect("checked above"),
                    old,
                )
            } else if guard.inner_ready && !aborted && guard.pending.is_none() {
                // Values within one fork stay ordered: prefetch only
                // when the previous value has been taken downstream.
                match guard.live_fork() {
                    Some(inner) => {
                        guard.busy = true;
                        guard.inner_ready = false;
                        Action::PullInner(inner)
                    }
                    None => Action::Idle,
                }
            } else if guard.inner_ready && aborted {
                match guard.live_fork() {
                    Some(inner) => {
                        guard.busy = true;
                        guard.inner_ready = false;
                        Action::DiscardFork(inner)
                    }
                    None => Action::Idle,
                }
            } else if !guard.down_notified && (guard.pending.is_some() || aborted) {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified
                && guard.up_done
                && !guard.up_ready
                && guard.forks.is_empty()
                && guard.pending.is_none()
            {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Spawn(upstream, mut body, old_fork) => {
                if let Some(old) = old_fork {
                    old.cancel();
                }
                let pulled = upstream.transfer();
                match pulled {
                    Ok(value) => {
                        let fork = body(value);
                        let generation = state.lock().expect("switch lock poisoned").generation;
                        let fork_handle = fork.subscribe_shared(
                            Arc::new({
                                let state = Arc::clone(state);
                                let notifier = Arc::clone(notifier);
                                let terminator = Arc::clone(terminator);
                                move || {
                                    {
                                        let mut guard =
                                            state.lock().expect("switch lock poisoned");
                                        if guard.generation == generation {
                                            guard.inner_ready = true;
                                        } else if let Some(handle) =
                                            guard.forks.get(&generation).cloned()
                                        {
                                            guard.stale.push(handle);
                                        }
                                    }
                                    switch_process(&state, &notifier, &terminator);
                                }
                            }),
                            Arc::new({
                                let state = Arc::clone(state);
                                let notifier = Arc::clone(notifier);
                                let terminator = Arc::clone(terminator);
                                move || {
                                    state
                                        .lock()
                                        .expect("switch lock poisoned")
                                        .forks
                                        .remove(&generation);
                                    switch_process(&state, &notifier, &terminator);
                                }
                            }),
                        );
                        let fork_handle = Arc::new(fork_handle);
                        let cancel_now = {
                            let mut guard = state.lock().expect("switch lock poisoned");
                            guard.busy = false;
                            guard.body = Some(body);
                            guard.forks.insert(generation, Arc::clone(&fork_handle));
                            guard.cancelled
                                || guard.failed.is_some()
                                || guard.generation != generation
                        };
                        if cancel_now {
                            fork_handle.cancel();
                        }
                    }
                    Err(error) => {
                        let forks = {
                            let mut guard = state.lock().expect("switch lock poisoned");
                            guard.busy = false;
                            guard.body = Some(body);
                            guard.failed = Some(error);
                            guard.pending = None;
                            guard.forks.values().cloned().collect::<Vec<_>>()
                        };
                        for fork in forks {
                            fork.cancel();
                        }
                    }
                }
            }
            Action::PullInner(inner) => {
                let pulled = inner.transfer();
                let cancel_all = {
                    let mut guard = state.lock().expect("switch lock poisoned");
                    guard.busy = false;
                    match pulled {
                        Ok(value) => {
                            if !guard.cancelled && guard.failed.is_none() {
                                guard.pending = Some(value);
                            }
                            None
                        }
                        Err(error) => {
                            if guard.failed.is_none() && !guard.cancelled {
                                guard.failed = Some(error);
                                guard.pending = None;
                                Some((
                                    guard.upstream.clone(),
                                    guard.forks.values().cloned().collect::<Vec<_>>(),
                                ))
                            } else {
                                None
                            }
                        }
                    }
                };
                if let Some((upstream, forks)) = cancel_all {
                    if let Some(upstream) = upstream {
                        upstream.cancel();
                    }
                    for fork in forks {
                        fork.cancel();
                    }
                }
            }
            Action::DiscardUp(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("switch lock poisoned").busy = false;
            }
            Action::DiscardFork(fork) => {
                let _ = fork.transfer();
                state.lock().expect("switch lock poisoned").busy = false;
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

// ---------------------------------------------------------------------------
// gather
// ---------------------------------------------------------------------------

struct GatherApState<T, U, F> {
    upstream: Option<Arc<Handle<T>>>,
    up_ready: bool,
    up_done: bool,
    forks: HashMap<u64, Arc<Handle<U>>>,
    next_fork: u64,
    /// Forks with an outstanding notification, oldest first.
    ready: VecDeque<u64>,
    body: Option<F>,
    failed: Option<Error>,
    cancelled: bool,
    down_notified: bool,
    terminated: bool,
    busy: bool,
}

/// Gather fork: a concurrent body per source value; outputs interleave
/// as they become available, one pending downstream value at a time.
pub fn gather<T, U, F>(source: Flow<T>, body: F) -> Flow<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Flow<U> + Send + 'static,
{
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(GatherApState::<T, U, F> {
            upstream: None,
            up_ready: false,
            up_done: false,
            forks: HashMap::new(),
            next_fork: 0,
            ready: VecDeque::new(),
            body: Some(body),
            failed: None,
            cancelled: false,
            down_notified: false,
            terminated: false,
            busy: false,
        }));
        let handle = source.subscribe(
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("ap gather lock poisoned").up_ready = true;
                    gather_process(&state, &notifier, &terminator);
                }
            },
            {
                let state = Arc::clone(&state);
                let notifier = Arc::clone(&notifier);
                let terminator = Arc::clone(&terminator);
                move || {
                    state.lock().expect("ap gather lock poisoned").up_done = true;
                    gather_process(&state, &notifier, &terminator);
                }
            },
        );
        state.lock().expect("ap gather lock poisoned").upstream = Some(Arc::new(handle));
        gather_process(&state, &notifier, &terminator);
        let transfer = {
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            let terminator = Arc::clone(&terminator);
            move || {
                let fork = {
                    let mut guard = state.lock().expect("ap gather lock poisoned");
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
                    let id = guard.ready.pop_front().expect("a fork is ready");
                    guard.forks.get(&id).cloned().expect("fork installed")
                };
                match fork.transfer() {
                    Ok(value) => {
                        gather_process(&state, &notifier, &terminator);
                        Ok(value)
                    }
                    Err(error) => {
                        let (upstream, forks) = {
                            let mut guard = state.lock().expect("ap gather lock poisoned");
                            guard.terminated = true;
                            (
                                guard.upstream.clone(),
                                guard.forks.values().cloned().collect::<Vec<_>>(),
                            )
                        };
                        if let Some(upstream) = upstream {
                            upstream.cancel();
                        }
                        for fork in forks {
                            fork.cancel();
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
                let (upstream, forks) = {
                    let mut guard = state.lock().expect("ap gather lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    (
                        guard.upstream.clone(),
                        guard.forks.values().cloned().collect::<Vec<_>>(),
                    )
                };
                if let Some(upstream) = upstream {
                    upstream.cancel();
                }
                for fork in forks {
                    fork.cancel();
                }
                gather_process(&state, &notifier, &terminator);
            }
        });
        Handle::new(transfer, cancel)
    })
}

fn gather_process<T, U, F>(
    state: &Arc<Mutex<GatherApState<T, U, F>>>,
    notifier: &Notifier,
    terminator: &Terminator,
) where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Flow<U> + Send + 'static,
{
    loop {
        enum Action<T, U, F> {
            Spawn(Arc<Handle<T>>, F),
            DiscardUp(Arc<Handle<T>>),
            DiscardFork(Arc<Handle<U>>),
            Notify,
            Terminate,
            Idle,
        }
        let action = {
            let mut guard = state.lock().expect("ap gather lock poisoned");
            if guard.busy {
                return;
            }
            let aborted = guard.cancelled || guard.failed.is_some();
            if (aborted || guard.terminated) && !guard.ready.is_empty() {
                // Drain cancelled forks so they can terminate, even
                // after the composite's own terminator.
                let id = *guard.ready.front().expect("non-empty checked");
                match guard.forks.get(&id).cloned() {
                    Some(fork) => {
                        guard.ready.pop_front();
                        guard.busy = true;
                        Action::DiscardFork(fork)
                    }
                    None => {
                        // Fork already gone; drop the stale entry.
                        guard.ready.pop_front();
                        continue;
                    }
                }
            } else if guard.terminated {
                return;
            } else if guard.up_ready && aborted && guard.upstream.is_some() {
                guard.busy = true;
                guard.up_ready = false;
                Action::DiscardUp(guard.upstream.clone().expect("checked above"))
            } else if guard.up_ready
                && !aborted
                && guard.upstream.is_some()
                && guard.body.is_some()
            {
                guard.busy = true;
                guard.up_ready = false;
                Action::Spawn(
                    guard.upstream.clone().expect("checked above"),
                    guard.body.take().expect("checked above"),
                )
            } else if !guard.down_notified && (!guard.ready.is_empty() || aborted) {
                guard.down_notified = true;
                Action::Notify
            } else if !guard.down_notified
                && guard.up_done
                && guard.forks.is_empty()
                && guard.ready.is_empty()
            {
                guard.terminated = true;
                Action::Terminate
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Spawn(upstream, mut body) => {
                let pulled = upstream.transfer();
                match pulled {
                    Ok(value) => {
                        let fork = body(value);
                        let id = {
                            let mut guard = state.lock().expect("ap gather lock poisoned");
                            let id = guard.next_fork;
                            guard.next_fork += 1;
                            id
                        };
                        let fork_handle = fork.subscribe_shared(
                            Arc::new({
                                let state = Arc::clone(state);
                                let notifier = Arc::clone(notifier);
                                let terminator = Arc::clone(terminator);
                                move || {
                                    state
                                        .lock()
                                        .expect("ap gather lock poisoned")
                                        .ready
                                        .push_back(id);
                                    gather_process(&state, &notifier, &terminator);
                                }
                            }),
                            Arc::new({
                                let state = Arc::clone(state);
                                let notifier = Arc::clone(notifier);
                                let terminator = Arc::clone(terminator);
                                move || {
                                    state
                                        .lock()
                                        .expect("ap gather lock poisoned")
                                        .forks
                                        .remove(&id);
                                    gather_process(&state, &notifier, &terminator);
                                }
                            }),
                        );
                        let fork_handle = Arc::new(fork_handle);
                        let cancel_now = {
                            let mut guard = state.lock().expect("ap gather lock poisoned");
                            guard.busy = false;
                            guard.body = Some(body);
                            guard.forks.insert(id, Arc::clone(&fork_handle));
                            guard.cancelled || guard.failed.is_some()
                        };
                        if cancel_now {
                            fork_handle.cancel();
                        }
                    }
                    Err(error) => {
                        let forks = {
                            let mut guard = state.lock().expect("ap gather lock poisoned");
                            guard.busy = false;
                            guard.body = Some(body);
                            guard.failed = Some(error);
                            guard.forks.values().cloned().collect::<Vec<_>>()
                        };
                        for fork in forks {
                            fork.cancel();
                        }
                    }
                }
            }
            Action::DiscardUp(upstream) => {
                let _ = upstream.transfer();
                state.lock().expect("ap gather lock poisoned").busy = false;
            }
            Action::DiscardFork(fork) => {
                let _ = fork.transfer();
                state.lock().expect("ap gather lock poisoned").busy = false;
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
    use crate::fiber::{park, sp};
    use crate::flow::{enumerate, observe, Emitter};
    use crate::time::sleep;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

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
            match handle.transfer() {
                Ok(v) => out.push(v),
                Err(e) => panic!("unexpected failure: {e}"),
            }
        }
        out
    }

    fn drain_blocking<T: Send + 'static>(flow: Flow<T>) -> Vec<T> {
        crate::flow::aggregate(
            |mut acc: Vec<T>, v| {
                acc.push(v);
                Ok(acc)
            },
            Vec::new(),
            flow,
        )
        .block_on()
        .unwrap()
    }

    #[test]
    fn concat_runs_bodies_in_order() {
        let out = drain(concat(enumerate(vec![1, 2, 3]), |x| {
            enumerate(vec![x * 10, x * 10 + 1])
        }));
        assert_eq!(out, vec![10, 11, 20, 21, 30, 31]);
    }

    #[test]
    fn concat_parks_inside_bodies() {
        let out = drain_blocking(concat(enumerate(vec![30u64, 10, 20]), |ms| {
            Flow::once(sp(async move {
                park(sleep(Duration::from_millis(ms), ms)).await
            }))
        }));
        // Concat preserves source order even though the sleeps would
        // finish in a different one.
        assert_eq!(out, vec![30, 10, 20]);
    }

    #[test]
    fn concat_fork_error_fails_the_process() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&terminated);
        let handle = concat(enumerate(vec![1, 2, 3]), |x| {
            if x == 2 {
                Flow::once(crate::task::Task::<i32>::fail(Error::msg("fork died")))
            } else {
                Flow::once(crate::task::Task::ready(x))
            }
        })
        .subscribe(
            || {},
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(handle.transfer().unwrap(), 1);
        let err = handle.transfer().unwrap_err();
        assert_eq!(err.to_string(), "user error: fork died");
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn switch_keeps_only_latest_fork() {
        // Forks never complete on their own; each source value replaces
        // the previous fork, and the last fork's value is the output.
        let out = drain_blocking(switch(enumerate(vec![1, 2, 3]), |x| {
            Flow::once(sp(async move {
                park(sleep(Duration::from_millis(30), x * 100)).await
            }))
        }));
        assert_eq!(out, vec![300]);
    }

    #[test]
    fn switch_emits_from_fast_forks_between_values() {
        let slot: Arc<Mutex<Option<Emitter<i32>>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let source = observe(move |emitter| {
            *slot2.lock().unwrap() = Some(emitter);
            || {}
        });
        let handle =
            switch(source, |x| enumerate(vec![x, x + 1])).subscribe(|| {}, || {});
        let emitter = slot.lock().unwrap().clone().unwrap();
        emitter.emit(10).unwrap();
        assert_eq!(handle.transfer().unwrap(), 10);
        assert_eq!(handle.transfer().unwrap(), 11);
        emitter.emit(20).unwrap();
        assert_eq!(handle.transfer().unwrap(), 20);
        assert_eq!(handle.transfer().unwrap(), 21);
    }

    #[test]
    fn gather_interleaves_fork_outputs() {
        let mut out = drain_blocking(gather(enumerate(vec![10u64, 5, 1]), |ms| {
            Flow::once(sp(async move {
                park(sleep(Duration::from_millis(ms), ms)).await
            }))
        }));
        out.sort_unstable();
        assert_eq!(out, vec![1, 5, 10]);
    }

    #[test]
    fn gather_runs_forks_concurrently() {
        use std::time::Instant;
        let started = Instant::now();
        let out = drain_blocking(gather(enumerate(vec![50u64, 50, 50]), |ms| {
            Flow::once(sp(async move {
                park(sleep(Duration::from_millis(ms), ms)).await
            }))
        }));
        assert_eq!(out.len(), 3);
        // Sequential execution would need 150 ms.
        assert!(started.elapsed() < Duration::from_millis(140));
    }

    #[test]
    fn cancel_stops_forks_and_source() {
        let (tx, rx) = std::sync::mpsc::channel();
        let flow = gather(enumerate(vec![1u64, 2]), |_x| {
            Flow::once(sleep(Duration::from_secs(60), 0u64))
        });
        let cancel = crate::flow::aggregate(
            |acc, _v: u64| Ok(acc + 1),
            0,
            flow,
        )
        .subscribe(
            |_| panic!("cancelled gather must not complete"),
            move |e| tx.send(e).unwrap(),
        );
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
    }
}
