//! Reactor: a boot-scoped graph of publisher nodes with glitch-free
//! propagation.
//!
//! [`run`] creates a reactor context, runs a boot closure that spawns
//! nodes with [`stream`] (discrete) and [`signal`] (continuous), then
//! drives the graph until every node has terminated.
//!
//! # Propagation model
//!
//! Time proceeds in rounds. Nodes woken by their wrapped flow are queued
//! at their rank — a number consistent with the subscription graph: a
//! node subscribing another node's output always carries the higher
//! rank. Within a round the queue drains in rank order and each node is
//! processed at most once, pulling one value from its wrapped flow and
//! feeding every subscriber port. A node woken again in the same round
//! (a cycle through a signal, or a faster-than-round producer) is
//! deferred to the next round. Signals cache their current value and
//! propagate only on change; a late signal subscriber immediately
//! receives the cached value.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::flow::{Flow, Handle};
use crate::task::{Cancel, Settler, Task};
use crate::tracing_compat::trace;

thread_local! {
    static CURRENT_REACTOR: RefCell<Vec<Arc<ReactorCtx>>> = const { RefCell::new(Vec::new()) };
    /// (node id, rank) of the node whose subscriptions are being set up.
    static CURRENT_NODE: RefCell<Vec<(u64, u64)>> = const { RefCell::new(Vec::new()) };
}

fn current_reactor() -> Option<Arc<ReactorCtx>> {
    CURRENT_REACTOR.with(|stack| stack.borrow().last().cloned())
}

trait NodeDriver: Send + Sync {
    /// Processes one wake-up: pulls at most one value from the wrapped
    /// flow and feeds the subscriber ports.
    fn step(self: Arc<Self>, ctx: &Arc<ReactorCtx>);
    /// Cancels the wrapped flow subscription.
    fn cancel(self: Arc<Self>);
}

struct ReactorState {
    drivers: HashMap<u64, Arc<dyn NodeDriver>>,
    ranks: HashMap<u64, u64>,
    /// Round each node was last processed in.
    visited: HashMap<u64, u64>,
    round: u64,
    /// Nodes woken for the current round, by rank.
    queue: BinaryHeap<Reverse<(u64, u64)>>,
    /// Nodes deferred to the next round (visited-this-round rule).
    deferred: Vec<u64>,
    /// Port notifications parked until their subscriber's dispatch slot.
    /// Deferring the wake-up to the subscriber's rank is what makes a
    /// round glitch-free: every producer a node depends on has emitted
    /// before the node's operator chain samples its ports.
    pending_wakes: HashMap<u64, Vec<crate::flow::Notifier>>,
    next_id: u64,
    live: usize,
    dispatching: bool,
    failed: Option<Error>,
    cancelled: bool,
    settled: bool,
}

struct ReactorCtx {
    state: Mutex<ReactorState>,
    /// Called exactly once when the graph winds down.
    completion: Mutex<Option<Box<dyn FnOnce(Option<Error>) + Send>>>,
}

impl ReactorCtx {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReactorState {
                drivers: HashMap::new(),
                ranks: HashMap::new(),
                visited: HashMap::new(),
                round: 0,
                queue: BinaryHeap::new(),
                deferred: Vec::new(),
                pending_wakes: HashMap::new(),
                next_id: 0,
                live: 0,
                dispatching: false,
                failed: None,
                cancelled: false,
                settled: false,
            }),
            completion: Mutex::new(None),
        }
    }

    /// Queues a woken node for processing, deferring it to the next
    /// round if it already ran in this one.
    fn schedule(self: &Arc<Self>, id: u64) {
        {
            let mut state = self.state.lock().expect("reactor lock poisoned");
            if state.settled {
                return;
            }
            let round = state.round;
            if state.visited.get(&id) == Some(&round) {
                if !state.deferred.contains(&id) {
                    state.deferred.push(id);
                }
            } else {
                let rank = state.ranks.get(&id).copied().unwrap_or(0);
                state.queue.push(Reverse((rank, id)));
            }
        }
        self.dispatch();
    }

    /// Drains the round queue in rank order. Only one dispatcher runs at
    /// a time; wake-ups landing meanwhile are picked up by the loop.
    fn dispatch(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("reactor lock poisoned");
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }
        loop {
            let next = {
                let mut state = self.state.lock().expect("reactor lock poisoned");
                match state.queue.pop() {
                    Some(Reverse((_rank, id))) => {
                        let round = state.round;
                        state.visited.insert(id, round);
                        state.drivers.get(&id).cloned()
                    }
                    None => {
                        if state.deferred.is_empty() {
                            state.dispatching = false;
                            drop(state);
                            self.check_done();
                            return;
                        }
                        state.round += 1;
                        trace!(round = state.round, "reactor round advanced");
                        let deferred = std::mem::take(&mut state.deferred);
                        for id in deferred {
                            let rank = state.ranks.get(&id).copied().unwrap_or(0);
                            state.queue.push(Reverse((rank, id)));
                        }
                        continue;
                    }
                }
            };
            if let Some(driver) = next {
                driver.step(self);
            }
        }
    }

    /// Parks a port notification until `subscriber`'s dispatch slot.
    fn defer_wake(self: &Arc<Self>, subscriber: u64, notifier: crate::flow::Notifier) {
        self.state
            .lock()
            .expect("reactor lock poisoned")
            .pending_wakes
            .entry(subscriber)
            .or_default()
            .push(notifier);
        self.schedule(subscriber);
    }

    fn take_wakes(self: &Arc<Self>, subscriber: u64) -> Vec<crate::flow::Notifier> {
        self.state
            .lock()
            .expect("reactor lock poisoned")
            .pending_wakes
            .remove(&subscriber)
            .unwrap_or_default()
    }

    fn node_terminated(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("reactor lock poisoned");
            state.live = state.live.saturating_sub(1);
        }
        self.check_done();
    }

    fn node_failed(self: &Arc<Self>, error: Error) {
        let drivers = {
            let mut state = self.state.lock().expect("reactor lock poisoned");
            if state.failed.is_some() || state.cancelled {
                return;
            }
            state.failed = Some(error);
            state.drivers.values().cloned().collect::<Vec<_>>()
        };
        for driver in drivers {
            driver.cancel();
        }
        self.check_done();
    }

    fn cancel_all(self: &Arc<Self>) {
        let drivers = {
            let mut state = self.state.lock().expect("reactor lock poisoned");
            if state.settled {
                return;
            }
            state.cancelled = true;
            state.drivers.values().cloned().collect::<Vec<_>>()
        };
        for driver in drivers {
            driver.cancel();
        }
        self.check_done();
    }

    fn check_done(self: &Arc<Self>) {
        let outcome = {
            let mut state = self.state.lock().expect("reactor lock poisoned");
            if state.settled || state.live > 0 {
                return;
            }
            state.settled = true;
            if state.cancelled && state.failed.is_none() {
                state.failed = Some(Error::cancelled());
            }
            state.failed.clone()
        };
        let completion = self
            .completion
            .lock()
            .expect("reactor lock poisoned")
            .take();
        if let Some(completion) = completion {
            completion(outcome);
        }
    }
}

enum PortBuffer<T> {
    /// Discrete subscribers see every emission.
    Queue(VecDeque<T>),
    /// Continuous subscribers see the latest value.
    Latest(Option<T>),
}

struct PortState<T> {
    buffer: PortBuffer<T>,
    notified: bool,
    node_done: bool,
    failed: Option<Error>,
    terminated: bool,
    cancelled: bool,
    /// Node whose subscription chain owns this port, when known.
    subscriber: Option<u64>,
    notifier: Option<crate::flow::Notifier>,
    terminator: Option<crate::flow::Terminator>,
}

struct NodeState<T> {
    handle: Option<Arc<Handle<T>>>,
    ready: bool,
    done: bool,
    current: Option<T>,
    ports: Vec<Arc<Mutex<PortState<T>>>>,
    terminated: bool,
}

struct NodeCore<T> {
    id: u64,
    /// Continuous nodes cache and deduplicate; discrete ones do not.
    continuous: bool,
    state: Mutex<NodeState<T>>,
    compare: Option<fn(&T, &T) -> bool>,
}

impl<T: Clone + Send + 'static> NodeCore<T> {
    fn emit_to_ports(&self, ctx: &Arc<ReactorCtx>, value: &T, ports: &[Arc<Mutex<PortState<T>>>]) {
        for port in ports {
            let wake = {
                let mut guard = port.lock().expect("port lock poisoned");
                if guard.terminated || guard.cancelled {
                    continue;
                }
                match &mut guard.buffer {
                    PortBuffer::Queue(queue) => queue.push_back(value.clone()),
                    PortBuffer::Latest(slot) => *slot = Some(value.clone()),
                }
                if guard.notified {
                    None
                } else {
                    guard.notified = true;
                    guard.notifier.clone().map(|n| (guard.subscriber, n))
                }
            };
            match wake {
                // A subscriber node samples in its own dispatch slot,
                // after every producer it depends on has emitted.
                Some((Some(subscriber), notifier)) => ctx.defer_wake(subscriber, notifier),
                Some((None, notifier)) => notifier(),
                None => {}
            }
        }
    }

    fn finish_ports(&self, error: Option<&Error>) {
        let ports = {
            let guard = self.state.lock().expect("node lock poisoned");
            guard.ports.clone()
        };
        for port in ports {
            let action = {
                let mut guard = port.lock().expect("port lock poisoned");
                if guard.terminated || guard.cancelled {
                    continue;
                }
                guard.node_done = true;
                guard.failed = error.cloned();
                let empty = match &guard.buffer {
                    PortBuffer::Queue(queue) => queue.is_empty(),
                    PortBuffer::Latest(slot) => slot.is_none(),
                };
                if guard.failed.is_some() && !guard.notified {
                    // Wake the subscriber so it can collect the error.
                    guard.notified = true;
                    guard.notifier.clone()
                } else if empty && !guard.notified {
                    guard.terminated = true;
                    guard.terminator.clone()
                } else {
                    None
                }
            };
            if let Some(callback) = action {
                callback();
            }
        }
    }
}

impl<T: Clone + Send + 'static> NodeDriver for NodeCore<T> {
    fn step(self: Arc<Self>, ctx: &Arc<ReactorCtx>) {
        // Deliver parked port notifications first: the operator chain
        // pulls its ports now, with every producer's round value in
        // place, and arms this node's wrapped flow.
        for wake in ctx.take_wakes(self.id) {
            wake();
        }
        let (handle, ports) = {
            let mut guard = self.state.lock().expect("node lock poisoned");
            if guard.terminated {
                return;
            }
            if guard.done {
                guard.terminated = true;
                drop(guard);
                self.finish_ports(None);
                ctx.node_terminated();
                return;
            }
            if !guard.ready || guard.handle.is_none() {
                return;
            }
            guard.ready = false;
            (
                guard.handle.clone().expect("checked above"),
                guard.ports.clone(),
            )
        };
        match handle.transfer() {
            Ok(value) => {
                let changed = {
                    let mut guard = self.state.lock().expect("node lock poisoned");
                    let changed = if self.continuous {
                        match (&guard.current, self.compare) {
                            (Some(prev), Some(eq)) => !eq(prev, &value),
                            _ => true,
                        }
                    } else {
                        true
                    };
                    if self.continuous {
                        guard.current = Some(value.clone());
                    }
                    changed.then_some(value)
                };
                if let Some(value) = changed {
                    self.emit_to_ports(ctx, &value, &ports);
                }
                // The wrapped flow may already hold the next value; the
                // schedule call defers it to the next round if needed.
                let rearm = {
                    let guard = self.state.lock().expect("node lock poisoned");
                    guard.ready || guard.done
                };
                if rearm {
                    ctx.schedule(self.id);
                }
            }
            Err(error) => {
                {
                    let mut guard = self.state.lock().expect("node lock poisoned");
                    guard.terminated = true;
                }
                self.finish_ports(Some(&error));
                ctx.node_terminated();
                ctx.node_failed(error);
            }
        }
    }

    fn cancel(self: Arc<Self>) {
        let handle = {
            let guard = self.state.lock().expect("node lock poisoned");
            if guard.terminated {
                None
            } else {
                guard.handle.clone()
            }
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}

/// A spawned publisher node: a handle producing subscription ports.
///
/// Cloneable; each [`Node::flow`] call yields an independent port,
/// subscribable from within the same reactor.
pub struct Node<T> {
    core: Arc<NodeCore<T>>,
    ctx: Arc<ReactorCtx>,
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<T: Clone + Send + 'static> Node<T> {
    /// A flow over this node's output, for consumption inside the
    /// reactor. Subscribing registers a dependency edge so the
    /// subscriber's node ranks below this one.
    pub fn flow(&self) -> Flow<T> {
        let core = Arc::clone(&self.core);
        let ctx = Arc::clone(&self.ctx);
        Flow::new(move |notifier, terminator| {
            let same_reactor = current_reactor().is_some_and(|r| Arc::ptr_eq(&r, &ctx));
            if !same_reactor {
                notifier();
                return Handle::new(
                    {
                        let mut raised = false;
                        move || {
                            if raised {
                                Err(Error::protocol("transfer after failure"))
                            } else {
                                raised = true;
                                terminator();
                                Err(Error::protocol(
                                    "node subscribed from outside its reactor",
                                ))
                            }
                        }
                    },
                    Cancel::noop(),
                );
            }
            // Rank the subscribing node below this node.
            let subscriber = CURRENT_NODE.with(|stack| stack.borrow().last().copied());
            if let Some((subscriber, _)) = subscriber {
                let mut state = ctx.state.lock().expect("reactor lock poisoned");
                let producer_rank = state.ranks.get(&core.id).copied().unwrap_or(0);
                let entry = state.ranks.entry(subscriber).or_insert(0);
                if *entry <= producer_rank {
                    *entry = producer_rank + 1;
                }
            }
            let port = Arc::new(Mutex::new(PortState::<T> {
                buffer: if core.continuous {
                    PortBuffer::Latest(None)
                } else {
                    PortBuffer::Queue(VecDeque::new())
                },
                notified: false,
                node_done: false,
                failed: None,
                terminated: false,
                cancelled: false,
                subscriber: subscriber.map(|(id, _)| id),
                notifier: Some(notifier),
                terminator: Some(terminator),
            }));
            {
                let mut node = core.state.lock().expect("node lock poisoned");
                let mut guard = port.lock().expect("port lock poisoned");
                if node.terminated {
                    guard.node_done = true;
                }
                // A continuous node hands its cached value to late
                // subscribers immediately.
                if core.continuous {
                    if let Some(current) = node.current.clone() {
                        guard.buffer = PortBuffer::Latest(Some(current));
                    }
                }
                drop(guard);
                node.ports.push(Arc::clone(&port));
            }
            let fire = {
                let mut guard = port.lock().expect("port lock poisoned");
                let has_value = match &guard.buffer {
                    PortBuffer::Queue(queue) => !queue.is_empty(),
                    PortBuffer::Latest(slot) => slot.is_some(),
                };
                if has_value && !guard.notified {
                    guard.notified = true;
                    guard.notifier.clone()
                } else if guard.node_done && !has_value && !guard.notified {
                    guard.terminated = true;
                    guard.terminator.clone()
                } else {
                    None
                }
            };
            if let Some(callback) = fire {
                callback();
            }
            let transfer = {
                let port = Arc::clone(&port);
                move || {
                    let (out, fire) = {
                        let mut guard = port.lock().expect("port lock poisoned");
                        if !guard.notified {
                            return Err(Error::protocol("transfer before notify"));
                        }
                        guard.notified = false;
                        if guard.cancelled {
                            guard.terminated = true;
                            (Err(Error::cancelled()), guard.terminator.clone())
                        } else {
                            let value = match &mut guard.buffer {
                                PortBuffer::Queue(queue) => queue.pop_front(),
                                PortBuffer::Latest(slot) => slot.take(),
                            };
                            match value {
                                Some(value) => {
                                    let more = match &guard.buffer {
                                        PortBuffer::Queue(queue) => !queue.is_empty(),
                                        PortBuffer::Latest(_) => false,
                                    };
                                    if more {
                                        guard.notified = true;
                                        (Ok(value), guard.notifier.clone())
                                    } else if guard.node_done && guard.failed.is_none() {
                                        guard.terminated = true;
                                        (Ok(value), guard.terminator.clone())
                                    } else {
                                        (Ok(value), None)
                                    }
                                }
                                None => {
                                    let error = guard
                                        .failed
                                        .take()
                                        .unwrap_or_else(Error::cancelled);
                                    guard.terminated = true;
                                    (Err(error), guard.terminator.clone())
                                }
                            }
                        }
                    };
                    if let Some(callback) = fire {
                        callback();
                    }
                    out
                }
            };
            let cancel = Cancel::new({
                let port = Arc::clone(&port);
                move || {
                    let fire = {
                        let mut guard = port.lock().expect("port lock poisoned");
                        if guard.terminated || guard.cancelled {
                            return;
                        }
                        guard.cancelled = true;
                        if guard.notified {
                            None
                        } else {
                            guard.notified = true;
                            guard.notifier.clone()
                        }
                    };
                    if let Some(callback) = fire {
                        callback();
                    }
                }
            });
            Handle::new(transfer, cancel)
        })
    }
}

impl<T> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("id", &self.core.id).finish()
    }
}

fn spawn_node<T: Clone + Send + 'static>(
    flow: Flow<T>,
    continuous: bool,
    compare: Option<fn(&T, &T) -> bool>,
) -> Result<Node<T>> {
    let Some(ctx) = current_reactor() else {
        return Err(Error::protocol("node spawned outside a reactor boot"));
    };
    let (id, rank) = {
        let mut state = ctx.state.lock().expect("reactor lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        // Creation order seeds the rank; subscriptions can only raise it.
        let rank = id;
        state.ranks.insert(id, rank);
        state.live += 1;
        (id, rank)
    };
    let core = Arc::new(NodeCore {
        id,
        continuous,
        state: Mutex::new(NodeState {
            handle: None,
            ready: false,
            done: false,
            current: None,
            ports: Vec::new(),
            terminated: false,
        }),
        compare,
    });
    CURRENT_NODE.with(|stack| stack.borrow_mut().push((id, rank)));
    let handle = flow.subscribe(
        {
            let core = Arc::clone(&core);
            let ctx = Arc::clone(&ctx);
            move || {
                core.state.lock().expect("node lock poisoned").ready = true;
                ctx.schedule(id);
            }
        },
        {
            let core = Arc::clone(&core);
            let ctx = Arc::clone(&ctx);
            move || {
                core.state.lock().expect("node lock poisoned").done = true;
                ctx.schedule(id);
            }
        },
    );
    CURRENT_NODE.with(|stack| {
        stack.borrow_mut().pop();
    });
    core.state.lock().expect("node lock poisoned").handle = Some(Arc::new(handle));
    ctx.state
        .lock()
        .expect("reactor lock poisoned")
        .drivers
        .insert(id, Arc::clone(&core) as Arc<dyn NodeDriver>);
    // Events that landed during subscription are waiting in the queue.
    ctx.schedule(id);
    Ok(Node { core, ctx })
}

/// Spawns a discrete publisher node wrapping `flow`. Must be called from
/// within a reactor boot, directly or from another node's subscription.
pub fn stream<T: Clone + Send + 'static>(flow: Flow<T>) -> Result<Node<T>> {
    spawn_node(flow, false, None)
}

/// Spawns a continuous publisher node wrapping `flow`: the node caches
/// its current value and propagates only on change.
pub fn signal<T: Clone + PartialEq + Send + 'static>(flow: Flow<T>) -> Result<Node<T>> {
    spawn_node(flow, true, Some(|a: &T, b: &T| a == b))
}

/// Runs `boot` inside a fresh reactor context and drives the spawned
/// graph until every node has terminated.
///
/// Succeeds with `boot`'s return value iff all nodes complete; fails
/// with the first node failure (the rest are cancelled) or with `boot`'s
/// error. Cancelling the task cancels every node and fails the reactor.
pub fn run<R: Send + 'static>(boot: impl FnOnce() -> Result<R> + Send + 'static) -> Task<R> {
    Task::new(move |on_success, on_failure| {
        let settler = Settler::new(on_success, on_failure);
        let ctx = Arc::new(ReactorCtx::new());
        CURRENT_REACTOR.with(|stack| stack.borrow_mut().push(Arc::clone(&ctx)));
        let booted = boot();
        CURRENT_REACTOR.with(|stack| {
            stack.borrow_mut().pop();
        });
        match booted {
            Ok(result) => {
                let result = Mutex::new(Some(result));
                {
                    let settler = settler.clone();
                    *ctx.completion.lock().expect("reactor lock poisoned") =
                        Some(Box::new(move |failure| match failure {
                            None => {
                                let value = result
                                    .lock()
                                    .expect("reactor lock poisoned")
                                    .take()
                                    .expect("boot result present");
                                settler.succeed(value);
                            }
                            Some(error) => {
                                settler.fail(error);
                            }
                        }));
                }
                ctx.check_done();
                Cancel::new(move || {
                    ctx.cancel_all();
                })
            }
            Err(error) => {
                ctx.cancel_all();
                settler.fail(error);
                Cancel::noop()
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{aggregate, enumerate};

    #[test]
    fn boot_result_is_returned_when_graph_finishes() {
        let out = run(|| {
            let _node = stream(enumerate(vec![1, 2, 3]))?;
            Ok("booted")
        })
        .block_on()
        .unwrap();
        assert_eq!(out, "booted");
    }

    #[test]
    fn spawn_outside_boot_is_refused() {
        let err = stream(enumerate(vec![1])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn stream_feeds_subscriber_node() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        run(move || {
            let source = stream(enumerate(vec![1, 2, 3]))?;
            let doubled = stream(crate::flow::transform(
                crate::transducer::map(|x: i32| x * 2),
                source.flow(),
            ))?;
            let sink = Arc::clone(&sink);
            let _drain = stream(crate::flow::transform(
                crate::transducer::map(move |x: i32| {
                    sink.lock().unwrap().push(x);
                    x
                }),
                doubled.flow(),
            ))?;
            Ok(())
        })
        .block_on()
        .unwrap();
        assert_eq!(*collected.lock().unwrap(), vec![2, 4, 6]);
    }

    #[test]
    fn signal_deduplicates_values() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        run(move || {
            let source = signal(enumerate(vec![1, 1, 2, 2, 3]))?;
            let sink = Arc::clone(&sink);
            let _drain = stream(crate::flow::transform(
                crate::transducer::map(move |x: i32| {
                    sink.lock().unwrap().push(x);
                    x
                }),
                source.flow(),
            ))?;
            Ok(())
        })
        .block_on()
        .unwrap();
        assert_eq!(*collected.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn node_failure_fails_the_reactor() {
        let err = run(|| {
            let _bad = stream(crate::flow::transform(
                FailingStage,
                enumerate(vec![1, 2, 3]),
            ))?;
            Ok(())
        })
        .block_on()
        .unwrap_err();
        assert_eq!(err.to_string(), "user error: node blew up");
    }

    struct FailingStage;
    impl crate::transducer::Transducer<i32, i32> for FailingStage {
        fn step(
            &mut self,
            input: i32,
            out: &mut Vec<i32>,
        ) -> Result<crate::transducer::Step> {
            if input == 2 {
                return Err(Error::msg("node blew up"));
            }
            out.push(input);
            Ok(crate::transducer::Step::Continue)
        }
    }

    #[test]
    fn diamond_graph_is_glitch_free() {
        // source -> (plus_one, doubled) -> combined: every observed
        // tuple must come from the same source value.
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        run(move || {
            let source = signal(enumerate(vec![1, 2, 3]))?;
            let plus_one = signal(crate::flow::transform(
                crate::transducer::map(|x: i32| x + 1),
                source.flow(),
            ))?;
            let doubled = signal(crate::flow::transform(
                crate::transducer::map(|x: i32| x * 2),
                source.flow(),
            ))?;
            let sink = Arc::clone(&sink);
            let _drain = stream(crate::flow::transform(
                crate::transducer::map(move |pair: (i32, i32)| {
                    sink.lock().unwrap().push(pair);
                    pair
                }),
                crate::flow::latest(
                    |vs: Vec<i32>| (vs[0], vs[1]),
                    vec![plus_one.flow(), doubled.flow()],
                ),
            ))?;
            Ok(())
        })
        .block_on()
        .unwrap();
        let observed = collected.lock().unwrap().clone();
        // No mixed-round tuple: (x + 1, x * 2) always agree on x.
        for (a, b) in &observed {
            assert_eq!((a - 1) * 2, *b, "glitched tuple ({a}, {b})");
        }
        assert_eq!(observed.last(), Some(&(4, 6)));
    }

    #[test]
    fn cancelling_the_reactor_cancels_nodes() {
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = run(|| {
            // A node that never terminates on its own.
            let _stuck = stream(Flow::once(crate::task::Task::<i32>::never()))?;
            Ok(())
        })
        .subscribe(
            |()| panic!("cancelled reactor must not succeed"),
            move |e| tx.send(e).unwrap(),
        );
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
    }

    #[test]
    fn subscribing_from_outside_the_reactor_fails() {
        let escaped: Arc<Mutex<Option<Node<i32>>>> = Arc::new(Mutex::new(None));
        let hatch = Arc::clone(&escaped);
        run(move || {
            let node = stream(enumerate(Vec::<i32>::new()))?;
            *hatch.lock().unwrap() = Some(node);
            Ok(())
        })
        .block_on()
        .unwrap();
        let node = escaped.lock().unwrap().take().unwrap();
        let err = aggregate(|acc, v: i32| Ok(acc + v), 0, node.flow())
            .block_on()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }
}
