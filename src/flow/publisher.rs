//! Bridge to and from reactive-streams-shaped publishers.
//!
//! The external interface is the classic four-signal shape:
//! `on_subscribe(subscription)` / `on_next(v)` / `on_error(e)` /
//! `on_complete()`, with `subscription.request(n)` / `cancel()` demand
//! control. Both bridges preserve backpressure exactly: the flow side
//! requests one element per transfer, and the publisher side emits only
//! against outstanding demand.

use std::sync::{Arc, Mutex};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

/// Demand-control half of a publisher subscription.
pub trait Subscription: Send + Sync {
    /// Requests `n` more elements.
    fn request(&self, n: u64);
    /// Cancels the subscription.
    fn cancel(&self);
}

/// Receiver of publisher signals.
///
/// Signals are serial: implementations are never called concurrently.
pub trait Subscriber<T>: Send {
    /// First signal, carrying the demand handle.
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);
    /// One element, only ever against outstanding demand.
    fn on_next(&mut self, value: T);
    /// Terminal failure signal.
    fn on_error(&mut self, error: Error);
    /// Terminal completion signal.
    fn on_complete(&mut self);
}

/// An external source of elements with demand-controlled delivery.
pub trait Publisher<T>: Send {
    /// Attaches a subscriber; signals begin with `on_subscribe`.
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>);
}

enum UpstreamSignal<T> {
    Next(T),
    Error(Error),
    Complete,
}

struct FromPublisherState<T> {
    subscription: Option<Arc<dyn Subscription>>,
    pending: Option<UpstreamSignal<T>>,
    notified: bool,
    cancelled: bool,
    terminated: bool,
}

struct BridgeSubscriber<T> {
    state: Arc<Mutex<FromPublisherState<T>>>,
    notifier: super::Notifier,
    terminator: super::Terminator,
}

enum PushAction {
    None,
    Notify,
    Terminate,
}

impl<T> BridgeSubscriber<T> {
    fn push(&mut self, signal: UpstreamSignal<T>) {
        let action = {
            let mut guard = self.state.lock().expect("bridge lock poisoned");
            if guard.terminated {
                return;
            }
            match signal {
                UpstreamSignal::Complete if guard.pending.is_none() && !guard.notified => {
                    guard.terminated = true;
                    PushAction::Terminate
                }
                signal => {
                    guard.pending = Some(signal);
                    if guard.notified {
                        PushAction::None
                    } else {
                        guard.notified = true;
                        PushAction::Notify
                    }
                }
            }
        };
        match action {
            PushAction::None => {}
            PushAction::Notify => (self.notifier)(),
            PushAction::Terminate => (self.terminator)(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for BridgeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let cancelled = {
            let mut guard = self.state.lock().expect("bridge lock poisoned");
            if guard.cancelled {
                true
            } else {
                guard.subscription = Some(Arc::clone(&subscription));
                false
            }
        };
        if cancelled {
            subscription.cancel();
        } else {
            subscription.request(1);
        }
    }

    fn on_next(&mut self, value: T) {
        self.push(UpstreamSignal::Next(value));
    }

    fn on_error(&mut self, error: Error) {
        self.push(UpstreamSignal::Error(error));
    }

    fn on_complete(&mut self) {
        self.push(UpstreamSignal::Complete);
    }
}

/// A discrete flow over an external publisher, requesting one element
/// per transfer.
pub fn from_publisher<T: Send + 'static>(publisher: impl Publisher<T> + 'static) -> Flow<T> {
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(FromPublisherState::<T> {
            subscription: None,
            pending: None,
            notified: false,
            cancelled: false,
            terminated: false,
        }));
        publisher.subscribe(Box::new(BridgeSubscriber {
            state: Arc::clone(&state),
            notifier: Arc::clone(&notifier),
            terminator: Arc::clone(&terminator),
        }));
        let transfer = {
            let state = Arc::clone(&state);
            let terminator = Arc::clone(&terminator);
            move || {
                enum After {
                    Request(Arc<dyn Subscription>),
                    Terminate,
                }
                let (out, after) = {
                    let mut guard = state.lock().expect("bridge lock poisoned");
                    if guard.cancelled {
                        guard.pending = None;
                        guard.terminated = true;
                        (Err(Error::cancelled()), Some(After::Terminate))
                    } else if !guard.notified {
                        return Err(Error::protocol("transfer before notify"));
                    } else {
                        guard.notified = false;
                        match guard.pending.take() {
                            Some(UpstreamSignal::Next(v)) => {
                                let request = guard.subscription.clone().map(After::Request);
                                (Ok(v), request)
                            }
                            Some(UpstreamSignal::Error(e)) => {
                                guard.terminated = true;
                                (Err(e), Some(After::Terminate))
                            }
                            Some(UpstreamSignal::Complete) | None => {
                                guard.terminated = true;
                                (
                                    Err(Error::protocol("publisher signalled out of demand")),
                                    Some(After::Terminate),
                                )
                            }
                        }
                    }
                };
                match after {
                    Some(After::Request(subscription)) => subscription.request(1),
                    Some(After::Terminate) => terminator(),
                    None => {}
                }
                out
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            move || {
                let (subscription, fire) = {
                    let mut guard = state.lock().expect("bridge lock poisoned");
                    if guard.terminated || guard.cancelled {
                        return;
                    }
                    guard.cancelled = true;
                    let fire = if guard.notified {
                        false
                    } else {
                        guard.notified = true;
                        true
                    };
                    (guard.subscription.take(), fire)
                };
                if let Some(subscription) = subscription {
                    subscription.cancel();
                }
                if fire {
                    notifier();
                }
            }
        });
        Handle::new(transfer, cancel)
    })
}

struct IntoPublisherState<T> {
    handle: Option<Arc<Handle<T>>>,
    demand: u64,
    ready: bool,
    upstream_done: bool,
    finished: bool,
    cancelled: bool,
    busy: bool,
}

struct FlowSubscription<T> {
    state: Arc<Mutex<IntoPublisherState<T>>>,
    subscriber: Arc<Mutex<Box<dyn Subscriber<T>>>>,
}

impl<T: Send + 'static> FlowSubscription<T> {
    /// Serialized drain loop: delivers elements while demand and data
    /// are both available, then the terminal signal. Only one thread
    /// drains at a time; others leave their state change behind and the
    /// draining thread re-reads it on the next iteration.
    fn drain(&self) {
        loop {
            enum Step<T> {
                Deliver(Arc<Handle<T>>),
                Complete,
                Idle,
            }
            let step = {
                let mut guard = self.state.lock().expect("publisher lock poisoned");
                if guard.busy || guard.finished || guard.cancelled {
                    return;
                }
                if guard.ready && guard.demand > 0 {
                    match guard.handle.clone() {
                        Some(handle) => {
                            guard.busy = true;
                            guard.ready = false;
                            guard.demand -= 1;
                            Step::Deliver(handle)
                        }
                        // Subscription still being installed; the installer
                        // drains again afterwards.
                        None => Step::Idle,
                    }
                } else if guard.upstream_done && !guard.ready {
                    guard.finished = true;
                    Step::Complete
                } else {
                    Step::Idle
                }
            };
            match step {
                Step::Deliver(handle) => {
                    match handle.transfer() {
                        Ok(value) => {
                            self.subscriber
                                .lock()
                                .expect("subscriber lock poisoned")
                                .on_next(value);
                        }
                        Err(error) => {
                            self.state.lock().expect("publisher lock poisoned").finished = true;
                            self.subscriber
                                .lock()
                                .expect("subscriber lock poisoned")
                                .on_error(error);
                            return;
                        }
                    }
                    self.state.lock().expect("publisher lock poisoned").busy = false;
                }
                Step::Complete => {
                    self.subscriber
                        .lock()
                        .expect("subscriber lock poisoned")
                        .on_complete();
                    return;
                }
                Step::Idle => return,
            }
        }
    }
}

impl<T: Send + 'static> Subscription for FlowSubscription<T> {
    fn request(&self, n: u64) {
        {
            let mut guard = self.state.lock().expect("publisher lock poisoned");
            guard.demand = guard.demand.saturating_add(n);
        }
        self.drain();
    }

    fn cancel(&self) {
        let handle = {
            let mut guard = self.state.lock().expect("publisher lock poisoned");
            if guard.cancelled || guard.finished {
                return;
            }
            guard.cancelled = true;
            guard.handle.clone()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}

/// A single-subscription publisher over a flow. Elements are pulled from
/// the flow only against outstanding demand; a second subscriber is
/// refused with a `Protocol` error.
pub fn into_publisher<T: Send + 'static>(flow: Flow<T>) -> impl Publisher<T> {
    struct FlowPublisher<T> {
        flow: Mutex<Option<Flow<T>>>,
    }
    impl<T: Send + 'static> Publisher<T> for FlowPublisher<T> {
        fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) {
            let Some(flow) = self.flow.lock().expect("publisher lock poisoned").take() else {
                let mut subscriber = subscriber;
                subscriber.on_error(Error::protocol("publisher supports a single subscription"));
                return;
            };
            let state = Arc::new(Mutex::new(IntoPublisherState::<T> {
                handle: None,
                demand: 0,
                ready: false,
                upstream_done: false,
                finished: false,
                cancelled: false,
                busy: false,
            }));
            let subscriber = Arc::new(Mutex::new(subscriber));
            let subscription = Arc::new(FlowSubscription {
                state: Arc::clone(&state),
                subscriber: Arc::clone(&subscriber),
            });
            let handle = flow.subscribe(
                {
                    let subscription = Arc::clone(&subscription);
                    move || {
                        subscription
                            .state
                            .lock()
                            .expect("publisher lock poisoned")
                            .ready = true;
                        subscription.drain();
                    }
                },
                {
                    let subscription = Arc::clone(&subscription);
                    move || {
                        subscription
                            .state
                            .lock()
                            .expect("publisher lock poisoned")
                            .upstream_done = true;
                        subscription.drain();
                    }
                },
            );
            state.lock().expect("publisher lock poisoned").handle = Some(Arc::new(handle));
            subscriber
                .lock()
                .expect("subscriber lock poisoned")
                .on_subscribe(Arc::clone(&subscription) as Arc<dyn Subscription>);
            // Events may have landed before the handle was installed.
            subscription.drain();
        }
    }
    FlowPublisher {
        flow: Mutex::new(Some(flow)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::enumerate;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every signal for assertions.
    struct Probe {
        log: Arc<Mutex<Vec<String>>>,
        subscription: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
    }

    impl Subscriber<i32> for Probe {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
            self.log.lock().unwrap().push("subscribe".into());
            *self.subscription.lock().unwrap() = Some(subscription);
        }
        fn on_next(&mut self, value: i32) {
            self.log.lock().unwrap().push(format!("next {value}"));
        }
        fn on_error(&mut self, error: Error) {
            self.log.lock().unwrap().push(format!("error {error}"));
        }
        fn on_complete(&mut self) {
            self.log.lock().unwrap().push("complete".into());
        }
    }

    #[test]
    fn publisher_respects_demand() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Mutex::new(None));
        let publisher = into_publisher(enumerate(vec![1, 2, 3]));
        publisher.subscribe(Box::new(Probe {
            log: Arc::clone(&log),
            subscription: Arc::clone(&sub),
        }));
        assert_eq!(*log.lock().unwrap(), vec!["subscribe"]);
        let subscription = sub.lock().unwrap().clone().unwrap();
        subscription.request(2);
        assert_eq!(*log.lock().unwrap(), vec!["subscribe", "next 1", "next 2"]);
        subscription.request(1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["subscribe", "next 1", "next 2", "next 3", "complete"]
        );
    }

    #[test]
    fn second_subscription_is_refused() {
        let publisher = into_publisher(enumerate(vec![1]));
        let log = Arc::new(Mutex::new(Vec::new()));
        publisher.subscribe(Box::new(Probe {
            log: Arc::new(Mutex::new(Vec::new())),
            subscription: Arc::new(Mutex::new(None)),
        }));
        publisher.subscribe(Box::new(Probe {
            log: Arc::clone(&log),
            subscription: Arc::new(Mutex::new(None)),
        }));
        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("error"));
    }

    /// A scripted in-memory publisher: delivers queued values against
    /// demand, then completes.
    struct ScriptedPublisher {
        values: Vec<i32>,
    }

    struct ScriptedSubscription {
        values: Mutex<VecDeque<i32>>,
        demand: Mutex<u64>,
        subscriber: Mutex<Option<Box<dyn Subscriber<i32>>>>,
        cancelled: Mutex<bool>,
    }

    impl ScriptedSubscription {
        fn pump(&self) {
            loop {
                // The subscriber slot doubles as a busy marker: while a
                // signal is in flight the slot is empty and the holder
                // pumps again before returning.
                let Some(mut subscriber) = self.subscriber.lock().unwrap().take() else {
                    return;
                };
                let mut delivered = false;
                loop {
                    if *self.cancelled.lock().unwrap() {
                        return;
                    }
                    let has_demand = {
                        let mut demand = self.demand.lock().unwrap();
                        if *demand == 0 {
                            false
                        } else {
                            *demand -= 1;
                            true
                        }
                    };
                    if !has_demand {
                        break;
                    }
                    match self.values.lock().unwrap().pop_front() {
                        Some(v) => {
                            subscriber.on_next(v);
                            delivered = true;
                        }
                        None => {
                            subscriber.on_complete();
                            return;
                        }
                    }
                }
                self.subscriber.lock().unwrap().replace(subscriber);
                if !delivered {
                    return;
                }
            }
        }
    }

    impl Subscription for ScriptedSubscription {
        fn request(&self, n: u64) {
            *self.demand.lock().unwrap() += n;
            self.pump();
        }
        fn cancel(&self) {
            *self.cancelled.lock().unwrap() = true;
        }
    }

    impl Publisher<i32> for ScriptedPublisher {
        fn subscribe(&self, mut subscriber: Box<dyn Subscriber<i32>>) {
            let subscription = Arc::new(ScriptedSubscription {
                values: Mutex::new(self.values.clone().into()),
                demand: Mutex::new(0),
                subscriber: Mutex::new(None),
                cancelled: Mutex::new(false),
            });
            subscriber.on_subscribe(Arc::clone(&subscription) as Arc<dyn Subscription>);
            subscription.subscriber.lock().unwrap().replace(subscriber);
            subscription.pump();
        }
    }

    #[test]
    fn from_publisher_pulls_one_per_transfer() {
        let notes = Arc::new(AtomicUsize::new(0));
        let terms = Arc::new(AtomicUsize::new(0));
        let (n, t) = (Arc::clone(&notes), Arc::clone(&terms));
        let handle = from_publisher(ScriptedPublisher {
            values: vec![10, 20, 30],
        })
        .subscribe(
            move || {
                n.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        // The pump delivers after the bridge's initial request(1); drive
        // remaining values by re-pumping through transfer's request.
        assert_eq!(handle.transfer().unwrap(), 10);
        assert_eq!(handle.transfer().unwrap(), 20);
        assert_eq!(handle.transfer().unwrap(), 30);
        assert_eq!(notes.load(Ordering::SeqCst), 3);
        assert_eq!(terms.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_publisher_cancel_reaches_subscription() {
        let handle = from_publisher(ScriptedPublisher {
            values: vec![1, 2, 3],
        })
        .subscribe(|| {}, || {});
        assert_eq!(handle.transfer().unwrap(), 1);
        handle.cancel();
        assert!(handle.transfer().unwrap_err().is_cancelled());
    }
}
