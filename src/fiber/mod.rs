//! Process blocks: suspendable computations over tasks and flows.
//!
//! The suspendable-block facility is Rust's `async` state machine: a
//! sequential process ([`sp`]) is an async body that parks on tasks with
//! [`park`], and an ambiguous process ([`ap`]) is a flow built from a
//! fork discipline and a per-value body.
//!
//! There is no executor. The body is polled on whatever thread produced
//! the event that resumed it: the subscribing thread first, then the
//! completion threads of awaited tasks. Re-entry is single-threaded — a
//! wake landing while the body is being polled is deferred to the
//! running poll loop.

pub mod ap;

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{Error, Result};
use crate::task::{Cancel, Settler, Task};
use crate::tracing_compat::trace;

/// Ambient state of the fiber currently being polled on this thread.
#[derive(Clone)]
struct FiberContext {
    cancelled: Arc<AtomicBool>,
    /// Cancel handle of the task the fiber is currently parked on.
    parked: Arc<Mutex<Option<Cancel>>>,
}

thread_local! {
    static CURRENT: RefCell<Vec<FiberContext>> = const { RefCell::new(Vec::new()) };
}

fn current_context() -> Option<FiberContext> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// Polls cancellation of the enclosing process, failing if it was
/// cancelled. Outside a process this is always `Ok`.
pub fn check() -> Result<()> {
    match current_context() {
        Some(ctx) if ctx.cancelled.load(Ordering::Acquire) => Err(Error::cancelled()),
        _ => Ok(()),
    }
}

trait Resumable: Send + Sync {
    fn resume(self: Arc<Self>);
}

struct FiberWaker {
    fiber: Arc<dyn Resumable>,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        Arc::clone(&self.fiber).resume();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(&self.fiber).resume();
    }
}

struct FiberFlags {
    running: bool,
    repoll: bool,
    done: bool,
}

struct Fiber<T, F> {
    body: Mutex<Pin<Box<F>>>,
    settler: Settler<T>,
    flags: Mutex<FiberFlags>,
    cancelled: Arc<AtomicBool>,
    parked: Arc<Mutex<Option<Cancel>>>,
}

impl<T, F> Fiber<T, F>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let parked = self.parked.lock().expect("fiber lock poisoned").take();
        if let Some(cancel) = parked {
            cancel.cancel();
        }
    }
}

impl<T, F> Resumable for Fiber<T, F>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    fn resume(self: Arc<Self>) {
        {
            let mut flags = self.flags.lock().expect("fiber lock poisoned");
            if flags.done {
                return;
            }
            if flags.running {
                flags.repoll = true;
                return;
            }
            flags.running = true;
        }
        let waker = Waker::from(Arc::new(FiberWaker {
            fiber: Arc::clone(&self) as Arc<dyn Resumable>,
        }));
        loop {
            let context = FiberContext {
                cancelled: Arc::clone(&self.cancelled),
                parked: Arc::clone(&self.parked),
            };
            CURRENT.with(|stack| stack.borrow_mut().push(context));
            let polled = {
                let mut body = self.body.lock().expect("fiber lock poisoned");
                let mut cx = Context::from_waker(&waker);
                body.as_mut().poll(&mut cx)
            };
            CURRENT.with(|stack| {
                stack.borrow_mut().pop();
            });
            match polled {
                Poll::Ready(outcome) => {
                    self.flags.lock().expect("fiber lock poisoned").done = true;
                    trace!("fiber completed");
                    match outcome {
                        Ok(value) => {
                            self.settler.succeed(value);
                        }
                        Err(error) => {
                            self.settler.fail(error);
                        }
                    }
                    return;
                }
                Poll::Pending => {
                    let mut flags = self.flags.lock().expect("fiber lock poisoned");
                    if flags.repoll {
                        flags.repoll = false;
                        continue;
                    }
                    flags.running = false;
                    return;
                }
            }
        }
    }
}

/// A sequential process: runs an async body as a task.
///
/// The body parks on tasks with [`park`] and observes cancellation as an
/// `Err(Cancelled)` at the next park, or at an explicit [`check`].
/// Cancelling the process cancels the currently-parked task and every
/// subsequently parked one.
pub fn sp<T, F>(body: F) -> Task<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    Task::new(move |on_success, on_failure| {
        let fiber = Arc::new(Fiber {
            body: Mutex::new(Box::pin(body)),
            settler: Settler::new(on_success, on_failure),
            flags: Mutex::new(FiberFlags {
                running: false,
                repoll: false,
                done: false,
            }),
            cancelled: Arc::new(AtomicBool::new(false)),
            parked: Arc::new(Mutex::new(None)),
        });
        Arc::clone(&fiber).resume();
        Cancel::new(move || {
            fiber.cancel();
        })
    })
}

/// Builds a sequential process from an async block.
///
/// ```ignore
/// let total = sp! {
///     let a = park(sleep(Duration::from_millis(10), 1)).await?;
///     let b = park(sleep(Duration::from_millis(10), 2)).await?;
///     Ok(a + b)
/// };
/// ```
#[macro_export]
macro_rules! sp {
    ($($body:tt)*) => {
        $crate::fiber::sp(async move { $($body)* })
    };
}

enum ParkPhase<T> {
    /// Not yet subscribed.
    Fresh(Task<T>),
    /// Subscribed, waiting on the terminal event.
    Waiting,
    /// Terminal event consumed.
    Spent,
}

/// Future adapter parking the enclosing process on a task.
///
/// The first poll subscribes the task and registers its cancel handle
/// with the enclosing fiber; the terminal event wakes the body with the
/// task's value or error. Outside a process `park` still works — it just
/// has no ambient cancellation to observe.
pub fn park<T: Send + 'static>(task: Task<T>) -> Park<T> {
    Park {
        phase: ParkPhase::Fresh(task),
        slot: Arc::new(Mutex::new(None)),
    }
}

/// Future returned by [`park`].
pub struct Park<T> {
    phase: ParkPhase<T>,
    slot: Arc<Mutex<Option<Result<T>>>>,
}

impl<T: Send + 'static> Future for Park<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.slot.lock().expect("park lock poisoned").take() {
            this.phase = ParkPhase::Spent;
            return Poll::Ready(outcome);
        }
        match std::mem::replace(&mut this.phase, ParkPhase::Waiting) {
            ParkPhase::Fresh(task) => {
                let context = current_context();
                if let Some(ctx) = &context {
                    if ctx.cancelled.load(Ordering::Acquire) {
                        this.phase = ParkPhase::Spent;
                        return Poll::Ready(Err(Error::cancelled()));
                    }
                }
                let waker = cx.waker().clone();
                let on_success = {
                    let slot = Arc::clone(&this.slot);
                    let waker = waker.clone();
                    let context = context.clone();
                    move |value| {
                        settle_park(&slot, Ok(value), context.as_ref());
                        waker.wake();
                    }
                };
                let on_failure = {
                    let slot = Arc::clone(&this.slot);
                    let context = context.clone();
                    move |error| {
                        settle_park(&slot, Err(error), context.as_ref());
                        waker.wake();
                    }
                };
                let cancel = task.subscribe(on_success, on_failure);
                if let Some(ctx) = &context {
                    let already_settled = this.slot.lock().expect("park lock poisoned").is_some();
                    if !already_settled {
                        *ctx.parked.lock().expect("fiber lock poisoned") = Some(cancel.clone());
                    }
                    // Re-check: a cancel landing between the first check
                    // and the registration must still reach the task.
                    if ctx.cancelled.load(Ordering::Acquire) {
                        if let Some(cancel) = ctx.parked.lock().expect("fiber lock poisoned").take()
                        {
                            cancel.cancel();
                        }
                    }
                }
                if let Some(outcome) = this.slot.lock().expect("park lock poisoned").take() {
                    this.phase = ParkPhase::Spent;
                    return Poll::Ready(outcome);
                }
                Poll::Pending
            }
            ParkPhase::Waiting => Poll::Pending,
            ParkPhase::Spent => {
                this.phase = ParkPhase::Spent;
                Poll::Ready(Err(Error::protocol("park polled after completion")))
            }
        }
    }
}

fn settle_park<T>(
    slot: &Arc<Mutex<Option<Result<T>>>>,
    outcome: Result<T>,
    context: Option<&FiberContext>,
) {
    *slot.lock().expect("park lock poisoned") = Some(outcome);
    if let Some(ctx) = context {
        // The park is over; its cancel handle must not leak into the
        // next suspension point.
        ctx.parked.lock().expect("fiber lock poisoned").take();
    }
}
