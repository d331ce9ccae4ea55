//! Unbounded FIFO mailbox.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::task::{Cancel, Settler, Task};

struct MailboxState<T> {
    queue: VecDeque<T>,
    waiters: VecDeque<(u64, Settler<T>)>,
    next_id: u64,
}

/// An unbounded FIFO mailbox.
///
/// `post` never blocks; `fetch` is a task popping the head or waiting for
/// the next post. Waiters are served in FIFO order. Cancelling a pending
/// `fetch` fails it; posts racing with that cancellation are re-routed to
/// the next waiter or enqueued, never lost.
pub struct Mailbox<T> {
    inner: Arc<Mutex<MailboxState<T>>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Mailbox<T> {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MailboxState {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// Enqueues a message, handing it directly to the oldest live waiter
    /// if one is pending.
    pub fn post(&self, value: T) {
        let mut value = value;
        loop {
            let waiter = {
                let mut state = self.inner.lock().expect("mailbox lock poisoned");
                match state.waiters.pop_front() {
                    Some((_, waiter)) => waiter,
                    None => {
                        state.queue.push_back(value);
                        return;
                    }
                }
            };
            match waiter.offer(value) {
                None => return,
                // The waiter settled under a racing cancel; try the next.
                Some(v) => value = v,
            }
        }
    }

    /// A task popping the head message or waiting for the next post.
    pub fn fetch(&self) -> Task<T> {
        let inner = Arc::clone(&self.inner);
        Task::new(move |on_success, on_failure| {
            let settler = Settler::new(on_success, on_failure);
            let id;
            {
                let mut state = inner.lock().expect("mailbox lock poisoned");
                if let Some(head) = state.queue.pop_front() {
                    drop(state);
                    settler.succeed(head);
                    return Cancel::noop();
                }
                id = state.next_id;
                state.next_id += 1;
                state.waiters.push_back((id, settler.clone()));
            }
            Cancel::new(move || {
                inner
                    .lock()
                    .expect("mailbox lock poisoned")
                    .waiters
                    .retain(|(wid, _)| *wid != id);
                settler.fail(Error::cancelled());
            })
        })
    }
}

impl<T: Send + 'static> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Mailbox")
    }
}
