//! Single-assignment dataflow variable.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::task::{Cancel, Settler, Task};

struct DataflowState<T> {
    binding: Option<T>,
    waiters: VecDeque<(u64, Settler<T>)>,
    next_id: u64,
}

/// A single-assignment variable: the first write binds it forever.
///
/// `deref` is a task completing with the binding as soon as it exists;
/// waiters are woken in FIFO order. Cancelling a pending `deref` fails it
/// with `Cancelled` and leaves the variable untouched.
pub struct Dataflow<T> {
    inner: Arc<Mutex<DataflowState<T>>>,
}

impl<T> Clone for Dataflow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Dataflow<T> {
    /// Creates an unbound variable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DataflowState {
                binding: None,
                waiters: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// Binds the variable if unbound and returns the binding. A later
    /// write is ignored and returns the existing binding.
    pub fn assign(&self, value: T) -> T {
        let (binding, woken) = {
            let mut state = self.inner.lock().expect("dataflow lock poisoned");
            match &state.binding {
                Some(bound) => (bound.clone(), VecDeque::new()),
                None => {
                    state.binding = Some(value.clone());
                    (value, std::mem::take(&mut state.waiters))
                }
            }
        };
        for (_, waiter) in woken {
            waiter.succeed(binding.clone());
        }
        binding
    }

    /// A task completing with the binding as soon as it is present.
    pub fn deref(&self) -> Task<T> {
        let inner = Arc::clone(&self.inner);
        Task::new(move |on_success, on_failure| {
            let settler = Settler::new(on_success, on_failure);
            let id;
            {
                let mut state = inner.lock().expect("dataflow lock poisoned");
                if let Some(bound) = state.binding.clone() {
                    drop(state);
                    settler.succeed(bound);
                    return Cancel::noop();
                }
                id = state.next_id;
                state.next_id += 1;
                state.waiters.push_back((id, settler.clone()));
            }
            Cancel::new(move || {
                inner
                    .lock()
                    .expect("dataflow lock poisoned")
                    .waiters
                    .retain(|(wid, _)| *wid != id);
                settler.fail(Error::cancelled());
            })
        })
    }
}

impl<T: Clone + Send + 'static> Default for Dataflow<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Dataflow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dataflow")
    }
}
