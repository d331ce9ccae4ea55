//! Watch: a continuous flow over a watchable reference cell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::{Flow, Handle};
use crate::error::Error;
use crate::task::Cancel;

/// Key identifying an installed watcher, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchKey(u64);

struct RefInner<T> {
    value: RwLock<T>,
    watchers: Mutex<HashMap<u64, Arc<dyn Fn(&T) + Send + Sync>>>,
    next_key: AtomicU64,
}

/// A shared mutable cell whose mutations notify installed watchers.
///
/// This is the watchable-reference capability backing [`watch`]: `get`
/// reads the current value, `set`/`update` replace it and invoke every
/// watcher with the new value, outside the cell's locks.
pub struct Ref<T> {
    inner: Arc<RefInner<T>>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Ref<T> {
    /// Creates a cell holding `initial`.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(RefInner {
                value: RwLock::new(initial),
                watchers: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.value.read().expect("ref lock poisoned").clone()
    }

    /// Replaces the value and notifies watchers.
    pub fn set(&self, value: T) {
        {
            let mut guard = self.inner.value.write().expect("ref lock poisoned");
            *guard = value;
        }
        self.notify_watchers();
    }

    /// Applies `f` to the current value, stores the result, notifies
    /// watchers, and returns the new value.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let new = {
            let mut guard = self.inner.value.write().expect("ref lock poisoned");
            let next = f(&*guard);
            *guard = next.clone();
            next
        };
        self.notify_watchers();
        new
    }

    /// Installs a watcher called after each mutation with the new value.
    pub fn add_watch(&self, watcher: impl Fn(&T) + Send + Sync + 'static) -> WatchKey {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .insert(key, Arc::new(watcher));
        WatchKey(key)
    }

    /// Removes a previously installed watcher.
    pub fn remove_watch(&self, key: WatchKey) {
        self.inner
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .remove(&key.0);
    }

    fn notify_watchers(&self) {
        let snapshot: Vec<_> = self
            .inner
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .values()
            .cloned()
            .collect();
        let value = self.inner.value.read().expect("ref lock poisoned").clone();
        for watcher in snapshot {
            watcher(&value);
        }
    }
}

impl<T> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Ref")
    }
}

struct WatchState<T> {
    latest: Option<T>,
    notified: bool,
    cancelled: bool,
    terminated: bool,
}

/// A continuous flow over `cell`: the first notification is immediate
/// and carries the current value; each later mutation notifies again.
/// Only the most recent value is retained between notifications — older
/// changes are dropped.
///
/// # Cancellation
///
/// Cancel removes the watcher; the subscription then fails its next
/// transfer with `Cancelled` and terminates.
pub fn watch<T: Clone + Send + Sync + 'static>(cell: Ref<T>) -> Flow<T> {
    Flow::new(move |notifier, terminator| {
        let state = Arc::new(Mutex::new(WatchState {
            latest: Some(cell.get()),
            notified: true,
            cancelled: false,
            terminated: false,
        }));
        let key = cell.add_watch({
            let state = Arc::clone(&state);
            let notifier = Arc::clone(&notifier);
            move |value: &T| {
                let fire = {
                    let mut guard = state.lock().expect("watch lock poisoned");
                    if guard.cancelled || guard.terminated {
                        return;
                    }
                    guard.latest = Some(value.clone());
                    if guard.notified {
                        false
                    } else {
                        guard.notified = true;
                        true
                    }
                };
                if fire {
                    notifier();
                }
            }
        });
        notifier();
        let transfer = {
            let state = Arc::clone(&state);
            let terminator = Arc::clone(&terminator);
            move || {
                let (out, terminate) = {
                    let mut guard = state.lock().expect("watch lock poisoned");
                    if guard.cancelled {
                        guard.latest = None;
                        guard.terminated = true;
                        (Err(Error::cancelled()), true)
                    } else if !guard.notified {
                        return Err(Error::protocol("transfer before notify"));
                    } else {
                        guard.notified = false;
                        let value = guard.latest.take().expect("current value defined");
                        (Ok(value), false)
                    }
                };
                if terminate {
                    terminator();
                }
                out
            }
        };
        let cancel = Cancel::new({
            let state = Arc::clone(&state);
            move || {
                cell.remove_watch(key);
                let fire = {
                    let mut guard = state.lock().expect("watch lock poisoned");
                    if guard.terminated {
                        return;
                    }
                    guard.cancelled = true;
                    if guard.notified {
                        false
                    } else {
                        guard.notified = true;
                        true
                    }
                };
                if fire {
                    notifier();
                }
            }
        });
        Handle::new(transfer, cancel)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ref_set_and_update_notify_watchers() {
        let cell = Ref::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let key = cell.add_watch(move |v| seen2.lock().unwrap().push(*v));
        cell.set(2);
        cell.update(|v| v + 10);
        cell.remove_watch(key);
        cell.set(99);
        assert_eq!(*seen.lock().unwrap(), vec![2, 12]);
    }

    #[test]
    fn first_notification_is_immediate() {
        let cell = Ref::new("initial");
        let notes = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notes);
        let handle = watch(cell).subscribe(
            move || {
                n.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        assert_eq!(notes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.transfer().unwrap(), "initial");
    }

    #[test]
    fn only_latest_value_is_retained() {
        let cell = Ref::new(0);
        let handle = watch(cell.clone()).subscribe(|| {}, || {});
        assert_eq!(handle.transfer().unwrap(), 0);
        // Three mutations between transfers collapse to the last one.
        cell.set(1);
        cell.set(2);
        cell.set(3);
        assert_eq!(handle.transfer().unwrap(), 3);
    }

    #[test]
    fn cancel_removes_watcher_and_terminates() {
        let cell = Ref::new(0);
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&terminated);
        let handle = watch(cell.clone()).subscribe(
            || {},
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(handle.transfer().unwrap(), 0);
        handle.cancel();
        assert!(handle.transfer().unwrap_err().is_cancelled());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        // Later mutations reach no one.
        cell.set(7);
    }
}
