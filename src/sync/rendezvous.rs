//! Synchronous unbuffered rendez-vous.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::task::{Cancel, Settler, Task};

struct RendezvousState<T> {
    givers: VecDeque<(u64, T, Settler<()>)>,
    takers: VecDeque<(u64, Settler<T>)>,
    next_id: u64,
}

/// A synchronous, unbuffered meeting point.
///
/// `give` is a task completing when a taker accepts the value; `take` is
/// a task completing with a given value. Both sides match in FIFO order.
/// Cancelling one pending side fails it and leaves the counterpart
/// waiting for the next partner.
pub struct Rendezvous<T> {
    inner: Arc<Mutex<RendezvousState<T>>>,
}

impl<T> Clone for Rendezvous<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Rendezvous<T> {
    /// Creates an empty rendez-vous.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RendezvousState {
                givers: VecDeque::new(),
                takers: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// A task completing with `()` once a taker has accepted `value`.
    pub fn give(&self, value: T) -> Task<()> {
        let inner = Arc::clone(&self.inner);
        Task::new(move |on_success, on_failure| {
            let settler = Settler::new(on_success, on_failure);
            let mut value = value;
            let id;
            loop {
                let taker = {
                    let mut state = inner.lock().expect("rendezvous lock poisoned");
                    match state.takers.pop_front() {
                        Some((_, taker)) => taker,
                        None => {
                            id = state.next_id;
                            state.next_id += 1;
                            state.givers.push_back((id, value, settler.clone()));
                            break;
                        }
                    }
                };
                match taker.offer(value) {
                    None => {
                        settler.succeed(());
                        return Cancel::noop();
                    }
                    // The taker settled under a racing cancel; try the next.
                    Some(v) => value = v,
                }
            }
            Cancel::new(move || {
                inner
                    .lock()
                    .expect("rendezvous lock poisoned")
                    .givers
                    .retain(|(gid, _, _)| *gid != id);
                settler.fail(Error::cancelled());
            })
        })
    }

    /// A task completing with the next given value.
    pub fn take(&self) -> Task<T> {
        let inner = Arc::clone(&self.inner);
        Task::new(move |on_success, on_failure| {
            let settler = Settler::new(on_success, on_failure);
            let id;
            loop {
                let giver = {
                    let mut state = inner.lock().expect("rendezvous lock poisoned");
                    match state.givers.pop_front() {
                        Some(entry) => entry,
                        None => {
                            id = state.next_id;
                            state.next_id += 1;
                            state.takers.push_back((id, settler.clone()));
                            break;
                        }
                    }
                };
                let (_, value, give_settler) = giver;
                // Claim the giver; a concurrently-cancelled one is skipped
                // and its value dropped with it.
                if give_settler.offer(()).is_none() {
                    settler.succeed(value);
                    return Cancel::noop();
                }
            }
            Cancel::new(move || {
                inner
                    .lock()
                    .expect("rendezvous lock poisoned")
                    .takers
                    .retain(|(tid, _)| *tid != id);
                settler.fail(Error::cancelled());
            })
        })
    }
}

impl<T: Send + 'static> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Rendezvous<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rendezvous")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn give_completes_when_taken() {
        let rdv = Rendezvous::new();
        let giver = rdv.clone();
        let handle = std::thread::spawn(move || giver.give(7).block_on());
        assert_eq!(rdv.take().block_on().unwrap(), 7);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn pairs_match_in_fifo_order() {
        let rdv: Rendezvous<u32> = Rendezvous::new();
        let (tx, rx) = std::sync::mpsc::channel();
        for v in [1u32, 2, 3] {
            let tx = tx.clone();
            let _ = rdv.give(v).subscribe(move |()| tx.send(v).unwrap(), |_| {});
        }
        assert_eq!(rdv.take().block_on().unwrap(), 1);
        assert_eq!(rdv.take().block_on().unwrap(), 2);
        assert_eq!(rdv.take().block_on().unwrap(), 3);
        // Givers completed in the same order.
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[test]
    fn cancelled_give_unblocks_next_giver() {
        let rdv: Rendezvous<&str> = Rendezvous::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = rdv
            .give("dropped")
            .subscribe(|()| panic!("cancelled give must not complete"), move |e| {
                tx.send(e).unwrap();
            });
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
        let _ = rdv.give("kept").subscribe(|()| {}, |_| {});
        assert_eq!(rdv.take().block_on().unwrap(), "kept");
    }

    #[test]
    fn cancelled_take_leaves_giver_for_next_taker() {
        let rdv: Rendezvous<i32> = Rendezvous::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = rdv
            .take()
            .subscribe(|_| panic!("cancelled take must not complete"), move |e| {
                tx.send(e).unwrap();
            });
        cancel.cancel();
        assert!(rx.recv().unwrap().is_cancelled());
        let _ = rdv.give(41).subscribe(|()| {}, |_| {});
        assert_eq!(rdv.take().block_on().unwrap(), 41);
    }
}
