//! Coordination primitives.
//!
//! Each primitive is a cheaply-cloneable shared handle over a state block
//! guarded by an internal lock. The "produce" operations never block; the
//! "consume" operations are tasks. Waiters are served in FIFO order, and
//! continuations run after the primitive's lock has been dropped, so a
//! continuation may re-enter the primitive freely.
//!
//! Cancellation of any pending consume fails it with `Cancelled` and
//! leaves the primitive's state intact: a cancelled `acquire` consumes no
//! token, a cancelled `fetch` loses no message, a cancelled `give` leaves
//! the taker waiting for the next partner.

mod dataflow;
mod mailbox;
mod rendezvous;
mod semaphore;

pub use dataflow::Dataflow;
pub use mailbox::Mailbox;
pub use rendezvous::Rendezvous;
pub use semaphore::Semaphore;
