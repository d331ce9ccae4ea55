//! Freshet: a callback-driven task and flow runtime with structured
//! cancellation and backpressure.
//!
//! # Overview
//!
//! Freshet unifies one-shot asynchronous computations ([`Task`]) and
//! backpressured, cancellable value streams ([`Flow`]) under one
//! signalling protocol. Programs compose from a small set of primitives;
//! cancellation and errors propagate deterministically through
//! arbitrarily deep compositions.
//!
//! # Core Guarantees
//!
//! - **One terminal event**: every subscription settles exactly once,
//!   even after cancellation
//! - **One outstanding**: a flow producer pauses until its consumer
//!   transfers the pending value — backpressure is the protocol, not a
//!   bolt-on
//! - **Cooperative cancellation**: idempotent, propagates from
//!   combinators to their children, never silently drops the terminal
//!   event
//! - **No event loop**: work progresses by synchronous continuation
//!   calls on whatever thread produced the triggering event, plus
//!   explicit hops through the [`executor`] pools and the timer
//!
//! # Module Structure
//!
//! - [`task`]: the one-shot computation contract
//! - [`flow`]: the stream contract, sources, and transformers
//! - [`combinator`]: `join`, `race`, `attempt`, `absolve`, `timeout`,
//!   `compel`
//! - [`sync`]: dataflow variable, mailbox, rendez-vous, semaphore
//! - [`time`]: `sleep`
//! - [`executor`]: blocking and compute pools, `via`
//! - [`transducer`]: push-style transformation stages for
//!   [`flow::transform`]
//! - [`fiber`]: sequential (`sp`) and ambiguous (`ap`) process blocks
//! - [`reactor`]: boot-scoped publisher graphs with glitch-free
//!   propagation
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use freshet::{combinator::join, time::sleep};
//! use std::time::Duration;
//!
//! let pair = join(
//!     |vs| (vs[0], vs[1]),
//!     vec![sleep(Duration::from_millis(100), 1), sleep(Duration::from_millis(100), 2)],
//! );
//! assert_eq!(pair.block_on().unwrap(), (1, 2));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::significant_drop_tightening)]

pub mod combinator;
pub mod error;
pub mod executor;
pub mod fiber;
pub mod flow;
pub mod reactor;
pub mod sync;
pub mod task;
pub mod test_utils;
pub mod time;
pub mod tracing_compat;
pub mod transducer;

// Re-exports for convenient access to the core vocabulary.
pub use combinator::{absolve, attempt, compel, join, race, timeout};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use executor::{via, Executor};
pub use fiber::{check, park, sp};
pub use flow::{
    aggregate, buffer, enumerate, gather, integrate, latest, observe, relieve, sample, transform,
    watch, zip, Flow, Handle,
};
pub use sync::{Dataflow, Mailbox, Rendezvous, Semaphore};
pub use task::{Cancel, Settler, Task};
pub use time::sleep;
