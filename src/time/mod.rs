//! Time-based primitives.
//!
//! The only privileged facility is [`sleep`]; timeouts are expressed by
//! racing a sleep against the guarded task (see
//! [`combinator::timeout`](crate::combinator::timeout)).

mod sleep;
pub(crate) mod timer;

pub use sleep::sleep;
