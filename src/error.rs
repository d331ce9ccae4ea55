//! Error types and error handling strategy for freshet.
//!
//! Every failure channel in the crate carries one [`Error`] type. The
//! handling strategy:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - The core never recovers an error; it surfaces on the failure channel
//!   of the containing task or flow
//! - `attempt` is the sole mechanism that reifies an error into a success
//!   value, and `absolve` is its inverse

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled before reaching completion.
    Cancelled,
    /// A deadline elapsed before the guarded task completed.
    Timeout,
    /// Every candidate of a race failed.
    RaceFailure,
    /// A producer outpaced its consumer beyond the permitted capacity.
    Overflow,
    /// The signalling protocol was violated: a transfer without a
    /// notification, a fork combinator outside an ambiguous process, or a
    /// node spawn outside a reactor boot.
    Protocol,
    /// An error propagated from a user computation.
    User,
}

/// The error type carried on task and flow failure channels.
///
/// Cloneable so a single failure can surface to several observers (a
/// reactor node feeds every subscriber the same terminal error).
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    /// Configured duration, for `Timeout`.
    elapsed: Option<Duration>,
    /// Child errors, for `RaceFailure`, in subscription order.
    children: Arc<[Error]>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
            elapsed: None,
            children: Arc::from([]),
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error represents an elapsed timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error represents a capacity overflow.
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        matches!(self.kind, ErrorKind::Overflow)
    }

    /// The configured duration of a `Timeout` error.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.elapsed
    }

    /// The aggregated child errors of a `RaceFailure`, in subscription
    /// order.
    #[must_use]
    pub fn children(&self) -> &[Error] {
        &self.children
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// A cancellation error, as delivered to cancelled waiters.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// A timeout error carrying the configured duration.
    #[must_use]
    pub fn timeout(elapsed: Duration) -> Self {
        let mut e = Self::new(ErrorKind::Timeout);
        e.elapsed = Some(elapsed);
        e
    }

    /// A race failure aggregating every candidate's error.
    #[must_use]
    pub fn race(children: Vec<Error>) -> Self {
        let mut e = Self::new(ErrorKind::RaceFailure);
        e.children = children.into();
        e
    }

    /// An overflow error with context.
    #[must_use]
    pub fn overflow(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overflow).with_context(ctx)
    }

    /// A protocol violation with context.
    #[must_use]
    pub fn protocol(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol).with_context(ctx)
    }

    /// A user error wrapping an arbitrary error value.
    #[must_use]
    pub fn user(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::User).with_source(source)
    }

    /// A user error carrying only a message.
    #[must_use]
    pub fn msg(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_context(ctx)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Cancelled => write!(f, "cancelled")?,
            ErrorKind::Timeout => match self.elapsed {
                Some(d) => write!(f, "timed out after {d:?}")?,
                None => write!(f, "timed out")?,
            },
            ErrorKind::RaceFailure => {
                write!(f, "all {} race candidates failed", self.children.len())?;
            }
            ErrorKind::Overflow => write!(f, "overflow")?,
            ErrorKind::Protocol => write!(f, "protocol violation")?,
            ErrorKind::User => write!(f, "user error")?,
        }
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Convenient alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_predicates() {
        assert!(Error::cancelled().is_cancelled());
        assert!(Error::timeout(Duration::from_millis(5)).is_timeout());
        assert!(Error::overflow("buffer").is_overflow());
        assert_eq!(Error::protocol("fork").kind(), ErrorKind::Protocol);
    }

    #[test]
    fn timeout_carries_duration() {
        let e = Error::timeout(Duration::from_millis(250));
        assert_eq!(e.duration(), Some(Duration::from_millis(250)));
        assert!(e.to_string().contains("250"));
    }

    #[test]
    fn race_aggregates_children_in_order() {
        let e = Error::race(vec![Error::msg("a"), Error::msg("b")]);
        assert_eq!(e.children().len(), 2);
        assert_eq!(e.children()[0].to_string(), "user error: a");
        assert_eq!(e.children()[1].to_string(), "user error: b");
    }

    #[test]
    fn context_chains() {
        let r: Result<()> = Err(Error::cancelled());
        let e = r.context("while fetching").unwrap_err();
        assert!(e.is_cancelled());
        assert!(e.to_string().contains("while fetching"));
    }

    #[test]
    fn source_is_preserved() {
        let io = std::io::Error::other("boom");
        let e = Error::user(io);
        assert!(std::error::Error::source(&e).is_some());
    }
}
