//! Shared helpers for unit and integration tests.
//!
//! - Consistent tracing-based logging initialization
//! - A deadline-guarded awaiter so a broken protocol hangs a test
//!   instead of the whole suite

use std::sync::Once;
use std::time::Duration;

use crate::combinator::timeout;
use crate::error::Result;
use crate::task::Task;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Awaits a task with a hard deadline, so a stuck subscription fails the
/// test rather than wedging the suite.
pub fn block_on_within<T: Send + 'static>(deadline: Duration, task: Task<T>) -> Result<T> {
    timeout(deadline, task).block_on()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn logging_init_is_idempotent() {
        init_test_logging();
        init_test_logging();
    }

    #[test]
    fn block_on_within_returns_in_time() {
        let v = block_on_within(Duration::from_secs(1), Task::ready(3)).unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn block_on_within_cuts_off_stuck_tasks() {
        let err =
            block_on_within(Duration::from_millis(30), Task::<i32>::never()).unwrap_err();
        assert!(err.is_timeout());
    }
}
