//! Test error types.

use thiserror::Error;
use tidepool_core::{JoinError, LoopError, TransportError};

/// Result of one test phase or cleanup.
pub type TestResult = Result<(), TestError>;

/// Why a test phase did not pass.
#[derive(Debug, Error)]
pub enum TestError {
    /// An explicit check failed.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// The test asked to be skipped.
    #[error("skipped: {0}")]
    Skipped(String),

    /// The code under test hit a transport error, simulated or not.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The event loop refused or failed to run the phase.
    #[error("event loop error: {0}")]
    Loop(#[from] LoopError),

    /// A task awaited by the test was cancelled or panicked.
    #[error("task error: {0}")]
    Join(#[from] JoinError),

    /// The phase panicked. Failed `assert!`s end up here.
    #[error("panicked: {0}")]
    Panic(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl TestError {
    /// Shorthand for [`TestError::Assertion`].
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    /// Returns true if this is a skip request rather than an error.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Fail with [`TestError::Assertion`] unless `condition` holds.
///
/// ```
/// # use tidepool_runner::{TestResult, ensure};
/// fn check(n: u32) -> TestResult {
///     ensure!(n > 2, "expected more than two, got {n}");
///     Ok(())
/// }
/// assert!(check(3).is_ok());
/// assert!(check(1).is_err());
/// ```
#[macro_export]
macro_rules! ensure {
    ($condition:expr, $($message:tt)+) => {
        if !$condition {
            return Err($crate::TestError::assertion(format!($($message)+)));
        }
    };
}
