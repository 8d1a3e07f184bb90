//! Test outcomes and how they are decided.
//!
//! Every phase of a test feeds its result into an [`OutcomeRecord`]. Once
//! the loop is closed, the record is folded into exactly one
//! [`TestOutcome`].
//!
//! # Invariants
//!
//! - One outcome per test, computed once
//! - A body failure is never escalated to an error by later cleanup or
//!   shutdown errors; those are attached to the failure instead
//! - A skip requested from any phase wins over success, never over errors

use std::fmt;

use tidepool_core::{LoopId, ShutdownReport};

use crate::error::{TestError, TestResult};

/// Where in the lifecycle an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// [`AsyncTestCase::set_up`](crate::AsyncTestCase::set_up).
    SetUp,
    /// [`AsyncTestCase::async_set_up`](crate::AsyncTestCase::async_set_up).
    AsyncSetUp,
    /// [`AsyncTestCase::body`](crate::AsyncTestCase::body).
    Body,
    /// [`AsyncTestCase::async_tear_down`](crate::AsyncTestCase::async_tear_down).
    AsyncTearDown,
    /// [`AsyncTestCase::tear_down`](crate::AsyncTestCase::tear_down).
    TearDown,
    /// A registered cleanup.
    Cleanup,
    /// Task cancellation and finalizer draining after the test.
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SetUp => "setUp",
            Self::AsyncSetUp => "asyncSetUp",
            Self::Body => "body",
            Self::AsyncTearDown => "asyncTearDown",
            Self::TearDown => "tearDown",
            Self::Cleanup => "cleanup",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// An error tagged with the phase that raised it.
#[derive(Debug)]
pub struct PhaseError {
    /// Phase that raised the error.
    pub phase: Phase,
    /// The error.
    pub error: TestError,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.error)
    }
}

/// The single verdict of a test.
#[derive(Debug)]
pub enum TestOutcome {
    /// Everything passed.
    Success,
    /// The body failed. Details are in [`TestReport::errors`].
    Failure,
    /// A fixture, cleanup or shutdown failed. Details are in
    /// [`TestReport::errors`].
    Error,
    /// The test was skipped.
    Skipped(String),
    /// The body failed as expected.
    ExpectedFailure(PhaseError),
    /// The body was expected to fail but passed.
    UnexpectedSuccess,
}

impl TestOutcome {
    /// Whether the outcome counts as passing.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped(_) | Self::ExpectedFailure(_))
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("ok"),
            Self::Failure => f.write_str("FAIL"),
            Self::Error => f.write_str("ERROR"),
            Self::Skipped(reason) => write!(f, "skipped '{reason}'"),
            Self::ExpectedFailure(_) => f.write_str("expected failure"),
            Self::UnexpectedSuccess => f.write_str("unexpected success"),
        }
    }
}

/// Everything known about one finished test.
#[derive(Debug)]
pub struct TestReport {
    /// Test identifier.
    pub id: String,
    /// The verdict.
    pub outcome: TestOutcome,
    /// Every error, in the order it happened.
    pub errors: Vec<PhaseError>,
    /// Loop the test ran on. `None` if it was skipped before a loop existed.
    pub loop_id: Option<LoopId>,
    /// What shutdown had to clean up. `None` if shutdown failed or never ran.
    pub shutdown: Option<ShutdownReport>,
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ... {}", self.id, self.outcome)?;
        for error in &self.errors {
            write!(f, "\n  {error}")?;
        }
        if let TestOutcome::ExpectedFailure(error) = &self.outcome {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}

/// How one phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseStatus {
    Passed,
    Failed,
    Skipped,
    ExpectedFailure,
}

impl PhaseStatus {
    /// Whether teardown may run after a body that ended this way.
    pub(crate) fn allows_teardown(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Accumulates phase results for one test.
#[derive(Debug, Default)]
pub(crate) struct OutcomeRecord {
    expecting_failure: bool,
    errors: Vec<PhaseError>,
    body_failed: bool,
    expected_failure: Option<PhaseError>,
    skip: Option<String>,
}

impl OutcomeRecord {
    pub(crate) fn new(expecting_failure: bool) -> Self {
        Self { expecting_failure, ..Self::default() }
    }

    pub(crate) fn record(&mut self, phase: Phase, result: TestResult) -> PhaseStatus {
        let error = match result {
            Ok(()) => return PhaseStatus::Passed,
            Err(error) => error,
        };

        if let TestError::Skipped(reason) = error {
            tracing::debug!(%phase, %reason, "test skipped");
            self.skip.get_or_insert(reason);
            return PhaseStatus::Skipped;
        }

        tracing::debug!(%phase, %error, "phase failed");
        let error = PhaseError { phase, error };

        if phase == Phase::Body {
            if self.expecting_failure {
                self.expected_failure = Some(error);
                return PhaseStatus::ExpectedFailure;
            }
            self.body_failed = true;
        }
        self.errors.push(error);
        PhaseStatus::Failed
    }

    pub(crate) fn finish(self) -> (TestOutcome, Vec<PhaseError>) {
        let outcome = if self.body_failed {
            TestOutcome::Failure
        } else if !self.errors.is_empty() {
            TestOutcome::Error
        } else if let Some(reason) = self.skip {
            TestOutcome::Skipped(reason)
        } else if let Some(error) = self.expected_failure {
            TestOutcome::ExpectedFailure(error)
        } else if self.expecting_failure {
            TestOutcome::UnexpectedSuccess
        } else {
            TestOutcome::Success
        };
        (outcome, self.errors)
    }
}
