//! Result collection.

use crate::outcome::PhaseError;

/// Receives test results, one `add_*` call per test between
/// [`ResultCollector::start_test`] and [`ResultCollector::stop_test`].
pub trait ResultCollector {
    /// A batch of tests is about to run.
    fn start_test_run(&mut self) {}

    /// The batch finished.
    fn stop_test_run(&mut self) {}

    /// A test is about to run.
    fn start_test(&mut self, test: &str);

    /// The test passed.
    fn add_success(&mut self, test: &str);

    /// The body failed. Cleanup and shutdown errors are attached.
    fn add_failure(&mut self, test: &str, errors: &[PhaseError]);

    /// A fixture, cleanup or shutdown failed.
    fn add_error(&mut self, test: &str, errors: &[PhaseError]);

    /// The test was skipped.
    fn add_skip(&mut self, test: &str, reason: &str);

    /// The body failed as expected.
    fn add_expected_failure(&mut self, test: &str, error: &PhaseError);

    /// The body was expected to fail but passed.
    fn add_unexpected_success(&mut self, test: &str);

    /// The test finished.
    fn stop_test(&mut self, test: &str);
}

/// A collector that remembers everything it is told.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestResultLog {
    /// Batches started.
    pub runs_started: usize,
    /// Batches stopped.
    pub runs_stopped: usize,
    /// Tests started.
    pub tests_run: usize,
    /// Tests stopped.
    pub tests_stopped: usize,
    /// Passing tests.
    pub successes: Vec<String>,
    /// Failing tests with their rendered errors.
    pub failures: Vec<(String, Vec<String>)>,
    /// Erroring tests with their rendered errors.
    pub errors: Vec<(String, Vec<String>)>,
    /// Skipped tests with the reason.
    pub skipped: Vec<(String, String)>,
    /// Expected failures with the rendered error.
    pub expected_failures: Vec<(String, String)>,
    /// Tests that passed while expected to fail.
    pub unexpected_successes: Vec<String>,
}

impl TestResultLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// No failure, no error and no unexpected success.
    pub fn was_successful(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty() && self.unexpected_successes.is_empty()
    }

    /// Number of `add_*` calls received.
    pub fn outcomes_reported(&self) -> usize {
        self.successes.len()
            + self.failures.len()
            + self.errors.len()
            + self.skipped.len()
            + self.expected_failures.len()
            + self.unexpected_successes.len()
    }
}

fn render(errors: &[PhaseError]) -> Vec<String> {
    errors.iter().map(ToString::to_string).collect()
}

impl ResultCollector for TestResultLog {
    fn start_test_run(&mut self) {
        self.runs_started += 1;
    }

    fn stop_test_run(&mut self) {
        self.runs_stopped += 1;
    }

    fn start_test(&mut self, _test: &str) {
        self.tests_run += 1;
    }

    fn add_success(&mut self, test: &str) {
        self.successes.push(test.to_string());
    }

    fn add_failure(&mut self, test: &str, errors: &[PhaseError]) {
        self.failures.push((test.to_string(), render(errors)));
    }

    fn add_error(&mut self, test: &str, errors: &[PhaseError]) {
        self.errors.push((test.to_string(), render(errors)));
    }

    fn add_skip(&mut self, test: &str, reason: &str) {
        self.skipped.push((test.to_string(), reason.to_string()));
    }

    fn add_expected_failure(&mut self, test: &str, error: &PhaseError) {
        self.expected_failures.push((test.to_string(), error.to_string()));
    }

    fn add_unexpected_success(&mut self, test: &str) {
        self.unexpected_successes.push(test.to_string());
    }

    fn stop_test(&mut self, _test: &str) {
        self.tests_stopped += 1;
    }
}
