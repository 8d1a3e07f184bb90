//! Per-test lifecycle.
//!
//! ```text
//! Init ──▶ Setup ──▶ Body ──▶ Teardown ──▶ Cleanup ──▶ Shutdown ──▶ Report
//!            │ fail    │ fail (unexpected)   ▲
//!            └─────────┴─────────────────────┘
//! ```
//!
//! Cleanup, Shutdown and Report run on every path. Panics in any phase are
//! caught and recorded as errors of that phase, so one broken test never
//! takes the rest of the run down with it.
//!
//! # Invariants
//!
//! - Exactly one event loop is created and closed per non-skipped test
//! - No task is alive on the loop once Shutdown succeeds
//! - The collector sees `start_test`, one `add_*`, then `stop_test`

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
};

use tidepool_core::{EventLoop, LoopConfig, panic_message};

use crate::{
    case::{AsyncTestCase, TestBody},
    collector::{ResultCollector, TestResultLog},
    context::{Cleanup, TestContext},
    error::{TestError, TestResult},
    logging::init_test_logging,
    outcome::{OutcomeRecord, Phase, PhaseStatus, TestOutcome, TestReport},
};

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Configuration of every per-test loop.
    pub loop_config: LoopConfig,
    /// Install the test log subscriber before the first test.
    pub init_logging: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            loop_config: LoopConfig { debug: true, ..LoopConfig::default() },
            init_logging: true,
        }
    }
}

impl RunnerConfig {
    /// Override the per-test loop configuration.
    pub fn with_loop_config(mut self, loop_config: LoopConfig) -> Self {
        self.loop_config = loop_config;
        self
    }

    /// Toggle log subscriber installation.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.init_logging = enabled;
        self
    }
}

/// Runs [`AsyncTestCase`]s, each on a fresh event loop.
#[derive(Debug, Clone, Default)]
pub struct AsyncTestRunner {
    config: RunnerConfig,
}

fn catch<R>(f: impl FnOnce() -> R) -> Result<R, TestError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| TestError::Panic(panic_message(payload.as_ref())))
}

fn run_sync(
    record: &mut OutcomeRecord,
    phase: Phase,
    f: impl FnOnce() -> TestResult,
) -> PhaseStatus {
    tracing::trace!(%phase, "phase started");
    let result = catch(f).and_then(|result| result);
    record.record(phase, result)
}

fn run_async<F>(
    record: &mut OutcomeRecord,
    lp: &mut EventLoop,
    phase: Phase,
    start: impl FnOnce() -> F,
) -> PhaseStatus
where
    F: Future<Output = TestResult>,
{
    tracing::trace!(%phase, "phase started");
    let result = catch(|| lp.run_until_complete(start()))
        .and_then(|driven| driven.map_err(TestError::from))
        .and_then(|result| result);
    record.record(phase, result)
}

impl AsyncTestRunner {
    /// Runner with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner with a custom configuration.
    pub fn with_config(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one test, reporting to `collector`.
    pub fn run<C: AsyncTestCase>(
        &self,
        case: &mut C,
        collector: &mut dyn ResultCollector,
    ) -> TestReport {
        if self.config.init_logging {
            init_test_logging();
        }

        let id = case.id();
        let span = tracing::debug_span!("test", %id);
        let _entered = span.enter();

        collector.start_test(&id);
        let markers = case.markers();

        if let Some(reason) = markers.skip {
            tracing::debug!(%reason, "skipped by marker");
            collector.add_skip(&id, &reason);
            collector.stop_test(&id);
            return TestReport {
                id,
                outcome: TestOutcome::Skipped(reason),
                errors: Vec::new(),
                loop_id: None,
                shutdown: None,
            };
        }

        let mut record = OutcomeRecord::new(markers.expecting_failure);
        let mut lp = EventLoop::with_config(self.config.loop_config.clone());
        let loop_id = lp.id();
        let guard = lp.install();
        let cx = TestContext::new(id.clone(), lp.handle());

        Self::run_phases(case, &cx, &mut lp, &mut record);
        Self::run_cleanups(&cx, &mut lp, &mut record);

        let shutdown = match lp.shutdown() {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::error!(%err, "loop shutdown failed");
                record.record(Phase::Shutdown, Err(err.into()));
                None
            },
        };
        drop(guard);
        drop(cx);
        lp.close();

        let (outcome, errors) = record.finish();
        let report = TestReport { id, outcome, errors, loop_id: Some(loop_id), shutdown };

        match &report.outcome {
            TestOutcome::Success => collector.add_success(&report.id),
            TestOutcome::Failure => collector.add_failure(&report.id, &report.errors),
            TestOutcome::Error => collector.add_error(&report.id, &report.errors),
            TestOutcome::Skipped(reason) => collector.add_skip(&report.id, reason),
            TestOutcome::ExpectedFailure(error) => {
                collector.add_expected_failure(&report.id, error);
            },
            TestOutcome::UnexpectedSuccess => collector.add_unexpected_success(&report.id),
        }
        collector.stop_test(&report.id);

        tracing::debug!(outcome = %report.outcome, "test finished");
        report
    }

    /// Run one test against a fresh [`TestResultLog`], framed by
    /// `start_test_run` / `stop_test_run`.
    pub fn run_standalone<C: AsyncTestCase>(&self, case: &mut C) -> (TestReport, TestResultLog) {
        let mut log = TestResultLog::new();
        log.start_test_run();
        let report = self.run(case, &mut log);
        log.stop_test_run();
        (report, log)
    }

    fn run_phases<C: AsyncTestCase>(
        case: &mut C,
        cx: &TestContext,
        lp: &mut EventLoop,
        record: &mut OutcomeRecord,
    ) {
        if run_sync(record, Phase::SetUp, || case.set_up(cx)) != PhaseStatus::Passed {
            return;
        }
        let status = run_async(record, lp, Phase::AsyncSetUp, || case.async_set_up(cx));
        if status != PhaseStatus::Passed {
            return;
        }

        let body = match catch(|| case.body(cx)) {
            Ok(TestBody::Ready(result)) => record.record(Phase::Body, result),
            Ok(TestBody::Pending(future)) => run_async(record, lp, Phase::Body, || future),
            Err(panicked) => record.record(Phase::Body, Err(panicked)),
        };
        if !body.allows_teardown() {
            return;
        }

        let status = run_async(record, lp, Phase::AsyncTearDown, || case.async_tear_down(cx));
        if status == PhaseStatus::Passed {
            run_sync(record, Phase::TearDown, || case.tear_down(cx));
        }
    }

    fn run_cleanups(cx: &TestContext, lp: &mut EventLoop, record: &mut OutcomeRecord) {
        let cleanups = cx.cleanups();
        while let Some(cleanup) = cleanups.pop() {
            match cleanup {
                Cleanup::Sync(cleanup) => run_sync(record, Phase::Cleanup, cleanup),
                Cleanup::Async(cleanup) => run_async(record, lp, Phase::Cleanup, cleanup),
            };
        }
    }
}
