//! Lifecycle tests for the async test runner.
//!
//! A scripted case records every phase it goes through and fails wherever it
//! is told to. These tests pin:
//! - Phase order, including when teardown is skipped
//! - Outcome classification and the collector contract
//! - Cleanup order and error isolation
//! - Loop shutdown: no task survives, finalizers are drained, the loop closes

use std::{cell::RefCell, rc::Rc, thread, time::Duration};

use tidepool_core::{LoopConfig, LoopError, LoopHandle, current_loop};
use tidepool_runner::{
    AsyncTestCase, AsyncTestRunner, Phase, PhaseError, ResultCollector, RunnerConfig, TestBody,
    TestContext, TestError, TestMarkers, TestOutcome, TestResult,
};
use tokio::sync::oneshot;

type Trace = Rc<RefCell<Vec<String>>>;

#[derive(Default)]
struct Scripted {
    trace: Trace,
    markers: TestMarkers,
    fail_in: Option<Phase>,
    skip_body: bool,
    cleanups: usize,
    loop_handle: Option<LoopHandle>,
}

impl Scripted {
    fn failing_in(phase: Phase) -> Self {
        Self { fail_in: Some(phase), ..Self::default() }
    }

    fn step(&self, phase: Phase) -> TestResult {
        self.trace.borrow_mut().push(phase.to_string());
        if self.fail_in == Some(phase) {
            return Err(TestError::assertion(format!("{phase} failed")));
        }
        Ok(())
    }

    fn trace(&self) -> Vec<String> {
        self.trace.borrow().clone()
    }
}

impl AsyncTestCase for Scripted {
    fn id(&self) -> String {
        "lifecycle::scripted".to_string()
    }

    fn markers(&self) -> TestMarkers {
        self.markers.clone()
    }

    fn set_up(&mut self, cx: &TestContext) -> TestResult {
        self.loop_handle = Some(cx.handle().clone());
        for n in 1..=self.cleanups {
            let trace = Rc::clone(&self.trace);
            cx.add_sync_cleanup(move || {
                trace.borrow_mut().push(format!("cleanup-{n}"));
                Ok(())
            });
        }
        self.step(Phase::SetUp)
    }

    async fn async_set_up(&mut self, cx: &TestContext) -> TestResult {
        cx.handle().sleep(Duration::from_millis(1)).await;
        self.step(Phase::AsyncSetUp)
    }

    fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a> {
        TestBody::future(async move {
            cx.handle().sleep(Duration::from_millis(5)).await;
            self.step(Phase::Body)?;
            if self.skip_body {
                return cx.skip("not today");
            }
            Ok(())
        })
    }

    async fn async_tear_down(&mut self, cx: &TestContext) -> TestResult {
        cx.handle().yield_now().await;
        self.step(Phase::AsyncTearDown)
    }

    fn tear_down(&mut self, _cx: &TestContext) -> TestResult {
        self.step(Phase::TearDown)
    }
}

fn runner() -> AsyncTestRunner {
    AsyncTestRunner::new()
}

#[test]
fn successful_test_runs_every_phase_in_order() {
    let mut case = Scripted { cleanups: 2, ..Scripted::default() };

    let (report, log) = runner().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::Success));
    assert_eq!(
        case.trace(),
        ["setUp", "asyncSetUp", "body", "asyncTearDown", "tearDown", "cleanup-2", "cleanup-1"]
    );
    assert_eq!(log.successes, vec!["lifecycle::scripted".to_string()]);
    assert_eq!((log.runs_started, log.runs_stopped), (1, 1));
    assert_eq!((log.tests_run, log.tests_stopped), (1, 1));
    assert!(log.was_successful());
    assert!(report.loop_id.is_some());
}

#[test]
fn async_body_failure_is_a_failure() {
    let mut case = Scripted { cleanups: 1, ..Scripted::failing_in(Phase::Body) };

    let (report, log) = runner().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::Failure));
    assert_eq!(case.trace(), ["setUp", "asyncSetUp", "body", "cleanup-1"]);
    assert_eq!(log.failures.len(), 1);
    assert_eq!(log.failures[0].1, vec!["[body] assertion failed: body failed".to_string()]);
    assert!(!log.was_successful());
}

#[test]
fn async_body_failure_under_marker_is_expected() {
    let mut case = Scripted {
        markers: TestMarkers::expecting_failure(),
        ..Scripted::failing_in(Phase::Body)
    };

    let (report, log) = runner().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::ExpectedFailure(_)));
    assert_eq!(case.trace(), ["setUp", "asyncSetUp", "body", "asyncTearDown", "tearDown"]);
    assert_eq!(log.expected_failures.len(), 1);
    assert!(log.was_successful());
    insta::assert_snapshot!(report.to_string(), @r"
    lifecycle::scripted ... expected failure
      [body] assertion failed: body failed
    ");
}

#[test]
fn passing_body_under_marker_is_unexpected_success() {
    let mut case = Scripted { markers: TestMarkers::expecting_failure(), ..Scripted::default() };

    let (report, log) = runner().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::UnexpectedSuccess));
    assert_eq!(log.unexpected_successes.len(), 1);
    assert!(!log.was_successful());
}

#[test]
fn setup_error_skips_body_and_teardown_but_not_cleanups() {
    for phase in [Phase::SetUp, Phase::AsyncSetUp] {
        let mut case = Scripted { cleanups: 1, ..Scripted::failing_in(phase) };

        let (report, log) = runner().run_standalone(&mut case);

        assert!(matches!(report.outcome, TestOutcome::Error), "{phase}");
        assert!(!case.trace().contains(&"body".to_string()), "{phase}");
        assert_eq!(case.trace().last().map(String::as_str), Some("cleanup-1"));
        assert_eq!(log.errors.len(), 1);
    }
}

#[test]
fn async_teardown_error_skips_sync_teardown() {
    let mut case = Scripted::failing_in(Phase::AsyncTearDown);

    let (report, _) = runner().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::Error));
    assert_eq!(case.trace(), ["setUp", "asyncSetUp", "body", "asyncTearDown"]);
    assert_eq!(report.errors[0].phase, Phase::AsyncTearDown);
}

#[test]
fn skip_marker_runs_nothing() {
    let mut case = Scripted { markers: TestMarkers::skip("needs hardware"), ..Scripted::default() };

    let (report, log) = runner().run_standalone(&mut case);

    assert!(matches!(&report.outcome, TestOutcome::Skipped(reason) if reason == "needs hardware"));
    assert!(case.trace().is_empty());
    assert!(report.loop_id.is_none());
    let expected = ("lifecycle::scripted".to_string(), "needs hardware".to_string());
    assert_eq!(log.skipped, vec![expected]);
    assert_eq!((log.tests_run, log.tests_stopped), (1, 1));
}

#[test]
fn skip_from_body_still_tears_down() {
    let mut case = Scripted { skip_body: true, cleanups: 1, ..Scripted::default() };

    let (report, log) = runner().run_standalone(&mut case);

    assert!(matches!(&report.outcome, TestOutcome::Skipped(reason) if reason == "not today"));
    assert_eq!(
        case.trace(),
        ["setUp", "asyncSetUp", "body", "asyncTearDown", "tearDown", "cleanup-1"]
    );
    assert_eq!(log.skipped.len(), 1);
}

#[test]
fn panicking_sync_body_is_a_failure() {
    struct Panics;
    impl AsyncTestCase for Panics {
        fn body<'a>(&'a mut self, _cx: &'a TestContext) -> TestBody<'a> {
            let replies: Vec<u8> = Vec::new();
            assert!(!replies.is_empty(), "no replies received");
            TestBody::Ready(Ok(()))
        }
    }

    let (report, _) = runner().run_standalone(&mut Panics);

    assert!(matches!(report.outcome, TestOutcome::Failure));
    let PhaseError { phase, error } = &report.errors[0];
    assert_eq!(*phase, Phase::Body);
    assert!(matches!(error, TestError::Panic(message) if message.contains("no replies received")));
}

#[test]
fn body_woken_from_another_thread_completes() {
    struct WaitsForWorker;
    impl AsyncTestCase for WaitsForWorker {
        fn body<'a>(&'a mut self, _cx: &'a TestContext) -> TestBody<'a> {
            let (tx, rx) = oneshot::channel();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let _ = tx.send(7_u32);
            });
            TestBody::future(async move {
                let value = rx.await.map_err(|_| TestError::Other("worker hung up".into()))?;
                tidepool_runner::ensure!(value == 7, "worker sent {value}");
                Ok(())
            })
        }
    }

    let (report, log) = runner().run_standalone(&mut WaitsForWorker);

    assert!(matches!(report.outcome, TestOutcome::Success), "{report}");
    assert!(log.was_successful());
}

#[test]
fn body_that_can_never_finish_is_reported_as_stalled_when_detection_is_on() {
    struct WaitsForever;
    impl AsyncTestCase for WaitsForever {
        fn body<'a>(&'a mut self, _cx: &'a TestContext) -> TestBody<'a> {
            TestBody::future(std::future::pending())
        }
    }

    let loop_config = LoopConfig { debug: true, detect_stalls: true, ..LoopConfig::default() };
    let config = RunnerConfig::default().with_loop_config(loop_config);
    let runner = AsyncTestRunner::with_config(config);
    let (report, _) = runner.run_standalone(&mut WaitsForever);

    assert!(matches!(report.outcome, TestOutcome::Failure));
    assert!(matches!(report.errors[0].error, TestError::Loop(LoopError::Stalled { .. })));
}

#[test]
fn cleanups_run_in_reverse_and_survive_failures() {
    struct Cleans {
        trace: Trace,
    }
    impl AsyncTestCase for Cleans {
        fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a> {
            let first = Rc::clone(&self.trace);
            cx.add_sync_cleanup(move || {
                first.borrow_mut().push("first".into());
                Ok(())
            });

            let second = Rc::clone(&self.trace);
            let handle = cx.handle().clone();
            cx.add_async_cleanup(move || async move {
                handle.sleep(Duration::from_secs(1)).await;
                second.borrow_mut().push("second (async)".into());
                Err(TestError::Other("second broke".into()))
            });

            let third = Rc::clone(&self.trace);
            let stack = cx.cleanups();
            cx.add_sync_cleanup(move || {
                third.borrow_mut().push("third".into());
                let late = Rc::clone(&third);
                stack.push(tidepool_runner::Cleanup::sync(move || {
                    late.borrow_mut().push("registered during cleanup".into());
                    Ok(())
                }));
                Ok(())
            });

            TestBody::Ready(Ok(()))
        }
    }

    let mut case = Cleans { trace: Trace::default() };
    let (report, log) = runner().run_standalone(&mut case);

    assert_eq!(
        *case.trace.borrow(),
        ["third", "registered during cleanup", "second (async)", "first"]
    );
    assert!(matches!(report.outcome, TestOutcome::Error));
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].phase, Phase::Cleanup);
    assert_eq!(log.errors[0].1, vec!["[cleanup] second broke".to_string()]);
}

#[test]
fn shutdown_cancels_tasks_drains_finalizers_and_closes_the_loop() {
    struct LeavesWorkBehind {
        finalized: Rc<RefCell<bool>>,
        handle: Option<LoopHandle>,
        active_during_body: Option<bool>,
    }
    impl AsyncTestCase for LeavesWorkBehind {
        fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a> {
            TestBody::future(async move {
                let handle = cx.handle().clone();
                self.active_during_body = Some(current_loop().map(|h| h.id()) == Some(handle.id()));

                let sleeper = handle.clone();
                handle.spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await })?;

                let finalized = Rc::clone(&self.finalized);
                let sleeper = handle.clone();
                handle.register_finalizer(async move {
                    sleeper.sleep(Duration::from_millis(10)).await;
                    *finalized.borrow_mut() = true;
                })?;

                handle.yield_now().await;
                self.handle = Some(handle);
                Ok(())
            })
        }
    }

    let mut case =
        LeavesWorkBehind { finalized: Rc::default(), handle: None, active_during_body: None };
    let (report, _) = runner().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::Success));
    let shutdown = report.shutdown.expect("shutdown report");
    assert_eq!(shutdown.tasks_cancelled, 1);
    assert_eq!(shutdown.finalizers_drained, 1);
    assert!(*case.finalized.borrow());

    let handle = case.handle.expect("handle");
    assert!(handle.is_closed());
    assert_eq!(handle.pending_tasks(), 0);
    assert_eq!(case.active_during_body, Some(true));
    assert!(current_loop().is_none());
}

fn respawn(handle: LoopHandle) {
    struct Respawner(LoopHandle);
    impl Drop for Respawner {
        fn drop(&mut self) {
            if !self.0.is_closed() {
                respawn(self.0.clone());
            }
        }
    }
    let guard = Respawner(handle.clone());
    let _ = handle.spawn(async move {
        let _guard = guard;
        std::future::pending::<()>().await;
    });
}

#[test]
fn task_that_keeps_respawning_is_a_shutdown_error() {
    struct Stubborn {
        finalized: Rc<RefCell<bool>>,
    }
    impl AsyncTestCase for Stubborn {
        fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a> {
            respawn(cx.handle().clone());
            let finalized = Rc::clone(&self.finalized);
            let registered = cx.handle().register_finalizer(async move {
                *finalized.borrow_mut() = true;
            });
            TestBody::Ready(registered.map_err(TestError::from))
        }
    }

    let mut case = Stubborn { finalized: Rc::default() };
    let (report, log) = runner().run_standalone(&mut case);

    assert!(*case.finalized.borrow(), "finalizer skipped");
    assert!(matches!(report.outcome, TestOutcome::Error));
    assert_eq!(report.errors[0].phase, Phase::Shutdown);
    assert!(matches!(
        report.errors[0].error,
        TestError::Loop(LoopError::CancellationIgnored { .. })
    ));
    assert!(report.shutdown.is_none());
    assert_eq!(log.errors.len(), 1);
}

#[test]
fn every_test_gets_a_fresh_loop() {
    let runner = runner();
    let mut first = Scripted::default();
    let mut second = Scripted::default();

    let a = runner.run_standalone(&mut first).0.loop_id;
    let b = runner.run_standalone(&mut second).0.loop_id;

    assert!(a.is_some() && b.is_some());
    assert_ne!(a, b);
    assert!(first.loop_handle.is_some_and(|h| h.is_closed()));
    assert!(second.loop_handle.is_some_and(|h| h.is_closed()));
}

/// Records the order of collector calls.
#[derive(Default)]
struct CallLog(Vec<String>);

impl ResultCollector for CallLog {
    fn start_test(&mut self, test: &str) {
        self.0.push(format!("start {test}"));
    }

    fn add_success(&mut self, _test: &str) {
        self.0.push("success".into());
    }

    fn add_failure(&mut self, _test: &str, errors: &[PhaseError]) {
        self.0.push(format!("failure x{}", errors.len()));
    }

    fn add_error(&mut self, _test: &str, errors: &[PhaseError]) {
        self.0.push(format!("error x{}", errors.len()));
    }

    fn add_skip(&mut self, _test: &str, reason: &str) {
        self.0.push(format!("skip {reason}"));
    }

    fn add_expected_failure(&mut self, _test: &str, _error: &PhaseError) {
        self.0.push("expected failure".into());
    }

    fn add_unexpected_success(&mut self, _test: &str) {
        self.0.push("unexpected success".into());
    }

    fn stop_test(&mut self, test: &str) {
        self.0.push(format!("stop {test}"));
    }
}

#[test]
fn collector_sees_exactly_one_outcome_per_test() {
    let runner = runner();
    let mut calls = CallLog::default();

    runner.run(&mut Scripted::failing_in(Phase::Body), &mut calls);
    let mut skipped = Scripted { markers: TestMarkers::skip("off"), ..Scripted::default() };
    runner.run(&mut skipped, &mut calls);
    runner.run(&mut Scripted::default(), &mut calls);

    insta::assert_snapshot!(calls.0.join("\n"), @r"
    start lifecycle::scripted
    failure x1
    stop lifecycle::scripted
    start lifecycle::scripted
    skip off
    stop lifecycle::scripted
    start lifecycle::scripted
    success
    stop lifecycle::scripted
    ");
}

#[test]
fn panicking_close_hook_still_reports_one_outcome() {
    struct BadHook;
    impl AsyncTestCase for BadHook {
        fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a> {
            cx.handle().on_close(|| panic!("hook exploded"));
            TestBody::Ready(Ok(()))
        }
    }

    let mut calls = CallLog::default();
    let report = runner().run(&mut BadHook, &mut calls);

    assert!(matches!(report.outcome, TestOutcome::Success), "{report}");
    assert_eq!(calls.0.len(), 3, "{:?}", calls.0);
    assert!(calls.0[0].starts_with("start "));
    assert_eq!(calls.0[1], "success");
    assert!(calls.0[2].starts_with("stop "));
}
