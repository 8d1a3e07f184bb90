//! The test-case trait.

use std::future::{self, Future};

use tidepool_core::LocalBoxFuture;

use crate::{context::TestContext, error::TestResult};

/// Case-level markers, fixed before the test starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestMarkers {
    /// Skip without running anything, for this reason.
    pub skip: Option<String>,
    /// The body is expected to fail.
    pub expecting_failure: bool,
}

impl TestMarkers {
    /// Skip the case.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self { skip: Some(reason.into()), expecting_failure: false }
    }

    /// Expect the body to fail.
    pub fn expecting_failure() -> Self {
        Self { skip: None, expecting_failure: true }
    }
}

/// A test body: either already evaluated or a future to drive.
pub enum TestBody<'a> {
    /// A synchronous body, already run.
    Ready(TestResult),
    /// An asynchronous body, run to completion on the test's loop.
    Pending(LocalBoxFuture<'a, TestResult>),
}

impl<'a> TestBody<'a> {
    /// Wrap an asynchronous body.
    pub fn future(body: impl Future<Output = TestResult> + 'a) -> Self {
        Self::Pending(Box::pin(body))
    }
}

impl From<TestResult> for TestBody<'_> {
    fn from(result: TestResult) -> Self {
        Self::Ready(result)
    }
}

/// One test, with optional synchronous and asynchronous fixtures.
///
/// Phases run in this order, each only if the previous ones allow it:
///
/// ```text
/// set_up -> async_set_up -> body -> async_tear_down -> tear_down
/// ```
///
/// Cleanups registered through the [`TestContext`] run afterwards, whatever
/// happened before.
pub trait AsyncTestCase {
    /// Identifier reported to the collector.
    fn id(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Skip and expected-failure markers.
    fn markers(&self) -> TestMarkers {
        TestMarkers::default()
    }

    /// Synchronous setup.
    fn set_up(&mut self, _cx: &TestContext) -> TestResult {
        Ok(())
    }

    /// Asynchronous setup, run on the test's loop after [`Self::set_up`].
    fn async_set_up(&mut self, _cx: &TestContext) -> impl Future<Output = TestResult> {
        future::ready(Ok(()))
    }

    /// The test itself.
    fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a>;

    /// Asynchronous teardown, run before [`Self::tear_down`].
    fn async_tear_down(&mut self, _cx: &TestContext) -> impl Future<Output = TestResult> {
        future::ready(Ok(()))
    }

    /// Synchronous teardown.
    fn tear_down(&mut self, _cx: &TestContext) -> TestResult {
        Ok(())
    }
}
