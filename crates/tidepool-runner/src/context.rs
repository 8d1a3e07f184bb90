//! Per-test context and cleanup registration.

use std::{cell::RefCell, fmt, future::Future, rc::Rc};

use tidepool_core::{LocalBoxFuture, LoopHandle};

use crate::error::{TestError, TestResult};

/// A cleanup callback, run after teardown in reverse registration order.
pub enum Cleanup {
    /// Runs to completion synchronously.
    Sync(Box<dyn FnOnce() -> TestResult>),
    /// Produces a future the runner drives on the test's loop.
    Async(Box<dyn FnOnce() -> LocalBoxFuture<'static, TestResult>>),
}

impl Cleanup {
    /// Wrap a synchronous cleanup.
    pub fn sync(cleanup: impl FnOnce() -> TestResult + 'static) -> Self {
        Self::Sync(Box::new(cleanup))
    }

    /// Wrap an asynchronous cleanup.
    pub fn future<F, Fut>(cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = TestResult> + 'static,
    {
        Self::Async(Box::new(move || Box::pin(cleanup())))
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Cleanup::Sync"),
            Self::Async(_) => f.write_str("Cleanup::Async"),
        }
    }
}

/// Shared LIFO of registered cleanups.
///
/// Clones share the stack, so a cleanup can capture one and register more
/// cleanups while the stack is being unwound. Those run too.
#[derive(Clone, Default)]
pub struct CleanupStack {
    stack: Rc<RefCell<Vec<Cleanup>>>,
}

impl CleanupStack {
    /// Register a cleanup.
    pub fn push(&self, cleanup: Cleanup) {
        self.stack.borrow_mut().push(cleanup);
    }

    /// Take the most recently registered cleanup.
    pub fn pop(&self) -> Option<Cleanup> {
        self.stack.borrow_mut().pop()
    }

    /// Number of cleanups not yet run.
    pub fn len(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Whether every cleanup has run.
    pub fn is_empty(&self) -> bool {
        self.stack.borrow().is_empty()
    }
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack").field("pending", &self.len()).finish()
    }
}

/// What a test can reach while it runs.
#[derive(Debug)]
pub struct TestContext {
    test_id: String,
    handle: LoopHandle,
    cleanups: CleanupStack,
}

impl TestContext {
    pub(crate) fn new(test_id: String, handle: LoopHandle) -> Self {
        Self { test_id, handle, cleanups: CleanupStack::default() }
    }

    /// Identifier of the running test.
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// The test's event loop. Bind simulators and spawn tasks through it.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Register a cleanup.
    pub fn add_cleanup(&self, cleanup: Cleanup) {
        self.cleanups.push(cleanup);
    }

    /// Register a synchronous cleanup.
    pub fn add_sync_cleanup(&self, cleanup: impl FnOnce() -> TestResult + 'static) {
        self.add_cleanup(Cleanup::sync(cleanup));
    }

    /// Register an asynchronous cleanup.
    pub fn add_async_cleanup<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = TestResult> + 'static,
    {
        self.add_cleanup(Cleanup::future(cleanup));
    }

    /// A handle to the cleanup stack that can be moved into cleanups.
    pub fn cleanups(&self) -> CleanupStack {
        self.cleanups.clone()
    }

    /// Skip the rest of the test: `return cx.skip("no multicast route");`
    pub fn skip(&self, reason: impl Into<String>) -> TestResult {
        Err(TestError::Skipped(reason.into()))
    }
}
