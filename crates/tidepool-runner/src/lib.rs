//! Async test runner.
//!
//! Gives every test its own event loop and lets fixtures, bodies and
//! cleanups be asynchronous while reporting through a conventional
//! success / failure / error / skip / expected-failure / unexpected-success
//! contract.
//!
//! ## Architecture
//!
//! ```text
//! tidepool-runner
//!   ├─ AsyncTestCase     (set_up, async_set_up, body, async_tear_down, tear_down)
//!   ├─ TestContext       (loop handle, cleanup stack, skip)
//!   ├─ AsyncTestRunner   (phase sequencing, panic capture, loop shutdown)
//!   ├─ TestOutcome       (single verdict per test)
//!   └─ ResultCollector   (reporting sink, TestResultLog)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod case;
mod collector;
mod context;
mod error;
pub mod logging;
mod outcome;
mod runner;

pub use case::{AsyncTestCase, TestBody, TestMarkers};
pub use collector::{ResultCollector, TestResultLog};
pub use context::{Cleanup, CleanupStack, TestContext};
pub use error::{TestError, TestResult};
pub use logging::init_test_logging;
pub use outcome::{Phase, PhaseError, TestOutcome, TestReport};
pub use runner::{AsyncTestRunner, RunnerConfig};
