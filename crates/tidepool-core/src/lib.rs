//! Tidepool core: a virtual-time event loop and transport traits.
//!
//! Everything here is single-threaded and deterministic. Time is virtual and
//! only moves when the loop has nothing else to do, so delayed replies in a
//! test are delivered in microseconds of wall time.
//!
//! ## Architecture
//!
//! ```text
//! tidepool-core
//!   ├─ EventLoop / LoopHandle   (clock, callbacks, tasks, shutdown)
//!   ├─ TimerQueue               ((deadline, sequence) ordered scheduler)
//!   ├─ JoinHandle               (spawned task output)
//!   └─ Network + Transport      (seams the simulator plugs into)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event_loop;
pub mod scheduler;
mod task;
pub mod transport;

pub use error::{JoinError, LoopError, TransportError};
pub use event_loop::{
    ActiveLoopGuard, EventLoop, LoopConfig, LoopHandle, LoopId, ShutdownReport, Sleep, TimerHandle,
    YieldNow, current_loop, panic_message,
};
pub use task::{JoinHandle, LocalBoxFuture, TaskId};
pub use transport::{
    Address, DatagramProtocol, DatagramTransport, Network, SharedDatagramProtocol,
    SharedStreamProtocol, Socket, SocketKind, SocketOption, StreamProtocol, StreamTransport,
    Transport, TransportId,
};
