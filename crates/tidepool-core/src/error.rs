//! Error types for the event loop and simulated transports.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    event_loop::LoopId,
    transport::{Address, TransportId},
};

/// Errors raised by the event loop itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    /// The loop was closed; nothing can be scheduled or run on it.
    #[error("event loop {loop_id} is closed")]
    Closed {
        /// Loop that rejected the operation.
        loop_id: LoopId,
    },

    /// The driven future is pending, but nothing can ever wake it: no task is
    /// runnable and no timer is scheduled.
    #[error("event loop stalled at {now:?} with {parked_tasks} parked task(s) and no timers")]
    Stalled {
        /// Virtual time at which the loop ran dry.
        now: Duration,
        /// Tasks still alive but waiting on something.
        parked_tasks: usize,
    },

    /// Tasks kept reappearing after every cancellation round.
    #[error("{remaining} task(s) still alive after {rounds} cancellation rounds")]
    CancellationIgnored {
        /// Tasks alive after the last round.
        remaining: usize,
        /// Rounds attempted.
        rounds: usize,
    },
}

/// Why a spawned task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The task was cancelled, either explicitly or at loop shutdown.
    #[error("task was cancelled")]
    Cancelled,

    /// The task panicked while being polled.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl JoinError {
    /// Returns true if the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors surfaced by transports and transport factories.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote end refused the connection.
    #[error("connection refused: {address}")]
    ConnectionRefused {
        /// Address the connection was attempted to.
        address: Address,
    },

    /// Binding a socket to a local address failed.
    #[error("cannot bind {address}: {reason}")]
    Bind {
        /// Address the bind was attempted on.
        address: Address,
        /// OS-style description of the failure.
        reason: String,
    },

    /// A datagram endpoint was requested for a socket that was never bound.
    #[error("socket is not bound")]
    NotBound,

    /// The transport was closed.
    #[error("transport {id} is closed")]
    Closed {
        /// Closed transport.
        id: TransportId,
    },

    /// The owning event loop rejected the operation.
    #[error(transparent)]
    Loop(#[from] LoopError),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// The `io::ErrorKind` a real socket would have reported.
    ///
    /// Lets code under test branch on simulated faults exactly as it would on
    /// real ones.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::ConnectionRefused { .. } => io::ErrorKind::ConnectionRefused,
            Self::Bind { .. } => io::ErrorKind::AddrNotAvailable,
            Self::NotBound => io::ErrorKind::InvalidInput,
            Self::Closed { .. } => io::ErrorKind::NotConnected,
            Self::Loop(_) => io::ErrorKind::Other,
            Self::Io(err) => err.kind(),
        }
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(err) => err,
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_maps_to_io_kind() {
        let err = TransportError::ConnectionRefused { address: Address::new("10.0.0.1", 80) };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(io_err.to_string(), "connection refused: 10.0.0.1:80");
    }

    #[test]
    fn io_errors_pass_through_unchanged() {
        let err = TransportError::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn join_error_display() {
        assert_eq!(JoinError::Cancelled.to_string(), "task was cancelled");
        assert!(JoinError::Cancelled.is_cancelled());
        assert!(!JoinError::Panicked("boom".to_string()).is_cancelled());
    }
}
