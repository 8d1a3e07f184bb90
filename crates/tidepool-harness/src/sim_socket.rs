//! Deterministic socket stub.
//!
//! Every query returns a fixed value so that code inspecting its socket sees
//! the same thing on every run. Options and blocking mode are accepted and
//! ignored.

use tidepool_core::{Address, Socket, SocketKind, SocketOption, TransportError};

/// File-descriptor-like number reported by every simulated socket.
pub const SIM_FILENO: i32 = 7;

/// `getsockname`-style name reported by every simulated socket.
pub const SIM_LOCAL_NAME: &str = "0.0.0.0";

/// A datagram socket that never touches the OS.
#[derive(Debug, Default)]
pub struct SimSocket {
    bind_fails: bool,
    bound: Option<Address>,
    closed: bool,
}

impl SimSocket {
    /// Create a socket; `bind_fails` makes every bind fail.
    pub fn new(bind_fails: bool) -> Self {
        Self { bind_fails, bound: None, closed: false }
    }

    /// Whether [`Socket::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Socket for SimSocket {
    fn set_option(&mut self, _option: SocketOption) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn bind(&mut self, address: &Address) -> Result<(), TransportError> {
        if self.bind_fails {
            tracing::warn!(%address, "injected bind failure");
            return Err(TransportError::Bind {
                address: address.clone(),
                reason: "address not available".to_string(),
            });
        }
        self.bound = Some(address.clone());
        Ok(())
    }

    fn bound_address(&self) -> Option<&Address> {
        self.bound.as_ref()
    }

    fn local_name(&self) -> String {
        SIM_LOCAL_NAME.to_string()
    }

    fn peer_name(&self) -> String {
        String::new()
    }

    fn fileno(&self) -> i32 {
        SIM_FILENO
    }

    fn kind(&self) -> SocketKind {
        SocketKind::Datagram
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
