//! Transport and protocol traits.
//!
//! Code under test never opens sockets itself. It is handed a [`Network`] and
//! asks it for transports, the same way it would ask a real runtime. Tests
//! pass a simulated network; production code passes one backed by the OS.
//!
//! Data flows in two directions:
//!
//! ```text
//!   code under test ── write / sendto ──▶ Transport
//!   code under test ◀── data_received ─── Protocol (owned by the caller)
//! ```

use std::{cell::RefCell, fmt, rc::Rc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// A `host:port` pair.
///
/// Hosts are kept as strings: simulated traffic may originate from addresses
/// that are not valid IPs (the noise origin is `?.?.?.?`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

/// Identifier of a transport, unique within the network that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Connection-oriented.
    Stream,
    /// Datagram-oriented.
    Datagram,
}

/// Options code under test sets on a datagram socket before binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// `SO_REUSEADDR`.
    ReuseAddress(bool),
    /// `SO_REUSEPORT`.
    ReusePort(bool),
    /// `SO_BROADCAST`.
    Broadcast(bool),
    /// `IP_MULTICAST_TTL`.
    MulticastTtl(u32),
    /// `IP_MULTICAST_LOOP`.
    MulticastLoop(bool),
}

/// Behaviour shared by every transport.
pub trait Transport {
    /// Identifier of this transport.
    fn id(&self) -> TransportId;

    /// Close the transport. Idempotent.
    ///
    /// After close, nothing is delivered to the protocol anymore.
    fn close(&self);

    /// Whether [`Transport::close`] was called.
    fn is_closing(&self) -> bool;

    /// Local address the transport is bound to.
    fn local_address(&self) -> Option<Address>;

    /// Remote address, if one is known.
    fn peer_address(&self) -> Option<Address>;
}

/// A connection-oriented transport.
pub trait StreamTransport: Transport {
    /// Queue `data` for the peer. Never blocks.
    fn write(&self, data: &[u8]) -> Result<(), TransportError>;
}

/// A datagram-oriented transport.
pub trait DatagramTransport: Transport {
    /// Send one datagram to `destination`. Never blocks.
    fn sendto(&self, data: &[u8], destination: &Address) -> Result<(), TransportError>;
}

/// Receives events from a [`StreamTransport`].
pub trait StreamProtocol {
    /// The connection is established. Called exactly once, before the
    /// transport is returned to the caller.
    fn connection_made(&mut self, transport: Rc<dyn StreamTransport>);

    /// A chunk of the byte stream arrived.
    fn data_received(&mut self, data: Bytes);
}

/// Receives events from a [`DatagramTransport`].
pub trait DatagramProtocol {
    /// The endpoint is ready. Called exactly once, before the transport is
    /// returned to the caller.
    fn connection_made(&mut self, transport: Rc<dyn DatagramTransport>);

    /// A datagram arrived from `origin`.
    fn datagram_received(&mut self, data: Bytes, origin: Address);
}

/// A socket handed to code under test before it becomes a transport.
pub trait Socket: fmt::Debug {
    /// Set a socket option.
    fn set_option(&mut self, option: SocketOption) -> Result<(), TransportError>;

    /// Toggle non-blocking mode.
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError>;

    /// Bind to a local address.
    fn bind(&mut self, address: &Address) -> Result<(), TransportError>;

    /// Address the socket is bound to, once [`Socket::bind`] succeeded.
    fn bound_address(&self) -> Option<&Address>;

    /// `getsockname`-style local name.
    fn local_name(&self) -> String;

    /// `getpeername`-style remote name.
    fn peer_name(&self) -> String;

    /// File-descriptor-like number.
    fn fileno(&self) -> i32;

    /// Socket type.
    fn kind(&self) -> SocketKind;

    /// Release the socket. Idempotent.
    fn close(&mut self);
}

/// Shared, mutable stream protocol handler.
pub type SharedStreamProtocol = Rc<RefCell<dyn StreamProtocol>>;

/// Shared, mutable datagram protocol handler.
pub type SharedDatagramProtocol = Rc<RefCell<dyn DatagramProtocol>>;

/// Transport factory handed to code under test.
#[async_trait(?Send)]
pub trait Network {
    /// A fresh, unbound datagram socket.
    fn datagram_socket(&self) -> Result<Box<dyn Socket>, TransportError>;

    /// Open a connection to `host:port`, attaching `protocol` to it.
    ///
    /// Returns the transport together with the protocol it delivers to.
    async fn create_connection(
        &self,
        protocol: SharedStreamProtocol,
        host: &str,
        port: u16,
    ) -> Result<(Rc<dyn StreamTransport>, SharedStreamProtocol), TransportError>;

    /// Wrap a bound socket in a datagram transport delivering to `protocol`.
    async fn create_datagram_endpoint(
        &self,
        protocol: SharedDatagramProtocol,
        socket: Box<dyn Socket>,
    ) -> Result<(Rc<dyn DatagramTransport>, SharedDatagramProtocol), TransportError>;
}
