//! Simulated stream and datagram transports.
//!
//! Writes and sends are intercepted synchronously: the payload is logged and
//! any scripted reaction is scheduled on the event loop. Nothing is delivered
//! inline, so code under test observes the same asynchronous timing a real
//! socket would produce.
//!
//! # Invariants
//!
//! - Every payload is logged before its reaction is scheduled
//! - Chunks of one TCP reply are delivered in order, each at the same delay
//! - Nothing reaches the protocol once the transport is closed

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use bytes::Bytes;
use tidepool_core::{
    Address, DatagramTransport, LoopHandle, SharedDatagramProtocol, SharedStreamProtocol, Socket,
    StreamTransport, Transport, TransportError, TransportId,
};

use crate::config::{NOISE_HOST, NOISE_PAYLOAD, SimConfig};

/// Split `reply` into consecutive pieces of at most `chunk_size` bytes.
///
/// Pieces share the reply's buffer. An empty reply yields no pieces.
pub fn chunk_reply(reply: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    (0..reply.len())
        .step_by(chunk_size)
        .map(|start| reply.slice(start..(start + chunk_size).min(reply.len())))
        .collect()
}

/// A scripted TCP connection.
pub struct SimStreamTransport {
    id: TransportId,
    handle: LoopHandle,
    config: Rc<SimConfig>,
    peer: Address,
    protocol: RefCell<Option<SharedStreamProtocol>>,
    closed: Cell<bool>,
    this: Weak<Self>,
}

impl SimStreamTransport {
    pub(crate) fn new(
        id: TransportId,
        handle: LoopHandle,
        config: Rc<SimConfig>,
        peer: Address,
        protocol: SharedStreamProtocol,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id,
            handle,
            config,
            peer,
            protocol: RefCell::new(Some(protocol)),
            closed: Cell::new(false),
            this: this.clone(),
        })
    }

    fn deliver(&self, chunk: Bytes) {
        if self.closed.get() {
            tracing::trace!(transport = %self.id, len = chunk.len(), "dropped after close");
            return;
        }
        let protocol = self.protocol.borrow().clone();
        if let Some(protocol) = protocol {
            tracing::trace!(transport = %self.id, len = chunk.len(), "tcp delivery");
            protocol.borrow_mut().data_received(chunk);
        }
    }
}

impl Transport for SimStreamTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        // Breaks the transport <-> protocol cycle
        let protocol = self.protocol.borrow_mut().take();
        drop(protocol);
        tracing::debug!(transport = %self.id, peer = %self.peer, "tcp transport closed");
    }

    fn is_closing(&self) -> bool {
        self.closed.get()
    }

    fn local_address(&self) -> Option<Address> {
        None
    }

    fn peer_address(&self) -> Option<Address> {
        Some(self.peer.clone())
    }
}

impl StreamTransport for SimStreamTransport {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed { id: self.id });
        }

        let data = Bytes::copy_from_slice(data);
        tracing::debug!(transport = %self.id, len = data.len(), "tcp write");
        self.config.sent_tcp.push(data.clone());

        let Some(reply) = self.config.tcp_replies.get(&data) else { return Ok(()) };

        for chunk in chunk_reply(reply, self.config.tcp_chunk_size.get()) {
            let this = self.this.clone();
            self.handle.call_later(self.config.tcp_delay, move || {
                if let Some(transport) = this.upgrade() {
                    transport.deliver(chunk);
                }
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for SimStreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimStreamTransport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}

/// A scripted UDP endpoint.
pub struct SimDatagramTransport {
    id: TransportId,
    handle: LoopHandle,
    config: Rc<SimConfig>,
    local: Address,
    socket: RefCell<Box<dyn Socket>>,
    peer: RefCell<Option<Address>>,
    protocol: RefCell<Option<SharedDatagramProtocol>>,
    closed: Cell<bool>,
    this: Weak<Self>,
}

impl SimDatagramTransport {
    pub(crate) fn new(
        id: TransportId,
        handle: LoopHandle,
        config: Rc<SimConfig>,
        local: Address,
        socket: Box<dyn Socket>,
        protocol: SharedDatagramProtocol,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id,
            handle,
            config,
            local,
            socket: RefCell::new(socket),
            peer: RefCell::new(None),
            protocol: RefCell::new(Some(protocol)),
            closed: Cell::new(false),
            this: this.clone(),
        })
    }

    fn schedule(
        &self,
        delay: std::time::Duration,
        data: Bytes,
        origin: Address,
        learn_peer: bool,
    ) -> Result<(), TransportError> {
        let this = self.this.clone();
        self.handle.call_later(delay, move || {
            if let Some(transport) = this.upgrade() {
                transport.deliver(data, origin, learn_peer);
            }
        })?;
        Ok(())
    }

    fn deliver(&self, data: Bytes, origin: Address, learn_peer: bool) {
        if self.closed.get() {
            tracing::trace!(transport = %self.id, %origin, "delivery suppressed after close");
            return;
        }
        if learn_peer {
            *self.peer.borrow_mut() = Some(origin.clone());
        }
        let protocol = self.protocol.borrow().clone();
        if let Some(protocol) = protocol {
            tracing::trace!(transport = %self.id, %origin, len = data.len(), "udp delivery");
            protocol.borrow_mut().datagram_received(data, origin);
        }
    }
}

impl Transport for SimDatagramTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.socket.borrow_mut().close();
        let protocol = self.protocol.borrow_mut().take();
        drop(protocol);
        tracing::debug!(transport = %self.id, local = %self.local, "udp transport closed");
    }

    fn is_closing(&self) -> bool {
        self.closed.get()
    }

    fn local_address(&self) -> Option<Address> {
        Some(self.local.clone())
    }

    fn peer_address(&self) -> Option<Address> {
        self.peer.borrow().clone()
    }
}

impl DatagramTransport for SimDatagramTransport {
    fn sendto(&self, data: &[u8], destination: &Address) -> Result<(), TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed { id: self.id });
        }

        let data = Bytes::copy_from_slice(data);
        tracing::debug!(transport = %self.id, %destination, len = data.len(), "udp send");
        self.config.sent_udp.push(data.clone());

        let delay = self.config.udp_delay;
        let echo_origin = self.config.responder(self.local.host());
        self.schedule(delay, data.clone(), echo_origin, false)?;

        if self.config.noise {
            let noise_origin = self.config.responder(NOISE_HOST);
            self.schedule(
                std::time::Duration::ZERO,
                Bytes::from_static(NOISE_PAYLOAD),
                noise_origin,
                false,
            )?;
        }

        if let Some(reply) = self.config.udp_replies.get(&(data, destination.clone())) {
            let host = self.config.udp_expected_host.as_deref().unwrap_or(destination.host());
            self.schedule(delay, reply.clone(), self.config.responder(host), true)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SimDatagramTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimDatagramTransport")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("peer", &self.peer.borrow())
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}
