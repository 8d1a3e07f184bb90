//! The simulated [`Network`] handed to code under test.
//!
//! A `SimNetwork` is bound to one event loop. Every transport it creates is
//! closed when that loop closes, whether the test passed, failed or panicked,
//! and whether or not the `SimNetwork` itself is still alive by then.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use async_trait::async_trait;
use tidepool_core::{
    Address, DatagramTransport, LoopError, LoopHandle, Network, SharedDatagramProtocol,
    SharedStreamProtocol, Socket, StreamTransport, Transport, TransportError, TransportId,
};

use crate::{
    config::{SentLog, SimConfig},
    sim_socket::SimSocket,
    sim_transport::{SimDatagramTransport, SimStreamTransport},
};

type Registry = Rc<RefCell<Vec<Rc<dyn Transport>>>>;

/// Scripted transport factory bound to one event loop.
pub struct SimNetwork {
    handle: LoopHandle,
    config: Rc<SimConfig>,
    transports: Registry,
    next_id: Cell<u64>,
}

impl SimNetwork {
    /// Bind a simulator to the loop behind `handle`.
    pub fn new(handle: &LoopHandle, config: SimConfig) -> Self {
        let transports: Registry = Rc::new(RefCell::new(Vec::new()));

        let on_close = Rc::clone(&transports);
        let loop_id = handle.id();
        handle.on_close(move || {
            let open = close_registry(&on_close);
            if open > 0 {
                tracing::debug!(%loop_id, transports = open, "closed transports left open");
            }
        });

        Self { handle: handle.clone(), config: Rc::new(config), transports, next_id: Cell::new(1) }
    }

    /// The scripted behaviour.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Every UDP payload sent so far.
    pub fn sent_udp(&self) -> &SentLog {
        &self.config.sent_udp
    }

    /// Every TCP payload written so far.
    pub fn sent_tcp(&self) -> &SentLog {
        &self.config.sent_tcp
    }

    /// Number of transports created and not yet closed.
    pub fn open_transports(&self) -> usize {
        self.transports.borrow().iter().filter(|t| !t.is_closing()).count()
    }

    /// Close every transport this simulator created. Returns how many were
    /// still open.
    pub fn close_all(&self) -> usize {
        close_registry(&self.transports)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.handle.is_closed() {
            return Err(LoopError::Closed { loop_id: self.handle.id() }.into());
        }
        Ok(())
    }

    fn next_id(&self) -> TransportId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        TransportId(id)
    }

    fn register(&self, transport: Rc<dyn Transport>) {
        self.transports.borrow_mut().push(transport);
    }
}

fn close_registry(registry: &Registry) -> usize {
    let transports = std::mem::take(&mut *registry.borrow_mut());
    let mut open = 0;
    for transport in transports {
        if !transport.is_closing() {
            open += 1;
            transport.close();
        }
    }
    open
}

#[async_trait(?Send)]
impl Network for SimNetwork {
    fn datagram_socket(&self) -> Result<Box<dyn Socket>, TransportError> {
        Ok(Box::new(SimSocket::new(self.config.bind_fails)))
    }

    async fn create_connection(
        &self,
        protocol: SharedStreamProtocol,
        host: &str,
        port: u16,
    ) -> Result<(Rc<dyn StreamTransport>, SharedStreamProtocol), TransportError> {
        let address = Address::new(host, port);
        if self.config.connect_refused {
            tracing::warn!(%address, "injected connection refused");
            return Err(TransportError::ConnectionRefused { address });
        }
        self.ensure_open()?;

        let transport = SimStreamTransport::new(
            self.next_id(),
            self.handle.clone(),
            Rc::clone(&self.config),
            address,
            Rc::clone(&protocol),
        );
        self.register(transport.clone());
        tracing::debug!(transport = %transport.id(), peer = %host, port, "tcp connection made");

        let transport: Rc<dyn StreamTransport> = transport;
        protocol.borrow_mut().connection_made(Rc::clone(&transport));
        Ok((transport, protocol))
    }

    async fn create_datagram_endpoint(
        &self,
        protocol: SharedDatagramProtocol,
        socket: Box<dyn Socket>,
    ) -> Result<(Rc<dyn DatagramTransport>, SharedDatagramProtocol), TransportError> {
        let local = socket.bound_address().cloned().ok_or(TransportError::NotBound)?;
        self.ensure_open()?;

        let transport = SimDatagramTransport::new(
            self.next_id(),
            self.handle.clone(),
            Rc::clone(&self.config),
            local,
            socket,
            Rc::clone(&protocol),
        );
        self.register(transport.clone());
        tracing::debug!(transport = %transport.id(), "udp endpoint created");

        let transport: Rc<dyn DatagramTransport> = transport;
        protocol.borrow_mut().connection_made(Rc::clone(&transport));
        Ok((transport, protocol))
    }
}

impl fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimNetwork")
            .field("loop", &self.handle.id())
            .field("transports", &self.transports.borrow().len())
            .field("open", &self.open_transports())
            .finish_non_exhaustive()
    }
}
