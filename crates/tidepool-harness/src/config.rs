//! Scripted network behaviour.
//!
//! A [`SimConfig`] is plain data: expected addresses, canned replies, delays,
//! chunking and fault flags. It is built once per test and read-only after the
//! [`SimNetwork`](crate::SimNetwork) is created.

use std::{cell::RefCell, collections::HashMap, fmt, num::NonZeroUsize, rc::Rc, time::Duration};

use bytes::Bytes;
use tidepool_core::Address;

/// Port every simulated UDP delivery originates from.
pub const DEFAULT_RESPONDER_PORT: u16 = 1900;

/// Largest piece a scripted TCP reply is delivered in by default.
pub const DEFAULT_TCP_CHUNK_SIZE: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(size) => size,
    None => unreachable!(),
};

/// Payload of injected noise datagrams.
pub const NOISE_PAYLOAD: &[u8] = b"potato";

/// Origin host of injected noise datagrams. Deliberately not an IP address.
pub const NOISE_HOST: &str = "?.?.?.?";

/// Append-only record of every payload the simulated peer observed.
///
/// Cloning yields another handle to the same log, so a test can keep one
/// before handing the config to the simulator.
#[derive(Clone, Default)]
pub struct SentLog {
    entries: Rc<RefCell<Vec<Bytes>>>,
}

impl SentLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, data: Bytes) {
        self.entries.borrow_mut().push(data);
    }

    /// Copy of every payload, in emission order.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.entries.borrow().clone()
    }

    /// Number of payloads recorded.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl fmt::Debug for SentLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.borrow().iter()).finish()
    }
}

/// Everything a simulated network does on behalf of the peer.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Host scripted UDP replies are attributed to. When unset, replies
    /// come from the host they were sent to.
    pub udp_expected_host: Option<String>,
    /// Port echoes, replies and noise originate from.
    pub responder_port: u16,
    /// UDP replies keyed by `(request, destination)`. Exact match only.
    pub udp_replies: HashMap<(Bytes, Address), Bytes>,
    /// Virtual delay before UDP echoes and replies are delivered.
    pub udp_delay: Duration,
    /// TCP replies keyed by the exact bytes of one write.
    pub tcp_replies: HashMap<Bytes, Bytes>,
    /// Virtual delay before every chunk of a TCP reply is delivered.
    pub tcp_delay: Duration,
    /// Largest piece a TCP reply is split into.
    pub tcp_chunk_size: NonZeroUsize,
    /// Inject a noise datagram on every UDP send.
    pub noise: bool,
    /// Fail every socket bind.
    pub bind_fails: bool,
    /// Refuse every TCP connection.
    pub connect_refused: bool,
    /// Log of every UDP payload sent.
    pub sent_udp: SentLog,
    /// Log of every TCP payload written.
    pub sent_tcp: SentLog,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            udp_expected_host: None,
            responder_port: DEFAULT_RESPONDER_PORT,
            udp_replies: HashMap::new(),
            udp_delay: Duration::ZERO,
            tcp_replies: HashMap::new(),
            tcp_delay: Duration::ZERO,
            tcp_chunk_size: DEFAULT_TCP_CHUNK_SIZE,
            noise: false,
            bind_fails: false,
            connect_refused: false,
            sent_udp: SentLog::new(),
            sent_tcp: SentLog::new(),
        }
    }
}

impl SimConfig {
    /// Configuration with no replies, no delay and no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute scripted UDP replies to `host`.
    pub fn with_udp_expected_host(mut self, host: impl Into<String>) -> Self {
        self.udp_expected_host = Some(host.into());
        self
    }

    /// Port simulated UDP traffic originates from.
    pub fn with_responder_port(mut self, port: u16) -> Self {
        self.responder_port = port;
        self
    }

    /// Reply with `reply` when `request` is sent to `destination`.
    pub fn with_udp_reply(
        mut self,
        request: impl Into<Bytes>,
        destination: Address,
        reply: impl Into<Bytes>,
    ) -> Self {
        self.udp_replies.insert((request.into(), destination), reply.into());
        self
    }

    /// Delay UDP echoes and replies.
    pub fn with_udp_delay(mut self, delay: Duration) -> Self {
        self.udp_delay = delay;
        self
    }

    /// Reply with `reply` when exactly `request` is written.
    pub fn with_tcp_reply(mut self, request: impl Into<Bytes>, reply: impl Into<Bytes>) -> Self {
        self.tcp_replies.insert(request.into(), reply.into());
        self
    }

    /// Delay TCP replies.
    pub fn with_tcp_delay(mut self, delay: Duration) -> Self {
        self.tcp_delay = delay;
        self
    }

    /// Split TCP replies into pieces of at most `size` bytes.
    pub fn with_tcp_chunk_size(mut self, size: NonZeroUsize) -> Self {
        self.tcp_chunk_size = size;
        self
    }

    /// Inject a noise datagram on every UDP send.
    pub fn with_noise(mut self, enabled: bool) -> Self {
        self.noise = enabled;
        self
    }

    /// Make every socket bind fail.
    pub fn with_bind_failure(mut self, enabled: bool) -> Self {
        self.bind_fails = enabled;
        self
    }

    /// Make every TCP connection attempt fail with connection refused.
    pub fn with_connection_refused(mut self, enabled: bool) -> Self {
        self.connect_refused = enabled;
        self
    }

    /// Record UDP sends into an existing log.
    pub fn with_sent_udp_log(mut self, log: SentLog) -> Self {
        self.sent_udp = log;
        self
    }

    /// Record TCP writes into an existing log.
    pub fn with_sent_tcp_log(mut self, log: SentLog) -> Self {
        self.sent_tcp = log;
        self
    }

    pub(crate) fn responder(&self, host: &str) -> Address {
        Address::new(host, self.responder_port)
    }
}
