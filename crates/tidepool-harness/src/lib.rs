//! Scripted network simulator for deterministic client tests.
//!
//! [`SimNetwork`] implements [`tidepool_core::Network`] without touching a
//! network device. Writes and sends are recorded; scripted replies, echoes
//! and noise are scheduled on the test's event loop; faults fire at exactly
//! the call they name.
//!
//! ## Architecture
//!
//! ```text
//! tidepool-harness
//!   ├─ SimConfig             (replies, delays, chunking, fault flags)
//!   ├─ SimNetwork            (transport factory bound to one loop)
//!   ├─ SimStreamTransport    (TCP: log write, deliver reply in chunks)
//!   ├─ SimDatagramTransport  (UDP: log send, echo + reply + noise)
//!   └─ SimSocket             (deterministic socket stub)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod sim_network;
mod sim_socket;
mod sim_transport;

pub use config::{
    DEFAULT_RESPONDER_PORT, DEFAULT_TCP_CHUNK_SIZE, NOISE_HOST, NOISE_PAYLOAD, SentLog, SimConfig,
};
pub use sim_network::SimNetwork;
pub use sim_socket::{SIM_FILENO, SIM_LOCAL_NAME, SimSocket};
pub use sim_transport::{SimDatagramTransport, SimStreamTransport, chunk_reply};
