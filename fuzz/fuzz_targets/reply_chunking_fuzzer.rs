//! Fuzz target for scripted TCP reply delivery
//!
//! # Strategy
//!
//! - Arbitrary request/reply pairs, including empty replies
//! - Chunk sizes from 1 to 256, smaller and larger than the reply
//! - Arbitrary delivery delay on the virtual clock
//!
//! # Invariants
//!
//! - `chunk_reply` pieces are non-empty and at most `chunk_size` bytes
//! - The protocol receives exactly the reply, in order, nothing more
//! - Nothing arrives before the configured delay
//! - Closing the loop closes every transport the simulator created

#![no_main]

use std::{cell::RefCell, num::NonZeroUsize, rc::Rc, time::Duration};

use arbitrary::Arbitrary;
use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use tidepool_core::{EventLoop, LoopHandle, Network, StreamProtocol, StreamTransport};
use tidepool_harness::{SimConfig, SimNetwork, chunk_reply};

#[derive(Debug, Arbitrary)]
struct Input {
    request: Vec<u8>,
    reply: Vec<u8>,
    chunk_size: u8,
    delay_ms: u8,
}

#[derive(Default)]
struct Collector {
    pieces: Vec<(Duration, Bytes)>,
    clock: Option<LoopHandle>,
}

impl StreamProtocol for Collector {
    fn connection_made(&mut self, _transport: Rc<dyn StreamTransport>) {}

    fn data_received(&mut self, data: Bytes) {
        let at = self.clock.as_ref().map(|h| h.time()).unwrap_or_default();
        self.pieces.push((at, data));
    }
}

fuzz_target!(|input: Input| {
    let chunk_size = NonZeroUsize::new(usize::from(input.chunk_size)).unwrap_or(NonZeroUsize::MIN);
    let reply = Bytes::from(input.reply);
    let delay = Duration::from_millis(u64::from(input.delay_ms));

    let pieces = chunk_reply(&reply, chunk_size.get());
    assert!(pieces.iter().all(|p| !p.is_empty() && p.len() <= chunk_size.get()));
    assert_eq!(pieces.len(), reply.len().div_ceil(chunk_size.get()));

    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();
    let config = SimConfig::new()
        .with_tcp_reply(input.request.clone(), reply.clone())
        .with_tcp_delay(delay)
        .with_tcp_chunk_size(chunk_size);
    let network = SimNetwork::new(&handle, config);
    let collector =
        Rc::new(RefCell::new(Collector { clock: Some(handle.clone()), ..Default::default() }));

    let received = event_loop
        .run_until_complete(async {
            let (transport, _) = network
                .create_connection(collector.clone(), "10.0.0.1", 80)
                .await
                .expect("connect");
            transport.write(&input.request).expect("write");
            handle.sleep(delay + Duration::from_millis(1)).await;
            transport.close();
        })
        .map(|()| collector.borrow().pieces.clone())
        .expect("loop ran");

    let mut joined = BytesMut::new();
    for (at, piece) in &received {
        assert!(*at >= delay, "piece delivered at {at:?}, before {delay:?}");
        joined.extend_from_slice(piece);
    }
    assert_eq!(joined.freeze(), reply);
    assert_eq!(received.len(), pieces.len());

    event_loop.close();
    assert_eq!(network.open_transports(), 0);
});
