//! End-to-end: a discovery client tested through the runner and simulator.
//!
//! The client multicasts a search request, listens for a while and returns
//! the responders it heard from. It only sees the `Network` trait, so the
//! same code would run against real sockets.

use std::{cell::RefCell, net::IpAddr, rc::Rc, time::Duration};

use bytes::Bytes;
use tidepool_core::{
    Address, DatagramProtocol, DatagramTransport, LoopHandle, Network, StreamProtocol,
    StreamTransport, Transport, TransportError,
};
use tidepool_harness::{SimConfig, SimNetwork};
use tidepool_runner::{
    AsyncTestCase, AsyncTestRunner, Phase, TestBody, TestContext, TestError, TestMarkers,
    TestOutcome, TestResult, ensure,
};
use tokio::sync::mpsc;

const SEARCH: &[u8] = b"M-SEARCH * HTTP/1.1";

fn multicast_group() -> Address {
    Address::new("239.255.255.250", 1900)
}

struct Listener {
    tx: mpsc::UnboundedSender<(Bytes, Address)>,
}

impl DatagramProtocol for Listener {
    fn connection_made(&mut self, _transport: Rc<dyn DatagramTransport>) {}

    fn datagram_received(&mut self, data: Bytes, origin: Address) {
        let _ = self.tx.send((data, origin));
    }
}

/// The code under test.
async fn discover(
    network: &dyn Network,
    handle: &LoopHandle,
    listen_for: Duration,
) -> Result<Vec<(Address, Bytes)>, TransportError> {
    let mut socket = network.datagram_socket()?;
    socket.set_nonblocking(true)?;
    socket.bind(&Address::new("192.168.1.10", 0))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (transport, _) =
        network.create_datagram_endpoint(Rc::new(RefCell::new(Listener { tx })), socket).await?;
    transport.sendto(SEARCH, &multicast_group())?;

    handle.sleep(listen_for).await;
    transport.close();

    let own_host = transport.local_address().map(|a| a.host().to_string());
    let mut responders = Vec::new();
    while let Ok((data, origin)) = rx.try_recv() {
        let is_echo = Some(origin.host().to_string()) == own_host;
        let is_valid = origin.host().parse::<IpAddr>().is_ok();
        if !is_echo && is_valid {
            responders.push((origin, data));
        }
    }
    Ok(responders)
}

struct DiscoveryTest {
    config: SimConfig,
    network: Option<Rc<SimNetwork>>,
    expect: usize,
    markers: TestMarkers,
}

impl DiscoveryTest {
    fn new(config: SimConfig, expect: usize) -> Self {
        Self { config, network: None, expect, markers: TestMarkers::default() }
    }
}

impl AsyncTestCase for DiscoveryTest {
    fn id(&self) -> String {
        "discovery::finds_responders".to_string()
    }

    fn markers(&self) -> TestMarkers {
        self.markers.clone()
    }

    async fn async_set_up(&mut self, cx: &TestContext) -> TestResult {
        let network = Rc::new(SimNetwork::new(cx.handle(), self.config.clone()));
        let for_cleanup = Rc::clone(&network);
        cx.add_sync_cleanup(move || {
            let leaked = for_cleanup.close_all();
            ensure!(leaked == 0, "{leaked} transport(s) left open");
            Ok(())
        });
        self.network = Some(network);
        Ok(())
    }

    fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a> {
        TestBody::future(async move {
            let network =
                self.network.clone().ok_or_else(|| TestError::Other("no network".into()))?;
            let found = discover(&*network, cx.handle(), Duration::from_secs(2)).await?;

            ensure!(
                found.len() == self.expect,
                "expected {} responder(s), got {found:?}",
                self.expect
            );
            let sent = network.sent_udp().snapshot();
            ensure!(sent == vec![Bytes::from_static(SEARCH)], "unexpected sends: {sent:?}");
            Ok(())
        })
    }
}

#[test]
fn discovery_finds_the_scripted_responder_among_noise() {
    let config = SimConfig::new()
        .with_udp_expected_host("192.168.1.77")
        .with_udp_reply(
            SEARCH,
            multicast_group(),
            &b"HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n"[..],
        )
        .with_udp_delay(Duration::from_millis(300))
        .with_noise(true);
    let mut case = DiscoveryTest::new(config, 1);

    let (report, log) = AsyncTestRunner::new().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::Success), "{report}");
    assert!(log.was_successful());
    let network = case.network.expect("network");
    assert_eq!(network.open_transports(), 0);
}

#[test]
fn discovery_with_no_responder_fails_the_body() {
    let mut case = DiscoveryTest::new(SimConfig::new().with_noise(true), 1);

    let (report, _) = AsyncTestRunner::new().run_standalone(&mut case);

    assert!(matches!(report.outcome, TestOutcome::Failure));
    assert_eq!(report.errors[0].phase, Phase::Body);
}

#[test]
fn bind_fault_surfaces_as_expected_failure_when_marked() {
    let mut case = DiscoveryTest {
        markers: TestMarkers::expecting_failure(),
        ..DiscoveryTest::new(SimConfig::new().with_bind_failure(true), 0)
    };

    let (report, log) = AsyncTestRunner::new().run_standalone(&mut case);

    let TestOutcome::ExpectedFailure(error) = &report.outcome else {
        panic!("expected failure, got {}", report.outcome);
    };
    assert!(matches!(error.error, TestError::Transport(TransportError::Bind { .. })));
    assert!(log.was_successful());
    assert!(case.network.is_some_and(|n| n.sent_udp().is_empty()));
}

struct Echo {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl StreamProtocol for Echo {
    fn connection_made(&mut self, _transport: Rc<dyn StreamTransport>) {}

    fn data_received(&mut self, data: Bytes) {
        let _ = self.tx.send(data);
    }
}

struct RefusedConnection;

impl AsyncTestCase for RefusedConnection {
    fn body<'a>(&'a mut self, cx: &'a TestContext) -> TestBody<'a> {
        TestBody::future(async move {
            let config = SimConfig::new().with_connection_refused(true);
            let network = SimNetwork::new(cx.handle(), config);
            let (tx, _rx) = mpsc::unbounded_channel();
            let protocol = Rc::new(RefCell::new(Echo { tx }));
            let result = network.create_connection(protocol, "10.0.0.1", 80).await;

            match result {
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {},
                Err(err) => return Err(err.into()),
                Ok(_) => return Err(TestError::assertion("connection should have been refused")),
            }
            ensure!(network.sent_tcp().is_empty(), "nothing may be written");
            Ok(())
        })
    }
}

#[test]
fn refused_connection_is_observable_by_the_client() {
    let (report, _) = AsyncTestRunner::new().run_standalone(&mut RefusedConnection);
    assert!(matches!(report.outcome, TestOutcome::Success), "{report}");
}
