//! Endpoint tests: datagram exchange, connection fan-in, mode
//! enforcement, and lifecycle events.

use bytes::Bytes;
use gangway_core::error::GangwayError;
use gangway_net::connection::Connection;
use gangway_net::endpoint::{Endpoint, EndpointConfig, Mode};
use gangway_net::monitor::SocketEvent;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Received datagrams with their source attribution.
#[derive(Default)]
struct PacketLog {
    state: Mutex<Vec<(Ipv4Addr, u16, Vec<u8>)>>,
    condition: Condvar,
}

impl PacketLog {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, address: Ipv4Addr, port: u16, body: &[u8]) {
        self.state.lock().push((address, port, body.to_vec()));
        self.condition.notify_all();
    }

    fn await_packets(&self, count: usize) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        let mut state = self.state.lock();
        while state.len() < count {
            if self.condition.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        true
    }

    fn packets(&self) -> Vec<(Ipv4Addr, u16, Vec<u8>)> {
        self.state.lock().clone()
    }
}

fn open_datagram(log: &Arc<PacketLog>) -> Endpoint {
    let endpoint = Endpoint::new().unwrap();
    let log = Arc::clone(log);
    endpoint
        .open(
            |_connection| {},
            move |address, port, body: Bytes| log.record(address, port, &body),
            EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();
    endpoint
}

#[test]
fn datagram_round_trip() {
    let sender_log = PacketLog::new();
    let receiver_log = PacketLog::new();
    let sender = open_datagram(&sender_log);
    let receiver = open_datagram(&receiver_log);

    sender
        .send_packet(
            Ipv4Addr::LOCALHOST,
            receiver.bound_port().unwrap(),
            &b"ping"[..],
        )
        .unwrap();
    assert!(receiver_log.await_packets(1));
    let received = receiver_log.packets();
    assert_eq!(received[0].0, Ipv4Addr::LOCALHOST);
    assert_eq!(received[0].1, sender.bound_port().unwrap());
    assert_eq!(received[0].2, b"ping");

    // Reply to the attributed source.
    receiver
        .send_packet(received[0].0, received[0].1, &b"pong"[..])
        .unwrap();
    assert!(sender_log.await_packets(1));
    assert_eq!(sender_log.packets()[0].2, b"pong");
}

#[test]
fn datagram_queue_preserves_order() {
    let receiver_log = PacketLog::new();
    let sender = open_datagram(&PacketLog::new());
    let receiver = open_datagram(&receiver_log);
    let port = receiver.bound_port().unwrap();

    for index in 0_u8..10 {
        sender
            .send_packet(Ipv4Addr::LOCALHOST, port, vec![index])
            .unwrap();
    }
    assert!(receiver_log.await_packets(10));
    let bodies: Vec<u8> = receiver_log
        .packets()
        .iter()
        .map(|(_, _, body)| body[0])
        .collect();
    assert_eq!(bodies, (0_u8..10).collect::<Vec<u8>>());
}

#[test]
fn send_packet_rejected_in_connection_mode() {
    let endpoint = Endpoint::new().unwrap();
    endpoint
        .open(
            |_connection| {},
            |_, _, _| {},
            EndpointConfig::new(Mode::Connection).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();
    assert!(matches!(
        endpoint.send_packet(Ipv4Addr::LOCALHOST, 9, &b"nope"[..]),
        Err(GangwayError::UnsupportedMode { .. })
    ));
}

#[test]
fn fan_in_attributes_bytes_to_the_right_connection() {
    let received: Arc<Mutex<HashMap<SocketAddrV4, Vec<u8>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let endpoint = Endpoint::new().unwrap();
    let sink = Arc::clone(&received);
    let (tx, rx) = mpsc::channel();
    endpoint
        .open(
            move |connection: Connection| {
                let peer = connection.peer_addr().unwrap();
                let sink = Arc::clone(&sink);
                connection
                    .process(
                        move |message: Bytes| {
                            sink.lock().entry(peer).or_default().extend_from_slice(&message);
                        },
                        |_graceful| {},
                    )
                    .unwrap();
                let _ = tx.send(connection);
            },
            |_, _, _| {},
            EndpointConfig::new(Mode::Connection).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();
    let port = endpoint.bound_port().unwrap();

    let first = Connection::new().unwrap();
    first.connect(Ipv4Addr::LOCALHOST, port).unwrap();
    first.process(|_| {}, |_| {}).unwrap();
    let second = Connection::new().unwrap();
    second.connect(Ipv4Addr::LOCALHOST, port).unwrap();
    second.process(|_| {}, |_| {}).unwrap();

    // Two independent clients surface as two distinct connections.
    let accepted_one = rx.recv_timeout(TIMEOUT).unwrap();
    let accepted_two = rx.recv_timeout(TIMEOUT).unwrap();
    assert_ne!(accepted_one.peer_addr(), accepted_two.peer_addr());

    first.send_message(&b"from first"[..]);
    second.send_message(&b"from second"[..]);

    let deadline = Instant::now() + TIMEOUT;
    loop {
        {
            let received = received.lock();
            if received.values().map(Vec::len).sum::<usize>()
                >= b"from first".len() + b"from second".len()
            {
                break;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for both streams");
        std::thread::sleep(Duration::from_millis(10));
    }

    let received = received.lock();
    assert_eq!(
        received.get(&first.local_addr().unwrap()).unwrap(),
        b"from first"
    );
    assert_eq!(
        received.get(&second.local_addr().unwrap()).unwrap(),
        b"from second"
    );
}

#[test]
fn close_is_idempotent_and_reopenable() {
    let endpoint = Endpoint::new().unwrap();
    endpoint
        .open(
            |_connection| {},
            |_, _, _| {},
            EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();
    let first_port = endpoint.bound_port().unwrap();
    endpoint.close();
    endpoint.close();
    assert_eq!(endpoint.bound_port(), None);

    endpoint
        .open(
            |_connection| {},
            |_, _, _| {},
            EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();
    assert!(endpoint.bound_port().is_some());
    assert_ne!(endpoint.bound_port(), Some(0));
    let _ = first_port;
}

#[test]
fn open_twice_is_rejected() {
    let endpoint = Endpoint::new().unwrap();
    endpoint
        .open(
            |_connection| {},
            |_, _, _| {},
            EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();
    assert!(matches!(
        endpoint.open(
            |_connection| {},
            |_, _, _| {},
            EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
        ),
        Err(GangwayError::AlreadyOpen)
    ));
}

#[test]
fn monitor_reports_listening_and_accepted() {
    let endpoint = Endpoint::new().unwrap();
    let monitor = endpoint.monitor();
    endpoint
        .open(
            |_connection| {},
            |_, _, _| {},
            EndpointConfig::new(Mode::Connection).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();

    let event = monitor.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(event, SocketEvent::Listening(_)));

    let client = Connection::new().unwrap();
    client
        .connect(Ipv4Addr::LOCALHOST, endpoint.bound_port().unwrap())
        .unwrap();

    let event = monitor.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(event, SocketEvent::Accepted(_)));
}

#[test]
fn accepted_connection_diagnostics_chain_into_endpoint() {
    let endpoint = Endpoint::new().unwrap();
    let log: Arc<Mutex<Vec<(String, usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let _ = endpoint.diagnostics().subscribe(
        Arc::new(move |name: &str, level: usize, message: &str| {
            sink.lock().push((name.to_owned(), level, message.to_owned()));
        }),
        1,
    );

    let (tx, rx) = mpsc::channel();
    endpoint
        .open(
            move |connection: Connection| {
                let _ = tx.send(connection);
            },
            |_, _, _| {},
            EndpointConfig::new(Mode::Connection).with_local_address(Ipv4Addr::LOCALHOST),
        )
        .unwrap();

    let client = Connection::new().unwrap();
    client
        .connect(Ipv4Addr::LOCALHOST, endpoint.bound_port().unwrap())
        .unwrap();
    let accepted = rx.recv_timeout(TIMEOUT).unwrap();
    accepted.close(false);

    let deadline = Instant::now() + TIMEOUT;
    loop {
        {
            let log = log.lock();
            let accepted_seen = log
                .iter()
                .any(|(name, _, message)| name == "endpoint" && message.starts_with("accepted connection from"));
            let chained_seen = log
                .iter()
                .any(|(name, _, message)| name == "endpoint" && message == "connection: closed connection");
            if accepted_seen && chained_seen {
                break;
            }
        }
        assert!(Instant::now() < deadline, "diagnostics never arrived");
        std::thread::sleep(Duration::from_millis(10));
    }
}
