//! Two datagram endpoints playing ping-pong on the loopback interface.

use gangway::prelude::*;
use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::time::Duration;

fn main() -> gangway::Result<()> {
    gangway::dev_tracing::init_tracing();

    // The responder cannot capture a handle to itself (its callback runs on
    // its own worker), so replies leave through a second endpoint moved
    // into the callback.
    let reply = Endpoint::new()?;
    reply.open(
        |_connection| {},
        |_, _, _| {},
        EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
    )?;

    let responder = Endpoint::new()?;
    responder.open(
        |_connection| {},
        move |address, port, body| {
            println!("responder: {} bytes from {address}:{port}", body.len());
            let _ = reply.send_packet(address, port, body);
        },
        EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
    )?;

    let (pong_tx, pong_rx) = mpsc::channel();
    let ponger = Endpoint::new()?;
    ponger.open(
        |_connection| {},
        move |address, port, body| {
            println!("ponger: {} bytes from {address}:{port}", body.len());
            let _ = pong_tx.send(body);
        },
        EndpointConfig::new(Mode::Datagram).with_local_address(Ipv4Addr::LOCALHOST),
    )?;

    ponger.send_packet(
        Ipv4Addr::LOCALHOST,
        responder.bound_port().expect("responder is open"),
        &b"ping"[..],
    )?;

    let body = pong_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no pong received");
    println!("round trip complete: {:?}", &body[..]);
    Ok(())
}
