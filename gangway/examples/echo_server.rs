//! Minimal TCP echo server.
//!
//! Run with `cargo run --example echo_server`, then throw bytes at the
//! printed port with `nc 127.0.0.1 <port>`.

use gangway::prelude::*;
use std::net::Ipv4Addr;

fn main() -> gangway::Result<()> {
    gangway::dev_tracing::init_tracing();

    let server = Endpoint::new()?;

    // Print every diagnostic the endpoint (and its connections) publish.
    let _subscription = server
        .diagnostics()
        .subscribe(stream_reporter(std::io::stdout(), std::io::stderr()), 0);

    server.open(
        |connection: Connection| {
            let writer = connection.clone();
            let result = connection.process(
                move |message| writer.send_message(message),
                |graceful| println!("connection broken (graceful: {graceful})"),
            );
            if result.is_err() {
                connection.close(false);
            }
        },
        |_, _, _| {},
        EndpointConfig::new(Mode::Connection).with_local_address(Ipv4Addr::LOCALHOST),
    )?;

    println!(
        "echo server listening on 127.0.0.1:{}",
        server.bound_port().unwrap_or(0)
    );
    println!("press Enter to stop");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    server.close();
    Ok(())
}
