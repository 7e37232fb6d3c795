//! # Gangway
//!
//! A thread-per-socket TCP/UDP engine with hierarchical diagnostics
//! fan-out, built directly on POSIX sockets.
//!
//! ## Architecture
//!
//! Gangway is structured in two layers under this facade:
//!
//! - **`gangway-core`**: byte queue, self-pipe wake signal, `poll(2)`
//!   wrapper, diagnostics bus
//! - **`gangway-net`**: `Connection` and `Endpoint` state machines, one
//!   dedicated OS thread per open socket
//!
//! The model is deliberately simple: every open socket gets its own worker
//! thread blocking in `poll(2)` on the socket plus a wake pipe. There is no
//! shared worker pool and no cooperative scheduler. Payloads are opaque
//! bytes; framing belongs to the caller.
//!
//! ## Quick Start
//!
//! ### TCP echo server
//!
//! ```rust,no_run
//! use gangway::prelude::*;
//! use std::net::Ipv4Addr;
//!
//! # fn main() -> gangway::Result<()> {
//! let server = Endpoint::new()?;
//! server.open(
//!     |connection| {
//!         // Echo whatever arrives back to the sender.
//!         let writer = connection.clone();
//!         let result = connection.process(
//!             move |message| writer.send_message(message),
//!             |graceful| println!("connection broken (graceful: {graceful})"),
//!         );
//!         if result.is_err() {
//!             connection.close(false);
//!         }
//!     },
//!     |_, _, _| {},
//!     EndpointConfig::new(Mode::Connection).with_local_address(Ipv4Addr::LOCALHOST),
//! )?;
//! println!("listening on port {}", server.bound_port().unwrap_or(0));
//! # Ok(())
//! # }
//! ```
//!
//! ### Client connection
//!
//! ```rust,no_run
//! use gangway::prelude::*;
//! use std::net::Ipv4Addr;
//!
//! # fn main() -> gangway::Result<()> {
//! let client = Connection::new()?;
//! client.connect(Ipv4Addr::LOCALHOST, 5555)?;
//! client.process(
//!     |message| println!("received {} bytes", message.len()),
//!     |graceful| println!("broken (graceful: {graceful})"),
//! )?;
//! client.send_message(&b"hello"[..]);
//! client.close(true); // drain, then half-close
//! # Ok(())
//! # }
//! ```
//!
//! ## Diagnostics
//!
//! Every connection and endpoint carries a [`DiagnosticsBus`]; subscribe
//! with a minimum severity to observe lifecycle and error messages, or
//! chain a component's bus into your own. Diagnostics are advisory only —
//! with no subscribers a publish costs one atomic load.
//!
//! [`DiagnosticsBus`]: crate::prelude::DiagnosticsBus

pub mod dev_tracing;

pub use gangway_core::error::{GangwayError, Result};

pub mod prelude {
    pub use gangway_core::prelude::*;
    pub use gangway_net::prelude::*;
}
