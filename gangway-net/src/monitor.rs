//! Socket event monitoring.
//!
//! Provides event streams for tracking socket lifecycle events like
//! connections, disconnections, and closures. Events are emitted
//! best-effort: a slow or dropped receiver never stalls a worker thread.

use std::fmt;
use std::net::SocketAddrV4;

/// Socket lifecycle events.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Connection successfully established to a peer.
    Connected(SocketAddrV4),

    /// Endpoint is listening for incoming connections.
    Listening(SocketAddrV4),

    /// Endpoint is bound for datagram traffic.
    Bound(SocketAddrV4),

    /// Endpoint accepted a new incoming connection.
    Accepted(SocketAddrV4),

    /// The peer half-closed its side of a connection.
    PeerClosed,

    /// The socket has been torn down.
    Closed,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(addr) => write!(f, "Connected to {addr}"),
            Self::Listening(addr) => write!(f, "Listening on {addr}"),
            Self::Bound(addr) => write!(f, "Bound to {addr}"),
            Self::Accepted(addr) => write!(f, "Accepted connection from {addr}"),
            Self::PeerClosed => write!(f, "Peer closed its end"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Handle for receiving socket events.
///
/// This is a channel receiver that provides a stream of socket lifecycle events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Internal sender for socket events.
pub(crate) type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
pub(crate) fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn event_display() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5555);
        let event = SocketEvent::Connected(addr);
        assert_eq!(event.to_string(), "Connected to 127.0.0.1:5555");
        assert_eq!(SocketEvent::PeerClosed.to_string(), "Peer closed its end");
    }

    #[test]
    fn monitor_channel_delivers() {
        let (sender, receiver) = create_monitor();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5555);
        sender.send(SocketEvent::Listening(addr)).unwrap();

        let event = receiver.recv().unwrap();
        assert!(matches!(event, SocketEvent::Listening(_)));
    }
}
