//! One listening or datagram socket plus its worker thread.
//!
//! An [`Endpoint`] binds a socket in one of four modes and runs a dedicated
//! worker thread over it. In connection mode it is a factory: every
//! accepted socket is wrapped into a [`Connection`] and handed to the
//! owner, who decides whether and when to start processing it. In the
//! datagram modes it exchanges individual packets, one callback per
//! received datagram.
//!
//! The endpoint keeps no reference to connections it has handed off;
//! closing it never affects them.

use bytes::Bytes;
use gangway_core::diagnostics::{levels, DiagnosticsBus};
use gangway_core::error::{GangwayError, Result};
use gangway_core::poll::{self, Interest};
use gangway_core::signal::SignalPipe;
use parking_lot::Mutex;
use smallvec::SmallVec;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crate::connection::Connection;
use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};

/// Largest datagram accepted or delivered in one piece.
const MAX_DATAGRAM: usize = 65536;

/// Severity of endpoint lifecycle messages.
const LIFECYCLE: usize = 1;

/// What kind of traffic an endpoint carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Unicast UDP, bound to a local address and port.
    Datagram,
    /// TCP listener producing [`Connection`]s.
    Connection,
    /// UDP with a multicast group as the default scope; `local_address`
    /// selects the sending interface.
    MulticastSend,
    /// UDP subscribed to a multicast group on all interfaces.
    MulticastReceive,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Datagram => "datagram",
            Self::Connection => "connection",
            Self::MulticastSend => "multicast-send",
            Self::MulticastReceive => "multicast-receive",
        }
    }

    const fn is_send_capable(self) -> bool {
        matches!(self, Self::Datagram | Self::MulticastSend)
    }
}

/// How to open an [`Endpoint`].
///
/// ```
/// use gangway_net::endpoint::{EndpointConfig, Mode};
/// use std::net::Ipv4Addr;
///
/// let config = EndpointConfig::new(Mode::Connection)
///     .with_local_address(Ipv4Addr::LOCALHOST);
/// assert_eq!(config.port, 0); // OS-assigned
/// ```
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub mode: Mode,
    /// Interface to bind (or to send multicast from). `UNSPECIFIED` binds
    /// all interfaces.
    pub local_address: Ipv4Addr,
    /// Multicast group; only meaningful in the multicast modes.
    pub group_address: Ipv4Addr,
    /// Port to bind; 0 lets the OS pick.
    pub port: u16,
}

impl EndpointConfig {
    #[must_use]
    pub const fn new(mode: Mode) -> Self {
        Self {
            mode,
            local_address: Ipv4Addr::UNSPECIFIED,
            group_address: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }

    #[must_use]
    pub const fn with_local_address(mut self, address: Ipv4Addr) -> Self {
        self.local_address = address;
        self
    }

    #[must_use]
    pub const fn with_group_address(mut self, address: Ipv4Addr) -> Self {
        self.group_address = address;
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

struct QueuedPacket {
    address: Ipv4Addr,
    port: u16,
    body: Bytes,
}

struct State {
    mode: Option<Mode>,
    bound: Option<SocketAddrV4>,
    outbound: VecDeque<QueuedPacket>,
    stop: bool,
    worker: Option<JoinHandle<()>>,
    worker_thread: Option<ThreadId>,
    monitor: Option<SocketEventSender>,
}

struct Shared {
    diagnostics: DiagnosticsBus,
    wake: Arc<SignalPipe>,
    state: Mutex<State>,
}

impl Shared {
    fn emit(&self, event: SocketEvent) {
        let sender = self.state.lock().monitor.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    /// Common end-of-worker cleanup; leaves the endpoint reopenable.
    fn reset_after_worker(&self) {
        let mut state = self.state.lock();
        state.mode = None;
        state.bound = None;
        state.outbound.clear();
        state.stop = false;
        state.worker_thread = None;
    }
}

/// A bound socket with a worker thread, in one of the four [`Mode`]s.
///
/// Move-only; dropping the endpoint closes it (joining its worker).
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Create a closed endpoint.
    pub fn new() -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                diagnostics: DiagnosticsBus::new("endpoint"),
                wake: Arc::new(SignalPipe::new()?),
                state: Mutex::new(State {
                    mode: None,
                    bound: None,
                    outbound: VecDeque::new(),
                    stop: false,
                    worker: None,
                    worker_thread: None,
                    monitor: None,
                }),
            }),
        })
    }

    /// The diagnostics bus this endpoint publishes through. Connections
    /// produced in connection mode are chained into it.
    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticsBus {
        &self.shared.diagnostics
    }

    /// Attach a lifecycle event monitor, replacing any previous one.
    pub fn monitor(&self) -> SocketMonitor {
        let (sender, receiver) = create_monitor();
        self.shared.state.lock().monitor = Some(sender);
        receiver
    }

    /// Bind the socket and start the worker in the configured mode.
    ///
    /// `on_new_connection` fires once per accepted connection (connection
    /// mode); the connection is delivered unprocessed. `on_packet` fires
    /// once per received datagram (datagram modes) with the sender's
    /// address and port. Both callbacks run on the worker thread.
    pub fn open(
        &self,
        on_new_connection: impl FnMut(Connection) + Send + 'static,
        on_packet: impl FnMut(Ipv4Addr, u16, Bytes) + Send + 'static,
        config: EndpointConfig,
    ) -> Result<()> {
        if self.shared.state.lock().mode.is_some() {
            return Err(GangwayError::AlreadyOpen);
        }
        match config.mode {
            Mode::Connection => self.open_listener(Box::new(on_new_connection), &config),
            Mode::Datagram | Mode::MulticastSend | Mode::MulticastReceive => {
                self.open_datagram(Box::new(on_packet), &config)
            }
        }
    }

    fn open_listener(
        &self,
        on_new_connection: Box<dyn FnMut(Connection) + Send>,
        config: &EndpointConfig,
    ) -> Result<()> {
        let local = SocketAddrV4::new(config.local_address, config.port);
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        socket.listen(libc::SOMAXCONN)?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from(socket);
        let bound = as_v4(listener.local_addr()?);

        let worker = ListenerWorker {
            shared: Arc::clone(&self.shared),
            wake: Arc::clone(&self.shared.wake),
            diagnostics: self.shared.diagnostics.clone(),
            listener,
            on_new_connection,
        };
        self.commit_open(config.mode, bound, move || worker.run())?;
        self.shared.diagnostics.publish_with(LIFECYCLE, || {
            format!("listening on {}", display_addr(bound))
        });
        if let Some(bound) = bound {
            self.shared.emit(SocketEvent::Listening(bound));
        }
        Ok(())
    }

    fn open_datagram(
        &self,
        on_packet: Box<dyn FnMut(Ipv4Addr, u16, Bytes) + Send>,
        config: &EndpointConfig,
    ) -> Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        match config.mode {
            Mode::MulticastSend => {
                socket.bind(&SocketAddrV4::new(config.local_address, config.port).into())?;
                socket.set_multicast_if_v4(&config.local_address)?;
                socket.set_multicast_loop_v4(true)?;
            }
            Mode::MulticastReceive => {
                // Membership on all interfaces; the local address is not
                // consulted in this mode.
                socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
                socket.join_multicast_v4(&config.group_address, &Ipv4Addr::UNSPECIFIED)?;
            }
            _ => {
                socket.bind(&SocketAddrV4::new(config.local_address, config.port).into())?;
            }
        }
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from(socket);
        let bound = as_v4(socket.local_addr()?);

        let worker = DatagramWorker {
            shared: Arc::clone(&self.shared),
            wake: Arc::clone(&self.shared.wake),
            diagnostics: self.shared.diagnostics.clone(),
            socket,
            on_packet,
        };
        self.commit_open(config.mode, bound, move || worker.run())?;
        self.shared.diagnostics.publish_with(LIFECYCLE, || {
            format!("bound to {}", display_addr(bound))
        });
        if let Some(bound) = bound {
            self.shared.emit(SocketEvent::Bound(bound));
        }
        Ok(())
    }

    /// Record the open state and spawn the worker, re-checking that no
    /// concurrent open won the race.
    fn commit_open(
        &self,
        mode: Mode,
        bound: Option<SocketAddrV4>,
        run: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.mode.is_some() {
            return Err(GangwayError::AlreadyOpen);
        }
        let handle = thread::Builder::new()
            .name("gangway-endpoint".into())
            .spawn(run)?;
        state.mode = Some(mode);
        state.bound = bound;
        state.stop = false;
        state.worker_thread = Some(handle.thread().id());
        state.worker = Some(handle);
        Ok(())
    }

    /// Port actually bound, once open.
    #[must_use]
    pub fn bound_port(&self) -> Option<u16> {
        self.shared.state.lock().bound.map(|addr| addr.port())
    }

    /// Address and port actually bound, once open.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddrV4> {
        self.shared.state.lock().bound
    }

    /// Queue a datagram for transmission.
    ///
    /// Only valid in the send-capable datagram modes; the worker sends one
    /// queued packet per writable wakeup.
    pub fn send_packet(&self, address: Ipv4Addr, port: u16, body: impl Into<Bytes>) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.mode {
            Some(mode) if mode.is_send_capable() => {
                state.outbound.push_back(QueuedPacket {
                    address,
                    port,
                    body: body.into(),
                });
                self.shared.wake.set();
                Ok(())
            }
            Some(mode) => Err(GangwayError::unsupported_mode(mode.as_str(), "send_packet")),
            None => Err(GangwayError::Closed),
        }
    }

    /// Stop the worker and release the socket.
    ///
    /// Joins the worker thread unless called from one of this endpoint's
    /// own callbacks. Connections already handed off are unaffected.
    pub fn close(&self) {
        let handle = {
            let mut state = self.shared.state.lock();
            if state.mode.is_none() && state.worker.is_none() {
                return;
            }
            state.stop = true;
            if state.worker_thread == Some(thread::current().id()) {
                None
            } else {
                state.worker.take()
            }
        };
        self.shared.wake.set();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Endpoint")
            .field("mode", &state.mode)
            .field("bound", &state.bound)
            .field("packets_queued", &state.outbound.len())
            .finish_non_exhaustive()
    }
}

fn as_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

fn display_addr(addr: Option<SocketAddrV4>) -> String {
    addr.map_or_else(|| "unknown".to_owned(), |addr| addr.to_string())
}

struct ListenerWorker {
    shared: Arc<Shared>,
    wake: Arc<SignalPipe>,
    diagnostics: DiagnosticsBus,
    listener: TcpListener,
    on_new_connection: Box<dyn FnMut(Connection) + Send>,
}

impl ListenerWorker {
    fn run(mut self) {
        loop {
            if self.shared.state.lock().stop {
                break;
            }
            let interests: SmallVec<[Interest; 2]> = SmallVec::from_buf([
                Interest::readable(self.wake.wait_fd()),
                Interest::readable(self.listener.as_raw_fd()),
            ]);
            let ready = match poll::wait(&interests, None) {
                Ok(ready) => ready,
                Err(err) => {
                    self.diagnostics
                        .publish_with(levels::ERROR, || format!("poll failed: {err}"));
                    break;
                }
            };
            if ready[0].readable {
                self.wake.clear();
            }
            if ready[1].any() {
                self.accept_pending();
            }
        }
        self.diagnostics.publish(LIFECYCLE, "endpoint closed");
        self.shared.emit(SocketEvent::Closed);
        self.shared.reset_after_worker();
    }

    /// Drain the accept backlog; one wakeup may cover several arrivals.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let connection = match Connection::from_accepted(stream) {
                        Ok(connection) => connection,
                        Err(err) => {
                            self.diagnostics.publish_with(levels::ERROR, || {
                                format!("failed to wrap accepted socket: {err}")
                            });
                            continue;
                        }
                    };
                    // Surface the connection's diagnostics through ours.
                    let _ = connection
                        .diagnostics()
                        .subscribe(self.diagnostics.chain(), 0);
                    self.diagnostics
                        .publish_with(LIFECYCLE, || format!("accepted connection from {peer}"));
                    if let SocketAddr::V4(peer) = peer {
                        self.shared.emit(SocketEvent::Accepted(peer));
                    }
                    (self.on_new_connection)(connection);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.diagnostics
                        .publish_with(levels::ERROR, || format!("accept failed: {err}"));
                    break;
                }
            }
        }
    }
}

struct DatagramWorker {
    shared: Arc<Shared>,
    wake: Arc<SignalPipe>,
    diagnostics: DiagnosticsBus,
    socket: UdpSocket,
    on_packet: Box<dyn FnMut(Ipv4Addr, u16, Bytes) + Send>,
}

impl DatagramWorker {
    fn run(mut self) {
        let mut buf = vec![0_u8; MAX_DATAGRAM];
        loop {
            let (stop, want_write) = {
                let state = self.shared.state.lock();
                (state.stop, !state.outbound.is_empty())
            };
            if stop {
                break;
            }
            let mut interests: SmallVec<[Interest; 2]> = SmallVec::new();
            interests.push(Interest::readable(self.wake.wait_fd()));
            interests.push(Interest {
                fd: self.socket.as_raw_fd(),
                readable: true,
                writable: want_write,
            });
            let ready = match poll::wait(&interests, None) {
                Ok(ready) => ready,
                Err(err) => {
                    self.diagnostics
                        .publish_with(levels::ERROR, || format!("poll failed: {err}"));
                    break;
                }
            };
            if ready[0].readable {
                self.wake.clear();
            }
            if want_write && ready[1].writable {
                self.send_one();
            }
            if ready[1].readable || ready[1].error {
                self.receive_one(&mut buf);
            }
        }
        self.diagnostics.publish(LIFECYCLE, "endpoint closed");
        self.shared.emit(SocketEvent::Closed);
        self.shared.reset_after_worker();
    }

    /// One queued packet per writable wakeup.
    fn send_one(&mut self) {
        let packet = self.shared.state.lock().outbound.pop_front();
        let Some(packet) = packet else {
            return;
        };
        let target = SocketAddrV4::new(packet.address, packet.port);
        match self.socket.send_to(&packet.body, target) {
            Ok(sent) => {
                tracing::trace!(bytes = sent, %target, "datagram sent");
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::Interrupted =>
            {
                // Not actually writable yet; retry on the next wakeup.
                self.shared.state.lock().outbound.push_front(packet);
            }
            Err(err) => {
                // Per-packet failure; the endpoint keeps running.
                self.diagnostics
                    .publish_with(levels::ERROR, || format!("send to {target} failed: {err}"));
            }
        }
    }

    fn receive_one(&mut self, buf: &mut [u8]) {
        match self.socket.recv_from(buf) {
            Ok((received, SocketAddr::V4(source))) => {
                tracing::trace!(bytes = received, %source, "datagram received");
                (self.on_packet)(
                    *source.ip(),
                    source.port(),
                    Bytes::copy_from_slice(&buf[..received]),
                );
            }
            Ok((_, SocketAddr::V6(_))) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                self.diagnostics
                    .publish_with(levels::ERROR, || format!("receive failed: {err}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = EndpointConfig::new(Mode::Datagram);
        assert_eq!(config.local_address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.group_address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.port, 0);
    }

    #[test]
    fn mode_send_capability() {
        assert!(Mode::Datagram.is_send_capable());
        assert!(Mode::MulticastSend.is_send_capable());
        assert!(!Mode::Connection.is_send_capable());
        assert!(!Mode::MulticastReceive.is_send_capable());
    }

    #[test]
    fn send_packet_requires_open_endpoint() {
        let endpoint = Endpoint::new().unwrap();
        assert!(matches!(
            endpoint.send_packet(Ipv4Addr::LOCALHOST, 9, &b"x"[..]),
            Err(GangwayError::Closed)
        ));
    }
}
