//! One established bidirectional byte-stream socket plus its worker thread.
//!
//! A [`Connection`] owns a stream socket and, once
//! [`process`](Connection::process) is called, a dedicated worker thread
//! that multiplexes outbound-queue draining and inbound reads via
//! `poll(2)` over the socket and a wake pipe. Inbound bytes and
//! disconnection are delivered through the caller's callbacks; all public
//! methods are non-blocking except [`connect`](Connection::connect) (OS
//! connect) and an abrupt [`close`](Connection::close) (joins the worker).
//!
//! Handles are cheap clones of shared state. The worker keeps only a weak
//! back-reference: dropping the last handle signals the worker, which tears
//! the socket down on its own and exits without anyone joining it.

use bytes::Bytes;
use gangway_core::buffer::ByteQueue;
use gangway_core::diagnostics::{levels, DiagnosticsBus};
use gangway_core::error::{GangwayError, Result};
use gangway_core::poll::{self, Interest};
use gangway_core::signal::SignalPipe;
use parking_lot::Mutex;
use smallvec::SmallVec;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};

/// Largest number of bytes moved between the socket and the queues per
/// worker wakeup.
const MAX_TRANSFER: usize = 65536;

/// Severity of connection lifecycle messages ("closing connection" and
/// friends); genuine failures go out at `levels::ERROR`.
const LIFECYCLE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Processing,
    Closing { graceful: bool },
    Closed,
}

struct State {
    stream: Option<Arc<TcpStream>>,
    local: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,
    outbound: ByteQueue,
    phase: Phase,
    peer_closed: bool,
    shutdown_sent: bool,
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
}

impl Drop for Shared {
    fn drop(&mut self) {
        // The worker only holds a weak reference; this wake is how it
        // learns the last handle is gone.
        self.wake.set();
    }
}

/// Handle onto one stream connection.
///
/// Clones share the same underlying connection; the connection tears down
/// when it is closed or when the last handle drops.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create an idle, unconnected connection.
    pub fn new() -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                diagnostics: DiagnosticsBus::new("connection"),
                wake: Arc::new(SignalPipe::new()?),
                state: Mutex::new(State {
                    stream: None,
                    local: None,
                    peer: None,
                    outbound: ByteQueue::new(),
                    phase: Phase::Idle,
                    peer_closed: false,
                    shutdown_sent: false,
                    worker: None,
                    worker_thread: None,
                    monitor: None,
                }),
            }),
        })
    }

    /// Wrap a socket an endpoint just accepted.
    pub(crate) fn from_accepted(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let local = as_v4(stream.local_addr()?);
        let peer = as_v4(stream.peer_addr()?);
        let connection = Self::new()?;
        {
            let mut state = connection.shared.state.lock();
            state.stream = Some(Arc::new(stream));
            state.local = local;
            state.peer = peer;
            state.phase = Phase::Connected;
        }
        Ok(connection)
    }

    /// The diagnostics bus this connection publishes through.
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

    /// Establish a connection to the given peer.
    ///
    /// Blocks for the OS-level connect. On failure the connection stays
    /// idle and may be retried.
    pub fn connect(&self, address: Ipv4Addr, port: u16) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::Idle {
                return Err(GangwayError::AlreadyOpen);
            }
            state.phase = Phase::Connecting;
        }

        let peer = SocketAddrV4::new(address, port);
        let connected = (|| -> Result<(TcpStream, Option<SocketAddrV4>)> {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            socket.connect(&peer.into())?;
            socket.set_nonblocking(true)?;
            let stream = TcpStream::from(socket);
            let local = as_v4(stream.local_addr()?);
            Ok((stream, local))
        })();

        let mut state = self.shared.state.lock();
        match connected {
            Ok((stream, local)) => {
                if state.phase != Phase::Connecting {
                    // Closed while we were connecting.
                    return Err(GangwayError::Closed);
                }
                state.stream = Some(Arc::new(stream));
                state.local = local;
                state.peer = Some(peer);
                state.phase = Phase::Connected;
                drop(state);
                self.shared
                    .diagnostics
                    .publish_with(0, || format!("connected to {peer}"));
                self.shared.emit(SocketEvent::Connected(peer));
                Ok(())
            }
            Err(err) => {
                if state.phase == Phase::Connecting {
                    state.phase = Phase::Idle;
                }
                drop(state);
                self.shared
                    .diagnostics
                    .publish_with(levels::ERROR, || format!("connect to {peer} failed: {err}"));
                Err(err)
            }
        }
    }

    /// Resolve a host name and connect to it.
    pub fn connect_to_host(&self, host: &str, port: u16) -> Result<()> {
        let address =
            crate::addr::resolve_host(host).ok_or_else(|| GangwayError::host_not_found(host))?;
        self.connect(address, port)
    }

    /// Whether a connection to a peer is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let state = self.shared.state.lock();
        state.stream.is_some()
            && matches!(
                state.phase,
                Phase::Connected | Phase::Processing | Phase::Closing { .. }
            )
    }

    /// Address and port of the peer, once connected.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.shared.state.lock().peer
    }

    /// Locally bound address and port, once connected.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.shared.state.lock().local
    }

    /// Start message processing on the connection.
    ///
    /// Spawns the worker thread; required before any data flows.
    /// `on_message` receives inbound byte chunks (stream semantics: chunk
    /// boundaries carry no meaning). `on_broken` receives `true` when the
    /// peer half-closes while the connection can still send, and `false`
    /// when the connection is fully torn down.
    ///
    /// The callbacks run on the worker thread and may call any method on a
    /// clone of this handle, including [`close`](Connection::close).
    pub fn process(
        &self,
        on_message: impl FnMut(Bytes) + Send + 'static,
        on_broken: impl FnMut(bool) + Send + 'static,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.phase {
            Phase::Connected => {}
            Phase::Processing | Phase::Closing { .. } => {
                return Err(GangwayError::AlreadyProcessing)
            }
            Phase::Idle | Phase::Connecting | Phase::Closed => {
                return Err(GangwayError::NotConnected)
            }
        }
        let stream = Arc::clone(
            state
                .stream
                .as_ref()
                .expect("connected phase implies a stream"),
        );
        let worker = Worker {
            shared: Arc::downgrade(&self.shared),
            wake: Arc::clone(&self.shared.wake),
            diagnostics: self.shared.diagnostics.clone(),
            stream,
            on_message: Box::new(on_message),
            on_broken: Box::new(on_broken),
            peer_close_reported: false,
            broken_reported: false,
        };
        let handle = thread::Builder::new()
            .name("gangway-connection".into())
            .spawn(move || worker.run())?;
        state.worker_thread = Some(handle.thread().id());
        state.worker = Some(handle);
        state.phase = Phase::Processing;
        Ok(())
    }

    /// Queue bytes for transmission to the peer.
    ///
    /// Bytes are delivered in enqueue order by the worker thread. Once a
    /// close of either kind has been requested the message is silently
    /// dropped.
    pub fn send_message(&self, message: impl Into<Bytes>) {
        let mut state = self.shared.state.lock();
        match state.phase {
            Phase::Connected | Phase::Processing => {
                state.outbound.enqueue(message);
                self.shared.wake.set();
            }
            _ => {}
        }
    }

    /// Close the connection.
    ///
    /// With `clean == true` the close is graceful: no further sends are
    /// accepted, the already-queued output keeps draining, the write side
    /// is shut down once the queue empties, and teardown waits for the
    /// peer's own close. The call returns immediately.
    ///
    /// With `clean == false` the close is abrupt: queued unsent bytes are
    /// discarded and the socket is torn down now. The call joins the
    /// worker thread unless it is made from one of this connection's own
    /// callbacks.
    ///
    /// Idempotent; a later abrupt close may override a pending graceful
    /// one.
    pub fn close(&self, clean: bool) {
        enum After {
            Nothing,
            Join(Option<JoinHandle<()>>),
            CloseNow(Option<Arc<TcpStream>>),
        }

        let mut publish_closing = false;
        let after = {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Idle | Phase::Connecting | Phase::Closed => After::Nothing,
                Phase::Connected => {
                    // No worker yet; tear down inline.
                    state.phase = Phase::Closed;
                    state.outbound = ByteQueue::new();
                    After::CloseNow(state.stream.take())
                }
                Phase::Processing => {
                    state.phase = Phase::Closing { graceful: clean };
                    publish_closing = true;
                    if clean {
                        After::Nothing
                    } else {
                        state.outbound = ByteQueue::new();
                        After::Join(take_joinable(&mut state))
                    }
                }
                Phase::Closing { graceful: true } if !clean => {
                    state.phase = Phase::Closing { graceful: false };
                    state.outbound = ByteQueue::new();
                    After::Join(take_joinable(&mut state))
                }
                Phase::Closing { .. } => After::Nothing,
            }
        };
        if publish_closing {
            self.shared.diagnostics.publish(LIFECYCLE, "closing connection");
        }
        self.shared.wake.set();
        match after {
            After::Nothing => {}
            After::Join(handle) => {
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
            After::CloseNow(stream) => {
                if let Some(stream) = stream {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                self.shared.diagnostics.publish(LIFECYCLE, "closed connection");
                self.shared.emit(SocketEvent::Closed);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Connection")
            .field("phase", &state.phase)
            .field("peer", &state.peer)
            .field("local", &state.local)
            .field("bytes_queued", &state.outbound.bytes_queued())
            .finish_non_exhaustive()
    }
}

/// The join handle, unless called from the worker thread itself (a
/// callback closing its own connection must not join itself).
fn take_joinable(state: &mut State) -> Option<JoinHandle<()>> {
    if state.worker_thread == Some(thread::current().id()) {
        None
    } else {
        state.worker.take()
    }
}

fn as_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

/// What one pass over the shared state asks the worker to do next.
struct Directives {
    teardown: bool,
    shutdown_write: bool,
    want_read: bool,
    want_write: bool,
}

struct Worker {
    shared: Weak<Shared>,
    wake: Arc<SignalPipe>,
    diagnostics: DiagnosticsBus,
    stream: Arc<TcpStream>,
    on_message: Box<dyn FnMut(Bytes) + Send>,
    on_broken: Box<dyn FnMut(bool) + Send>,
    /// Whether `on_broken(true)` (peer half-close) has been delivered.
    peer_close_reported: bool,
    /// Whether `on_broken(false)` (full teardown) has been delivered.
    broken_reported: bool,
}

impl Worker {
    fn run(mut self) {
        let mut read_buf = vec![0_u8; MAX_TRANSFER];
        loop {
            let directives = {
                let Some(shared) = self.shared.upgrade() else {
                    self.close_detached();
                    return;
                };
                let directives = Self::next_directives(&mut shared.state.lock());
                if directives.shutdown_write {
                    let _ = self.stream.shutdown(Shutdown::Write);
                    tracing::trace!("output drained, write side shut down");
                }
                if directives.teardown {
                    self.teardown(&shared);
                    return;
                }
                directives
            };
            // The strong reference is released before blocking so that a
            // dropped last handle can reach Shared::drop and wake us.

            let mut interests: SmallVec<[Interest; 2]> = SmallVec::new();
            interests.push(Interest::readable(self.wake.wait_fd()));
            if directives.want_read || directives.want_write {
                interests.push(Interest {
                    fd: self.stream.as_raw_fd(),
                    readable: directives.want_read,
                    writable: directives.want_write,
                });
            }
            let ready = match poll::wait(&interests, None) {
                Ok(ready) => ready,
                Err(err) => {
                    self.diagnostics
                        .publish_with(levels::ERROR, || format!("poll failed: {err}"));
                    match self.shared.upgrade() {
                        Some(shared) => self.teardown(&shared),
                        None => self.close_detached(),
                    }
                    return;
                }
            };
            if ready[0].readable {
                self.wake.clear();
            }
            let socket_ready = ready.get(1).copied().unwrap_or_default();
            let read_signaled = socket_ready.readable || socket_ready.hangup || socket_ready.error;

            let Some(shared) = self.shared.upgrade() else {
                self.close_detached();
                return;
            };
            if directives.want_write && socket_ready.writable && !self.drain_output(&shared) {
                return;
            }
            if directives.want_read && read_signaled && !self.pump_input(&shared, &mut read_buf) {
                return;
            }
        }
    }

    /// Translate the current phase into poll interests and pending work.
    fn next_directives(state: &mut State) -> Directives {
        match state.phase {
            Phase::Processing => Directives {
                teardown: false,
                shutdown_write: false,
                want_read: !state.peer_closed,
                want_write: !state.outbound.is_empty(),
            },
            Phase::Closing { graceful: true } => {
                let drained = state.outbound.is_empty();
                let shutdown_write = drained && !state.shutdown_sent;
                if shutdown_write {
                    state.shutdown_sent = true;
                }
                Directives {
                    teardown: drained && state.peer_closed,
                    shutdown_write,
                    want_read: !state.peer_closed,
                    want_write: !drained,
                }
            }
            // Abrupt close requested, or a phase no running worker should
            // ever observe: stop now.
            _ => Directives {
                teardown: true,
                shutdown_write: false,
                want_read: false,
                want_write: false,
            },
        }
    }

    /// Send one window of queued bytes. Returns false after a teardown.
    fn drain_output(&mut self, shared: &Arc<Shared>) -> bool {
        let chunk = shared.state.lock().outbound.peek(MAX_TRANSFER);
        if chunk.is_empty() {
            return true;
        }
        match (&*self.stream).write(&chunk) {
            Ok(sent) => {
                tracing::trace!(bytes = sent, "sent");
                shared.state.lock().outbound.discard(sent);
                true
            }
            Err(err) if is_transient(&err) => true,
            Err(err) => {
                // A dead send path and a dead receive path read the same
                // from the owner's point of view.
                tracing::debug!(error = %err, "send failed");
                self.diagnostics
                    .publish(LIFECYCLE, "connection closed abruptly by peer");
                self.teardown(shared);
                false
            }
        }
    }

    /// Receive one window of inbound bytes. Returns false after a teardown.
    fn pump_input(&mut self, shared: &Arc<Shared>, buf: &mut [u8]) -> bool {
        match (&*self.stream).read(buf) {
            Ok(0) => {
                self.diagnostics
                    .publish(LIFECYCLE, "connection closed gracefully by peer");
                shared.emit(SocketEvent::PeerClosed);
                let (closing, finish) = {
                    let mut state = shared.state.lock();
                    state.peer_closed = true;
                    let closing = matches!(state.phase, Phase::Closing { .. });
                    (closing, closing && state.outbound.is_empty())
                };
                if finish {
                    self.teardown(shared);
                    return false;
                }
                if !closing && !self.peer_close_reported {
                    self.peer_close_reported = true;
                    (self.on_broken)(true);
                }
                true
            }
            Ok(received) => {
                tracing::trace!(bytes = received, "received");
                (self.on_message)(Bytes::copy_from_slice(&buf[..received]));
                true
            }
            Err(err) if is_transient(&err) => true,
            Err(err) => {
                tracing::debug!(error = %err, "receive failed");
                self.diagnostics
                    .publish(LIFECYCLE, "connection closed abruptly by peer");
                self.teardown(shared);
                false
            }
        }
    }

    /// Release the socket and report the connection fully broken.
    fn teardown(&mut self, shared: &Arc<Shared>) {
        let aborted = {
            let mut state = shared.state.lock();
            state.phase = Phase::Closed;
            state.outbound = ByteQueue::new();
            state.stream = None;
            !state.shutdown_sent
        };
        if aborted {
            // Reset on close instead of lingering over bytes the peer will
            // never be allowed to finish reading.
            let _ = SockRef::from(&*self.stream).set_linger(Some(Duration::ZERO));
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.diagnostics.publish(LIFECYCLE, "closed connection");
        shared.emit(SocketEvent::Closed);
        if !self.broken_reported {
            self.broken_reported = true;
            (self.on_broken)(false);
        }
    }

    /// Last handle dropped while we were running: close the socket and go
    /// quietly; there is nobody left to notify.
    fn close_detached(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.diagnostics.publish(LIFECYCLE, "closed connection");
        tracing::debug!("connection released; worker detaching");
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
