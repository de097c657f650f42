//! Multiplexing TCP candidate harvester
//!
//! One set of passive TCP listen endpoints serves any number of
//! negotiation sessions. Two threads cooperate:
//!
//! - the accept loop multiplexes accept-readiness across every listener,
//!   stages fresh connections into the intake queue and nudges the read
//!   loop through a pipe;
//! - the read loop multiplexes read-readiness across the pipe and every
//!   adopted connection, reads one framed handshake request per
//!   connection, resolves the session by the username's ufrag prefix and
//!   hands the connection off - or closes it.
//!
//! ```text
//! harvest(component) ──► registry[ufrag] = component
//!
//! peer ──TCP──► accept loop ──intake──► read loop ──lookup──► candidate
//!                     │                     │
//!                     └──── signal pipe ────┘
//! ```
//!
//! Every accepted connection reaches exactly one terminal state: handed
//! off, or closed (timeout, protocol mismatch, unknown session, I/O
//! error, shutdown).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};

use crate::agent::{Component, IceProcessingState, StunSocket};
use crate::candidate::TcpCandidate;
use crate::config::HarvesterConfig;
use crate::error::HarvesterError;
use crate::frame;
use crate::interfaces;
use crate::registry::UfragRegistry;
use crate::stun::{StunDecodeError, StunMessage};

// ============================================================================
// Constants
// ============================================================================

/// Accept-loop poll timeout; bounds how late the closing flag is observed
/// on a quiet listener set.
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Read-loop token for the signal pipe
const SIGNAL_TOKEN: Token = Token(0);

/// First token handed to an adopted connection
const FIRST_CONNECTION_TOKEN: usize = 1;

// ============================================================================
// Harvester
// ============================================================================

/// Multiplexing TCP candidate harvester.
///
/// Binds its listener set at construction time, runs its two loops until
/// [`close`](Self::close) (or drop), and demultiplexes inbound
/// connections to the sessions registered through
/// [`harvest`](Self::harvest).
pub struct TcpMuxHarvester {
    /// Actual bound addresses, advertised as candidates on harvest
    local_addresses: Vec<SocketAddr>,
    registry: Arc<UfragRegistry>,
    shared: Arc<Shared>,
    accept_handle: Option<JoinHandle<()>>,
    read_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TcpMuxHarvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMuxHarvester")
            .field("local_addresses", &self.local_addresses)
            .finish_non_exhaustive()
    }
}

/// State both loops and the API surface touch.
struct Shared {
    /// Cooperative cancellation flag: written once at shutdown, polled by
    /// both loops at every iteration
    closing: AtomicBool,
    /// Freshly accepted connections awaiting adoption by the read loop
    intake: Mutex<Vec<TcpStream>>,
    /// Write end of the wakeup pipe
    signal_tx: Mutex<pipe::Sender>,
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Wake the read loop by writing one byte to the pipe. A full pipe is
    /// fine: the reader drains it and the intake queue is swept
    /// unconditionally every iteration.
    fn notify_read_loop(&self) {
        let mut tx = self.signal_tx.lock().expect("signal lock poisoned");
        if let Err(e) = tx.write(&[0u8]) {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::info!("failed to signal read loop: {}", e);
            }
        }
    }
}

impl TcpMuxHarvester {
    /// Bind one passive listen endpoint per address and start the loops.
    ///
    /// Any bind failure aborts construction. Addresses with port 0 get an
    /// ephemeral port; the actual bound addresses are what
    /// [`harvest`](Self::harvest) advertises.
    pub fn bind(
        addresses: &[SocketAddr],
        config: HarvesterConfig,
    ) -> Result<Self, HarvesterError> {
        let mut listeners = Vec::with_capacity(addresses.len());
        let mut local_addresses = Vec::with_capacity(addresses.len());

        for &addr in addresses {
            let listener = std::net::TcpListener::bind(addr)
                .and_then(|l| {
                    l.set_nonblocking(true)?;
                    Ok(l)
                })
                .map_err(|source| HarvesterError::Bind { addr, source })?;
            let listener = TcpListener::from_std(listener);
            local_addresses.push(listener.local_addr()?);
            listeners.push(listener);
        }

        Self::start(listeners, local_addresses, config)
    }

    /// Listen on every usable interface address at the given port.
    ///
    /// Usable means up, not loopback and allowed by the config; IPv6
    /// addresses are skipped when `use_ipv6` is off.
    pub fn for_port(port: u16, config: HarvesterConfig) -> Result<Self, HarvesterError> {
        let addresses = interfaces::listen_addresses(port, &config)?;
        if addresses.is_empty() {
            return Err(HarvesterError::NoListenAddresses);
        }
        Self::bind(&addresses, config)
    }

    /// Set up both multiplexers and the signal pipe, then spawn the loops.
    fn start(
        mut listeners: Vec<TcpListener>,
        local_addresses: Vec<SocketAddr>,
        config: HarvesterConfig,
    ) -> Result<Self, HarvesterError> {
        let accept_poll = Poll::new()?;
        for (index, listener) in listeners.iter_mut().enumerate() {
            accept_poll
                .registry()
                .register(listener, Token(index), Interest::READABLE)?;
        }

        let (signal_tx, mut signal_rx) = pipe::new()?;
        let read_poll = Poll::new()?;
        read_poll
            .registry()
            .register(&mut signal_rx, SIGNAL_TOKEN, Interest::READABLE)?;

        let registry = Arc::new(UfragRegistry::new());
        let shared = Arc::new(Shared {
            closing: AtomicBool::new(false),
            intake: Mutex::new(Vec::new()),
            signal_tx: Mutex::new(signal_tx),
        });

        let accept_loop = AcceptLoop {
            poll: accept_poll,
            listeners,
            shared: Arc::clone(&shared),
        };
        let accept_handle = thread::Builder::new()
            .name("ice-tcp-mux-accept".into())
            .spawn(move || accept_loop.run())?;

        let read_loop = ReadLoop {
            poll: read_poll,
            signal_rx,
            shared: Arc::clone(&shared),
            registry: Arc::clone(&registry),
            read_timeout: config.read_timeout,
            active: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
        };
        let read_handle = thread::Builder::new()
            .name("ice-tcp-mux-read".into())
            .spawn(move || read_loop.run())?;

        log::info!(
            "harvester listening on {} address(es)",
            local_addresses.len()
        );

        Ok(Self {
            local_addresses,
            registry,
            shared,
            accept_handle: Some(accept_handle),
            read_handle: Some(read_handle),
        })
    }

    /// The bound listen addresses.
    pub fn local_addresses(&self) -> &[SocketAddr] {
        &self.local_addresses
    }

    /// Harvest passive candidates for a component and register its
    /// session for demultiplexing.
    ///
    /// The component's topology must be unambiguous: exactly one
    /// component on its stream and exactly one stream on its agent,
    /// because the local ufrag alone routes inbound connections.
    /// Re-harvesting under the same ufrag replaces the prior
    /// registration.
    pub fn harvest(
        &self,
        component: &Arc<Component>,
    ) -> Result<Vec<Arc<TcpCandidate>>, HarvesterError> {
        let stream = component
            .parent_stream()
            .ok_or(HarvesterError::SessionReleased)?;
        let agent = stream
            .parent_agent()
            .ok_or(HarvesterError::SessionReleased)?;

        let streams = agent.stream_count();
        let components = stream.component_count();
        if streams != 1 || components != 1 {
            return Err(HarvesterError::AmbiguousTopology {
                streams,
                components,
            });
        }

        let mut candidates = Vec::with_capacity(self.local_addresses.len());
        for &addr in &self.local_addresses {
            let candidate = Arc::new(TcpCandidate::passive(addr));
            component.add_local_candidate(Arc::clone(&candidate));
            candidates.push(candidate);
        }

        // Candidates must be attached before the ufrag can resolve, so a
        // connection classified right after this call finds its target.
        self.registry.register(agent.local_ufrag(), component);

        log::debug!(
            "harvested {} candidate(s) for ufrag '{}'",
            candidates.len(),
            agent.local_ufrag()
        );
        Ok(candidates)
    }

    /// Stop both loops and close every listener and every connection not
    /// yet handed off. Idempotent; also invoked on drop.
    pub fn close(&mut self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        // The accept loop is bounded by its poll timeout; the read loop
        // gets woken immediately.
        self.shared.notify_read_loop();

        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.read_handle.take() {
            let _ = handle.join();
        }
        log::info!("harvester closed");
    }
}

impl Drop for TcpMuxHarvester {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Multiplexes accept-readiness across the listener set and stages
/// accepted connections for the read loop.
struct AcceptLoop {
    poll: Poll,
    listeners: Vec<TcpListener>,
    shared: Arc<Shared>,
}

impl AcceptLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);

        loop {
            if self.shared.is_closing() {
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("accept loop: readiness wait failed: {}", e);
                break;
            }

            let mut admitted = false;
            'batch: for event in events.iter() {
                let Token(index) = event.token();
                let listener = &self.listeners[index];

                // Drain the listener: one readiness event may cover
                // several pending connections.
                loop {
                    match listener.accept() {
                        Ok((connection, peer_addr)) => {
                            log::debug!("accepted connection from {}", peer_addr);
                            self.shared
                                .intake
                                .lock()
                                .expect("intake lock poisoned")
                                .push(connection);
                            admitted = true;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::info!(
                                "failed to accept a connection that should have been ready: {}",
                                e
                            );
                            break 'batch;
                        }
                    }
                }
            }

            if admitted {
                self.shared.notify_read_loop();
            }
        }

        // Dropping the listeners closes every listen endpoint; the
        // multiplexer goes with them.
        log::debug!("accept loop terminated");
    }
}

// ============================================================================
// Read Loop
// ============================================================================

/// A connection adopted by the read loop, timestamped for the sweep.
struct ActiveConnection {
    stream: TcpStream,
    adopted_at: Instant,
}

/// Multiplexes read-readiness across the signal pipe and every adopted
/// connection; classifies each connection's first frame and hands it off
/// or closes it.
struct ReadLoop {
    poll: Poll,
    signal_rx: pipe::Receiver,
    shared: Arc<Shared>,
    registry: Arc<UfragRegistry>,
    read_timeout: Duration,
    active: HashMap<Token, ActiveConnection>,
    next_token: usize,
}

impl ReadLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        loop {
            if self.shared.is_closing() {
                break;
            }

            self.sweep_expired();
            self.adopt_pending();

            // Half the read timeout keeps worst-case staleness at about
            // 1.5x the timeout even with no traffic.
            if let Err(e) = self.poll.poll(&mut events, Some(self.read_timeout / 2)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("read loop: readiness wait failed: {}", e);
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == SIGNAL_TOKEN {
                    self.drain_signal();
                } else if let Some(connection) = self.active.remove(&token) {
                    let ActiveConnection { mut stream, .. } = connection;
                    // Deregister first so a single readiness event cannot
                    // re-fire for this connection.
                    if let Err(e) = self.poll.registry().deregister(&mut stream) {
                        log::debug!("failed to deregister connection: {}", e);
                    }
                    self.classify(stream);
                }
            }
        }

        self.shutdown();
    }

    /// Close every active connection older than the read timeout.
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .active
            .iter()
            .filter(|(_, c)| now.duration_since(c.adopted_at) > self.read_timeout)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(mut connection) = self.active.remove(&token) {
                log::info!(
                    "read timeout for connection from {}",
                    peer_of(&connection.stream)
                );
                if let Err(e) = self.poll.registry().deregister(&mut connection.stream) {
                    log::debug!("failed to deregister expired connection: {}", e);
                }
                // Dropping the stream closes it
            }
        }
    }

    /// Adopt everything in the intake queue: timestamp, register for
    /// read-readiness, track.
    fn adopt_pending(&mut self) {
        let pending = {
            let mut intake = self.shared.intake.lock().expect("intake lock poisoned");
            std::mem::take(&mut *intake)
        };

        let now = Instant::now();
        for mut stream in pending {
            let token = Token(self.next_token);
            self.next_token += 1;

            match self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                Ok(()) => {
                    self.active.insert(
                        token,
                        ActiveConnection {
                            stream,
                            adopted_at: now,
                        },
                    );
                }
                Err(e) => {
                    log::info!(
                        "failed to register connection from {}: {}",
                        peer_of(&stream),
                        e
                    );
                    // Dropping the stream closes it
                }
            }
        }
    }

    /// Drain the notification bytes from the signal pipe. The intake
    /// queue itself is swept unconditionally every iteration; the pipe
    /// only exists to cut the wait short.
    fn drain_signal(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.signal_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::info!("failed to drain signal pipe: {}", e);
                    break;
                }
            }
        }
    }

    /// Read one framed handshake request from the connection and hand it
    /// off to its session, or dispose of it. Either way the connection
    /// leaves the read loop's ownership here.
    fn classify(&self, stream: TcpStream) {
        let peer = peer_of(&stream);
        match self.read_and_hand_off(stream) {
            Ok((ufrag, candidate)) => {
                log::debug!(
                    "handed off connection from {} to ufrag '{}' at {}",
                    peer,
                    ufrag,
                    candidate
                );
            }
            Err(e) => {
                log::info!("dropping connection from {}: {}", peer, e);
                // The stream was consumed and dropped on the error path
            }
        }
    }

    fn read_and_hand_off(
        &self,
        stream: TcpStream,
    ) -> Result<(String, Arc<TcpCandidate>), ClassifyError> {
        // The handshake is read synchronously and in full. A socket-level
        // timeout bounds how long one silent peer can hold the loop.
        let mut stream = into_blocking(stream)?;
        stream.set_read_timeout(Some(self.read_timeout))?;

        let payload = frame::read_frame(&mut stream)?;
        let message = StunMessage::decode(&payload).map_err(ClassifyError::Malformed)?;

        if !message.is_binding_request() {
            return Err(ClassifyError::NotBindingRequest(message.message_type));
        }

        let username = message.username().ok_or(ClassifyError::NoUsername)?;
        let local_ufrag = match username.split_once(':') {
            Some((prefix, _)) => prefix,
            None => username,
        };

        let component = self
            .registry
            .lookup(local_ufrag)
            .ok_or_else(|| ClassifyError::UnknownUfrag(local_ufrag.to_string()))?;

        // Anything that fails from here on disposes the connection rather
        // than handing off: the session may be tearing down concurrently.
        let media_stream = component
            .parent_stream()
            .ok_or(ClassifyError::SessionReleased)?;
        let agent = media_stream
            .parent_agent()
            .ok_or(ClassifyError::SessionReleased)?;

        let state = agent.state();
        if !state.is_active() {
            return Err(ClassifyError::SessionNotActive(state));
        }

        let local_addr = stream.local_addr()?;
        let candidate = component
            .find_passive_candidate(local_addr)
            .ok_or(ClassifyError::NoMatchingCandidate(local_addr))?;

        // Frames after the handshake flow on normal socket semantics
        stream.set_read_timeout(None)?;

        // Protocol-only view for the dispatcher, general-purpose view for
        // the candidate. From here the session owns the connection.
        let protocol_view = stream.try_clone()?;
        agent.dispatcher().add_socket(StunSocket::new(protocol_view));
        candidate.attach_socket(stream);

        Ok((local_ufrag.to_string(), candidate))
    }

    /// Close everything still queued or active, then let the multiplexer
    /// go.
    fn shutdown(mut self) {
        let queued = {
            let mut intake = self.shared.intake.lock().expect("intake lock poisoned");
            std::mem::take(&mut *intake)
        };
        let queued_count = queued.len();
        drop(queued);

        let active_count = self.active.len();
        self.active.clear();

        log::debug!(
            "read loop terminated, closed {} queued and {} active connection(s)",
            queued_count,
            active_count
        );
    }
}

// ============================================================================
// Classification Errors
// ============================================================================

/// Why a connection was disposed instead of handed off. Internal to the
/// read loop; every variant ends up in one log line.
#[derive(Debug)]
enum ClassifyError {
    Io(io::Error),
    Malformed(StunDecodeError),
    NotBindingRequest(u16),
    NoUsername,
    UnknownUfrag(String),
    SessionReleased,
    SessionNotActive(IceProcessingState),
    NoMatchingCandidate(SocketAddr),
}

impl std::fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassifyError::Io(e) => write!(f, "failed to read from connection: {}", e),
            ClassifyError::Malformed(e) => {
                write!(f, "failed to decode a signaling message: {}", e)
            }
            ClassifyError::NotBindingRequest(message_type) => {
                write!(f, "not a binding request (type 0x{:04x})", message_type)
            }
            ClassifyError::NoUsername => write!(f, "no USERNAME attribute present"),
            ClassifyError::UnknownUfrag(ufrag) => {
                write!(f, "no session registered for ufrag '{}'", ufrag)
            }
            ClassifyError::SessionReleased => {
                write!(f, "session released before handoff")
            }
            ClassifyError::SessionNotActive(state) => {
                write!(f, "session not accepting connections (state {})", state)
            }
            ClassifyError::NoMatchingCandidate(addr) => {
                write!(f, "no passive candidate matches local address {}", addr)
            }
        }
    }
}

impl From<io::Error> for ClassifyError {
    fn from(e: io::Error) -> Self {
        ClassifyError::Io(e)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Convert an adopted mio stream back into a blocking std stream for the
/// synchronous handshake read.
#[cfg(unix)]
fn into_blocking(stream: TcpStream) -> io::Result<std::net::TcpStream> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};

    // Safety: into_raw_fd transfers sole ownership of the descriptor.
    let stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
    stream.set_nonblocking(false)?;
    Ok(stream)
}

fn peer_of(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_reports_actual_addresses() {
        let harvester =
            TcpMuxHarvester::bind(&[loopback(), loopback()], HarvesterConfig::default()).unwrap();

        assert_eq!(harvester.local_addresses().len(), 2);
        for addr in harvester.local_addresses() {
            assert_ne!(addr.port(), 0);
        }
    }

    #[test]
    fn test_bind_failure_propagates() {
        let first = TcpMuxHarvester::bind(&[loopback()], HarvesterConfig::default()).unwrap();
        let taken = first.local_addresses()[0];

        let err = TcpMuxHarvester::bind(&[taken], HarvesterConfig::default()).unwrap_err();
        assert!(matches!(err, HarvesterError::Bind { addr, .. } if addr == taken));
    }

    #[test]
    fn test_harvest_rejects_ambiguous_topology() {
        let harvester = TcpMuxHarvester::bind(&[loopback()], HarvesterConfig::default()).unwrap();

        let agent = Agent::new("frag");
        let stream = agent.create_stream("audio");
        let component = stream.create_component();
        stream.create_component();

        let err = harvester.harvest(&component).unwrap_err();
        assert!(matches!(
            err,
            HarvesterError::AmbiguousTopology { streams: 1, components: 2 }
        ));
        // Nothing was harvested or registered
        assert!(component.local_candidates().is_empty());
        assert!(harvester.registry.lookup("frag").is_none());
    }

    #[test]
    fn test_harvest_rejects_released_session() {
        let harvester = TcpMuxHarvester::bind(&[loopback()], HarvesterConfig::default()).unwrap();

        let agent = Agent::new("frag");
        let stream = agent.create_stream("audio");
        let component = stream.create_component();
        drop(stream);
        drop(agent);

        assert!(matches!(
            harvester.harvest(&component).unwrap_err(),
            HarvesterError::SessionReleased
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut harvester =
            TcpMuxHarvester::bind(&[loopback()], HarvesterConfig::default()).unwrap();
        harvester.close();
        harvester.close();
    }

    #[test]
    fn test_classify_error_display() {
        assert_eq!(
            ClassifyError::UnknownUfrag("abc".to_string()).to_string(),
            "no session registered for ufrag 'abc'"
        );
        assert_eq!(
            ClassifyError::NotBindingRequest(0x0101).to_string(),
            "not a binding request (type 0x0101)"
        );
        assert!(ClassifyError::SessionNotActive(IceProcessingState::Terminated)
            .to_string()
            .contains("terminated"));
    }
}
