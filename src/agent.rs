//! Session object model
//!
//! The negotiation-side collaborators of the harvester: a negotiating
//! `Agent` owns media streams, a stream owns components, and a component
//! owns the local candidates a harvest call attaches to it. Parent links
//! are `Weak`, so holding a child (or a registry entry pointing at one)
//! never extends the lifetime of the session above it.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, Weak};
use std::{fmt, io};

use crate::candidate::TcpCandidate;
use crate::frame;
use crate::stun::StunMessage;

// ============================================================================
// Processing State
// ============================================================================

/// Lifecycle state of a negotiating agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceProcessingState {
    /// Candidates gathered, checks not yet started
    Waiting,
    /// Connectivity checks in progress
    Running,
    /// Negotiation finished successfully
    Completed,
    /// Negotiation failed
    Failed,
    /// Agent torn down
    Terminated,
}

impl IceProcessingState {
    /// Whether the agent may still adopt inbound connections.
    pub fn is_active(&self) -> bool {
        matches!(self, IceProcessingState::Waiting | IceProcessingState::Running)
    }
}

impl fmt::Display for IceProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceProcessingState::Waiting => write!(f, "waiting"),
            IceProcessingState::Running => write!(f, "running"),
            IceProcessingState::Completed => write!(f, "completed"),
            IceProcessingState::Failed => write!(f, "failed"),
            IceProcessingState::Terminated => write!(f, "terminated"),
        }
    }
}

// ============================================================================
// Agent
// ============================================================================

/// A negotiating agent: one local credential fragment, one set of media
/// streams, one signaling dispatcher.
pub struct Agent {
    local_ufrag: String,
    state: Mutex<IceProcessingState>,
    streams: Mutex<Vec<Arc<MediaStream>>>,
    dispatcher: StunDispatcher,
}

impl Agent {
    /// Create an agent with the given local ufrag.
    pub fn new(local_ufrag: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            local_ufrag: local_ufrag.into(),
            state: Mutex::new(IceProcessingState::Waiting),
            streams: Mutex::new(Vec::new()),
            dispatcher: StunDispatcher::new(),
        })
    }

    /// The local credential fragment used as the demultiplexing key.
    pub fn local_ufrag(&self) -> &str {
        &self.local_ufrag
    }

    pub fn state(&self) -> IceProcessingState {
        *self.state.lock().expect("agent state lock poisoned")
    }

    pub fn set_state(&self, state: IceProcessingState) {
        *self.state.lock().expect("agent state lock poisoned") = state;
    }

    /// Create a media stream owned by this agent.
    pub fn create_stream(self: &Arc<Self>, name: impl Into<String>) -> Arc<MediaStream> {
        let stream = Arc::new(MediaStream {
            name: name.into(),
            agent: Arc::downgrade(self),
            components: Mutex::new(Vec::new()),
        });
        self.streams
            .lock()
            .expect("agent streams lock poisoned")
            .push(Arc::clone(&stream));
        stream
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("agent streams lock poisoned").len()
    }

    /// The process-wide signaling dispatcher for this agent.
    pub fn dispatcher(&self) -> &StunDispatcher {
        &self.dispatcher
    }
}

// ============================================================================
// Media Stream
// ============================================================================

/// A media stream: a group of components under one agent.
pub struct MediaStream {
    name: String,
    agent: Weak<Agent>,
    components: Mutex<Vec<Arc<Component>>>,
}

impl MediaStream {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning agent, if it is still alive.
    pub fn parent_agent(&self) -> Option<Arc<Agent>> {
        self.agent.upgrade()
    }

    /// Create a component on this stream. Ids are assigned sequentially
    /// starting at 1.
    pub fn create_component(self: &Arc<Self>) -> Arc<Component> {
        let mut components = self.components.lock().expect("stream components lock poisoned");
        let component = Arc::new(Component {
            component_id: components.len() as u16 + 1,
            stream: Arc::downgrade(self),
            candidates: Mutex::new(Vec::new()),
        });
        components.push(Arc::clone(&component));
        component
    }

    pub fn component_count(&self) -> usize {
        self.components.lock().expect("stream components lock poisoned").len()
    }
}

// ============================================================================
// Component
// ============================================================================

/// One component of a media stream; the adoption target a classified
/// connection is handed to.
pub struct Component {
    component_id: u16,
    stream: Weak<MediaStream>,
    candidates: Mutex<Vec<Arc<TcpCandidate>>>,
}

impl Component {
    pub fn id(&self) -> u16 {
        self.component_id
    }

    /// The owning stream, if it is still alive.
    pub fn parent_stream(&self) -> Option<Arc<MediaStream>> {
        self.stream.upgrade()
    }

    pub fn add_local_candidate(&self, candidate: Arc<TcpCandidate>) {
        self.candidates
            .lock()
            .expect("component candidates lock poisoned")
            .push(candidate);
    }

    pub fn local_candidates(&self) -> Vec<Arc<TcpCandidate>> {
        self.candidates
            .lock()
            .expect("component candidates lock poisoned")
            .clone()
    }

    /// The passive TCP candidate whose transport address equals the given
    /// connection-local address, if any.
    pub fn find_passive_candidate(&self, local_addr: SocketAddr) -> Option<Arc<TcpCandidate>> {
        self.candidates
            .lock()
            .expect("component candidates lock poisoned")
            .iter()
            .find(|c| c.matches_local_addr(local_addr))
            .cloned()
    }
}

// ============================================================================
// Signaling Dispatcher
// ============================================================================

/// Protocol-only view of a handed-off connection: reads frames and yields
/// only the ones that decode as STUN messages.
pub struct StunSocket {
    stream: TcpStream,
}

impl StunSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Read frames until one decodes as a STUN message. Non-STUN frames
    /// are skipped, everything else on this connection belongs to the
    /// general-purpose view.
    pub fn recv_message(&mut self) -> io::Result<StunMessage> {
        loop {
            let payload = frame::read_frame(&mut self.stream)?;
            match StunMessage::decode(&payload) {
                Ok(message) => return Ok(message),
                Err(e) => log::debug!("skipping non-STUN frame: {}", e),
            }
        }
    }
}

/// Collects the protocol-only views of handed-off connections so control
/// messages keep reaching protocol processing.
pub struct StunDispatcher {
    sockets: Mutex<Vec<StunSocket>>,
}

impl StunDispatcher {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(Vec::new()),
        }
    }

    pub fn add_socket(&self, socket: StunSocket) {
        self.sockets.lock().expect("dispatcher lock poisoned").push(socket);
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().expect("dispatcher lock poisoned").len()
    }

    /// Take ownership of all registered sockets.
    pub fn take_sockets(&self) -> Vec<StunSocket> {
        std::mem::take(&mut *self.sockets.lock().expect("dispatcher lock poisoned"))
    }
}

impl Default for StunDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_eligibility() {
        assert!(IceProcessingState::Waiting.is_active());
        assert!(IceProcessingState::Running.is_active());
        assert!(!IceProcessingState::Completed.is_active());
        assert!(!IceProcessingState::Failed.is_active());
        assert!(!IceProcessingState::Terminated.is_active());
    }

    #[test]
    fn test_topology_counts() {
        let agent = Agent::new("frag");
        assert_eq!(agent.stream_count(), 0);

        let stream = agent.create_stream("audio");
        assert_eq!(agent.stream_count(), 1);
        assert_eq!(stream.component_count(), 0);

        let component = stream.create_component();
        assert_eq!(stream.component_count(), 1);
        assert_eq!(component.id(), 1);
        assert_eq!(stream.create_component().id(), 2);
    }

    #[test]
    fn test_parent_links() {
        let agent = Agent::new("frag");
        let stream = agent.create_stream("audio");
        let component = stream.create_component();

        let parent = component.parent_stream().unwrap();
        assert_eq!(parent.name(), "audio");
        assert_eq!(parent.parent_agent().unwrap().local_ufrag(), "frag");
    }

    #[test]
    fn test_parent_links_are_non_owning() {
        let agent = Agent::new("frag");
        let stream = agent.create_stream("audio");
        let component = stream.create_component();

        drop(stream);
        drop(agent);

        // The component alone keeps nothing above it alive
        assert!(component.parent_stream().is_none());
    }

    #[test]
    fn test_candidate_lookup() {
        let agent = Agent::new("frag");
        let component = agent.create_stream("audio").create_component();

        let addr: SocketAddr = "192.0.2.1:7000".parse().unwrap();
        component.add_local_candidate(Arc::new(TcpCandidate::passive(addr)));

        assert!(component.find_passive_candidate(addr).is_some());
        assert!(component
            .find_passive_candidate("192.0.2.1:7001".parse().unwrap())
            .is_none());
        assert_eq!(component.local_candidates().len(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let agent = Agent::new("frag");
        assert_eq!(agent.state(), IceProcessingState::Waiting);

        agent.set_state(IceProcessingState::Running);
        assert!(agent.state().is_active());

        agent.set_state(IceProcessingState::Terminated);
        assert!(!agent.state().is_active());
        assert_eq!(agent.state().to_string(), "terminated");
    }
}
