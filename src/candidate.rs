//! Passive TCP candidates
//!
//! A passive candidate is a transport address at which this endpoint only
//! accepts inbound connections. The harvester derives one candidate per
//! bound listen address for each session it harvests for; accepted
//! connections that classify successfully are attached here and are owned
//! by the candidate from that point on.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

// ============================================================================
// TCP Candidate Types
// ============================================================================

/// ICE TCP candidate type (RFC 6544)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TcpType {
    /// Initiates outbound connections only
    Active,
    /// Accepts inbound connections only
    Passive,
    /// Simultaneous-open
    SimultaneousOpen,
}

impl fmt::Display for TcpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpType::Active => write!(f, "active"),
            TcpType::Passive => write!(f, "passive"),
            TcpType::SimultaneousOpen => write!(f, "so"),
        }
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// A local TCP candidate advertised for one session.
///
/// Not shared across sessions: each `harvest` call creates its own set.
#[derive(Debug)]
pub struct TcpCandidate {
    /// The advertised transport address
    transport_address: SocketAddr,
    /// TCP direction type
    tcp_type: TcpType,
    /// Connections handed off to this candidate
    sockets: Mutex<Vec<TcpStream>>,
}

impl TcpCandidate {
    /// Create a passive candidate for a listen address.
    pub fn passive(transport_address: SocketAddr) -> Self {
        Self {
            transport_address,
            tcp_type: TcpType::Passive,
            sockets: Mutex::new(Vec::new()),
        }
    }

    /// The advertised transport address.
    pub fn transport_address(&self) -> SocketAddr {
        self.transport_address
    }

    /// TCP direction type.
    pub fn tcp_type(&self) -> TcpType {
        self.tcp_type
    }

    /// Whether this candidate matches a connection's local address:
    /// address and port equality, TCP transport, passive type.
    pub fn matches_local_addr(&self, local_addr: SocketAddr) -> bool {
        self.tcp_type == TcpType::Passive
            && self.transport_address.ip() == local_addr.ip()
            && self.transport_address.port() == local_addr.port()
    }

    /// Attach a handed-off connection. From this point the candidate owns
    /// the stream's lifecycle.
    pub fn attach_socket(&self, stream: TcpStream) {
        self.sockets.lock().expect("candidate lock poisoned").push(stream);
    }

    /// Number of connections currently attached.
    pub fn attached_count(&self) -> usize {
        self.sockets.lock().expect("candidate lock poisoned").len()
    }

    /// Take ownership of all attached connections.
    pub fn take_sockets(&self) -> Vec<TcpStream> {
        std::mem::take(&mut *self.sockets.lock().expect("candidate lock poisoned"))
    }

    /// Serializable description of this candidate.
    pub fn describe(&self) -> CandidateInfo {
        CandidateInfo {
            transport_address: self.transport_address,
            tcp_type: self.tcp_type,
        }
    }
}

impl fmt::Display for TcpCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tcp-{}", self.transport_address, self.tcp_type)
    }
}

/// Descriptive view of a candidate, for signaling or diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInfo {
    pub transport_address: SocketAddr,
    pub tcp_type: TcpType,
}

// ============================================================================
// Tests
// ============================================================================
