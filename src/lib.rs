//! Multiplexing TCP candidate harvester
//!
//! Turns a fixed set of passively-listening TCP endpoints into transport
//! candidates for any number of concurrent negotiation sessions, and
//! demultiplexes inbound connections to the right session purely from the
//! first framed handshake message each connection sends:
//!
//! - one accept thread multiplexes accept-readiness across the whole
//!   listener set;
//! - one read thread adopts accepted connections, reads a single
//!   length-prefixed STUN Binding Request from each, and routes the
//!   connection by the USERNAME attribute's ufrag prefix;
//! - sessions opt in through [`TcpMuxHarvester::harvest`], which
//!   advertises one passive candidate per listen address and registers
//!   the session's ufrag for routing.
//!
//! Connections that never produce a usable handshake are closed after a
//! configurable idle timeout; nothing leaks on shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ice_tcp_mux::{Agent, HarvesterConfig, TcpMuxHarvester};
//!
//! # fn main() -> Result<(), ice_tcp_mux::HarvesterError> {
//! let harvester = TcpMuxHarvester::bind(
//!     &["0.0.0.0:7777".parse().unwrap()],
//!     HarvesterConfig::default(),
//! )?;
//!
//! let agent = Agent::new("frag");
//! let component = agent.create_stream("data").create_component();
//! let candidates = harvester.harvest(&component)?;
//! assert_eq!(candidates.len(), 1);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

/// Session object model: agents, streams, components, dispatcher
pub mod agent;

/// Passive TCP candidates
pub mod candidate;

/// Harvester tunables
pub mod config;

/// API-boundary error types
pub mod error;

/// RFC4571-style length-prefixed framing
pub mod frame;

/// The accept/read engine and harvest API
pub mod harvester;

/// Local interface enumeration
pub mod interfaces;

/// ufrag -> component session registry
pub mod registry;

/// Minimal STUN message codec
pub mod stun;

// ============================================================================
// Re-exports
// ============================================================================

pub use agent::{Agent, Component, IceProcessingState, MediaStream, StunDispatcher, StunSocket};
pub use candidate::{CandidateInfo, TcpCandidate, TcpType};
pub use config::HarvesterConfig;
pub use error::HarvesterError;
pub use harvester::TcpMuxHarvester;
pub use registry::UfragRegistry;
pub use stun::StunMessage;
