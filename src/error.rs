//! Harvester error types

use std::net::SocketAddr;
use std::{fmt, io};

/// Errors surfaced at the harvester's API boundary.
///
/// Everything inside the loops is contained and logged; only construction
/// and `harvest` return errors to the caller.
#[derive(Debug)]
pub enum HarvesterError {
    /// A configured listen address could not be bound
    Bind { addr: SocketAddr, source: io::Error },
    /// Setup I/O failure (poll or signal pipe creation, registration)
    Io(io::Error),
    /// The session's topology cannot be demultiplexed by ufrag alone:
    /// more than one component per stream or stream per agent
    AmbiguousTopology { streams: usize, components: usize },
    /// Interface enumeration produced no usable listen address
    NoListenAddresses,
    /// The component's parent stream or agent has already been released
    SessionReleased,
}

impl fmt::Display for HarvesterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarvesterError::Bind { addr, source } => {
                write!(f, "failed to bind {}: {}", addr, source)
            }
            HarvesterError::Io(e) => write!(f, "harvester setup failed: {}", e),
            HarvesterError::AmbiguousTopology { streams, components } => write!(
                f,
                "cannot demultiplex by ufrag: {} stream(s), {} component(s); need exactly one of each",
                streams, components
            ),
            HarvesterError::NoListenAddresses => {
                write!(f, "no usable listen addresses found")
            }
            HarvesterError::SessionReleased => {
                write!(f, "the component's parent session has been released")
            }
        }
    }
}

impl std::error::Error for HarvesterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarvesterError::Bind { source, .. } => Some(source),
            HarvesterError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HarvesterError {
    fn from(e: io::Error) -> Self {
        HarvesterError::Io(e)
    }
}
