//! Harvester configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-connection read-idle timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Tunables for a harvester instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvesterConfig {
    /// How long an adopted connection may stay silent before it is closed.
    /// Applies from the moment the read loop adopts it, not from accept.
    pub read_timeout: Duration,

    /// Whether IPv6 interface addresses are used when enumerating listen
    /// addresses. Explicit address lists are not filtered.
    pub use_ipv6: bool,

    /// Interface names to listen on; `None` means every interface that is
    /// up and not loopback.
    pub allowed_interfaces: Option<Vec<String>>,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            use_ipv6: true,
            allowed_interfaces: None,
        }
    }
}

impl HarvesterConfig {
    /// Whether an interface name passes the allow-list.
    pub fn interface_allowed(&self, name: &str) -> bool {
        match &self.allowed_interfaces {
            Some(allowed) => allowed.iter().any(|a| a == name),
            None => true,
        }
    }
}
