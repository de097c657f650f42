//! Local interface enumeration
//!
//! Expands a port number into one listen address per usable interface
//! address via `getifaddrs`. An address is usable when its interface is
//! up, is not loopback, and passes the configured allow-list; AF_INET6
//! addresses are skipped entirely when IPv6 is disabled.

use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use crate::config::HarvesterConfig;

// ============================================================================
// Enumeration
// ============================================================================

/// Enumerate the listen addresses for a port under the given config.
#[cfg(unix)]
pub fn listen_addresses(port: u16, config: &HarvesterConfig) -> io::Result<Vec<SocketAddr>> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_addr.is_null() {
                continue;
            }

            let flags = ifa.ifa_flags as libc::c_int;
            if flags & libc::IFF_UP == 0 || flags & libc::IFF_LOOPBACK != 0 {
                continue;
            }

            if !ifa.ifa_name.is_null() {
                let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy();
                if !config.interface_allowed(&name) {
                    continue;
                }
            }

            match (*ifa.ifa_addr).sa_family as libc::c_int {
                libc::AF_INET => {
                    let sa = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip = Ipv4Addr::from((*sa).sin_addr.s_addr.to_ne_bytes());
                    if !ip.is_loopback() {
                        addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                    }
                }
                libc::AF_INET6 if config.use_ipv6 => {
                    let sa = ifa.ifa_addr as *const libc::sockaddr_in6;
                    let ip = Ipv6Addr::from((*sa).sin6_addr.s6_addr);
                    if !ip.is_loopback() {
                        // Keep the scope id so link-local addresses bind
                        addrs.push(SocketAddr::V6(SocketAddrV6::new(
                            ip,
                            port,
                            0,
                            (*sa).sin6_scope_id,
                        )));
                    }
                }
                _ => {}
            }
        }

        libc::freeifaddrs(ifaddrs);
    }

    Ok(addrs)
}

#[cfg(not(unix))]
pub fn listen_addresses(_port: u16, _config: &HarvesterConfig) -> io::Result<Vec<SocketAddr>> {
    Ok(Vec::new())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_skips_loopback() {
        let config = HarvesterConfig::default();
        // May be empty on isolated CI hosts, which is fine
        let addrs = listen_addresses(9000, &config).unwrap();
        for addr in &addrs {
            assert!(!addr.ip().is_loopback());
            assert_eq!(addr.port(), 9000);
        }
    }

    #[test]
    fn test_ipv4_only_switch() {
        let config = HarvesterConfig {
            use_ipv6: false,
            ..HarvesterConfig::default()
        };
        let addrs = listen_addresses(9000, &config).unwrap();
        assert!(addrs.iter().all(|a| a.is_ipv4()));
    }

    #[test]
    fn test_empty_allow_list_blocks_everything() {
        let config = HarvesterConfig {
            allowed_interfaces: Some(Vec::new()),
            ..HarvesterConfig::default()
        };
        let addrs = listen_addresses(9000, &config).unwrap();
        assert!(addrs.is_empty());
    }
}
