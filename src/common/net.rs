//! Eager host resolution shared by every adapter

use crate::error::{CdaError, CdaResult};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::debug;

/// Resolve `host:port` once, preferring IPv4 addresses.
///
/// Fails with [`CdaError::HostResolution`] when the name cannot be resolved.
pub fn resolve_host(host: &str, port: u16) -> CdaResult<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| CdaError::host_resolution(host, port, e))?
        .collect();

    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| CdaError::host_resolution(host, port, "no addresses returned"))?;

    debug!(host = %host, port = port, addr = %addr, "Resolved host");
    Ok(addr)
}

/// Unspecified local address of the same family as `peer`, any port
pub fn local_bind_addr(peer: &SocketAddr) -> SocketAddr {
    if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_address() {
        let addr = resolve_host("127.0.0.1", 5683).unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 5683)));
    }

    #[test]
    fn test_resolve_localhost_prefers_ipv4() {
        let addr = resolve_host("localhost", 1883).unwrap();
        assert_eq!(addr.port(), 1883);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_unresolvable_host_fails_loudly() {
        let err = resolve_host("no-such-host.invalid", 5683).unwrap_err();
        assert!(matches!(err, CdaError::HostResolution { .. }));
        assert!(err.is_startup_error());
    }

    #[test]
    fn test_local_bind_addr_matches_family() {
        let v4 = SocketAddr::from(([10, 0, 0, 1], 5683));
        assert!(local_bind_addr(&v4).is_ipv4());

        let v6: SocketAddr = "[::1]:5683".parse().unwrap();
        assert!(local_bind_addr(&v6).is_ipv6());
    }
}
