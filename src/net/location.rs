//! Peer and server locations.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};

use crate::config::{PeerEntry, ServerEntry};

use super::TransportError;

/// A `host:port` endpoint. Resolution happens lazily so a location can be
/// configured before its host is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub host: String,
    pub port: u16,
}

impl Location {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_peer(entry: &PeerEntry) -> Self {
        Self::new(entry.host.clone(), entry.port)
    }

    pub fn from_server(entry: &ServerEntry) -> Self {
        Self::new(entry.host.clone(), entry.port)
    }

    pub fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let mut addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| self.unresolvable())?;
        // Prefer IPv4: the wire protocol identifies peers by v4-style address
        // comparison on the acceptor side.
        let mut first = None;
        for addr in &mut addrs {
            if addr.is_ipv4() {
                return Ok(addr);
            }
            first.get_or_insert(addr);
        }
        first.ok_or_else(|| self.unresolvable())
    }

    pub fn resolve_ip(&self) -> Result<IpAddr, TransportError> {
        Ok(self.resolve()?.ip())
    }

    /// Whether this location names the local node listening on `my_port`.
    pub fn is_self(&self, my_port: u16) -> bool {
        if self.port != my_port {
            return false;
        }
        match self.resolve_ip() {
            Ok(ip) => ip.is_loopback() || Some(ip) == local_ip(),
            Err(_) => false,
        }
    }

    fn unresolvable(&self) -> TransportError {
        TransportError::Resolve {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Best-effort address of the interface used for outbound traffic. No packet
/// is sent; connecting a UDP socket only selects a route.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_loopback() {
        let location = Location::new("localhost", 4000);
        let addr = location.resolve().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn detects_self_on_loopback() {
        let location = Location::new("localhost", 4000);
        assert!(location.is_self(4000));
        assert!(!location.is_self(4001));
    }

    #[test]
    fn unresolvable_host_errors() {
        let location = Location::new("host.invalid.", 4000);
        assert!(matches!(
            location.resolve(),
            Err(TransportError::Resolve { .. })
        ));
    }

    #[test]
    fn displays_as_host_port() {
        assert_eq!(Location::new("alpha", 9001).to_string(), "alpha:9001");
    }
}
