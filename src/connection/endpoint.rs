//! Dial target and TLS identity, kept apart

use std::net::SocketAddr;

/// Where to connect and whom to expect there.
///
/// `addr` is the socket the bytes flow through (usually a local tunnel).
/// `server_name` is the host the session is meant for: it is sent as SNI
/// and the server certificate must match it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// TCP destination
    pub addr: SocketAddr,
    /// TLS server name
    pub server_name: String,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(addr: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            addr,
            server_name: server_name.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (sni={})", self.addr, self.server_name)
    }
}
