//! Server endpoint addressing for the connect path.
//!
//! An endpoint is either a literal socket address or a hostname plus port
//! that is resolved at connect time.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{ManifoldError, Result};

/// Address of the server a bridge connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Literal IP address and port.
    Ip(SocketAddr),
    /// Hostname and port, resolved eagerly at connect time.
    Host(String, u16),
}

impl Endpoint {
    /// Parse an endpoint from a `host:port` or `ip:port` string.
    ///
    /// # Examples
    ///
    /// ```
    /// use manifold_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("127.0.0.1:6379").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Ip(_)));
    ///
    /// let endpoint = Endpoint::parse("cache.internal:6379").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Host(_, 6379)));
    /// ```
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Returns true if this endpoint needs DNS resolution.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self, Endpoint::Host(..))
    }

    /// Resolve to a concrete socket address.
    ///
    /// Hostnames are resolved eagerly and the first reported address is
    /// used, rather than letting the OS connect path walk the full address
    /// list; multi-address connects have a history of failures on Unix
    /// hosts once keepalive is enabled on the socket.
    pub fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Endpoint::Ip(addr) => Ok(*addr),
            Endpoint::Host(host, port) => (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|_| ManifoldError::resolve(host.clone()))?
                .next()
                .ok_or_else(|| ManifoldError::resolve(host.clone())),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Ip(addr)
    }
}

impl FromStr for Endpoint {
    type Err = ManifoldError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::Ip(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ManifoldError::invalid_endpoint(format!("{s} (expected host:port)")))?;
        if host.is_empty() || host.contains(':') {
            return Err(ManifoldError::invalid_endpoint(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ManifoldError::invalid_endpoint(format!("bad port in {s}")))?;
        Ok(Endpoint::Host(host.to_string(), port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{addr}"),
            Endpoint::Host(host, port) => write!(f, "{host}:{port}"),
        }
    }
}
