//! Backend addresses and dialing.
//!
//! The route table hands back URL-like strings such as
//! `http://10.0.0.5:8443`. Only the host and port matter here: the
//! connection is relayed opaquely, so the scheme is used solely to infer a
//! default port.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use url::{Host, Url};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Scheme assumed for bare `host:port` backends.
const BARE_SCHEME: &str = "tcp";

/// Errors produced while interpreting a backend address string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendAddrError {
    /// The string is not a parseable URL.
    #[error("invalid backend address '{address}': {reason}")]
    Invalid { address: String, reason: String },

    /// The URL has no host component.
    #[error("backend address '{0}' has no host")]
    MissingHost(String),

    /// No explicit port and no well-known port for the scheme.
    #[error("backend address '{0}' has no port")]
    MissingPort(String),
}

/// A dialable backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    host: Host<String>,
    port: u16,
}

impl Backend {
    /// Create a backend from a host and port.
    pub fn new(host: Host<String>, port: u16) -> Self {
        Self { host, port }
    }

    /// Parse a URL-like backend address.
    ///
    /// Accepts `scheme://host[:port][/path]` and bare `host:port`.
    pub fn parse(address: &str) -> Result<Self, BackendAddrError> {
        let address = address.trim();
        let url = if address.contains("://") {
            Url::parse(address)
        } else {
            Url::parse(&format!("{BARE_SCHEME}://{address}"))
        }
        .map_err(|e| BackendAddrError::Invalid {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let host = match url.host() {
            Some(Host::Domain(d)) if d.is_empty() => None,
            Some(host) => Some(host.to_owned()),
            None => None,
        }
        .ok_or_else(|| BackendAddrError::MissingHost(address.to_string()))?;

        let port = url
            .port_or_known_default()
            .ok_or_else(|| BackendAddrError::MissingPort(address.to_string()))?;

        Ok(Self { host, port })
    }

    /// Backend host.
    pub fn host(&self) -> &Host<String> {
        &self.host
    }

    /// Backend port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open a TCP connection to this backend.
    ///
    /// A `connect_timeout` of `None` leaves the OS connect timeout in charge.
    pub async fn connect(&self, connect_timeout: Option<Duration>) -> io::Result<TcpStream> {
        debug!(backend_addr = %self, "Connecting to backend");

        let connect = self.connect_inner();
        match connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => connect.await,
        }
    }

    async fn connect_inner(&self) -> io::Result<TcpStream> {
        let stream = match &self.host {
            Host::Domain(domain) => TcpStream::connect((domain.as_str(), self.port)).await?,
            Host::Ipv4(ip) => TcpStream::connect((*ip, self.port)).await?,
            Host::Ipv6(ip) => TcpStream::connect((*ip, self.port)).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl FromStr for Backend {
    type Err = BackendAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<(Ipv4Addr, u16)> for Backend {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Self::new(Host::Ipv4(ip), port)
    }
}

impl From<(Ipv6Addr, u16)> for Backend {
    fn from((ip, port): (Ipv6Addr, u16)) -> Self {
        Self::new(Host::Ipv6(ip), port)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
