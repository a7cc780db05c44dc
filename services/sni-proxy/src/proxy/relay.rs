//! Per-connection relay.
//!
//! Drives one client connection through
//! `ReadingPrefix -> Parsing -> Resolving -> Dialing -> Relaying`.
//! Any failure ends the connection; both streams are owned by the relay and
//! dropped (closed) on every return path.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::backend::{Backend, DEFAULT_CONNECT_TIMEOUT};
use super::router::{BackendResolver, ResolveError};
use super::sni::{InspectError, SniConfig, SniError, SniInspector};

const PUMP_BUFFER_SIZE: usize = 8192;

/// Relay stage, used to tag failures in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReadingPrefix,
    Parsing,
    Resolving,
    Dialing,
    Relaying,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ReadingPrefix => "reading_prefix",
            Stage::Parsing => "parsing",
            Stage::Resolving => "resolving",
            Stage::Dialing => "dialing",
            Stage::Relaying => "relaying",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a single connection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Short or failed read of the record header or body.
    #[error("read client hello: {0}")]
    Read(#[source] io::Error),

    /// ClientHello did not arrive in time.
    #[error("read client hello: timed out after {0:?}")]
    ReadTimeout(Duration),

    /// ClientHello could not be parsed.
    #[error("parse client hello: {0}")]
    Parse(#[from] SniError),

    /// Routing lookup failed or returned an unusable address.
    #[error("resolve backend for '{hostname}': {source}")]
    Resolve {
        hostname: String,
        #[source]
        source: ResolveError,
    },

    /// Could not connect to the backend.
    #[error("connect to backend {backend}: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// I/O error while pumping bytes.
    #[error("relay: {0}")]
    Relay(#[source] io::Error),
}

impl RelayError {
    /// Stage the connection was in when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            RelayError::Read(_) | RelayError::ReadTimeout(_) => Stage::ReadingPrefix,
            RelayError::Parse(_) => Stage::Parsing,
            RelayError::Resolve { .. } => Stage::Resolving,
            RelayError::Dial { .. } => Stage::Dialing,
            RelayError::Relay(_) => Stage::Relaying,
        }
    }
}

impl From<InspectError> for RelayError {
    fn from(err: InspectError) -> Self {
        match err {
            InspectError::Io(e) => RelayError::Read(e),
            InspectError::Timeout(limit) => RelayError::ReadTimeout(limit),
            InspectError::Invalid(e) => RelayError::Parse(e),
        }
    }
}

/// Relay timeouts.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// ClientHello read configuration.
    pub sni: SniConfig,
    /// Backend connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Per-read idle timeout while relaying.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sni: SniConfig::default(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            idle_timeout: None,
        }
    }
}

/// Which side finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

/// Summary of a completed relay.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub hostname: String,
    pub backend: String,
    /// Bytes written to the backend, including the replayed ClientHello.
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub finished_first: Direction,
}

/// Relays client connections to the backend selected by SNI.
pub struct Relay<R: ?Sized> {
    resolver: Arc<R>,
    inspector: SniInspector,
    config: RelayConfig,
}

impl<R: BackendResolver + ?Sized> Relay<R> {
    pub fn new(resolver: Arc<R>, config: RelayConfig) -> Self {
        Self {
            inspector: SniInspector::with_config(config.sni.clone()),
            resolver,
            config,
        }
    }

    /// Run one connection to completion.
    ///
    /// The client stream is consumed; it and the backend stream are closed
    /// when this returns, whatever the outcome.
    pub async fn run<S>(&self, mut client: S) -> Result<RelayOutcome, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let record = self.inspector.inspect(&mut client).await?;

        let hostname = record.server_name()?;
        debug!(hostname = %hostname, "SNI extracted");

        let address = self
            .resolver
            .resolve(&hostname)
            .await
            .map_err(|source| RelayError::Resolve {
                hostname: hostname.clone(),
                source,
            })?;
        let backend = Backend::parse(&address).map_err(|e| RelayError::Resolve {
            hostname: hostname.clone(),
            source: e.into(),
        })?;

        let mut upstream = backend
            .connect(self.config.connect_timeout)
            .await
            .map_err(|source| RelayError::Dial {
                backend: backend.to_string(),
                source,
            })?;
        debug!(backend_addr = %backend, "Connected to backend");

        let prefix = record.to_prefix();
        upstream
            .write_all(&prefix)
            .await
            .map_err(RelayError::Relay)?;

        let (to_backend, from_backend, finished_first) =
            proxy_bidirectional(&mut client, &mut upstream, self.config.idle_timeout)
                .await
                .map_err(RelayError::Relay)?;

        Ok(RelayOutcome {
            hostname,
            backend: backend.to_string(),
            bytes_to_backend: prefix.len() as u64 + to_backend,
            bytes_from_backend: from_backend,
            finished_first,
        })
    }
}

/// Last time either direction of a relay moved data.
///
/// Shared by both pumps so the idle timeout only fires once the whole
/// connection is quiet, not when just one direction is.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_deadline(&self, limit: Duration) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + limit
    }
}

/// Copy `reader` into `writer` until EOF, then shut the writer down.
///
/// With an idle timeout, a read that waits past the shared deadline fails
/// with `TimedOut`; activity in the other direction pushes the deadline out.
async fn pump<Rd, Wr>(
    reader: &mut Rd,
    writer: &mut Wr,
    idle_timeout: Option<Duration>,
    activity: &Activity,
    total: &mut u64,
) -> io::Result<()>
where
    Rd: AsyncRead + Unpin + ?Sized,
    Wr: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = match idle_timeout {
            Some(limit) => loop {
                let deadline = activity.idle_deadline(limit);
                // `read` is cancel safe, so retrying after a timeout loses nothing.
                match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
                    Ok(result) => break result?,
                    Err(_) if activity.idle_deadline(limit) <= Instant::now() => {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
                    }
                    Err(_) => continue,
                }
            },
            None => reader.read(&mut buf).await?,
        };

        if n == 0 {
            break;
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
    writer.shutdown().await
}

/// Proxy data in both directions until either direction finishes.
///
/// The first direction to hit EOF or an error ends the exchange; the other
/// direction is dropped mid-flight rather than drained.
///
/// Returns (bytes_to_backend, bytes_from_backend, first finished direction).
async fn proxy_bidirectional<S>(
    client: &mut S,
    backend: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64, Direction)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = backend.split();

    let mut to_backend = 0u64;
    let mut from_backend = 0u64;
    let activity = Activity::new();

    let (direction, result) = tokio::select! {
        result = pump(&mut client_read, &mut backend_write, idle_timeout, &activity, &mut to_backend) => {
            (Direction::ClientToBackend, result)
        }
        result = pump(&mut backend_read, &mut client_write, idle_timeout, &activity, &mut from_backend) => {
            (Direction::BackendToClient, result)
        }
    };

    debug!(
        finished_first = ?direction,
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "Relay finished"
    );

    result.map(|()| (to_backend, from_backend, direction))
}
