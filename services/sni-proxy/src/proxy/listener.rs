//! TCP listener and connection acceptance.
//!
//! Accepts connections and hands each one to its own task running the
//! [`Relay`]. The accept loop never waits on a connection. Each task is the
//! single place where a connection's failure is logged.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::relay::{Relay, RelayConfig, RelayError, Stage};
use super::router::BackendResolver;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection relay configuration.
    pub relay: RelayConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            relay: RelayConfig::default(),
        }
    }

    /// Set the ClientHello read timeout.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay.sni.timeout = timeout;
        self
    }

    /// Set the backend connect timeout.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay.connect_timeout = timeout;
        self
    }

    /// Set the relay idle timeout.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay.idle_timeout = timeout;
        self
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// ClientHello read failures.
    pub read_failed: AtomicU64,
    /// ClientHello parse failures.
    pub parse_failed: AtomicU64,
    /// Backend resolution failures.
    pub resolve_failed: AtomicU64,
    /// Backend connection failures.
    pub dial_failed: AtomicU64,
    /// Connections that reached the relaying stage and ended with an error.
    pub relay_failed: AtomicU64,
    /// Connections relayed to completion.
    pub relayed: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_failure(&self, err: &RelayError) {
        let counter = match err.stage() {
            Stage::ReadingPrefix => &self.read_failed,
            Stage::Parsing => &self.parse_failed,
            Stage::Resolving => &self.resolve_failed,
            Stage::Dialing => &self.dial_failed,
            Stage::Relaying => &self.relay_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A TCP listener for the SNI proxy.
pub struct Listener {
    listener: TcpListener,
    relay: Arc<Relay<dyn BackendResolver>>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(
        config: ListenerConfig,
        resolver: Arc<dyn BackendResolver>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener,
            relay: Arc::new(Relay::new(resolver, config.relay)),
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until accepting fails.
    ///
    /// An accept error is treated as fatal for the listener: it is logged and
    /// returned. Connections already running are not affected.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(bind_addr = %local_addr, error = %e, "Accept error, listener stopping");
                    return Err(e);
                }
            };

            let conn_id = Uuid::new_v4();

            let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats
                        .connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        conn_id = %conn_id,
                        peer_addr = %peer_addr,
                        "Connection rejected: max connections reached"
                    );
                    continue;
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let relay = Arc::clone(&self.relay);
            let stats = Arc::clone(&self.stats);

            tokio::spawn(
                async move {
                    handle_connection(&relay, &stats, stream, conn_id).await;

                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", conn_id = %conn_id, peer = %peer_addr)),
            );
        }
    }
}

/// Relay one connection and log how it ended.
async fn handle_connection(
    relay: &Relay<dyn BackendResolver>,
    stats: &ListenerStats,
    stream: TcpStream,
    conn_id: Uuid,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id = %conn_id, error = %e, "Failed to set TCP_NODELAY");
    }

    match relay.run(stream).await {
        Ok(outcome) => {
            stats.relayed.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_to_backend
                .fetch_add(outcome.bytes_to_backend, Ordering::Relaxed);
            stats
                .bytes_from_backend
                .fetch_add(outcome.bytes_from_backend, Ordering::Relaxed);
            debug!(
                conn_id = %conn_id,
                hostname = %outcome.hostname,
                backend_addr = %outcome.backend,
                bytes_to_backend = outcome.bytes_to_backend,
                bytes_from_backend = outcome.bytes_from_backend,
                finished_first = ?outcome.finished_first,
                "Connection closed"
            );
        }
        Err(e) => {
            stats.record_failure(&e);
            error!(
                conn_id = %conn_id,
                stage = %e.stage(),
                error = %e,
                "Connection failed"
            );
        }
    }
}
