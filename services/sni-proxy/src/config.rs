//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{
    ListenerConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};

const DEFAULT_LISTEN_ADDR: &str = "[::]:443";

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// JSON route file.
    pub routes_file: PathBuf,

    /// Poll interval for route file changes; `None` disables reloading.
    pub routes_reload_interval: Option<Duration>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Time allowed for the client to send its ClientHello.
    pub handshake_timeout: Option<Duration>,

    /// Time allowed for connecting to a backend.
    pub connect_timeout: Option<Duration>,

    /// Per-read idle timeout while relaying.
    pub idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("SNI_PROXY_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("SNI_PROXY_LISTEN_ADDR must be a socket address (example: [::]:443).")?;

        let routes_file = lookup("SNI_PROXY_ROUTES_FILE")
            .map(PathBuf::from)
            .context("Missing route file. Set SNI_PROXY_ROUTES_FILE.")?;

        let routes_reload_interval = millis(&lookup, "SNI_PROXY_ROUTES_RELOAD_MS", None)?;

        let max_connections: usize = lookup("SNI_PROXY_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("SNI_PROXY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let handshake_timeout = millis(
            &lookup,
            "SNI_PROXY_HANDSHAKE_TIMEOUT_MS",
            Some(DEFAULT_HANDSHAKE_TIMEOUT),
        )?;
        let connect_timeout = millis(
            &lookup,
            "SNI_PROXY_CONNECT_TIMEOUT_MS",
            Some(DEFAULT_CONNECT_TIMEOUT),
        )?;
        let idle_timeout = millis(&lookup, "SNI_PROXY_IDLE_TIMEOUT_MS", None)?;

        let log_level = lookup("SNI_PROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            routes_file,
            routes_reload_interval,
            max_connections,
            handshake_timeout,
            connect_timeout,
            idle_timeout,
            log_level,
        })
    }

    /// Listener configuration derived from this config.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr)
            .handshake_timeout(self.handshake_timeout)
            .connect_timeout(self.connect_timeout)
            .idle_timeout(self.idle_timeout);
        config.max_connections = self.max_connections;
        config
    }
}

/// Read a millisecond duration; `0` means disabled.
fn millis<F>(lookup: &F, key: &str, default: Option<Duration>) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}
