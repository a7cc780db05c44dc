//! SNI passthrough proxy
//!
//! L4 proxy with TLS passthrough and SNI routing.
//!
//! This service:
//! - Loads hostname routes from a JSON file (optionally reloading it)
//! - Accepts TCP connections on the configured listener
//! - Inspects the TLS ClientHello for the SNI hostname
//! - Relays each connection, unmodified, to the routed backend

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sni_proxy::config::Config;
use sni_proxy::routes::{load_routes, RouteReloader};
use sni_proxy::{Listener, RouteTable};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SNI_PROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting SNI proxy");
    info!(
        listen_addr = %config.listen_addr,
        routes_file = %config.routes_file.display(),
        max_connections = config.max_connections,
        handshake_timeout_ms = config.handshake_timeout.map(|d| d.as_millis() as u64),
        connect_timeout_ms = config.connect_timeout.map(|d| d.as_millis() as u64),
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        "Configuration loaded"
    );

    let route_table = Arc::new(RouteTable::with_routes(load_routes(&config.routes_file)?));

    if let Some(interval) = config.routes_reload_interval {
        let reloader = RouteReloader::new(config.routes_file.clone(), Arc::clone(&route_table));
        tokio::spawn(reloader.run(interval));
    }

    let listener = Listener::bind(config.listener_config(), route_table)
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.listen_addr))?;

    // Runs until accepting fails.
    Arc::new(listener).run().await?;
    Ok(())
}
