//! L4 TLS passthrough proxy.
//!
//! This module provides:
//! - TCP listener management
//! - ClientHello parsing for SNI
//! - Hostname to backend resolution
//! - Bidirectional connection relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Relay -> SNI parser -> Resolver -> Backend dial
//!                         |                                    |
//!                         +------ replayed ClientHello --------+
//!                         +------ bidirectional pump ----------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, RouteTable};
//!
//! let route_table = Arc::new(RouteTable::new());
//!
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, route_table).await?);
//! listener.run().await?;
//! ```

mod backend;
mod listener;
mod relay;
mod router;
mod sni;

pub use backend::{Backend, BackendAddrError, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use relay::{Direction, Relay, RelayConfig, RelayError, RelayOutcome, Stage};
pub use router::{BackendResolver, ResolveError, Route, RouteTable, SharedRouteTable};
pub use sni::{
    extract_sni, parse_client_hello, ClientHelloRecord, InspectError, RecordHeader, SniConfig,
    SniError, SniInspector, DEFAULT_HANDSHAKE_TIMEOUT, RECORD_HEADER_LEN,
};
