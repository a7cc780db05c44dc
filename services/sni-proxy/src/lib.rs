pub mod config;
pub mod proxy;
pub mod routes;

pub use proxy::{
    extract_sni, Backend, BackendResolver, ClientHelloRecord, Direction, Listener, ListenerConfig,
    ListenerStats, Relay, RelayConfig, RelayError, RelayOutcome, ResolveError, Route, RouteTable,
    SharedRouteTable, SniConfig, SniError, SniInspector, Stage,
};
