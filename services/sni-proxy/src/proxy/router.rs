//! Route table and backend resolution.
//!
//! Maps SNI hostnames to backend addresses. The relay only sees the
//! [`BackendResolver`] contract; [`RouteTable`] is the in-process
//! implementation used by the binary.
//!
//! - Exact hostname match only (no wildcards)
//! - Hostnames normalized to lowercase, trailing dot trimmed
//! - Several backends per hostname are selected round-robin
//! - Updates are applied atomically and never disturb in-flight lookups

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by a backend resolver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No route exists for the hostname.
    #[error("no route for hostname '{0}'")]
    UnknownHost(String),

    /// A route exists but lists no backends.
    #[error("route for '{0}' has no backends")]
    NoBackends(String),

    /// The resolver returned an address that cannot be dialed.
    #[error(transparent)]
    InvalidBackend(#[from] super::backend::BackendAddrError),

    /// Lookup failed in the resolver itself.
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Hostname to backend lookup used by the relay.
///
/// Implementations must be safe for concurrent lookups from many
/// connection tasks.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    /// Resolve a hostname to a URL-like backend address.
    async fn resolve(&self, hostname: &str) -> Result<String, ResolveError>;
}

/// A single hostname route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hostname: String,
    pub backends: Vec<String>,
}

impl Route {
    /// Create a route, normalizing the hostname.
    pub fn new(hostname: &str, backends: Vec<String>) -> Self {
        Self {
            hostname: Self::normalize_hostname(hostname),
            backends,
        }
    }

    /// Normalize a hostname for matching.
    ///
    /// - Convert to lowercase
    /// - Trim trailing dot
    pub fn normalize_hostname(hostname: &str) -> String {
        hostname.to_lowercase().trim_end_matches('.').to_string()
    }
}

/// Route plus its round-robin position.
#[derive(Debug)]
struct RouteEntry {
    route: Route,
    rr_counter: AtomicUsize,
}

impl RouteEntry {
    fn new(route: Route) -> Self {
        Self {
            route,
            rr_counter: AtomicUsize::new(0),
        }
    }

    fn next_backend(&self) -> Option<&str> {
        let backends = &self.route.backends;
        if backends.is_empty() {
            return None;
        }
        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % backends.len();
        Some(backends[idx].as_str())
    }
}

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug, Default)]
struct RouteSnapshot {
    by_hostname: HashMap<String, Arc<RouteEntry>>,
}

impl RouteSnapshot {
    fn from_routes(routes: Vec<Route>) -> Self {
        let by_hostname = routes
            .into_iter()
            .map(|route| (route.hostname.clone(), Arc::new(RouteEntry::new(route))))
            .collect();
        Self { by_hostname }
    }

    fn with_upsert(&self, route: Route) -> Self {
        let mut by_hostname = self.by_hostname.clone();
        by_hostname.insert(route.hostname.clone(), Arc::new(RouteEntry::new(route)));
        Self { by_hostname }
    }

    fn without(&self, hostname: &str) -> Self {
        let mut by_hostname = self.by_hostname.clone();
        by_hostname.remove(hostname);
        Self { by_hostname }
    }
}

/// Route table managing all active routes.
///
/// Uses ArcSwap for lock-free atomic config updates.
/// Readers get consistent snapshots without blocking.
/// Writers atomically swap in new snapshots.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Create a route table holding `routes`.
    pub fn with_routes(routes: Vec<Route>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::from_routes(routes)),
        }
    }

    /// Replace the entire route table in a single pointer swap.
    pub fn update(&self, routes: Vec<Route>) {
        let route_count = routes.len();
        self.snapshot
            .store(Arc::new(RouteSnapshot::from_routes(routes)));
        info!(route_count = route_count, "Route table updated atomically");
    }

    /// Add or replace a single route.
    pub fn upsert(&self, route: Route) {
        self.snapshot.rcu(|current| current.with_upsert(route.clone()));
    }

    /// Remove a route by hostname.
    pub fn remove(&self, hostname: &str) {
        let hostname = Route::normalize_hostname(hostname);
        self.snapshot.rcu(|current| current.without(&hostname));
    }

    /// Get a route by hostname.
    pub fn get(&self, hostname: &str) -> Option<Route> {
        let hostname = Route::normalize_hostname(hostname);
        self.snapshot
            .load()
            .by_hostname
            .get(&hostname)
            .map(|entry| entry.route.clone())
    }

    /// Pick the next backend for a hostname.
    pub fn lookup(&self, hostname: &str) -> Result<String, ResolveError> {
        let normalized = Route::normalize_hostname(hostname);
        let snapshot = self.snapshot.load();

        let entry = snapshot
            .by_hostname
            .get(&normalized)
            .ok_or_else(|| ResolveError::UnknownHost(normalized.clone()))?;

        let backend = entry
            .next_backend()
            .ok_or_else(|| ResolveError::NoBackends(normalized.clone()))?;

        debug!(hostname = %normalized, backend = %backend, "Route matched by SNI");
        Ok(backend.to_string())
    }

    /// Get the total number of routes.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_hostname.len()
    }

    /// Check if the route table is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().by_hostname.is_empty()
    }

    /// Get all configured hostnames.
    pub fn hostnames(&self) -> Vec<String> {
        self.snapshot.load().by_hostname.keys().cloned().collect()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendResolver for RouteTable {
    async fn resolve(&self, hostname: &str) -> Result<String, ResolveError> {
        self.lookup(hostname)
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;
