//! Route file loading and reload.
//!
//! Routes are read from a JSON file:
//!
//! ```json
//! {
//!   "routes": [
//!     { "hostname": "example.com", "backends": ["http://10.0.0.5:8443"] }
//!   ]
//! }
//! ```
//!
//! Every backend is validated as a dialable address when the file is
//! loaded, so a bad entry is caught before it can fail a connection.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::proxy::{Backend, Route, RouteTable};

/// On-disk route file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteFile {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

/// One route in the route file.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    pub hostname: String,
    #[serde(default)]
    pub backends: Vec<String>,
}

impl RouteFile {
    /// Parse and validate route file contents.
    pub fn parse(content: &str) -> Result<Self> {
        let file: RouteFile = serde_json::from_str(content).context("Invalid route file JSON")?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.routes {
            let hostname = Route::normalize_hostname(&entry.hostname);
            if hostname.is_empty() {
                bail!("Route with empty hostname");
            }
            if !seen.insert(hostname.clone()) {
                bail!("Duplicate route for hostname '{}'", hostname);
            }
            for backend in &entry.backends {
                Backend::parse(backend)
                    .with_context(|| format!("Invalid backend for '{}'", hostname))?;
            }
        }
        Ok(())
    }

    /// Convert entries into route table routes.
    pub fn into_routes(self) -> Vec<Route> {
        self.routes
            .into_iter()
            .map(|entry| Route::new(&entry.hostname, entry.backends))
            .collect()
    }
}

/// Load routes from a JSON file.
pub fn load_routes(path: &Path) -> Result<Vec<Route>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read route file {}", path.display()))?;
    let file = RouteFile::parse(&content)
        .with_context(|| format!("Failed to load route file {}", path.display()))?;

    info!(
        path = %path.display(),
        route_count = file.routes.len(),
        "Loaded routes"
    );

    Ok(file.into_routes())
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Watches a route file and swaps new routes into the table when it changes.
pub struct RouteReloader {
    path: PathBuf,
    table: Arc<RouteTable>,
    last_modified: Option<SystemTime>,
}

impl RouteReloader {
    /// Create a reloader; the current file state counts as already applied.
    pub fn new(path: PathBuf, table: Arc<RouteTable>) -> Self {
        let last_modified = modified_at(&path);
        Self {
            path,
            table,
            last_modified,
        }
    }

    /// Reload if the file changed since the last check.
    ///
    /// Returns whether new routes were applied. An unreadable or invalid file
    /// leaves the current routes in place.
    pub fn check(&mut self) -> bool {
        let modified = modified_at(&self.path);
        if modified == self.last_modified {
            return false;
        }
        self.last_modified = modified;

        match load_routes(&self.path) {
            Ok(routes) => {
                self.table.update(routes);
                true
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %format!("{e:#}"),
                    "Route reload failed; keeping current routes"
                );
                false
            }
        }
    }

    /// Poll the file forever.
    pub async fn run(mut self, interval: Duration) {
        debug!(
            path = %self.path.display(),
            interval_ms = interval.as_millis() as u64,
            "Route reload loop started"
        );
        loop {
            tokio::time::sleep(interval).await;
            self.check();
        }
    }
}
