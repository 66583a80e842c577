//! Startup configuration for the discovery server binary.
//!
//! The file is JSON:
//!
//! ```json
//! {
//!   "server": { "debounce_after": 100, "enable_flow_control": true },
//!   "configs": [
//!     { "meta": { "name": "reviews", "namespace": "default" },
//!       "spec": { "Service": { "hostname": "reviews.default.svc.cluster.local",
//!                              "ports": [{ "name": "http", "port": 9080 }] } } }
//!   ]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use xds_server::{Config, ConfigStore, MemoryStore, ServerConfig};

use crate::error::{Error, Result};

/// Server settings and the initial contents of the configuration store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Bootstrap {
    /// Discovery server settings.
    pub server: ServerConfig,
    /// Entries loaded into the store at startup.
    pub configs: Vec<Config>,
}

impl Bootstrap {
    /// Read a bootstrap file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    /// Parse a bootstrap document.
    pub fn from_json(contents: &str) -> Result<Self> {
        let bootstrap: Bootstrap = serde_json::from_str(contents)
            .map_err(|e| Error::Config(format!("parsing bootstrap: {e}")))?;
        bootstrap.server.validate()?;
        Ok(bootstrap)
    }

    /// Create a store holding the configured entries.
    pub fn store(&self) -> Result<Arc<MemoryStore>> {
        let store = Arc::new(MemoryStore::new());
        for config in &self.configs {
            store.create(config.clone())?;
        }
        Ok(store)
    }
}
