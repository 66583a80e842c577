//! Registry of live connections and the observers notified about them.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::Connection;
use crate::message::ErrorDetail;

/// Callbacks for connection lifecycle events.
///
/// Every method has a no-op default so observers implement only what they
/// need. Callbacks run on the connection's own task and must not block.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// A connection finished initialization and is about to be served.
    fn on_connect(&self, _con: &Connection) {}

    /// A connection ended. Called exactly once per connection.
    fn on_disconnect(&self, _con: &Connection) {}

    /// The proxy rejected a response.
    fn on_nack(&self, _con: &Connection, _type_url: &str, _error: &ErrorDetail) {}
}

/// Live connections, indexed by connection ID and by the proxy's cluster.
///
/// Fan-out iterates a snapshot so no map shard lock is held while pushes are
/// queued.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    by_cluster: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn store(&self, con: Arc<Connection>) {
        let cluster = con.proxy().cluster_id.clone();
        self.by_cluster
            .entry(cluster)
            .or_default()
            .insert(con.id().to_string());
        self.connections.insert(con.id().to_string(), con);
    }

    /// Look up a connection by ID.
    pub fn get(&self, con_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(con_id).map(|c| Arc::clone(c.value()))
    }

    /// Remove a connection. Returns the removed connection, if any.
    pub fn delete(&self, con_id: &str) -> Option<Arc<Connection>> {
        let (_, con) = self.connections.remove(con_id)?;
        let cluster = con.proxy().cluster_id.clone();
        self.by_cluster.remove_if_mut(&cluster, |_, ids| {
            ids.remove(con_id);
            ids.is_empty()
        });
        Some(con)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// A snapshot of every live connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Connections whose proxy runs in the given cluster.
    pub fn by_cluster(&self, cluster_id: &str) -> Vec<Arc<Connection>> {
        let Some(ids) = self.by_cluster.get(cluster_id).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }
}
