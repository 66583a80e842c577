//! Remote cluster registry fed by cluster secrets.
//!
//! Each secret maps cluster IDs to the opaque credentials used to reach that
//! cluster. Reconciling a secret turns the difference against what the secret
//! declared before into [`ClusterEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::config_store::{ConfigKey, Kind};
use crate::model::push_request::{PushRequest, TriggerReason};
use crate::server::DiscoveryServer;

/// A remote cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Cluster ID.
    pub id: String,
    /// `namespace/name` of the secret that declared the cluster.
    pub secret: String,
    /// Credentials for reaching the cluster's API server.
    pub credentials: Vec<u8>,
}

/// A change to the set of remote clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A cluster was declared.
    Added(Arc<Cluster>),
    /// A cluster's credentials changed.
    Updated {
        /// The previous cluster.
        old: Arc<Cluster>,
        /// The new cluster.
        new: Arc<Cluster>,
    },
    /// A cluster is no longer declared.
    Removed(Arc<Cluster>),
}

impl ClusterEvent {
    /// The cluster the event is about, after the change.
    pub fn cluster(&self) -> &Arc<Cluster> {
        match self {
            ClusterEvent::Added(c) | ClusterEvent::Removed(c) => c,
            ClusterEvent::Updated { new, .. } => new,
        }
    }
}

/// Clusters keyed by the secret that declared them.
#[derive(Debug, Default)]
pub struct ClusterStore {
    by_secret: HashMap<String, BTreeMap<String, Arc<Cluster>>>,
}

impl ClusterStore {
    /// Look up a cluster by ID.
    pub fn get(&self, cluster_id: &str) -> Option<&Arc<Cluster>> {
        self.by_secret
            .values()
            .find_map(|clusters| clusters.get(cluster_id))
    }

    /// The secret that declared a cluster.
    fn owner(&self, cluster_id: &str) -> Option<&str> {
        self.by_secret
            .iter()
            .find(|(_, clusters)| clusters.contains_key(cluster_id))
            .map(|(secret, _)| secret.as_str())
    }

    /// Number of known clusters.
    pub fn len(&self) -> usize {
        self.by_secret.values().map(BTreeMap::len).sum()
    }

    /// Returns true if no cluster is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// IDs of every known cluster, sorted.
    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .by_secret
            .values()
            .flat_map(|clusters| clusters.keys().cloned())
            .collect();
        ids.sort();
        ids
    }
}

/// Reconciles cluster secrets into the cluster store.
#[derive(Debug)]
pub struct SecretController {
    local_cluster: String,
    store: Mutex<ClusterStore>,
    events: mpsc::UnboundedSender<ClusterEvent>,
}

impl SecretController {
    /// Create a controller. Secrets naming `local_cluster` are ignored for
    /// that entry; the local cluster is never managed through a secret.
    pub fn new(local_cluster: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            local_cluster: local_cluster.into(),
            store: Mutex::new(ClusterStore::default()),
            events,
        };
        (controller, rx)
    }

    fn store(&self) -> MutexGuard<'_, ClusterStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to the current cluster store.
    pub fn with_clusters<T>(&self, f: impl FnOnce(&ClusterStore) -> T) -> T {
        f(&self.store())
    }

    /// Reconcile a created or updated secret.
    pub fn add_secret(&self, secret: &str, data: &BTreeMap<String, Vec<u8>>) -> Vec<ClusterEvent> {
        let mut store = self.store();
        let previous = store.by_secret.remove(secret).unwrap_or_default();
        let mut current = BTreeMap::new();
        let mut events = Vec::new();

        for (cluster_id, credentials) in data {
            if *cluster_id == self.local_cluster {
                info!(secret, cluster_id = cluster_id.as_str(), "ignoring secret for the local cluster");
                continue;
            }
            if let Some(owner) = store.owner(cluster_id) {
                warn!(secret, cluster_id = cluster_id.as_str(), owner, "cluster already declared by another secret");
                continue;
            }
            match previous.get(cluster_id) {
                Some(old) if old.credentials == *credentials => {
                    current.insert(cluster_id.clone(), Arc::clone(old));
                }
                Some(old) => {
                    let new = Arc::new(Cluster {
                        id: cluster_id.clone(),
                        secret: secret.to_string(),
                        credentials: credentials.clone(),
                    });
                    info!(secret, cluster_id = cluster_id.as_str(), "cluster credentials updated");
                    events.push(ClusterEvent::Updated {
                        old: Arc::clone(old),
                        new: Arc::clone(&new),
                    });
                    current.insert(cluster_id.clone(), new);
                }
                None => {
                    let cluster = Arc::new(Cluster {
                        id: cluster_id.clone(),
                        secret: secret.to_string(),
                        credentials: credentials.clone(),
                    });
                    info!(secret, cluster_id = cluster_id.as_str(), "cluster added");
                    events.push(ClusterEvent::Added(Arc::clone(&cluster)));
                    current.insert(cluster_id.clone(), cluster);
                }
            }
        }

        for (cluster_id, old) in previous {
            if !current.contains_key(&cluster_id) {
                info!(secret, cluster_id = cluster_id.as_str(), "cluster removed");
                events.push(ClusterEvent::Removed(old));
            }
        }

        if !current.is_empty() {
            store.by_secret.insert(secret.to_string(), current);
        }
        drop(store);
        self.emit(&events);
        events
    }

    /// Reconcile a deleted secret.
    pub fn delete_secret(&self, secret: &str) -> Vec<ClusterEvent> {
        let removed = self.store().by_secret.remove(secret).unwrap_or_default();
        let events: Vec<ClusterEvent> = removed
            .into_values()
            .map(|cluster| {
                info!(secret, cluster_id = cluster.id.as_str(), "cluster removed");
                ClusterEvent::Removed(cluster)
            })
            .collect();
        self.emit(&events);
        events
    }

    fn emit(&self, events: &[ClusterEvent]) {
        for event in events {
            let _ = self.events.send(event.clone());
        }
    }
}

impl DiscoveryServer {
    /// Push everything whenever the set of remote clusters changes.
    pub fn watch_clusters(&self, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        let server = self.clone();
        let stop: CancellationToken = self.shutdown_token().clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                let cluster = event.cluster();
                let (namespace, name) = cluster
                    .secret
                    .split_once('/')
                    .unwrap_or(("", cluster.secret.as_str()));
                server.config_update(PushRequest::for_configs(
                    TriggerReason::ClusterUpdate,
                    [ConfigKey::new(Kind::Secret, name, namespace)],
                ));
            }
        });
    }
}
