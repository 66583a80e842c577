//! WorkloadEntry auto-registration for proxies that ask for it.
//!
//! A proxy whose metadata names an auto-registration group gets a
//! WorkloadEntry named after the group and its IP. Connecting marks the
//! entry connected and records which connection owns it; disconnecting marks
//! it disconnected, but only if no newer connection took it over.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::config_store::{Config, ConfigKey, ConfigSpec, ConfigStore, Kind};
use crate::model::proxy::Proxy;
use crate::model::service::WorkloadEntry;

/// Annotation holding the connect time, in milliseconds since the epoch.
pub const CONNECTED_AT: &str = "workload-controller/connected-at";
/// Annotation holding the disconnect time, in milliseconds since the epoch.
pub const DISCONNECTED_AT: &str = "workload-controller/disconnected-at";
/// Annotation naming the connection that owns the entry.
pub const CONNECTION: &str = "workload-controller/connection";
/// Label naming the group an entry was registered from.
pub const GROUP_LABEL: &str = "workload-controller/group";

/// Maintains WorkloadEntries for auto-registering proxies.
#[derive(Clone)]
pub struct WorkloadRegistrar {
    store: Arc<dyn ConfigStore>,
}

impl std::fmt::Debug for WorkloadRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadRegistrar").finish_non_exhaustive()
    }
}

impl WorkloadRegistrar {
    /// Create a registrar writing to `store`.
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// Name of the entry a proxy registers under.
    pub fn entry_name(group: &str, ip: &str) -> String {
        format!("{group}-{}", ip.replace(['.', ':'], "-"))
    }

    fn key(proxy: &Proxy) -> Option<ConfigKey> {
        let group = &proxy.metadata.auto_register_group;
        if group.is_empty() {
            return None;
        }
        Some(ConfigKey::new(
            Kind::WorkloadEntry,
            Self::entry_name(group, proxy.primary_ip()),
            &proxy.config_namespace,
        ))
    }

    /// Create or mark connected the proxy's entry. A no-op for proxies
    /// without an auto-registration group.
    pub fn register(&self, proxy: &Proxy, con_id: &str, connected_at: SystemTime) -> Result<()> {
        let Some(key) = Self::key(proxy) else {
            return Ok(());
        };
        let stamp = millis(connected_at);

        if self.store.get(key.kind, &key.name, &key.namespace).is_none() {
            let mut config = Config::new(
                &key.name,
                &key.namespace,
                ConfigSpec::WorkloadEntry(WorkloadEntry {
                    address: proxy.primary_ip().to_string(),
                    labels: proxy.labels.clone(),
                    service_account: proxy.metadata.service_account.clone(),
                    network: proxy.metadata.network.clone(),
                    locality: proxy
                        .locality
                        .as_ref()
                        .map(|l| format!("{}/{}/{}", l.region, l.zone, l.sub_zone))
                        .unwrap_or_default(),
                    ..Default::default()
                }),
            );
            config
                .meta
                .labels
                .insert(GROUP_LABEL.to_string(), proxy.metadata.auto_register_group.clone());
            config.meta.annotations.insert(CONNECTED_AT.to_string(), stamp.clone());
            config.meta.annotations.insert(CONNECTION.to_string(), con_id.to_string());
            match self.store.create(config) {
                Ok(_) => {
                    info!(entry = %key, con_id, "registered workload entry");
                    return Ok(());
                }
                Err(Error::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.store.patch(&key, &mut |config| {
            let annotations = &mut config.meta.annotations;
            annotations.insert(CONNECTED_AT.to_string(), stamp.clone());
            annotations.insert(CONNECTION.to_string(), con_id.to_string());
            annotations.remove(DISCONNECTED_AT);
        })?;
        debug!(entry = %key, con_id, "marked workload entry connected");
        Ok(())
    }

    /// Mark the proxy's entry disconnected, unless another connection has
    /// taken it over since.
    pub fn unregister(&self, proxy: &Proxy, con_id: &str, disconnected_at: SystemTime) -> Result<()> {
        let Some(key) = Self::key(proxy) else {
            return Ok(());
        };
        let Some(current) = self.store.get(key.kind, &key.name, &key.namespace) else {
            return Ok(());
        };
        if current.meta.annotations.get(CONNECTION).map(String::as_str) != Some(con_id) {
            debug!(entry = %key, con_id, "workload entry owned by a newer connection");
            return Ok(());
        }

        let stamp = millis(disconnected_at);
        self.store.patch(&key, &mut |config| {
            let annotations = &mut config.meta.annotations;
            annotations.remove(CONNECTED_AT);
            annotations.insert(DISCONNECTED_AT.to_string(), stamp.clone());
        })?;
        info!(entry = %key, con_id, "marked workload entry disconnected");
        Ok(())
    }
}

fn millis(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Node;
    use crate::model::config_store::MemoryStore;
    use serde_json::json;

    fn proxy() -> Proxy {
        let node = Node::new("sidecar~10.1.2.3~vm-1.apps~apps.svc.cluster.local")
            .with_metadata("AUTO_REGISTER_GROUP", json!("billing"))
            .with_metadata("LABELS", json!({"app": "billing"}));
        Proxy::from_node(&node).unwrap()
    }

    #[test]
    fn connect_then_disconnect() {
        let store = Arc::new(MemoryStore::new());
        let registrar = WorkloadRegistrar::new(store.clone());
        let proxy = proxy();

        registrar.register(&proxy, "con-1", SystemTime::now()).unwrap();
        let entry = store
            .get(Kind::WorkloadEntry, "billing-10-1-2-3", "apps")
            .unwrap();
        assert_eq!(entry.meta.annotations[CONNECTION], "con-1");
        assert!(entry.meta.annotations.contains_key(CONNECTED_AT));
        match &entry.spec {
            ConfigSpec::WorkloadEntry(w) => {
                assert_eq!(w.address, "10.1.2.3");
                assert_eq!(w.labels["app"], "billing");
            }
            other => panic!("unexpected spec {other:?}"),
        }

        registrar.unregister(&proxy, "con-1", SystemTime::now()).unwrap();
        let entry = store
            .get(Kind::WorkloadEntry, "billing-10-1-2-3", "apps")
            .unwrap();
        assert!(entry.meta.annotations.contains_key(DISCONNECTED_AT));
        assert!(!entry.meta.annotations.contains_key(CONNECTED_AT));
    }

    #[test]
    fn stale_disconnect_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let registrar = WorkloadRegistrar::new(store.clone());
        let proxy = proxy();

        registrar.register(&proxy, "con-1", SystemTime::now()).unwrap();
        registrar.register(&proxy, "con-2", SystemTime::now()).unwrap();
        registrar.unregister(&proxy, "con-1", SystemTime::now()).unwrap();

        let entry = store
            .get(Kind::WorkloadEntry, "billing-10-1-2-3", "apps")
            .unwrap();
        assert_eq!(entry.meta.annotations[CONNECTION], "con-2");
        assert!(!entry.meta.annotations.contains_key(DISCONNECTED_AT));
    }

    #[test]
    fn proxies_without_group_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let registrar = WorkloadRegistrar::new(store.clone());
        let node = Node::new("sidecar~10.1.2.4~pod.apps~apps.svc.cluster.local");
        let proxy = Proxy::from_node(&node).unwrap();
        registrar.register(&proxy, "con-1", SystemTime::now()).unwrap();
        assert!(store.list(Kind::WorkloadEntry, None).is_empty());
    }
}
