//! The configuration store interface and an in-memory implementation.
//!
//! The store is the source of truth every push context is built from.
//! Writers go through [`ConfigStore`]; readers that need to react to
//! changes call [`ConfigStore::watch`] and receive typed [`ConfigEvent`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::model::Labels;
use crate::model::envoy_filter::EnvoyFilter;
use crate::model::policy::PeerAuthentication;
use crate::model::service::{Service, WorkloadEntry};

/// The kinds of configuration the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// A [`Service`].
    Service,
    /// A [`WorkloadEntry`].
    WorkloadEntry,
    /// An [`EnvoyFilter`].
    EnvoyFilter,
    /// A [`PeerAuthentication`].
    PeerAuthentication,
    /// A remote cluster secret; only used as a push trigger.
    Secret,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Service => "Service",
            Kind::WorkloadEntry => "WorkloadEntry",
            Kind::EnvoyFilter => "EnvoyFilter",
            Kind::PeerAuthentication => "PeerAuthentication",
            Kind::Secret => "Secret",
        };
        f.write_str(name)
    }
}

/// Identity of a configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    /// Entry kind.
    pub kind: Kind,
    /// Entry name.
    pub name: String,
    /// Entry namespace.
    pub namespace: String,
}

impl ConfigKey {
    /// Create a key.
    pub fn new(kind: Kind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Metadata common to all entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigMeta {
    /// Entry name.
    pub name: String,
    /// Entry namespace.
    pub namespace: String,
    /// Opaque version, assigned by the store on every write.
    #[serde(default)]
    pub resource_version: String,
    /// Store revision at which the entry was created.
    #[serde(default)]
    pub created: u64,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// The typed body of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigSpec {
    /// A service.
    Service(Service),
    /// A workload entry.
    WorkloadEntry(WorkloadEntry),
    /// An EnvoyFilter.
    EnvoyFilter(EnvoyFilter),
    /// A peer authentication policy.
    PeerAuthentication(PeerAuthentication),
}

impl ConfigSpec {
    /// The kind of this spec.
    pub fn kind(&self) -> Kind {
        match self {
            ConfigSpec::Service(_) => Kind::Service,
            ConfigSpec::WorkloadEntry(_) => Kind::WorkloadEntry,
            ConfigSpec::EnvoyFilter(_) => Kind::EnvoyFilter,
            ConfigSpec::PeerAuthentication(_) => Kind::PeerAuthentication,
        }
    }

    /// Decode a spec of the given kind from JSON.
    pub fn from_json(kind: Kind, value: serde_json::Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| Error::Validation(format!("{kind}: {e}"));
        Ok(match kind {
            Kind::Service => ConfigSpec::Service(serde_json::from_value(value).map_err(invalid)?),
            Kind::WorkloadEntry => {
                ConfigSpec::WorkloadEntry(serde_json::from_value(value).map_err(invalid)?)
            }
            Kind::EnvoyFilter => {
                ConfigSpec::EnvoyFilter(serde_json::from_value(value).map_err(invalid)?)
            }
            Kind::PeerAuthentication => {
                ConfigSpec::PeerAuthentication(serde_json::from_value(value).map_err(invalid)?)
            }
            Kind::Secret => {
                return Err(Error::Validation("secrets are not stored as config".into()));
            }
        })
    }
}

/// A configuration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Metadata.
    pub meta: ConfigMeta,
    /// Body.
    pub spec: ConfigSpec,
}

impl Config {
    /// Create an entry.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: ConfigSpec) -> Self {
        Self {
            meta: ConfigMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec,
        }
    }

    /// The key identifying this entry.
    pub fn key(&self) -> ConfigKey {
        ConfigKey::new(self.spec.kind(), &self.meta.name, &self.meta.namespace)
    }
}

/// A change to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    /// An entry was created.
    Added(Arc<Config>),
    /// An entry was replaced.
    Updated {
        /// The previous entry.
        old: Arc<Config>,
        /// The new entry.
        new: Arc<Config>,
    },
    /// An entry was deleted.
    Removed(Arc<Config>),
}

impl ConfigEvent {
    /// Key of the affected entry.
    pub fn key(&self) -> ConfigKey {
        match self {
            ConfigEvent::Added(config) | ConfigEvent::Removed(config) => config.key(),
            ConfigEvent::Updated { new, .. } => new.key(),
        }
    }
}

/// Read/write access to configuration.
pub trait ConfigStore: Send + Sync + 'static {
    /// List entries of a kind, optionally restricted to one namespace,
    /// ordered by key.
    fn list(&self, kind: Kind, namespace: Option<&str>) -> Vec<Arc<Config>>;

    /// Fetch one entry.
    fn get(&self, kind: Kind, name: &str, namespace: &str) -> Option<Arc<Config>>;

    /// Create an entry, returning its resource version.
    fn create(&self, config: Config) -> Result<String>;

    /// Replace an entry. A non-empty `resource_version` on the input must
    /// match the stored one.
    fn update(&self, config: Config) -> Result<String>;

    /// Modify an entry in place.
    fn patch(&self, key: &ConfigKey, apply: &mut dyn FnMut(&mut Config)) -> Result<String>;

    /// Delete an entry. A `resource_version` must match the stored one.
    fn delete(&self, key: &ConfigKey, resource_version: Option<&str>) -> Result<()>;

    /// Subscribe to future changes.
    fn watch(&self) -> mpsc::UnboundedReceiver<ConfigEvent>;
}

/// An in-memory [`ConfigStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: RwLock<BTreeMap<ConfigKey, Arc<Config>>>,
    revision: AtomicU64,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ConfigEvent>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn notify(&self, event: ConfigEvent) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn not_found(key: &ConfigKey) -> Error {
        Error::NotFound {
            kind: key.kind.to_string(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
        }
    }

    fn check_version(key: &ConfigKey, stored: &Config, expected: &str) -> Result<()> {
        if !expected.is_empty() && expected != stored.meta.resource_version {
            return Err(Error::Conflict {
                name: key.to_string(),
                expected: expected.to_string(),
                found: stored.meta.resource_version.clone(),
            });
        }
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn list(&self, kind: Kind, namespace: Option<&str>) -> Vec<Arc<Config>> {
        let configs = self.configs.read().unwrap_or_else(|e| e.into_inner());
        configs
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .map(|(_, config)| Arc::clone(config))
            .collect()
    }

    fn get(&self, kind: Kind, name: &str, namespace: &str) -> Option<Arc<Config>> {
        let configs = self.configs.read().unwrap_or_else(|e| e.into_inner());
        configs.get(&ConfigKey::new(kind, name, namespace)).cloned()
    }

    fn create(&self, mut config: Config) -> Result<String> {
        let key = config.key();
        let stored = {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            if configs.contains_key(&key) {
                return Err(Error::AlreadyExists {
                    kind: key.kind.to_string(),
                    name: key.name,
                    namespace: key.namespace,
                });
            }
            let revision = self.next_revision();
            config.meta.resource_version = revision.to_string();
            config.meta.created = revision;
            let stored = Arc::new(config);
            configs.insert(key, Arc::clone(&stored));
            stored
        };
        let version = stored.meta.resource_version.clone();
        self.notify(ConfigEvent::Added(stored));
        Ok(version)
    }

    fn update(&self, mut config: Config) -> Result<String> {
        let key = config.key();
        let (old, new) = {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            let old = configs.get(&key).cloned().ok_or_else(|| Self::not_found(&key))?;
            Self::check_version(&key, &old, &config.meta.resource_version)?;
            config.meta.resource_version = self.next_revision().to_string();
            config.meta.created = old.meta.created;
            let new = Arc::new(config);
            configs.insert(key, Arc::clone(&new));
            (old, new)
        };
        let version = new.meta.resource_version.clone();
        self.notify(ConfigEvent::Updated { old, new });
        Ok(version)
    }

    fn patch(&self, key: &ConfigKey, apply: &mut dyn FnMut(&mut Config)) -> Result<String> {
        let (old, new) = {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            let old = configs.get(key).cloned().ok_or_else(|| Self::not_found(key))?;
            let mut config = (*old).clone();
            apply(&mut config);
            if config.key() != *key {
                return Err(Error::Validation(format!("patch may not change the key of {key}")));
            }
            config.meta.resource_version = self.next_revision().to_string();
            config.meta.created = old.meta.created;
            let new = Arc::new(config);
            configs.insert(key.clone(), Arc::clone(&new));
            (old, new)
        };
        let version = new.meta.resource_version.clone();
        self.notify(ConfigEvent::Updated { old, new });
        Ok(version)
    }

    fn delete(&self, key: &ConfigKey, resource_version: Option<&str>) -> Result<()> {
        let removed = {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            let stored = configs.get(key).ok_or_else(|| Self::not_found(key))?;
            Self::check_version(key, stored, resource_version.unwrap_or_default())?;
            configs.remove(key).ok_or_else(|| Self::not_found(key))?
        };
        self.notify(ConfigEvent::Removed(removed));
        Ok(())
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<ConfigEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> Config {
        Config::new(
            name,
            "default",
            ConfigSpec::Service(Service {
                hostname: format!("{name}.default.svc.cluster.local"),
                namespace: "default".into(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn create_get_list() {
        let store = MemoryStore::new();
        store.create(service("b")).unwrap();
        store.create(service("a")).unwrap();

        let listed = store.list(Kind::Service, Some("default"));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].meta.name, "a");
        assert!(store.list(Kind::Service, Some("other")).is_empty());
        assert!(store.get(Kind::Service, "a", "default").is_some());
        assert!(matches!(
            store.create(service("a")),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn stale_update_conflicts() {
        let store = MemoryStore::new();
        let v1 = store.create(service("a")).unwrap();

        let mut update = service("a");
        update.meta.resource_version = v1.clone();
        let v2 = store.update(update).unwrap();
        assert_ne!(v1, v2);

        let mut stale = service("a");
        stale.meta.resource_version = v1;
        assert!(matches!(store.update(stale), Err(Error::Conflict { .. })));
    }

    #[test]
    fn patch_keeps_creation_revision() {
        let store = MemoryStore::new();
        store.create(service("a")).unwrap();
        let created = store.get(Kind::Service, "a", "default").unwrap().meta.created;

        let key = ConfigKey::new(Kind::Service, "a", "default");
        store
            .patch(&key, &mut |config| {
                config.meta.annotations.insert("k".into(), "v".into());
            })
            .unwrap();

        let patched = store.get(Kind::Service, "a", "default").unwrap();
        assert_eq!(patched.meta.created, created);
        assert_eq!(patched.meta.annotations["k"], "v");
    }

    #[tokio::test]
    async fn watchers_see_typed_events() {
        let store = MemoryStore::new();
        let mut events = store.watch();

        store.create(service("a")).unwrap();
        store.update(service("a")).unwrap();
        store
            .delete(&ConfigKey::new(Kind::Service, "a", "default"), None)
            .unwrap();

        assert!(matches!(events.recv().await, Some(ConfigEvent::Added(_))));
        assert!(matches!(events.recv().await, Some(ConfigEvent::Updated { .. })));
        match events.recv().await {
            Some(ConfigEvent::Removed(config)) => assert_eq!(config.meta.name, "a"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn spec_from_json_by_kind() {
        let spec = ConfigSpec::from_json(
            Kind::WorkloadEntry,
            serde_json::json!({"address": "10.0.0.9", "labels": {"app": "vm"}}),
        )
        .unwrap();
        assert_eq!(spec.kind(), Kind::WorkloadEntry);
        assert!(ConfigSpec::from_json(Kind::Secret, serde_json::json!({})).is_err());
    }
}
