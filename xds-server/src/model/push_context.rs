//! The immutable snapshot every push is computed from.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::message::Resource;
use crate::model::config_store::{ConfigSpec, ConfigStore, Kind};
use crate::model::envoy_filter::{ApplyTo, EnvoyFilterWrapper, PatchWrapper};
use crate::model::policy::{MtlsMode, ScopedPolicy, effective_mtls_mode};
use crate::model::proxy::Proxy;
use crate::model::push_request::PushRequest;
use crate::model::service::{Protocol, Service, ServiceInstance};
use crate::model::Labels;

/// Mesh-wide settings a push context is built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSettings {
    /// Namespace whose filters and policies apply everywhere.
    pub root_namespace: String,
    /// SPIFFE trust domain.
    pub trust_domain: String,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            root_namespace: "mesh-system".to_string(),
            trust_domain: "cluster.local".to_string(),
        }
    }
}

/// The EnvoyFilters that apply to one proxy, ordered for application.
#[derive(Debug, Clone, Default)]
pub struct MergedEnvoyFilters {
    /// `namespace/name` of each contributing filter, in application order.
    pub keys: Vec<String>,
    /// Patches by level, in application order.
    pub patches: BTreeMap<ApplyTo, Vec<Arc<PatchWrapper>>>,
}

impl MergedEnvoyFilters {
    /// Patches at one level.
    pub fn patches(&self, apply_to: ApplyTo) -> &[Arc<PatchWrapper>] {
        self.patches
            .get(&apply_to)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// An immutable snapshot of the mesh configuration.
///
/// A new snapshot is built for every push that carries configuration
/// changes and shared read-only between all connections.
#[derive(Debug, Default)]
pub struct PushContext {
    version: String,
    mesh: MeshSettings,
    services: BTreeMap<String, Arc<Service>>,
    instances_by_service: HashMap<String, Vec<ServiceInstance>>,
    instances_by_ip: HashMap<String, Vec<ServiceInstance>>,
    envoy_filters: Vec<Arc<EnvoyFilterWrapper>>,
    peer_authentication: Vec<ScopedPolicy>,
    resources: HashMap<String, BTreeMap<String, Resource>>,
}

impl PushContext {
    /// Build a snapshot from the current contents of the store.
    pub fn init(store: &dyn ConfigStore, mesh: MeshSettings, version: impl Into<String>) -> Self {
        let mut push = PushContext {
            version: version.into(),
            mesh,
            ..Default::default()
        };

        for config in store.list(Kind::Service, None) {
            if let ConfigSpec::Service(service) = &config.spec {
                let mut service = service.clone();
                if service.namespace.is_empty() {
                    service.namespace = config.meta.namespace.clone();
                }
                for port in &mut service.ports {
                    if port.protocol == Protocol::Unsupported {
                        port.protocol = Protocol::from_port_name(&port.name);
                    }
                }
                push.services
                    .insert(service.hostname.clone(), Arc::new(service));
            }
        }

        for config in store.list(Kind::WorkloadEntry, None) {
            let ConfigSpec::WorkloadEntry(workload) = &config.spec else {
                continue;
            };
            for service in push.services.values() {
                if service.namespace != config.meta.namespace {
                    continue;
                }
                for instance in ServiceInstance::for_workload(service, workload) {
                    push.instances_by_ip
                        .entry(instance.endpoint.address.clone())
                        .or_default()
                        .push(instance.clone());
                    push.instances_by_service
                        .entry(service.hostname.clone())
                        .or_default()
                        .push(instance);
                }
            }
        }

        for config in store.list(Kind::EnvoyFilter, None) {
            if let ConfigSpec::EnvoyFilter(filter) = &config.spec {
                push.envoy_filters
                    .push(Arc::new(EnvoyFilterWrapper::convert(&config.meta, filter)));
            }
        }
        push.envoy_filters.sort_by(|a, b| {
            (a.priority, a.created, &a.namespace, &a.name)
                .cmp(&(b.priority, b.created, &b.namespace, &b.name))
        });

        for config in store.list(Kind::PeerAuthentication, None) {
            if let ConfigSpec::PeerAuthentication(policy) = &config.spec {
                push.peer_authentication.push(ScopedPolicy {
                    namespace: config.meta.namespace.clone(),
                    policy: policy.clone(),
                });
            }
        }

        push
    }

    /// Attach pre-built resources of one type, served by the snapshot
    /// generator.
    pub fn with_resources(mut self, type_url: impl Into<String>, resources: Vec<Resource>) -> Self {
        let entry = self.resources.entry(type_url.into()).or_default();
        for resource in resources {
            entry.insert(resource.name.clone(), resource);
        }
        self
    }

    /// Version stamped on every response built from this snapshot.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Mesh-wide settings.
    pub fn mesh(&self) -> &MeshSettings {
        &self.mesh
    }

    /// All services, ordered by hostname.
    pub fn services(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    /// Look up a service.
    pub fn service(&self, hostname: &str) -> Option<&Arc<Service>> {
        self.services.get(hostname)
    }

    /// Instances serving a service port.
    pub fn instances(&self, hostname: &str, port: u16) -> Vec<&ServiceInstance> {
        self.instances_by_service
            .get(hostname)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| i.service_port.port == port)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instances whose workload has the given IP.
    pub fn instances_by_ip(&self, ip: &str) -> &[ServiceInstance] {
        self.instances_by_ip
            .get(ip)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Pre-built resources of one type.
    pub fn resources(&self, type_url: &str) -> Option<&BTreeMap<String, Resource>> {
        self.resources.get(type_url)
    }

    /// Effective inbound mTLS mode for a workload port.
    pub fn mtls_mode(&self, namespace: &str, labels: &Labels, port: u16) -> MtlsMode {
        effective_mtls_mode(
            &self.peer_authentication,
            &self.mesh.root_namespace,
            namespace,
            labels,
            port,
        )
    }

    /// EnvoyFilters from the root namespace and the proxy's namespace that
    /// select the proxy, merged in application order.
    pub fn envoy_filters(&self, proxy: &Proxy) -> Option<MergedEnvoyFilters> {
        let mut merged = MergedEnvoyFilters::default();
        for filter in &self.envoy_filters {
            let in_scope = filter.namespace == self.mesh.root_namespace
                || filter.namespace == proxy.config_namespace;
            if !in_scope || !filter.selects(&proxy.labels) {
                continue;
            }
            merged.keys.push(filter.key());
            for (apply_to, patches) in &filter.patches {
                merged
                    .patches
                    .entry(*apply_to)
                    .or_default()
                    .extend(patches.iter().cloned());
            }
        }
        (!merged.keys.is_empty()).then_some(merged)
    }

    /// Decide whether a push request can affect a proxy.
    pub fn proxy_needs_push(&self, proxy: &Proxy, request: &PushRequest) -> bool {
        if request.configs_updated.is_empty() {
            return true;
        }
        request.configs_updated.iter().any(|key| match key.kind {
            Kind::Service | Kind::WorkloadEntry | Kind::Secret => true,
            Kind::EnvoyFilter | Kind::PeerAuthentication => {
                key.namespace == proxy.config_namespace
                    || key.namespace == self.mesh.root_namespace
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Node;
    use crate::model::config_store::{Config, ConfigKey, MemoryStore};
    use crate::model::envoy_filter::{EnvoyFilter, WorkloadSelector};
    use crate::model::push_request::TriggerReason;
    use crate::model::service::{Port, WorkloadEntry};

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create(Config::new(
                "reviews",
                "default",
                ConfigSpec::Service(Service {
                    hostname: "reviews.default.svc.cluster.local".into(),
                    address: "10.96.0.10".into(),
                    ports: vec![Port::new("http", 9080)],
                    selector: labels(&[("app", "reviews")]),
                    ..Default::default()
                }),
            ))
            .unwrap();
        store
            .create(Config::new(
                "reviews-vm",
                "default",
                ConfigSpec::WorkloadEntry(WorkloadEntry {
                    address: "10.0.0.7".into(),
                    labels: labels(&[("app", "reviews")]),
                    ..Default::default()
                }),
            ))
            .unwrap();
        store
    }

    fn proxy(namespace: &str, app: &str) -> Proxy {
        let node = Node::new(format!("sidecar~10.0.0.7~{app}.{namespace}~{namespace}.svc.cluster.local"))
            .with_metadata("LABELS", serde_json::json!({"app": app}));
        Proxy::from_node(&node).unwrap()
    }

    #[test]
    fn indexes_instances() {
        let push = PushContext::init(&store(), MeshSettings::default(), "v1");
        assert_eq!(push.version(), "v1");
        assert_eq!(push.service("reviews.default.svc.cluster.local").unwrap().namespace, "default");
        assert_eq!(push.instances("reviews.default.svc.cluster.local", 9080).len(), 1);
        assert!(push.instances("reviews.default.svc.cluster.local", 80).is_empty());
        assert_eq!(push.instances_by_ip("10.0.0.7").len(), 1);

        let mut proxy = proxy("default", "reviews");
        proxy.set_service_instances(&push);
        assert_eq!(proxy.service_instances.len(), 1);
    }

    #[test]
    fn envoy_filters_ordered_and_scoped() {
        let store = store();
        let filter = |priority: i32, selector: Option<&[(&str, &str)]>| {
            ConfigSpec::EnvoyFilter(EnvoyFilter {
                workload_selector: selector.map(|s| WorkloadSelector { labels: labels(s) }),
                priority,
                ..Default::default()
            })
        };
        store.create(Config::new("late", "default", filter(0, None))).unwrap();
        store.create(Config::new("mesh", "mesh-system", filter(0, None))).unwrap();
        store.create(Config::new("first", "default", filter(-5, Some(&[("app", "reviews")])))).unwrap();
        store.create(Config::new("other-app", "default", filter(0, Some(&[("app", "ratings")])))).unwrap();
        store.create(Config::new("elsewhere", "prod", filter(0, None))).unwrap();

        let push = PushContext::init(&store, MeshSettings::default(), "v1");
        let merged = push.envoy_filters(&proxy("default", "reviews")).unwrap();
        assert_eq!(merged.keys, vec!["default/first", "default/late", "mesh-system/mesh"]);
    }

    #[test]
    fn namespaced_changes_only_reach_their_namespace() {
        let push = PushContext::init(&store(), MeshSettings::default(), "v1");
        let proxy = proxy("default", "reviews");

        let elsewhere = PushRequest::for_configs(
            TriggerReason::ConfigUpdate,
            [ConfigKey::new(Kind::EnvoyFilter, "f", "prod")],
        );
        assert!(!push.proxy_needs_push(&proxy, &elsewhere));

        let mesh_wide = PushRequest::for_configs(
            TriggerReason::ConfigUpdate,
            [ConfigKey::new(Kind::EnvoyFilter, "f", "mesh-system")],
        );
        assert!(push.proxy_needs_push(&proxy, &mesh_wide));
        assert!(push.proxy_needs_push(&proxy, &PushRequest::full(TriggerReason::GlobalUpdate)));
    }
}
