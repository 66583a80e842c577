//! Shared fixtures for unit tests: a small mesh with an HTTP and a TCP
//! service.

use std::collections::BTreeMap;

use xds_server::model::service::{Port, Service, WorkloadEntry};
use xds_server::{Config, ConfigSpec, ConfigStore, MemoryStore, Node, Proxy, PushContext};
use xds_server::model::push_context::MeshSettings;

pub(crate) const REVIEWS: &str = "reviews.default.svc.cluster.local";
pub(crate) const MYSQL: &str = "mysql.db.svc.cluster.local";

fn labels(app: &str) -> BTreeMap<String, String> {
    [("app".to_string(), app.to_string())].into_iter().collect()
}

/// Build a push context holding the fixture mesh plus `extra` configs,
/// given as `(namespace, name, spec)`.
pub(crate) fn push_context(extra: Vec<(&str, &str, ConfigSpec)>) -> PushContext {
    let store = MemoryStore::new();
    let configs = [
        (
            "default",
            "reviews",
            ConfigSpec::Service(Service {
                hostname: REVIEWS.to_string(),
                namespace: "default".to_string(),
                address: "10.96.0.10".to_string(),
                ports: vec![Port::new("http", 9080)],
                selector: labels("reviews"),
            }),
        ),
        (
            "db",
            "mysql",
            ConfigSpec::Service(Service {
                hostname: MYSQL.to_string(),
                namespace: "db".to_string(),
                address: "10.96.0.20".to_string(),
                ports: vec![Port::new("tcp-mysql", 3306)],
                selector: labels("mysql"),
            }),
        ),
        (
            "default",
            "reviews-v1",
            ConfigSpec::WorkloadEntry(WorkloadEntry {
                address: "10.0.0.5".to_string(),
                labels: labels("reviews"),
                service_account: "reviews".to_string(),
                locality: "us-east1/us-east1-a/".to_string(),
                ..Default::default()
            }),
        ),
        (
            "default",
            "reviews-v2",
            ConfigSpec::WorkloadEntry(WorkloadEntry {
                address: "10.0.0.6".to_string(),
                labels: labels("reviews"),
                service_account: "reviews".to_string(),
                locality: "us-east1/us-east1-b/".to_string(),
                weight: 3,
                ..Default::default()
            }),
        ),
        (
            "db",
            "mysql-0",
            ConfigSpec::WorkloadEntry(WorkloadEntry {
                address: "10.0.1.9".to_string(),
                labels: labels("mysql"),
                ..Default::default()
            }),
        ),
    ];
    for (namespace, name, spec) in configs.into_iter().chain(extra) {
        store.create(Config::new(name, namespace, spec)).unwrap();
    }
    PushContext::init(&store, MeshSettings::default(), "v1")
}

/// A sidecar in the `default` namespace labelled `app=reviews`, with its
/// service instances resolved.
pub(crate) fn sidecar(push: &PushContext, ip: &str) -> Proxy {
    let node = Node::new(format!("sidecar~{ip}~reviews-v1.default~default.svc.cluster.local"))
        .with_metadata("LABELS", serde_json::json!({"app": "reviews"}));
    let mut proxy = Proxy::from_node(&node).unwrap();
    proxy.set_service_instances(push);
    proxy
}
