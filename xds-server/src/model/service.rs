//! Services, workloads and the instances that join them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{Labels, selector_matches};

/// Application protocol of a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    /// HTTP/1.1.
    Http,
    /// HTTP/2 over cleartext.
    Http2,
    /// gRPC.
    Grpc,
    /// Opaque TCP.
    Tcp,
    /// TLS passthrough.
    Tls,
    /// Unknown; sniffed at runtime.
    #[default]
    Unsupported,
}

impl Protocol {
    /// Infer the protocol from a port name such as `http-web` or `grpc`.
    pub fn from_port_name(name: &str) -> Self {
        let prefix = name.split('-').next().unwrap_or_default();
        match prefix.to_ascii_lowercase().as_str() {
            "http" => Protocol::Http,
            "http2" => Protocol::Http2,
            "grpc" => Protocol::Grpc,
            "tcp" => Protocol::Tcp,
            "tls" | "https" => Protocol::Tls,
            _ => Protocol::Unsupported,
        }
    }

    /// Returns true if the protocol is served by the HTTP connection manager.
    pub fn is_http(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Http2 | Protocol::Grpc)
    }
}

/// A service port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    /// Port name, used to map to workload ports.
    pub name: String,
    /// Port number clients connect to.
    pub port: u16,
    /// Application protocol; inferred from the name when unset.
    #[serde(default)]
    pub protocol: Protocol,
}

impl Port {
    /// Create a port, inferring its protocol from the name.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let protocol = Protocol::from_port_name(&name);
        Self {
            name,
            port,
            protocol,
        }
    }

    /// Override the protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// A logical service reachable inside the mesh.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Service {
    /// Fully qualified hostname, e.g. `reviews.default.svc.cluster.local`.
    pub hostname: String,
    /// Namespace that owns the service.
    #[serde(default)]
    pub namespace: String,
    /// Virtual IP, or `0.0.0.0` for headless services.
    #[serde(default = "unspecified_address")]
    pub address: String,
    /// Ports exposed by the service.
    #[serde(default)]
    pub ports: Vec<Port>,
    /// Workload selector; workloads whose labels match back the service.
    #[serde(default)]
    pub selector: Labels,
}

fn unspecified_address() -> String {
    "0.0.0.0".to_string()
}

impl Service {
    /// Returns the port with the given number.
    pub fn port(&self, number: u16) -> Option<&Port> {
        self.ports.iter().find(|p| p.port == number)
    }
}

/// A non-Kubernetes workload registered with the mesh.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkloadEntry {
    /// IP address of the workload.
    pub address: String,
    /// Workload labels.
    #[serde(default)]
    pub labels: Labels,
    /// Map of service port name to workload port, when they differ.
    #[serde(default)]
    pub ports: std::collections::BTreeMap<String, u16>,
    /// Service account the workload runs as.
    #[serde(default)]
    pub service_account: String,
    /// Network the workload lives on.
    #[serde(default)]
    pub network: String,
    /// Locality as `region/zone/subzone`.
    #[serde(default)]
    pub locality: String,
    /// Load-balancing weight, zero meaning the default.
    #[serde(default)]
    pub weight: u32,
}

/// A concrete destination for a service port.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// IP address.
    pub address: String,
    /// Port the workload listens on.
    pub port: u16,
    /// Workload labels.
    pub labels: Labels,
    /// Service account the workload runs as.
    pub service_account: String,
    /// Locality as `region/zone/subzone`.
    pub locality: String,
    /// Load-balancing weight.
    pub weight: u32,
}

/// One workload serving one port of one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    /// The service.
    pub service: Arc<Service>,
    /// The service port being served.
    pub service_port: Port,
    /// The workload endpoint serving it.
    pub endpoint: Endpoint,
}

impl ServiceInstance {
    /// Build the instances a workload contributes to a service, one per
    /// service port. Returns nothing when the selector does not match.
    pub fn for_workload(service: &Arc<Service>, workload: &WorkloadEntry) -> Vec<ServiceInstance> {
        if service.selector.is_empty() || !selector_matches(&service.selector, &workload.labels) {
            return Vec::new();
        }
        service
            .ports
            .iter()
            .map(|port| ServiceInstance {
                service: Arc::clone(service),
                service_port: port.clone(),
                endpoint: Endpoint {
                    address: workload.address.clone(),
                    port: workload.ports.get(&port.name).copied().unwrap_or(port.port),
                    labels: workload.labels.clone(),
                    service_account: workload.service_account.clone(),
                    locality: workload.locality.clone(),
                    weight: if workload.weight == 0 { 1 } else { workload.weight },
                },
            })
            .collect()
    }
}
