//! The server's view of a connected proxy.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::message::{Locality, Node};
use crate::model::Labels;
use crate::model::push_context::PushContext;
use crate::model::service::ServiceInstance;

/// The role a proxy plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// A sidecar next to an application workload.
    Sidecar,
    /// A standalone gateway.
    Router,
}

impl NodeType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "sidecar" => Some(NodeType::Sidecar),
            "router" => Some(NodeType::Router),
            _ => None,
        }
    }
}

/// Typed view of the node metadata the server understands. Unknown keys are
/// kept in `raw`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProxyMetadata {
    /// Namespace the workload runs in.
    pub namespace: String,
    /// Workload labels.
    pub labels: Labels,
    /// Cluster the workload runs in.
    pub cluster_id: String,
    /// Service account the workload runs as.
    pub service_account: String,
    /// When set, a WorkloadEntry is maintained for the proxy in this group.
    pub auto_register_group: String,
    /// Name of the workload.
    pub workload_name: String,
    /// Version of the proxy build.
    pub proxy_version: String,
    /// Comma separated additional instance IPs.
    pub instance_ips: String,
    /// Network the workload lives on.
    pub network: String,
    /// All metadata entries as received.
    #[serde(skip)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl ProxyMetadata {
    /// Parse node metadata.
    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut metadata: ProxyMetadata =
            serde_json::from_value(serde_json::Value::Object(map.clone()))
                .map_err(|e| Error::Validation(format!("invalid node metadata: {e}")))?;
        metadata.raw = map.clone();
        Ok(metadata)
    }

    /// A metadata entry rendered as a string, if it is a scalar.
    pub fn raw_string(&self, key: &str) -> Option<String> {
        match self.raw.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A connected proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    /// Sidecar or gateway.
    pub node_type: NodeType,
    /// Workload IPs, primary first.
    pub ip_addresses: Vec<String>,
    /// Workload identifier, usually `pod.namespace`.
    pub id: String,
    /// DNS domain of the workload.
    pub dns_domain: String,
    /// Namespace whose configuration applies to the proxy.
    pub config_namespace: String,
    /// Parsed metadata.
    pub metadata: ProxyMetadata,
    /// Workload labels.
    pub labels: Labels,
    /// Cluster the proxy runs in.
    pub cluster_id: String,
    /// Locality reported by the node.
    pub locality: Option<Locality>,
    /// Proxy build version.
    pub user_agent_version: String,
    /// Services the workload serves, recomputed on every full push.
    pub service_instances: Vec<ServiceInstance>,
}

impl Proxy {
    /// Parse a proxy from a node of the form `type~ip~id~domain`.
    pub fn from_node(node: &Node) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidNode {
            id: node.id.clone(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = node.id.split('~').collect();
        let [node_type, ip, id, domain] = parts.as_slice() else {
            return Err(invalid("expected 4 parts separated by '~'"));
        };
        let node_type = NodeType::parse(node_type).ok_or_else(|| invalid("unknown node type"))?;
        if ip.is_empty() {
            return Err(invalid("missing IP address"));
        }

        let metadata = ProxyMetadata::from_map(&node.metadata)?;

        let mut ip_addresses = vec![ip.to_string()];
        ip_addresses.extend(
            metadata
                .instance_ips
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty() && *s != *ip)
                .map(str::to_string),
        );

        let config_namespace = if !metadata.namespace.is_empty() {
            metadata.namespace.clone()
        } else if let Some((_, ns)) = id.split_once('.') {
            ns.to_string()
        } else {
            domain.split('.').next().unwrap_or_default().to_string()
        };

        let cluster_id = metadata.cluster_id.clone();
        let labels = metadata.labels.clone();
        Ok(Self {
            node_type,
            ip_addresses,
            id: id.to_string(),
            dns_domain: domain.to_string(),
            config_namespace,
            labels,
            cluster_id,
            locality: node.locality.clone(),
            user_agent_version: node.user_agent_version.clone(),
            metadata,
            service_instances: Vec::new(),
        })
    }

    /// The primary workload IP.
    pub fn primary_ip(&self) -> &str {
        self.ip_addresses.first().map(String::as_str).unwrap_or_default()
    }

    /// Proxy version from metadata, falling back to the user agent version.
    pub fn version(&self) -> &str {
        if self.metadata.proxy_version.is_empty() {
            &self.user_agent_version
        } else {
            &self.metadata.proxy_version
        }
    }

    /// SPIFFE identity the proxy claims, if it names a service account.
    pub fn spiffe_identity(&self, trust_domain: &str) -> Option<String> {
        if self.metadata.service_account.is_empty() {
            return None;
        }
        Some(format!(
            "spiffe://{trust_domain}/ns/{}/sa/{}",
            self.config_namespace, self.metadata.service_account
        ))
    }

    /// Recompute which services this workload serves.
    pub fn set_service_instances(&mut self, push: &PushContext) {
        self.service_instances = self
            .ip_addresses
            .iter()
            .flat_map(|ip| push.instances_by_ip(ip))
            .cloned()
            .collect();
        self.service_instances.sort_by(|a, b| {
            (a.service.hostname.as_str(), a.service_port.port)
                .cmp(&(b.service.hostname.as_str(), b.service_port.port))
        });
    }
}
