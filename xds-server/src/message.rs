//! Crate-owned xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between the
//! stream handlers and the transport layer. The codec converts them to and
//! from the envoy-types wire protos.

use std::collections::HashMap;

use bytes::Bytes;

/// A state-of-the-world discovery request received from a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryRequest {
    /// The version_info of the most recent response the proxy accepted.
    pub version_info: String,
    /// The node making the request. Only required on the first request.
    pub node: Option<Node>,
    /// Resource names the proxy is subscribed to.
    pub resource_names: Vec<String>,
    /// Type URL of the resource being requested.
    pub type_url: String,
    /// Nonce of the response this request acknowledges.
    pub response_nonce: String,
    /// Set when the proxy rejected the previous response.
    pub error_detail: Option<ErrorDetail>,
}

/// A state-of-the-world discovery response sent to a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResponse {
    /// The version of the response data.
    pub version_info: String,
    /// The response resources wrapped as Any protos.
    pub resources: Vec<ResourceAny>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Nonce for this response, echoed back in the next request.
    pub nonce: String,
}

/// An incremental discovery request received from a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaDiscoveryRequest {
    /// The node making the request. Only required on the first request.
    pub node: Option<Node>,
    /// Type URL of the resource being requested.
    pub type_url: String,
    /// Names added to the subscription.
    pub resource_names_subscribe: Vec<String>,
    /// Names removed from the subscription.
    pub resource_names_unsubscribe: Vec<String>,
    /// Versions of resources the proxy already holds, sent on reconnect.
    pub initial_resource_versions: HashMap<String, String>,
    /// Nonce of the response this request acknowledges.
    pub response_nonce: String,
    /// Set when the proxy rejected the previous response.
    pub error_detail: Option<ErrorDetail>,
}

/// An incremental discovery response sent to a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaDiscoveryResponse {
    /// The version of the push that produced this response.
    pub system_version_info: String,
    /// Resources added or updated.
    pub resources: Vec<Resource>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Names of resources the proxy should drop.
    pub removed_resources: Vec<String>,
    /// Nonce for this response, echoed back in the next request.
    pub nonce: String,
}

/// A resource wrapped as google.protobuf.Any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

impl ResourceAny {
    /// Serialize a prost message under the given type URL.
    pub fn encode<M: prost::Message>(type_url: impl Into<String>, message: &M) -> Self {
        Self {
            type_url: type_url.into(),
            value: message.encode_to_vec().into(),
        }
    }
}

/// A named, versioned resource produced by a generator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resource {
    /// Resource name, unique within its type.
    pub name: String,
    /// Resource version, usually the push version that produced it.
    pub version: String,
    /// The serialized resource.
    pub resource: ResourceAny,
}

impl Resource {
    /// Create a named resource from a prost message.
    pub fn new<M: prost::Message>(
        name: impl Into<String>,
        type_url: impl Into<String>,
        message: &M,
    ) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            resource: ResourceAny::encode(type_url, message),
        }
    }

    /// Size of the serialized payload in bytes.
    pub fn size(&self) -> usize {
        self.resource.value.len()
    }
}

/// Resources produced for one type in one push.
pub type Resources = Vec<Resource>;

/// Node identification sent by the proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// An opaque node identifier, `type~ip~id~domain` for mesh proxies.
    pub id: String,
    /// The cluster the node belongs to.
    pub cluster: String,
    /// Free-form node metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Free-form string identifying the client type (e.g., "envoy").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a node with the given identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details carried by a NACK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}
