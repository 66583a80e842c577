//! Conversions to and from the envoy-types discovery protos.

use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::protobuf::{Any, ListValue, Struct, Value, value::Kind};
use envoy_types::pb::google::rpc::Status;

use crate::message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    ErrorDetail, Locality, Node, Resource, ResourceAny,
};

impl From<discovery::DiscoveryRequest> for DiscoveryRequest {
    fn from(proto: discovery::DiscoveryRequest) -> Self {
        Self {
            version_info: proto.version_info,
            node: proto.node.map(Node::from),
            resource_names: proto.resource_names,
            type_url: proto.type_url,
            response_nonce: proto.response_nonce,
            error_detail: proto.error_detail.map(ErrorDetail::from),
        }
    }
}

impl From<DiscoveryRequest> for discovery::DiscoveryRequest {
    fn from(request: DiscoveryRequest) -> Self {
        Self {
            version_info: request.version_info,
            node: request.node.map(core::Node::from),
            resource_names: request.resource_names,
            type_url: request.type_url,
            response_nonce: request.response_nonce,
            error_detail: request.error_detail.map(Status::from),
            ..Default::default()
        }
    }
}

impl From<DiscoveryResponse> for discovery::DiscoveryResponse {
    fn from(response: DiscoveryResponse) -> Self {
        Self {
            version_info: response.version_info,
            resources: response.resources.into_iter().map(Any::from).collect(),
            type_url: response.type_url,
            nonce: response.nonce,
            ..Default::default()
        }
    }
}

impl From<discovery::DiscoveryResponse> for DiscoveryResponse {
    fn from(proto: discovery::DiscoveryResponse) -> Self {
        Self {
            version_info: proto.version_info,
            resources: proto.resources.into_iter().map(ResourceAny::from).collect(),
            type_url: proto.type_url,
            nonce: proto.nonce,
        }
    }
}

impl From<discovery::DeltaDiscoveryRequest> for DeltaDiscoveryRequest {
    fn from(proto: discovery::DeltaDiscoveryRequest) -> Self {
        Self {
            node: proto.node.map(Node::from),
            type_url: proto.type_url,
            resource_names_subscribe: proto.resource_names_subscribe,
            resource_names_unsubscribe: proto.resource_names_unsubscribe,
            initial_resource_versions: proto.initial_resource_versions.into_iter().collect(),
            response_nonce: proto.response_nonce,
            error_detail: proto.error_detail.map(ErrorDetail::from),
        }
    }
}

impl From<DeltaDiscoveryRequest> for discovery::DeltaDiscoveryRequest {
    fn from(request: DeltaDiscoveryRequest) -> Self {
        Self {
            node: request.node.map(core::Node::from),
            type_url: request.type_url,
            resource_names_subscribe: request.resource_names_subscribe,
            resource_names_unsubscribe: request.resource_names_unsubscribe,
            initial_resource_versions: request.initial_resource_versions.into_iter().collect(),
            response_nonce: request.response_nonce,
            error_detail: request.error_detail.map(Status::from),
            ..Default::default()
        }
    }
}

impl From<DeltaDiscoveryResponse> for discovery::DeltaDiscoveryResponse {
    fn from(response: DeltaDiscoveryResponse) -> Self {
        Self {
            system_version_info: response.system_version_info,
            resources: response
                .resources
                .into_iter()
                .map(discovery::Resource::from)
                .collect(),
            type_url: response.type_url,
            removed_resources: response.removed_resources,
            nonce: response.nonce,
            ..Default::default()
        }
    }
}

impl From<discovery::DeltaDiscoveryResponse> for DeltaDiscoveryResponse {
    fn from(proto: discovery::DeltaDiscoveryResponse) -> Self {
        Self {
            system_version_info: proto.system_version_info,
            resources: proto.resources.into_iter().map(Resource::from).collect(),
            type_url: proto.type_url,
            removed_resources: proto.removed_resources,
            nonce: proto.nonce,
        }
    }
}

impl From<Resource> for discovery::Resource {
    fn from(resource: Resource) -> Self {
        Self {
            name: resource.name,
            version: resource.version,
            resource: Some(resource.resource.into()),
            ..Default::default()
        }
    }
}

impl From<discovery::Resource> for Resource {
    fn from(proto: discovery::Resource) -> Self {
        Self {
            name: proto.name,
            version: proto.version,
            resource: proto.resource.map(ResourceAny::from).unwrap_or_default(),
        }
    }
}

impl From<ResourceAny> for Any {
    fn from(resource: ResourceAny) -> Self {
        Any {
            type_url: resource.type_url,
            value: resource.value.to_vec(),
        }
    }
}

impl From<Any> for ResourceAny {
    fn from(any: Any) -> Self {
        ResourceAny {
            type_url: any.type_url,
            value: any.value.into(),
        }
    }
}

impl From<Status> for ErrorDetail {
    fn from(status: Status) -> Self {
        Self {
            code: status.code,
            message: status.message,
        }
    }
}

impl From<ErrorDetail> for Status {
    fn from(detail: ErrorDetail) -> Self {
        Status {
            code: detail.code,
            message: detail.message,
            details: vec![],
        }
    }
}

impl From<core::Node> for Node {
    fn from(proto: core::Node) -> Self {
        let user_agent_version = match proto.user_agent_version_type {
            Some(core::node::UserAgentVersionType::UserAgentVersion(version)) => version,
            _ => String::new(),
        };
        Self {
            id: proto.id,
            cluster: proto.cluster,
            metadata: proto.metadata.map(struct_to_json).unwrap_or_default(),
            locality: proto.locality.map(|l| Locality {
                region: l.region,
                zone: l.zone,
                sub_zone: l.sub_zone,
            }),
            user_agent_name: proto.user_agent_name,
            user_agent_version,
        }
    }
}

impl From<Node> for core::Node {
    fn from(node: Node) -> Self {
        core::Node {
            id: node.id,
            cluster: node.cluster,
            metadata: (!node.metadata.is_empty()).then(|| json_to_struct(node.metadata)),
            locality: node.locality.map(|l| core::Locality {
                region: l.region,
                zone: l.zone,
                sub_zone: l.sub_zone,
            }),
            user_agent_name: node.user_agent_name,
            user_agent_version_type: (!node.user_agent_version.is_empty()).then_some(
                core::node::UserAgentVersionType::UserAgentVersion(node.user_agent_version),
            ),
            ..Default::default()
        }
    }
}

/// Convert a protobuf `Struct` into a JSON object.
pub fn struct_to_json(proto: Struct) -> serde_json::Map<String, serde_json::Value> {
    proto
        .fields
        .into_iter()
        .map(|(key, value)| (key, value_to_json(value)))
        .collect()
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::StructValue(s)) => serde_json::Value::Object(struct_to_json(s)),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
    }
}

/// Convert a JSON object into a protobuf `Struct`.
pub fn json_to_struct(map: serde_json::Map<String, serde_json::Value>) -> Struct {
    Struct {
        fields: map
            .into_iter()
            .map(|(key, value)| (key, json_to_value(value)))
            .collect(),
    }
}

fn json_to_value(value: serde_json::Value) -> Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => Kind::StringValue(s),
        serde_json::Value::Array(values) => Kind::ListValue(ListValue {
            values: values.into_iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(json_to_struct(map)),
    };
    Value { kind: Some(kind) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_metadata_survives_conversion() {
        let node = Node::new("sidecar~10.0.0.1~app.default~default.svc.cluster.local")
            .with_metadata("NAMESPACE", json!("default"))
            .with_metadata("LABELS", json!({"app": "reviews", "version": "v1"}));

        let proto = core::Node::from(node.clone());
        assert_eq!(proto.id, node.id);
        let back = Node::from(proto);
        assert_eq!(back.metadata["NAMESPACE"], json!("default"));
        assert_eq!(back.metadata["LABELS"]["version"], json!("v1"));
    }

    #[test]
    fn nack_detail_is_decoded() {
        let proto = discovery::DiscoveryRequest {
            type_url: crate::resource::CLUSTER.to_string(),
            response_nonce: "0000000000000001".to_string(),
            error_detail: Some(Status {
                code: 3,
                message: "bad cluster".to_string(),
                details: vec![],
            }),
            ..Default::default()
        };

        let request = DiscoveryRequest::from(proto);
        assert_eq!(
            request.error_detail,
            Some(ErrorDetail {
                code: 3,
                message: "bad cluster".to_string()
            })
        );
        assert!(request.node.is_none());
    }

    #[test]
    fn delta_response_carries_removals() {
        let response = DeltaDiscoveryResponse {
            system_version_info: "v1".to_string(),
            resources: vec![Resource {
                name: "outbound|80||a.default".to_string(),
                version: "v1".to_string(),
                resource: ResourceAny {
                    type_url: crate::resource::CLUSTER.to_string(),
                    value: bytes::Bytes::from_static(b"cluster"),
                },
            }],
            type_url: crate::resource::CLUSTER.to_string(),
            removed_resources: vec!["gone".to_string()],
            nonce: "n".to_string(),
        };

        let proto = discovery::DeltaDiscoveryResponse::from(response);
        assert_eq!(proto.removed_resources, vec!["gone".to_string()]);
        let any = proto.resources[0].resource.as_ref().unwrap();
        assert_eq!(any.value, b"cluster".to_vec());
    }
}
