//! EnvoyFilter configuration and its decoded, per-level form.
//!
//! The wire form mirrors the configuration API: a list of patches, each with
//! an `applyTo` level, a match and a patch holding an operation and a
//! `google.protobuf.Any` value. [`EnvoyFilterWrapper::convert`] decodes the
//! values into the proto for their level once, when the push context is
//! built, so applying patches never touches serialized bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use envoy_types::pb::envoy::config::listener::v3::{Filter, FilterChain, Listener};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpFilter;
use prost::Message;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::config_store::ConfigMeta;
use crate::model::proxy::Proxy;
use crate::model::{Labels, selector_matches};

const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
const FILTER_CHAIN_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.FilterChain";
const FILTER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Filter";
const HTTP_FILTER_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpFilter";

/// An EnvoyFilter as stored in the configuration store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyFilter {
    /// Workloads the filter applies to; unset applies to the whole namespace.
    #[serde(default)]
    pub workload_selector: Option<WorkloadSelector>,
    /// Patches, applied in order within each level.
    #[serde(default)]
    pub config_patches: Vec<EnvoyConfigObjectPatch>,
    /// Lower priorities apply first.
    #[serde(default)]
    pub priority: i32,
}

/// Label selector for an EnvoyFilter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkloadSelector {
    /// Labels a workload must carry.
    #[serde(default)]
    pub labels: Labels,
}

/// One patch of an EnvoyFilter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfigObjectPatch {
    /// The level the patch applies to.
    pub apply_to: ApplyTo,
    /// Which objects at that level are patched.
    #[serde(default, rename = "match")]
    pub match_: Option<EnvoyConfigObjectMatch>,
    /// The operation and value.
    #[serde(default)]
    pub patch: Option<Patch>,
}

/// The configuration level a patch targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyTo {
    /// Unset.
    #[default]
    Invalid,
    /// A whole listener.
    Listener,
    /// A filter chain of a listener.
    FilterChain,
    /// A network filter in a filter chain.
    NetworkFilter,
    /// An HTTP filter inside the HTTP connection manager.
    HttpFilter,
    /// A route configuration.
    RouteConfiguration,
    /// A virtual host.
    VirtualHost,
    /// A route.
    HttpRoute,
    /// A cluster.
    Cluster,
    /// An extension config.
    ExtensionConfig,
    /// The bootstrap config.
    Bootstrap,
    /// A listener filter.
    ListenerFilter,
}

impl ApplyTo {
    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyTo::Invalid => "invalid",
            ApplyTo::Listener => "listener",
            ApplyTo::FilterChain => "filter_chain",
            ApplyTo::NetworkFilter => "network_filter",
            ApplyTo::HttpFilter => "http_filter",
            ApplyTo::RouteConfiguration => "route_configuration",
            ApplyTo::VirtualHost => "virtual_host",
            ApplyTo::HttpRoute => "http_route",
            ApplyTo::Cluster => "cluster",
            ApplyTo::ExtensionConfig => "extension_config",
            ApplyTo::Bootstrap => "bootstrap",
            ApplyTo::ListenerFilter => "listener_filter",
        }
    }
}

/// Where a patched object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchContext {
    /// Any listener of any proxy.
    #[default]
    Any,
    /// Inbound listeners of sidecars.
    SidecarInbound,
    /// Outbound listeners of sidecars.
    SidecarOutbound,
    /// Gateway listeners.
    Gateway,
}

/// Match conditions of a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfigObjectMatch {
    /// Listener context.
    #[serde(default)]
    pub context: PatchContext,
    /// Proxy conditions.
    #[serde(default)]
    pub proxy: Option<ProxyMatch>,
    /// Listener conditions.
    #[serde(default)]
    pub listener: Option<ListenerMatch>,
}

/// Proxy conditions of a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMatch {
    /// Regular expression matched against the proxy version.
    #[serde(default)]
    pub proxy_version: String,
    /// Metadata entries the proxy must carry.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Listener conditions of a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerMatch {
    /// Listener port; zero matches any.
    #[serde(default)]
    pub port_number: u32,
    /// Listener name; empty matches any.
    #[serde(default)]
    pub name: String,
    /// Filter chain conditions.
    #[serde(default)]
    pub filter_chain: Option<FilterChainMatch>,
}

/// Filter chain conditions of a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterChainMatch {
    /// Filter chain name.
    #[serde(default)]
    pub name: String,
    /// A server name the chain must list.
    #[serde(default)]
    pub sni: String,
    /// Transport protocol, e.g. `tls` or `raw_buffer`.
    #[serde(default)]
    pub transport_protocol: String,
    /// Comma separated application protocols the chain must list.
    #[serde(default)]
    pub application_protocols: String,
    /// Destination port the chain matches.
    #[serde(default)]
    pub destination_port: u32,
    /// Filter conditions.
    #[serde(default)]
    pub filter: Option<FilterMatch>,
}

/// Network filter conditions of a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMatch {
    /// Network filter name.
    #[serde(default)]
    pub name: String,
    /// HTTP filter conditions, for the HTTP connection manager.
    #[serde(default)]
    pub sub_filter: Option<SubFilterMatch>,
}

/// HTTP filter conditions of a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubFilterMatch {
    /// HTTP filter name.
    #[serde(default)]
    pub name: String,
}

/// The operation and value of a patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Patch {
    /// What to do.
    #[serde(default)]
    pub operation: Operation,
    /// The object to merge, add or insert.
    #[serde(default)]
    pub value: Option<AnyValue>,
}

/// Patch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Unset.
    #[default]
    Invalid,
    /// Merge the value into the matched object.
    Merge,
    /// Append the value.
    Add,
    /// Remove the matched object.
    Remove,
    /// Insert before the matched object.
    InsertBefore,
    /// Insert after the matched object.
    InsertAfter,
    /// Insert at the front of the list.
    InsertFirst,
    /// Replace the matched object.
    Replace,
}

/// A serialized `google.protobuf.Any`; `value` is base64 in JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    /// Type URL of the payload.
    pub type_url: String,
    /// Serialized payload.
    #[serde(default, with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl AnyValue {
    /// Wrap a proto message.
    pub fn encode<M: Message>(type_url: impl Into<String>, message: &M) -> Self {
        Self {
            type_url: type_url.into(),
            value: message.encode_to_vec(),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

/// A patch value decoded into the proto of its level.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    /// A listener.
    Listener(Listener),
    /// A filter chain.
    FilterChain(FilterChain),
    /// A network filter.
    NetworkFilter(Filter),
    /// An HTTP filter.
    HttpFilter(HttpFilter),
}

/// A decoded patch ready to apply.
#[derive(Debug, Clone)]
pub struct PatchWrapper {
    /// `namespace/name` of the owning EnvoyFilter.
    pub filter_key: String,
    /// The level the patch applies to.
    pub apply_to: ApplyTo,
    /// Listener context.
    pub context: PatchContext,
    /// Listener conditions.
    pub listener: Option<ListenerMatch>,
    /// Compiled proxy version condition.
    pub proxy_version: Option<Regex>,
    /// Proxy metadata condition.
    pub proxy_metadata: BTreeMap<String, String>,
    /// The operation.
    pub operation: Operation,
    /// The decoded value.
    pub value: Option<PatchValue>,
}

impl PatchWrapper {
    /// Returns true if the proxy satisfies the patch's proxy conditions.
    pub fn proxy_matches(&self, proxy: &Proxy) -> bool {
        if let Some(version) = &self.proxy_version {
            if !version.is_match(proxy.version()) {
                return false;
            }
        }
        self.proxy_metadata
            .iter()
            .all(|(k, v)| proxy.metadata.raw_string(k).as_deref() == Some(v.as_str()))
    }
}

/// An EnvoyFilter with every patch decoded and grouped by level.
#[derive(Debug, Clone)]
pub struct EnvoyFilterWrapper {
    /// Filter name.
    pub name: String,
    /// Filter namespace.
    pub namespace: String,
    /// Lower applies first.
    pub priority: i32,
    /// Store revision at creation, breaking priority ties by age.
    pub created: u64,
    /// Workload selector; `None` selects the whole namespace.
    pub workload_selector: Option<Labels>,
    /// Patches by level, in declaration order.
    pub patches: BTreeMap<ApplyTo, Vec<Arc<PatchWrapper>>>,
}

impl EnvoyFilterWrapper {
    /// Decode an EnvoyFilter. Patches that cannot be decoded are dropped
    /// with a warning; the rest of the filter still applies.
    pub fn convert(meta: &ConfigMeta, filter: &EnvoyFilter) -> Self {
        let filter_key = format!("{}/{}", meta.namespace, meta.name);
        let mut patches: BTreeMap<ApplyTo, Vec<Arc<PatchWrapper>>> = BTreeMap::new();

        for (index, patch) in filter.config_patches.iter().enumerate() {
            match decode_patch(&filter_key, patch) {
                Ok(wrapper) => patches
                    .entry(wrapper.apply_to)
                    .or_default()
                    .push(Arc::new(wrapper)),
                Err(reason) => {
                    warn!(envoy_filter = %filter_key, index, %reason, "skipping patch");
                }
            }
        }

        Self {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            priority: filter.priority,
            created: meta.created,
            workload_selector: filter
                .workload_selector
                .as_ref()
                .map(|s| s.labels.clone())
                .filter(|labels| !labels.is_empty()),
            patches,
        }
    }

    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Returns true if the filter selects a workload with these labels.
    pub fn selects(&self, labels: &Labels) -> bool {
        match &self.workload_selector {
            Some(selector) => selector_matches(selector, labels),
            None => true,
        }
    }
}

fn decode_patch(filter_key: &str, patch: &EnvoyConfigObjectPatch) -> Result<PatchWrapper, String> {
    let Some(body) = &patch.patch else {
        return Err("patch has no operation".to_string());
    };
    if body.operation == Operation::Invalid {
        return Err("patch operation is unset".to_string());
    }
    let match_ = patch.match_.clone().unwrap_or_default();
    let proxy = match_.proxy.unwrap_or_default();
    let proxy_version = if proxy.proxy_version.is_empty() {
        None
    } else {
        Some(Regex::new(&proxy.proxy_version).map_err(|e| e.to_string())?)
    };

    let value = match &body.value {
        Some(any) if body.operation != Operation::Remove => {
            Some(decode_value(patch.apply_to, any)?)
        }
        _ => None,
    };
    if value.is_none()
        && matches!(
            body.operation,
            Operation::Merge
                | Operation::Add
                | Operation::InsertBefore
                | Operation::InsertAfter
                | Operation::InsertFirst
                | Operation::Replace
        )
    {
        return Err(format!("{:?} requires a value", body.operation));
    }

    Ok(PatchWrapper {
        filter_key: filter_key.to_string(),
        apply_to: patch.apply_to,
        context: match_.context,
        listener: match_.listener,
        proxy_version,
        proxy_metadata: proxy.metadata,
        operation: body.operation,
        value,
    })
}

fn decode_value(apply_to: ApplyTo, any: &AnyValue) -> Result<PatchValue, String> {
    let expect = |type_url: &str| {
        if any.type_url == type_url {
            Ok(())
        } else {
            Err(format!(
                "value of type {} cannot patch {}",
                any.type_url,
                apply_to.as_str()
            ))
        }
    };
    let bytes = any.value.as_slice();
    match apply_to {
        ApplyTo::Listener => {
            expect(LISTENER_TYPE)?;
            Listener::decode(bytes)
                .map(PatchValue::Listener)
                .map_err(|e| e.to_string())
        }
        ApplyTo::FilterChain => {
            expect(FILTER_CHAIN_TYPE)?;
            FilterChain::decode(bytes)
                .map(PatchValue::FilterChain)
                .map_err(|e| e.to_string())
        }
        ApplyTo::NetworkFilter => {
            expect(FILTER_TYPE)?;
            Filter::decode(bytes)
                .map(PatchValue::NetworkFilter)
                .map_err(|e| e.to_string())
        }
        ApplyTo::HttpFilter => {
            expect(HTTP_FILTER_TYPE)?;
            HttpFilter::decode(bytes)
                .map(PatchValue::HttpFilter)
                .map_err(|e| e.to_string())
        }
        other => Err(format!("{} patches are not supported", other.as_str())),
    }
}
