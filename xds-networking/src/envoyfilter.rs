//! Applies EnvoyFilter patches to generated listeners.
//!
//! Patches are applied depth first: listener, filter chains (including the
//! default chain), network filters, then the HTTP filters of each HTTP
//! connection manager. At every level REMOVE and MERGE run first, removed
//! entries are compacted out, and ADD and the insert operations run last in
//! declaration order.
//!
//! Patching never fails a push. Each listener is patched on a copy; if that
//! fails the unpatched listener is kept and the failure is counted against
//! the contributing filters.

use std::sync::Arc;

use envoy_types::pb::envoy::config::listener::v3::{Filter, FilterChain, FilterChainMatch, Listener, filter};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    HttpConnectionManager, HttpFilter, http_filter,
};
use prost::Message;
use tracing::{debug, warn};
use xds_server::metrics::{PatchStatus, record_envoy_filter};
use xds_server::model::envoy_filter::{ApplyTo, Operation, PatchContext, PatchValue, PatchWrapper};
use xds_server::model::push_context::MergedEnvoyFilters;
use xds_server::Proxy;

use crate::error::{Error, Result};
use crate::proto::{self, any};

/// Apply the listener, filter chain, network filter and HTTP filter patches
/// of `filters` to `listeners`.
///
/// With `skip_adds` set, ADD operations are ignored at every level; callers
/// set it when patching a subset of listeners that must not grow.
pub fn apply_listener_patches(
    context: PatchContext,
    proxy: &Proxy,
    filters: Option<&MergedEnvoyFilters>,
    listeners: Vec<Listener>,
    skip_adds: bool,
) -> Vec<Listener> {
    let Some(filters) = filters else {
        return listeners;
    };
    let patcher = Patcher {
        context,
        proxy,
        filters,
        skip_adds,
    };
    patcher.patch_listeners(listeners)
}

/// Run `apply` on a copy of `input`, falling back to `input` if it fails.
fn patch_or_original<T: Clone>(
    filters: &MergedEnvoyFilters,
    input: T,
    apply: impl FnOnce(T) -> Result<T>,
) -> T {
    match apply(input.clone()) {
        Ok(patched) => patched,
        Err(error) => {
            warn!(envoy_filters = ?filters.keys, %error, "patching failed, keeping unpatched config");
            for key in &filters.keys {
                record_envoy_filter(key, ApplyTo::Listener.as_str(), PatchStatus::Error);
            }
            input
        }
    }
}

/// The parts of a listener patch matching looks at.
struct ListenerKey {
    name: String,
    port: Option<u16>,
}

impl ListenerKey {
    fn of(listener: &Listener) -> Self {
        Self {
            name: listener.name.clone(),
            port: proto::listener_port(listener),
        }
    }
}

struct Patcher<'a> {
    context: PatchContext,
    proxy: &'a Proxy,
    filters: &'a MergedEnvoyFilters,
    skip_adds: bool,
}

impl Patcher<'_> {
    fn applicable(&self, apply_to: ApplyTo) -> impl Iterator<Item = &Arc<PatchWrapper>> {
        self.filters.patches(apply_to).iter().filter(|patch| {
            (patch.context == PatchContext::Any || patch.context == self.context)
                && patch.proxy_matches(self.proxy)
        })
    }

    fn patch_listeners(&self, listeners: Vec<Listener>) -> Vec<Listener> {
        let mut patched: Vec<Listener> = listeners
            .into_iter()
            .map(|listener| {
                patch_or_original(self.filters, listener, |listener| self.patch_listener(listener))
            })
            .collect();
        patched.retain(|listener| !listener.name.is_empty());

        if !self.skip_adds {
            for patch in self.applicable(ApplyTo::Listener) {
                if patch.operation != Operation::Add {
                    continue;
                }
                if let Some(PatchValue::Listener(listener)) = &patch.value {
                    patched.push(listener.clone());
                    applied(patch);
                }
            }
        }
        patched
    }

    fn patch_listener(&self, mut listener: Listener) -> Result<Listener> {
        let key = ListenerKey::of(&listener);
        for patch in self.applicable(ApplyTo::Listener) {
            if !listener_matches(&key, patch) {
                continue;
            }
            match (patch.operation, &patch.value) {
                (Operation::Remove, _) => {
                    debug!(listener = key.name.as_str(), envoy_filter = patch.filter_key.as_str(), "listener removed");
                    listener.name.clear();
                    applied(patch);
                    return Ok(listener);
                }
                (Operation::Merge, Some(PatchValue::Listener(value))) => {
                    merge_message(patch, &mut listener, value);
                }
                _ => {}
            }
        }

        let chains = std::mem::take(&mut listener.filter_chains);
        for chain in chains {
            if let Some(chain) = self.patch_filter_chain(&key, chain)? {
                listener.filter_chains.push(chain);
            }
        }
        if let Some(chain) = listener.default_filter_chain.take() {
            listener.default_filter_chain = self.patch_filter_chain(&key, chain)?;
        }

        if !self.skip_adds {
            for patch in self.applicable(ApplyTo::FilterChain) {
                if patch.operation != Operation::Add || !listener_matches(&key, patch) {
                    continue;
                }
                if let Some(PatchValue::FilterChain(chain)) = &patch.value {
                    listener.filter_chains.push(chain.clone());
                    applied(patch);
                }
            }
        }
        Ok(listener)
    }

    /// Returns `None` when the chain was removed.
    fn patch_filter_chain(&self, key: &ListenerKey, mut chain: FilterChain) -> Result<Option<FilterChain>> {
        for patch in self.applicable(ApplyTo::FilterChain) {
            if !listener_matches(key, patch) || !chain_matches(key, &chain, patch) {
                continue;
            }
            match (patch.operation, &patch.value) {
                (Operation::Remove, _) => {
                    applied(patch);
                    return Ok(None);
                }
                (Operation::Merge, Some(PatchValue::FilterChain(value))) => {
                    merge_message(patch, &mut chain, value);
                }
                _ => {}
            }
        }
        self.patch_network_filters(key, &mut chain)?;
        Ok(Some(chain))
    }

    fn patch_network_filters(&self, key: &ListenerKey, chain: &mut FilterChain) -> Result<()> {
        for patch in self.applicable(ApplyTo::NetworkFilter) {
            if !matches!(patch.operation, Operation::Remove | Operation::Merge)
                || !listener_matches(key, patch)
                || !chain_matches(key, chain, patch)
            {
                continue;
            }
            let mut hit = false;
            for filter in chain.filters.iter_mut().filter(|f| !f.name.is_empty()) {
                if !network_filter_matches(filter, patch) {
                    continue;
                }
                match (patch.operation, &patch.value) {
                    (Operation::Remove, _) => filter.name.clear(),
                    (Operation::Merge, Some(PatchValue::NetworkFilter(value))) => {
                        merge_network_filter(filter, value);
                    }
                    _ => continue,
                }
                hit = true;
            }
            if hit {
                applied(patch);
            }
        }

        let http_patches: Vec<&Arc<PatchWrapper>> = self
            .applicable(ApplyTo::HttpFilter)
            .filter(|patch| {
                listener_matches(key, patch)
                    && chain_matches(key, chain, patch)
                    && filter_name(patch).is_none_or(|name| name == proto::HTTP_CONNECTION_MANAGER)
            })
            .collect();
        if !http_patches.is_empty() {
            for filter in chain
                .filters
                .iter_mut()
                .filter(|f| f.name == proto::HTTP_CONNECTION_MANAGER)
            {
                self.patch_http_connection_manager(&http_patches, filter)?;
            }
        }

        chain.filters.retain(|f| !f.name.is_empty());

        for patch in self.applicable(ApplyTo::NetworkFilter) {
            if !self.is_insert(patch.operation)
                || !listener_matches(key, patch)
                || !chain_matches(key, chain, patch)
            {
                continue;
            }
            let Some(PatchValue::NetworkFilter(value)) = &patch.value else {
                continue;
            };
            let named = filter_name(patch).is_some();
            if insert(&mut chain.filters, patch.operation, named, value, |f| {
                network_filter_matches(f, patch)
            }) {
                applied(patch);
            }
        }
        Ok(())
    }

    fn patch_http_connection_manager(&self, patches: &[&Arc<PatchWrapper>], filter: &mut Filter) -> Result<()> {
        let Some(config) = proto::filter_config(filter, proto::HCM_TYPE) else {
            return Ok(());
        };
        let mut hcm = HttpConnectionManager::decode(config.value.as_slice()).map_err(|source| {
            Error::Decode {
                what: "http connection manager",
                source,
            }
        })?;

        for patch in patches {
            if !matches!(patch.operation, Operation::Remove | Operation::Merge) {
                continue;
            }
            let mut hit = false;
            for http_filter in hcm.http_filters.iter_mut().filter(|f| !f.name.is_empty()) {
                if !http_filter_matches(http_filter, patch) {
                    continue;
                }
                match (patch.operation, &patch.value) {
                    (Operation::Remove, _) => http_filter.name.clear(),
                    (Operation::Merge, Some(PatchValue::HttpFilter(value))) => {
                        merge_http_filter(http_filter, value);
                    }
                    _ => continue,
                }
                hit = true;
            }
            if hit {
                applied(patch);
            }
        }

        hcm.http_filters.retain(|f| !f.name.is_empty());

        for patch in patches {
            if !self.is_insert(patch.operation) {
                continue;
            }
            let Some(PatchValue::HttpFilter(value)) = &patch.value else {
                continue;
            };
            let named = sub_filter_name(patch).is_some();
            if insert(&mut hcm.http_filters, patch.operation, named, value, |f| {
                http_filter_matches(f, patch)
            }) {
                applied(patch);
            }
        }

        filter.config_type = Some(filter::ConfigType::TypedConfig(any(proto::HCM_TYPE, &hcm)));
        Ok(())
    }

    fn is_insert(&self, operation: Operation) -> bool {
        match operation {
            Operation::Add => !self.skip_adds,
            Operation::InsertFirst
            | Operation::InsertBefore
            | Operation::InsertAfter
            | Operation::Replace => true,
            _ => false,
        }
    }
}

fn applied(patch: &PatchWrapper) {
    record_envoy_filter(&patch.filter_key, patch.apply_to.as_str(), PatchStatus::Applied);
}

/// Merge `value` into `target` with protobuf merge semantics. A failure
/// leaves the target untouched and counts against the patch.
fn merge_message<M: Message + Clone>(patch: &PatchWrapper, target: &mut M, value: &M) {
    let mut merged = target.clone();
    match merged.merge(value.encode_to_vec().as_slice()) {
        Ok(()) => {
            *target = merged;
            applied(patch);
        }
        Err(error) => {
            warn!(envoy_filter = patch.filter_key.as_str(), %error, "merge failed");
            record_envoy_filter(&patch.filter_key, patch.apply_to.as_str(), PatchStatus::Error);
        }
    }
}

/// Merge a network filter. Typed configs of the same type are merged field
/// by field; a config of another type replaces the existing one.
fn merge_network_filter(target: &mut Filter, value: &Filter) {
    if !value.name.is_empty() {
        target.name.clone_from(&value.name);
    }
    match (&mut target.config_type, &value.config_type) {
        (
            Some(filter::ConfigType::TypedConfig(existing)),
            Some(filter::ConfigType::TypedConfig(patch)),
        ) if existing.type_url == patch.type_url => existing.value.extend_from_slice(&patch.value),
        (_, Some(config)) => target.config_type = Some(config.clone()),
        (_, None) => {}
    }
}

fn merge_http_filter(target: &mut HttpFilter, value: &HttpFilter) {
    if !value.name.is_empty() {
        target.name.clone_from(&value.name);
    }
    target.is_optional |= value.is_optional;
    target.disabled |= value.disabled;
    match (&mut target.config_type, &value.config_type) {
        (
            Some(http_filter::ConfigType::TypedConfig(existing)),
            Some(http_filter::ConfigType::TypedConfig(patch)),
        ) if existing.type_url == patch.type_url => existing.value.extend_from_slice(&patch.value),
        (_, Some(config)) => target.config_type = Some(config.clone()),
        (_, None) => {}
    }
}

/// Apply an ADD, INSERT or REPLACE to `items`. Returns true if the list
/// changed.
fn insert<T: Clone>(
    items: &mut Vec<T>,
    operation: Operation,
    named: bool,
    value: &T,
    matches: impl Fn(&T) -> bool,
) -> bool {
    let position = if named { items.iter().position(matches) } else { None };
    match (operation, position) {
        (Operation::Add, _) => items.push(value.clone()),
        (Operation::InsertFirst, _) | (Operation::InsertBefore, None) => {
            items.insert(0, value.clone())
        }
        (Operation::InsertBefore, Some(index)) => items.insert(index, value.clone()),
        (Operation::InsertAfter, Some(index)) => items.insert(index + 1, value.clone()),
        (Operation::InsertAfter, None) => items.push(value.clone()),
        (Operation::Replace, Some(index)) => items[index] = value.clone(),
        _ => return false,
    }
    true
}

fn listener_matches(key: &ListenerKey, patch: &PatchWrapper) -> bool {
    let Some(listener) = &patch.listener else {
        return true;
    };
    if !listener.name.is_empty() && listener.name != key.name {
        return false;
    }
    // Ports on the inbound listener are matched per filter chain.
    if listener.port_number != 0
        && key.name != proto::VIRTUAL_INBOUND
        && key.port.map(u32::from) != Some(listener.port_number)
    {
        return false;
    }
    true
}

fn chain_matches(key: &ListenerKey, chain: &FilterChain, patch: &PatchWrapper) -> bool {
    let Some(listener) = &patch.listener else {
        return true;
    };
    let default = FilterChainMatch::default();
    let criteria = chain.filter_chain_match.as_ref().unwrap_or(&default);
    let destination_port = criteria.destination_port.as_ref().map(|p| p.value);

    if key.name == proto::VIRTUAL_INBOUND
        && listener.port_number != 0
        && destination_port != Some(listener.port_number)
    {
        return false;
    }
    let Some(wanted) = &listener.filter_chain else {
        return true;
    };
    if !wanted.name.is_empty() && wanted.name != chain.name {
        return false;
    }
    if !wanted.sni.is_empty() && !criteria.server_names.contains(&wanted.sni) {
        return false;
    }
    if !wanted.transport_protocol.is_empty() && wanted.transport_protocol != criteria.transport_protocol {
        return false;
    }
    let all_protocols_listed = wanted
        .application_protocols
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .all(|p| criteria.application_protocols.iter().any(|listed| listed == p));
    if !all_protocols_listed {
        return false;
    }
    if wanted.destination_port != 0 && destination_port != Some(wanted.destination_port) {
        return false;
    }
    match filter_name(patch) {
        Some(name) => chain.filters.iter().any(|f| f.name == name),
        None => true,
    }
}

fn filter_name(patch: &PatchWrapper) -> Option<&str> {
    let name = patch.listener.as_ref()?.filter_chain.as_ref()?.filter.as_ref()?.name.as_str();
    (!name.is_empty()).then_some(name)
}

fn sub_filter_name(patch: &PatchWrapper) -> Option<&str> {
    let name = patch
        .listener
        .as_ref()?
        .filter_chain
        .as_ref()?
        .filter
        .as_ref()?
        .sub_filter
        .as_ref()?
        .name
        .as_str();
    (!name.is_empty()).then_some(name)
}

fn network_filter_matches(filter: &Filter, patch: &PatchWrapper) -> bool {
    filter_name(patch).is_none_or(|name| name == filter.name)
}

fn http_filter_matches(filter: &HttpFilter, patch: &PatchWrapper) -> bool {
    sub_filter_name(patch).is_none_or(|name| name == filter.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::TcpProxy;
    use std::collections::BTreeMap;
    use xds_server::model::envoy_filter::{FilterChainMatch as ChainMatch, FilterMatch, ListenerMatch, SubFilterMatch};
    use xds_server::Node;

    use crate::listener::{HcmRoutes, http_connection_manager, router_filter};
    use crate::route::inbound_route_config;

    fn proxy() -> Proxy {
        Proxy::from_node(&Node::new("sidecar~10.0.0.5~reviews-v1.default~default.svc.cluster.local")).unwrap()
    }

    fn patch(apply_to: ApplyTo, operation: Operation, listener: Option<ListenerMatch>, value: Option<PatchValue>) -> Arc<PatchWrapper> {
        Arc::new(PatchWrapper {
            filter_key: "default/test".to_string(),
            apply_to,
            context: PatchContext::Any,
            listener,
            proxy_version: None,
            proxy_metadata: BTreeMap::new(),
            operation,
            value,
        })
    }

    fn merged(patches: Vec<Arc<PatchWrapper>>) -> MergedEnvoyFilters {
        let mut filters = MergedEnvoyFilters {
            keys: vec!["default/test".to_string()],
            ..Default::default()
        };
        for patch in patches {
            filters.patches.entry(patch.apply_to).or_default().push(patch);
        }
        filters
    }

    fn http_filter(name: &str) -> HttpFilter {
        HttpFilter {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn listener_with_http_filters(http_filters: Vec<HttpFilter>) -> Listener {
        let mut hcm_filter = http_connection_manager("inbound_9080", HcmRoutes::Inline(inbound_route_config(9080)));
        let config = proto::filter_config(&hcm_filter, proto::HCM_TYPE).unwrap();
        let mut hcm = HttpConnectionManager::decode(config.value.as_slice()).unwrap();
        hcm.http_filters = http_filters;
        hcm_filter.config_type = Some(filter::ConfigType::TypedConfig(any(proto::HCM_TYPE, &hcm)));
        Listener {
            name: "0.0.0.0_9080".to_string(),
            address: Some(proto::socket_address("0.0.0.0", 9080)),
            filter_chains: vec![FilterChain {
                name: "http".to_string(),
                filters: vec![hcm_filter],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn http_filter_names(listener: &Listener) -> Vec<String> {
        let filter = &listener.filter_chains[0].filters[0];
        let config = proto::filter_config(filter, proto::HCM_TYPE).unwrap();
        let hcm = HttpConnectionManager::decode(config.value.as_slice()).unwrap();
        hcm.http_filters.into_iter().map(|f| f.name).collect()
    }

    fn router_match() -> Option<ListenerMatch> {
        Some(ListenerMatch {
            filter_chain: Some(ChainMatch {
                filter: Some(FilterMatch {
                    name: proto::HTTP_CONNECTION_MANAGER.to_string(),
                    sub_filter: Some(SubFilterMatch {
                        name: proto::ROUTER.to_string(),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn apply(filters: &MergedEnvoyFilters, listeners: Vec<Listener>) -> Vec<Listener> {
        apply_listener_patches(PatchContext::SidecarOutbound, &proxy(), Some(filters), listeners, false)
    }

    #[test]
    fn insert_after_router() {
        let filters = merged(vec![patch(
            ApplyTo::HttpFilter,
            Operation::InsertAfter,
            router_match(),
            Some(PatchValue::HttpFilter(http_filter("envoy.filters.http.lua"))),
        )]);

        let listener = listener_with_http_filters(vec![http_filter("envoy.filters.http.fault"), router_filter()]);
        let out = apply(&filters, vec![listener]);
        assert_eq!(
            http_filter_names(&out[0]),
            vec!["envoy.filters.http.fault", proto::ROUTER, "envoy.filters.http.lua"]
        );

        let listener = listener_with_http_filters(vec![http_filter("envoy.filters.http.fault")]);
        let out = apply(&filters, vec![listener]);
        assert_eq!(
            http_filter_names(&out[0]),
            vec!["envoy.filters.http.fault", "envoy.filters.http.lua"]
        );
    }

    #[test]
    fn insert_before_without_match_prepends_and_replace_is_noop() {
        let filters = merged(vec![
            patch(
                ApplyTo::HttpFilter,
                Operation::InsertBefore,
                router_match(),
                Some(PatchValue::HttpFilter(http_filter("first"))),
            ),
            patch(
                ApplyTo::HttpFilter,
                Operation::Replace,
                router_match(),
                Some(PatchValue::HttpFilter(http_filter("replaced"))),
            ),
        ]);
        let listener = listener_with_http_filters(vec![http_filter("envoy.filters.http.fault")]);
        let out = apply(&filters, vec![listener]);
        assert_eq!(http_filter_names(&out[0]), vec!["first", "envoy.filters.http.fault"]);
    }

    #[test]
    fn remove_and_replace_http_filters() {
        let mut fault = router_match();
        fault
            .as_mut()
            .and_then(|l| l.filter_chain.as_mut())
            .and_then(|c| c.filter.as_mut())
            .and_then(|f| f.sub_filter.as_mut())
            .unwrap()
            .name = "envoy.filters.http.fault".to_string();
        let filters = merged(vec![
            patch(ApplyTo::HttpFilter, Operation::Remove, fault, None),
            patch(
                ApplyTo::HttpFilter,
                Operation::Replace,
                router_match(),
                Some(PatchValue::HttpFilter(http_filter("custom.router"))),
            ),
            patch(
                ApplyTo::HttpFilter,
                Operation::InsertFirst,
                None,
                Some(PatchValue::HttpFilter(http_filter("authn"))),
            ),
        ]);
        let listener = listener_with_http_filters(vec![http_filter("envoy.filters.http.fault"), router_filter()]);
        let out = apply(&filters, vec![listener]);
        assert_eq!(http_filter_names(&out[0]), vec!["authn", "custom.router"]);
    }

    #[test]
    fn empty_merge_is_identity() {
        let filters = merged(vec![
            patch(ApplyTo::Listener, Operation::Merge, None, Some(PatchValue::Listener(Listener::default()))),
            patch(
                ApplyTo::FilterChain,
                Operation::Merge,
                None,
                Some(PatchValue::FilterChain(FilterChain::default())),
            ),
            patch(
                ApplyTo::NetworkFilter,
                Operation::Merge,
                None,
                Some(PatchValue::NetworkFilter(Filter::default())),
            ),
        ]);
        let listener = listener_with_http_filters(vec![router_filter()]);
        let out = apply(&filters, vec![listener.clone()]);
        assert_eq!(out, vec![listener]);
    }

    #[test]
    fn typed_config_merge() {
        let tcp_match = Some(ListenerMatch {
            filter_chain: Some(ChainMatch {
                filter: Some(FilterMatch {
                    name: proto::TCP_PROXY.to_string(),
                    sub_filter: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let patch_value = Filter {
            name: String::new(),
            config_type: Some(filter::ConfigType::TypedConfig(any(
                proto::TCP_PROXY_TYPE,
                &TcpProxy {
                    stat_prefix: "patched".to_string(),
                    ..Default::default()
                },
            ))),
        };
        let filters = merged(vec![patch(
            ApplyTo::NetworkFilter,
            Operation::Merge,
            tcp_match,
            Some(PatchValue::NetworkFilter(patch_value)),
        )]);
        let listener = Listener {
            name: "0.0.0.0_3306".to_string(),
            filter_chains: vec![FilterChain {
                filters: vec![proto::tcp_proxy_filter("mysql", "outbound|3306||mysql.db.svc.cluster.local")],
                ..Default::default()
            }],
            ..Default::default()
        };

        let out = apply(&filters, vec![listener]);
        let filter = &out[0].filter_chains[0].filters[0];
        let config = proto::filter_config(filter, proto::TCP_PROXY_TYPE).unwrap();
        let proxy = TcpProxy::decode(config.value.as_slice()).unwrap();
        assert_eq!(proxy.stat_prefix, "patched");
        assert!(proxy.cluster_specifier.is_some());
    }

    #[test]
    fn remove_listener_short_circuits() {
        let by_name = |name: &str| {
            Some(ListenerMatch {
                name: name.to_string(),
                ..Default::default()
            })
        };
        let filters = merged(vec![
            patch(ApplyTo::Listener, Operation::Remove, by_name("0.0.0.0_9080"), None),
            patch(
                ApplyTo::Listener,
                Operation::Merge,
                by_name("0.0.0.0_9080"),
                Some(PatchValue::Listener(Listener {
                    name: "renamed".to_string(),
                    ..Default::default()
                })),
            ),
            patch(
                ApplyTo::Listener,
                Operation::Add,
                None,
                Some(PatchValue::Listener(Listener {
                    name: "extra".to_string(),
                    ..Default::default()
                })),
            ),
        ]);
        let out = apply(&filters, vec![listener_with_http_filters(vec![router_filter()])]);
        let names: Vec<&str> = out.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["extra"]);

        let out = apply_listener_patches(
            PatchContext::SidecarOutbound,
            &proxy(),
            Some(&filters),
            vec![listener_with_http_filters(vec![router_filter()])],
            true,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn inbound_chains_matched_by_destination_port() {
        let port_match = Some(ListenerMatch {
            port_number: 9080,
            ..Default::default()
        });
        let filters = merged(vec![
            patch(ApplyTo::FilterChain, Operation::Remove, port_match, None),
            patch(
                ApplyTo::FilterChain,
                Operation::Add,
                None,
                Some(PatchValue::FilterChain(FilterChain {
                    name: "added".to_string(),
                    ..Default::default()
                })),
            ),
        ]);
        let chain = |name: &str, port: u32| FilterChain {
            name: name.to_string(),
            filter_chain_match: Some(FilterChainMatch {
                destination_port: proto::u32_value(port),
                ..Default::default()
            }),
            ..Default::default()
        };
        let listener = Listener {
            name: proto::VIRTUAL_INBOUND.to_string(),
            address: Some(proto::socket_address("0.0.0.0", proto::VIRTUAL_INBOUND_PORT)),
            filter_chains: vec![chain("a", 9080), chain("b", 9090)],
            ..Default::default()
        };

        let out = apply_listener_patches(
            PatchContext::SidecarInbound,
            &proxy(),
            Some(&filters),
            vec![listener.clone()],
            true,
        );
        let names: Vec<&str> = out[0].filter_chains.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);

        let out = apply_listener_patches(PatchContext::SidecarInbound, &proxy(), Some(&filters), vec![listener], false);
        let names: Vec<&str> = out[0].filter_chains.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "added"]);
    }

    #[test]
    fn context_gates_patches() {
        let mut inbound_only = (*patch(ApplyTo::Listener, Operation::Remove, None, None)).clone();
        inbound_only.context = PatchContext::SidecarInbound;
        let filters = merged(vec![Arc::new(inbound_only)]);
        let listener = listener_with_http_filters(vec![router_filter()]);

        let out = apply(&filters, vec![listener.clone()]);
        assert_eq!(out.len(), 1);
        let out = apply_listener_patches(PatchContext::SidecarInbound, &proxy(), Some(&filters), vec![listener], false);
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_config_keeps_unpatched_listener() {
        let garbage = Filter {
            name: String::new(),
            config_type: Some(filter::ConfigType::TypedConfig(
                envoy_types::pb::google::protobuf::Any {
                    type_url: proto::HCM_TYPE.to_string(),
                    value: vec![0xff],
                },
            )),
        };
        let filters = merged(vec![
            patch(ApplyTo::NetworkFilter, Operation::Merge, None, Some(PatchValue::NetworkFilter(garbage))),
            patch(
                ApplyTo::HttpFilter,
                Operation::InsertFirst,
                None,
                Some(PatchValue::HttpFilter(http_filter("authn"))),
            ),
        ]);
        let listener = listener_with_http_filters(vec![router_filter()]);
        let out = apply(&filters, vec![listener.clone()]);
        assert_eq!(out, vec![listener]);
    }

    #[test]
    fn chain_criteria_must_all_hold() {
        let chain = FilterChain {
            name: "inbound_9080_tls".to_string(),
            filter_chain_match: Some(FilterChainMatch {
                transport_protocol: "tls".to_string(),
                application_protocols: vec!["istio".to_string(), "istio-h2".to_string()],
                server_names: vec!["reviews.default.svc.cluster.local".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let key = ListenerKey {
            name: "0.0.0.0_9080".to_string(),
            port: Some(9080),
        };
        let with = |criteria: ChainMatch| {
            patch(
                ApplyTo::FilterChain,
                Operation::Remove,
                Some(ListenerMatch {
                    filter_chain: Some(criteria),
                    ..Default::default()
                }),
                None,
            )
        };

        assert!(chain_matches(&key, &chain, &with(ChainMatch {
            transport_protocol: "tls".to_string(),
            application_protocols: "istio, istio-h2".to_string(),
            sni: "reviews.default.svc.cluster.local".to_string(),
            ..Default::default()
        })));
        assert!(!chain_matches(&key, &chain, &with(ChainMatch {
            application_protocols: "h2".to_string(),
            ..Default::default()
        })));
        assert!(!chain_matches(&key, &chain, &with(ChainMatch {
            destination_port: 9080,
            ..Default::default()
        })));
        assert!(!chain_matches(&key, &chain, &with(ChainMatch {
            filter: Some(FilterMatch {
                name: proto::TCP_PROXY.to_string(),
                sub_filter: None,
            }),
            ..Default::default()
        })));
    }
}
