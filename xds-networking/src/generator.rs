//! Generators serving listeners, routes, clusters and endpoints from the
//! push context.

use std::collections::HashSet;
use std::sync::Arc;

use xds_server::resource::{CLUSTER, ENDPOINT, LISTENER, ROUTE};
use xds_server::{
    DiscoveryServerBuilder, Generator, Kind, PushContext, PushRequest, Proxy, Resource,
    Resources, WatchedResource,
};

use crate::cluster::ClusterBuilder;
use crate::endpoint;
use crate::listener::ListenerBuilder;
use crate::proto;
use crate::route::RouteBuilder;

/// Register the listener, route, cluster and endpoint generators.
pub fn install(builder: DiscoveryServerBuilder) -> DiscoveryServerBuilder {
    builder
        .with_generator(LISTENER, Arc::new(ListenerGenerator))
        .with_generator(ROUTE, Arc::new(RouteGenerator))
        .with_generator(CLUSTER, Arc::new(ClusterGenerator))
        .with_generator(ENDPOINT, Arc::new(EndpointGenerator))
}

fn versioned(push: &PushContext, mut resource: Resource) -> Resource {
    resource.version = push.version().to_string();
    resource
}

fn wanted(watched: &WatchedResource, name: &str) -> bool {
    watched.wildcard || watched.resource_names.contains(name)
}

/// Serves the proxy's listeners with EnvoyFilter patches applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerGenerator;

impl Generator for ListenerGenerator {
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        _request: &PushRequest,
    ) -> xds_server::Result<Option<Resources>> {
        let resources = ListenerBuilder::new(proxy, push)
            .build()
            .into_iter()
            .filter(|listener| wanted(watched, &listener.name))
            .map(|listener| versioned(push, Resource::new(listener.name.clone(), LISTENER, &listener)))
            .collect();
        Ok(Some(resources))
    }
}

/// Serves the route configurations the proxy's listeners refer to.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteGenerator;

impl Generator for RouteGenerator {
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        _request: &PushRequest,
    ) -> xds_server::Result<Option<Resources>> {
        let builder = RouteBuilder::new(proxy, push);
        let names: Vec<String> = if watched.wildcard {
            builder.names()
        } else {
            watched.resource_names.iter().cloned().collect()
        };
        let resources = names
            .iter()
            .map(|name| versioned(push, Resource::new(name.clone(), ROUTE, &builder.build(name))))
            .collect();
        Ok(Some(resources))
    }
}

/// Serves the proxy's clusters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterGenerator;

impl Generator for ClusterGenerator {
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        _request: &PushRequest,
    ) -> xds_server::Result<Option<Resources>> {
        let resources = ClusterBuilder::new(proxy, push)
            .build()
            .into_iter()
            .filter(|cluster| wanted(watched, &cluster.name))
            .map(|cluster| versioned(push, Resource::new(cluster.name.clone(), CLUSTER, &cluster)))
            .collect();
        Ok(Some(resources))
    }
}

/// Serves load assignments. Incremental pushes naming only services send
/// the assignments of those services.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointGenerator;

impl Generator for EndpointGenerator {
    fn generate(
        &self,
        _proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> xds_server::Result<Option<Resources>> {
        let mut names: Vec<String> = if watched.wildcard {
            endpoint::cluster_names(push)
        } else {
            watched.resource_names.iter().cloned().collect()
        };

        if let Some(hostnames) = changed_services(request) {
            names.retain(|name| {
                proto::parse_outbound_cluster_name(name)
                    .is_some_and(|(_, hostname)| hostnames.contains(hostname))
            });
            if names.is_empty() {
                return Ok(None);
            }
        }

        let resources = names
            .iter()
            .map(|name| versioned(push, Resource::new(name.clone(), ENDPOINT, &endpoint::load_assignment(push, name))))
            .collect();
        Ok(Some(resources))
    }

    fn handles_incremental(&self) -> bool {
        true
    }
}

/// Hostnames an incremental push is limited to, or `None` when any
/// assignment may have changed.
fn changed_services(request: &PushRequest) -> Option<HashSet<&str>> {
    if request.full || request.configs_updated.is_empty() {
        return None;
    }
    request
        .configs_updated
        .iter()
        .map(|key| (key.kind == Kind::Service).then_some(key.name.as_str()))
        .collect()
}
