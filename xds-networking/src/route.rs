//! Route configurations served over RDS.
//!
//! Outbound HTTP listeners refer to a route configuration named after their
//! port. It holds one virtual host per HTTP service on that port, plus an
//! `allow_any` host forwarding unknown authorities to the passthrough
//! cluster.

use envoy_types::pb::envoy::config::route::v3::{
    Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost, route, route_action,
    route_match,
};
use xds_server::model::service::Service;
use xds_server::{PushContext, Proxy};

use crate::listener::service_vip;
use crate::proto;

/// Name of the route configuration outbound listeners on `port` fetch.
pub fn outbound_route_config_name(port: u16) -> String {
    port.to_string()
}

/// Builds route configurations for one proxy.
#[derive(Debug, Clone, Copy)]
pub struct RouteBuilder<'a> {
    proxy: &'a Proxy,
    push: &'a PushContext,
}

impl<'a> RouteBuilder<'a> {
    /// Create a builder for `proxy`.
    pub fn new(proxy: &'a Proxy, push: &'a PushContext) -> Self {
        Self { proxy, push }
    }

    /// Names of every route configuration the proxy's listeners refer to.
    pub fn names(&self) -> Vec<String> {
        let mut ports: Vec<u16> = self
            .push
            .services()
            .flat_map(|s| s.ports.iter())
            .filter(|p| p.protocol.is_http())
            .map(|p| p.port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports.into_iter().map(outbound_route_config_name).collect()
    }

    /// Build the named route configuration. Names that are not a port
    /// produce an empty configuration.
    pub fn build(&self, name: &str) -> RouteConfiguration {
        let Ok(port) = name.parse::<u16>() else {
            return RouteConfiguration {
                name: name.to_string(),
                ..Default::default()
            };
        };

        let mut virtual_hosts: Vec<VirtualHost> = self
            .push
            .services()
            .filter(|s| s.port(port).is_some_and(|p| p.protocol.is_http()))
            .map(|service| VirtualHost {
                name: format!("{}:{port}", service.hostname),
                domains: self.domains(service, port),
                routes: vec![forward_all(&proto::outbound_cluster_name(port, &service.hostname))],
                ..Default::default()
            })
            .collect();
        virtual_hosts.push(VirtualHost {
            name: "allow_any".to_string(),
            domains: vec!["*".to_string()],
            routes: vec![forward_all(proto::PASSTHROUGH_CLUSTER)],
            ..Default::default()
        });

        RouteConfiguration {
            name: name.to_string(),
            virtual_hosts,
            validate_clusters: proto::bool_value(false),
            ..Default::default()
        }
    }

    fn domains(&self, service: &Service, port: u16) -> Vec<String> {
        let mut hosts = vec![service.hostname.clone()];
        let labels: Vec<&str> = service.hostname.split('.').collect();
        if labels.len() > 3 && labels[1] == service.namespace && labels[2] == "svc" {
            if service.namespace == self.proxy.config_namespace {
                hosts.push(labels[0].to_string());
            }
            hosts.push(labels[..2].join("."));
            hosts.push(labels[..3].join("."));
        }
        if let Some(vip) = service_vip(service) {
            hosts.push(vip.to_string());
        }

        hosts
            .into_iter()
            .flat_map(|host| {
                let with_port = format!("{host}:{port}");
                [host, with_port]
            })
            .collect()
    }
}

/// The route configuration embedded in an inbound HTTP chain.
pub fn inbound_route_config(port: u16) -> RouteConfiguration {
    let cluster = proto::inbound_cluster_name(port);
    RouteConfiguration {
        name: cluster.clone(),
        virtual_hosts: vec![VirtualHost {
            name: format!("inbound|http|{port}"),
            domains: vec!["*".to_string()],
            routes: vec![forward_all(&cluster)],
            ..Default::default()
        }],
        validate_clusters: proto::bool_value(false),
        ..Default::default()
    }
}

fn forward_all(cluster: &str) -> Route {
    Route {
        name: "default".to_string(),
        r#match: Some(RouteMatch {
            path_specifier: Some(route_match::PathSpecifier::Prefix("/".to_string())),
            ..Default::default()
        }),
        action: Some(route::Action::Route(RouteAction {
            cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(cluster.to_string())),
            ..Default::default()
        })),
        ..Default::default()
    }
}
