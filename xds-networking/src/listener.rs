//! Builds the listeners of a proxy.
//!
//! A sidecar gets one outbound listener per service port, the
//! `virtualOutbound` catch-all and the `virtualInbound` listener carrying one
//! set of filter chains per served port. A router gets the outbound
//! listeners only. EnvoyFilter listener patches are applied before the
//! listeners are returned.

use std::collections::BTreeMap;
use std::net::IpAddr;

use envoy_types::pb::envoy::config::core::v3::{CidrRange, TrafficDirection, TransportSocket, transport_socket};
use envoy_types::pb::envoy::config::listener::v3::{
    Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter, filter, listener_filter,
};
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::http_inspector::v3::HttpInspector;
use envoy_types::pb::envoy::extensions::filters::listener::original_dst::v3::OriginalDst;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    HttpConnectionManager, HttpFilter, Rds, http_connection_manager, http_filter,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, DownstreamTlsContext,
};
use tracing::debug;
use xds_server::model::envoy_filter::PatchContext;
use xds_server::model::policy::MtlsMode;
use xds_server::model::proxy::NodeType;
use xds_server::model::push_context::MergedEnvoyFilters;
use xds_server::model::service::{Protocol, Service, ServiceInstance};
use xds_server::{PushContext, Proxy};

use crate::envoyfilter;
use crate::proto::{self, any};
use crate::route;

/// Builds the listeners of one proxy from a push context.
#[derive(Debug)]
pub struct ListenerBuilder<'a> {
    proxy: &'a Proxy,
    push: &'a PushContext,
    envoy_filters: Option<MergedEnvoyFilters>,
}

impl<'a> ListenerBuilder<'a> {
    /// Create a builder for `proxy`.
    pub fn new(proxy: &'a Proxy, push: &'a PushContext) -> Self {
        Self {
            proxy,
            push,
            envoy_filters: push.envoy_filters(proxy),
        }
    }

    /// All listeners of the proxy, patched.
    pub fn build(&self) -> Vec<Listener> {
        match self.proxy.node_type {
            NodeType::Router => self.patch(PatchContext::Gateway, self.outbound_listeners(), false),
            NodeType::Sidecar => {
                let mut listeners =
                    self.patch(PatchContext::SidecarOutbound, self.outbound_listeners(), false);
                listeners.extend(self.patch(
                    PatchContext::SidecarOutbound,
                    vec![virtual_outbound_listener()],
                    true,
                ));
                listeners.extend(self.patch(
                    PatchContext::SidecarInbound,
                    vec![self.virtual_inbound_listener()],
                    false,
                ));
                listeners
            }
        }
    }

    fn patch(&self, context: PatchContext, listeners: Vec<Listener>, skip_adds: bool) -> Vec<Listener> {
        envoyfilter::apply_listener_patches(
            context,
            self.proxy,
            self.envoy_filters.as_ref(),
            listeners,
            skip_adds,
        )
    }

    /// One `0.0.0.0_<port>` listener per service port, unpatched.
    pub fn outbound_listeners(&self) -> Vec<Listener> {
        let mut by_port: BTreeMap<u16, Vec<(&Service, Protocol)>> = BTreeMap::new();
        for service in self.push.services() {
            for port in &service.ports {
                by_port
                    .entry(port.port)
                    .or_default()
                    .push((service.as_ref(), port.protocol));
            }
        }

        by_port
            .into_iter()
            .map(|(port, services)| self.outbound_listener(port, &services))
            .collect()
    }

    fn outbound_listener(&self, port: u16, services: &[(&Service, Protocol)]) -> Listener {
        let name = format!("0.0.0.0_{port}");
        let mut chains = Vec::new();
        let mut has_http = false;
        let mut needs_tls_inspector = false;

        for (service, protocol) in services {
            if protocol.is_http() {
                has_http = true;
                continue;
            }
            let cluster = proto::outbound_cluster_name(port, &service.hostname);
            if *protocol == Protocol::Tls {
                needs_tls_inspector = true;
                chains.push(FilterChain {
                    name: cluster.clone(),
                    filter_chain_match: Some(FilterChainMatch {
                        server_names: vec![service.hostname.clone()],
                        transport_protocol: proto::TRANSPORT_TLS.to_string(),
                        ..Default::default()
                    }),
                    filters: vec![proto::tcp_proxy_filter(&cluster, &cluster)],
                    ..Default::default()
                });
                continue;
            }
            let Some(vip) = service_vip(service) else {
                debug!(hostname = service.hostname.as_str(), port, "tcp service without a VIP");
                continue;
            };
            chains.push(FilterChain {
                name: cluster.clone(),
                filter_chain_match: Some(FilterChainMatch {
                    prefix_ranges: vec![host_cidr(vip)],
                    ..Default::default()
                }),
                filters: vec![proto::tcp_proxy_filter(&cluster, &cluster)],
                ..Default::default()
            });
        }

        if has_http {
            chains.push(FilterChain {
                name: format!("http_{port}"),
                filters: vec![http_connection_manager(
                    &format!("outbound_0.0.0.0_{port}"),
                    HcmRoutes::Rds(route::outbound_route_config_name(port)),
                )],
                ..Default::default()
            });
        }

        Listener {
            name: name.clone(),
            address: Some(proto::socket_address("0.0.0.0", port)),
            filter_chains: chains,
            default_filter_chain: Some(passthrough_chain()),
            listener_filters: if needs_tls_inspector {
                vec![listener_filter(proto::TLS_INSPECTOR, proto::TLS_INSPECTOR_TYPE, &TlsInspector::default())]
            } else {
                Vec::new()
            },
            bind_to_port: proto::bool_value(false),
            traffic_direction: TrafficDirection::Outbound as i32,
            ..Default::default()
        }
    }

    /// The inbound listener with chains for every served port, unpatched.
    pub fn virtual_inbound_listener(&self) -> Listener {
        let mut chains = Vec::new();
        let mut seen = Vec::new();
        for instance in &self.proxy.service_instances {
            let port = instance.endpoint.port;
            if seen.contains(&port) {
                continue;
            }
            seen.push(port);
            let mode = match self
                .push
                .mtls_mode(&self.proxy.config_namespace, &self.proxy.labels, port)
            {
                MtlsMode::Unset => MtlsMode::Permissive,
                mode => mode,
            };
            chains.extend(inbound_chains(instance, mode));
        }

        Listener {
            name: proto::VIRTUAL_INBOUND.to_string(),
            address: Some(proto::socket_address("0.0.0.0", proto::VIRTUAL_INBOUND_PORT)),
            filter_chains: chains,
            default_filter_chain: Some(FilterChain {
                name: "InboundPassthroughFilterChain".to_string(),
                filters: vec![proto::tcp_proxy_filter(
                    proto::INBOUND_PASSTHROUGH_CLUSTER,
                    proto::INBOUND_PASSTHROUGH_CLUSTER,
                )],
                ..Default::default()
            }),
            listener_filters: vec![
                listener_filter(proto::ORIGINAL_DST, proto::ORIGINAL_DST_TYPE, &OriginalDst::default()),
                listener_filter(proto::TLS_INSPECTOR, proto::TLS_INSPECTOR_TYPE, &TlsInspector::default()),
                listener_filter(proto::HTTP_INSPECTOR, proto::HTTP_INSPECTOR_TYPE, &HttpInspector::default()),
            ],
            use_original_dst: proto::bool_value(true),
            traffic_direction: TrafficDirection::Inbound as i32,
            ..Default::default()
        }
    }
}

/// The catch-all outbound listener.
pub fn virtual_outbound_listener() -> Listener {
    Listener {
        name: proto::VIRTUAL_OUTBOUND.to_string(),
        address: Some(proto::socket_address("0.0.0.0", proto::VIRTUAL_OUTBOUND_PORT)),
        filter_chains: vec![passthrough_chain()],
        use_original_dst: proto::bool_value(true),
        traffic_direction: TrafficDirection::Outbound as i32,
        ..Default::default()
    }
}

fn passthrough_chain() -> FilterChain {
    FilterChain {
        name: "PassthroughFilterChain".to_string(),
        filters: vec![proto::tcp_proxy_filter(
            proto::PASSTHROUGH_CLUSTER,
            proto::PASSTHROUGH_CLUSTER,
        )],
        ..Default::default()
    }
}

fn inbound_chains(instance: &ServiceInstance, mode: MtlsMode) -> Vec<FilterChain> {
    let port = instance.endpoint.port;
    let http = instance.service_port.protocol.is_http();
    let filters = || {
        let cluster = proto::inbound_cluster_name(port);
        if http {
            vec![http_connection_manager(
                &format!("inbound_0.0.0.0_{port}"),
                HcmRoutes::Inline(route::inbound_route_config(port)),
            )]
        } else {
            vec![proto::tcp_proxy_filter(&cluster, &cluster)]
        }
    };

    let tls_chain = || FilterChain {
        name: format!("inbound_{port}_tls"),
        filter_chain_match: Some(FilterChainMatch {
            destination_port: proto::u32_value(u32::from(port)),
            transport_protocol: proto::TRANSPORT_TLS.to_string(),
            application_protocols: proto::MTLS_ALPN.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }),
        filters: filters(),
        transport_socket: Some(downstream_tls(http)),
        ..Default::default()
    };

    match mode {
        MtlsMode::Strict => vec![tls_chain()],
        MtlsMode::Disable => vec![FilterChain {
            name: format!("inbound_{port}_plaintext"),
            filter_chain_match: Some(FilterChainMatch {
                destination_port: proto::u32_value(u32::from(port)),
                ..Default::default()
            }),
            filters: filters(),
            ..Default::default()
        }],
        MtlsMode::Permissive | MtlsMode::Unset => vec![
            tls_chain(),
            FilterChain {
                name: format!("inbound_{port}_raw"),
                filter_chain_match: Some(FilterChainMatch {
                    destination_port: proto::u32_value(u32::from(port)),
                    transport_protocol: proto::TRANSPORT_RAW.to_string(),
                    ..Default::default()
                }),
                filters: filters(),
                ..Default::default()
            },
        ],
    }
}

fn downstream_tls(http: bool) -> TransportSocket {
    let alpn = if http {
        vec!["h2".to_string(), "http/1.1".to_string()]
    } else {
        Vec::new()
    };
    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols: alpn,
            ..Default::default()
        }),
        require_client_certificate: proto::bool_value(true),
        ..Default::default()
    };
    TransportSocket {
        name: proto::TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(any(
            proto::DOWNSTREAM_TLS_TYPE,
            &context,
        ))),
    }
}

/// Where an HTTP connection manager finds its routes.
#[derive(Debug, Clone)]
pub(crate) enum HcmRoutes {
    /// Fetched over RDS by name.
    Rds(String),
    /// Embedded.
    Inline(RouteConfiguration),
}

/// An HTTP connection manager network filter ending in the router.
pub(crate) fn http_connection_manager(stat_prefix: &str, routes: HcmRoutes) -> Filter {
    let route_specifier = match routes {
        HcmRoutes::Rds(name) => http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(proto::ads_config_source()),
            route_config_name: name,
        }),
        HcmRoutes::Inline(config) => http_connection_manager::RouteSpecifier::RouteConfig(config),
    };
    let hcm = HttpConnectionManager {
        stat_prefix: stat_prefix.to_string(),
        route_specifier: Some(route_specifier),
        http_filters: vec![router_filter()],
        ..Default::default()
    };
    Filter {
        name: proto::HTTP_CONNECTION_MANAGER.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any(proto::HCM_TYPE, &hcm))),
    }
}

pub(crate) fn router_filter() -> HttpFilter {
    HttpFilter {
        name: proto::ROUTER.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(any(
            proto::ROUTER_TYPE,
            &Router::default(),
        ))),
        ..Default::default()
    }
}

fn listener_filter<M: prost::Message>(name: &str, type_url: &str, config: &M) -> ListenerFilter {
    ListenerFilter {
        name: name.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(any(type_url, config))),
        ..Default::default()
    }
}

/// The service VIP, if it has a routable one.
pub(crate) fn service_vip(service: &Service) -> Option<IpAddr> {
    let ip: IpAddr = service.address.parse().ok()?;
    (!ip.is_unspecified()).then_some(ip)
}

fn host_cidr(ip: IpAddr) -> CidrRange {
    let len = if ip.is_ipv4() { 32 } else { 128 };
    CidrRange {
        address_prefix: ip.to_string(),
        prefix_len: proto::u32_value(len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{push_context, sidecar};
    use xds_server::model::policy::PeerAuthentication;
    use xds_server::ConfigSpec;

    fn chain_names(listener: &Listener) -> Vec<&str> {
        listener.filter_chains.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn sidecar_gets_outbound_and_virtual_listeners() {
        let push = push_context(Vec::new());
        let proxy = sidecar(&push, "10.0.0.5");
        let listeners = ListenerBuilder::new(&proxy, &push).build();
        let names: Vec<&str> = listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["0.0.0.0_3306", "0.0.0.0_9080", "virtualOutbound", "virtualInbound"]
        );

        let http = &listeners[1];
        assert_eq!(chain_names(http), vec!["http_9080"]);
        assert_eq!(http.bind_to_port, proto::bool_value(false));

        let tcp = &listeners[0];
        assert_eq!(chain_names(tcp), vec!["outbound|3306||mysql.db.svc.cluster.local"]);
        let prefix = &tcp.filter_chains[0].filter_chain_match.as_ref().unwrap().prefix_ranges[0];
        assert_eq!(prefix.address_prefix, "10.96.0.20");
        assert!(tcp.default_filter_chain.is_some());
    }

    #[test]
    fn inbound_chains_follow_mtls_mode() {
        let push = push_context(Vec::new());
        let proxy = sidecar(&push, "10.0.0.5");
        let inbound = ListenerBuilder::new(&proxy, &push).virtual_inbound_listener();
        assert_eq!(chain_names(&inbound), vec!["inbound_9080_tls", "inbound_9080_raw"]);
        assert!(inbound.filter_chains[0].transport_socket.is_some());
        assert_eq!(inbound.listener_filters.len(), 3);

        let strict = ConfigSpec::PeerAuthentication(PeerAuthentication {
            mode: MtlsMode::Strict,
            ..Default::default()
        });
        let push = push_context(vec![("default", "strict", strict)]);
        let proxy = sidecar(&push, "10.0.0.5");
        let inbound = ListenerBuilder::new(&proxy, &push).virtual_inbound_listener();
        assert_eq!(chain_names(&inbound), vec!["inbound_9080_tls"]);

        let disable = ConfigSpec::PeerAuthentication(PeerAuthentication {
            mode: MtlsMode::Disable,
            ..Default::default()
        });
        let push = push_context(vec![("default", "off", disable)]);
        let proxy = sidecar(&push, "10.0.0.5");
        let inbound = ListenerBuilder::new(&proxy, &push).virtual_inbound_listener();
        assert_eq!(chain_names(&inbound), vec!["inbound_9080_plaintext"]);
        let chain_match = inbound.filter_chains[0].filter_chain_match.as_ref().unwrap();
        assert!(chain_match.transport_protocol.is_empty());
    }

    #[test]
    fn router_gets_outbound_listeners_only() {
        let push = push_context(Vec::new());
        let mut proxy = sidecar(&push, "10.0.0.5");
        proxy.node_type = NodeType::Router;
        let listeners = ListenerBuilder::new(&proxy, &push).build();
        assert!(listeners.iter().all(|l| l.name.starts_with("0.0.0.0_")));
    }

    #[test]
    fn unspecified_address_has_no_vip() {
        let service = Service {
            hostname: "headless.default.svc.cluster.local".to_string(),
            address: "0.0.0.0".to_string(),
            ..Default::default()
        };
        assert_eq!(service_vip(&service), None);
    }
}
