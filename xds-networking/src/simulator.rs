//! Predicts which listener, filter chain, route and cluster a proxy uses
//! for a call, the way Envoy selects them.
//!
//! Filter chains are selected by narrowing the candidates through the
//! destination port, destination prefix ranges, server names, transport
//! protocol and application protocols in that order. A stage only narrows
//! when some candidate declares its criterion: matching declared candidates
//! win, and when none of them match, the candidates without the criterion
//! survive. Source matching is not simulated.

use std::collections::HashMap;
use std::net::IpAddr;

use envoy_types::pb::envoy::config::listener::v3::{FilterChain, FilterChainMatch, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    Route, RouteConfiguration, VirtualHost, route, route_action, route_match,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    HttpConnectionManager, http_connection_manager,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{TcpProxy, tcp_proxy};
use ipnet::IpNet;
use prost::Message;
use regex::Regex;
use tracing::trace;
use xds_server::{PushContext, Proxy};

use crate::error::{Error, Result};
use crate::listener::ListenerBuilder;
use crate::proto;
use crate::route::RouteBuilder;

/// TLS used by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// No TLS.
    #[default]
    Plaintext,
    /// TLS originated by the application.
    Tls,
    /// Mesh mutual TLS.
    Mtls,
}

/// Application protocol of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// HTTP/1.1.
    #[default]
    Http,
    /// HTTP/2.
    Http2,
    /// Opaque TCP.
    Tcp,
}

/// Whether the call leaves or enters the proxy's workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// From the workload to a destination.
    #[default]
    Outbound,
    /// From a peer to the workload.
    Inbound,
}

/// A connection or request to simulate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Call {
    /// Destination address.
    pub address: String,
    /// Destination port.
    pub port: u16,
    /// Server name sent in the TLS handshake.
    pub sni: Option<String>,
    /// ALPN offered in the TLS handshake; derived from the TLS mode and
    /// protocol when empty.
    pub alpn: Vec<String>,
    /// TLS used by the caller.
    pub tls: TlsMode,
    /// Application protocol.
    pub protocol: Protocol,
    /// HTTP authority; defaults to `address:port`.
    pub host: Option<String>,
    /// HTTP path.
    pub path: String,
    /// Call direction.
    pub direction: Direction,
}

impl Call {
    /// An outbound plaintext HTTP call to `address:port` for `/`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            path: "/".to_string(),
            ..Default::default()
        }
    }

    /// Set the server name.
    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    /// Set the offered ALPN.
    pub fn with_alpn<I, S>(mut self, alpn: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn = alpn.into_iter().map(Into::into).collect();
        self
    }

    /// Set the TLS mode.
    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Set the protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the HTTP authority.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the HTTP path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Make the call inbound.
    pub fn inbound(mut self) -> Self {
        self.direction = Direction::Inbound;
        self
    }

    fn authority(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => format!("{}:{}", self.address, self.port),
        }
    }

    fn offered_alpn(&self, http_inspector: bool) -> Vec<String> {
        if !self.alpn.is_empty() {
            return self.alpn.clone();
        }
        let protocols: &[&str] = match (self.tls, self.protocol) {
            (TlsMode::Mtls, Protocol::Http) => &["istio-http/1.1", "istio"],
            (TlsMode::Mtls, Protocol::Http2) => &["istio-h2", "istio"],
            (TlsMode::Mtls, Protocol::Tcp) => &["istio-peer-exchange", "istio"],
            (TlsMode::Plaintext, Protocol::Http) if http_inspector => &["http/1.1"],
            (TlsMode::Plaintext, Protocol::Http2) if http_inspector => &["h2c"],
            _ => &[],
        };
        protocols.iter().map(|p| p.to_string()).collect()
    }
}

/// Where a call ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Listener that accepted the connection.
    pub listener: String,
    /// Selected filter chain.
    pub filter_chain: String,
    /// Route configuration, for HTTP chains.
    pub route_config: Option<String>,
    /// Virtual host, for HTTP chains.
    pub virtual_host: Option<String>,
    /// Route, for HTTP chains.
    pub route: Option<String>,
    /// Destination cluster.
    pub cluster: String,
}

/// Listeners and routes of one proxy, ready to answer calls.
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    listeners: Vec<Listener>,
    routes: HashMap<String, RouteConfiguration>,
}

impl Simulation {
    /// Simulate over the given configuration.
    pub fn new(listeners: Vec<Listener>, routes: Vec<RouteConfiguration>) -> Self {
        Self {
            listeners,
            routes: routes.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// Simulate over the configuration generated for `proxy`.
    pub fn for_proxy(proxy: &Proxy, push: &PushContext) -> Self {
        let routes = RouteBuilder::new(proxy, push);
        Self::new(
            ListenerBuilder::new(proxy, push).build(),
            routes.names().iter().map(|name| routes.build(name)).collect(),
        )
    }

    /// Follow a call through listener, filter chain, route and cluster
    /// selection.
    pub fn run(&self, call: &Call) -> Result<RouteDecision> {
        let listener = self.select_listener(call)?;
        let chain = match_filter_chain(listener, call)?;
        trace!(listener = listener.name.as_str(), filter_chain = chain.name.as_str(), "filter chain selected");

        let mut decision = RouteDecision {
            listener: listener.name.clone(),
            filter_chain: chain.name.clone(),
            route_config: None,
            virtual_host: None,
            route: None,
            cluster: String::new(),
        };

        if let Some(filter) = chain.filters.iter().find(|f| f.name == proto::HTTP_CONNECTION_MANAGER) {
            let config = proto::filter_config(filter, proto::HCM_TYPE)
                .ok_or_else(|| Error::NoCluster(chain.name.clone()))?;
            let hcm = HttpConnectionManager::decode(config.value.as_slice()).map_err(|source| {
                Error::Decode {
                    what: "http connection manager",
                    source,
                }
            })?;
            let route_config = match hcm.route_specifier {
                Some(http_connection_manager::RouteSpecifier::Rds(rds)) => self
                    .routes
                    .get(&rds.route_config_name)
                    .cloned()
                    .ok_or(Error::NoRouteConfiguration(rds.route_config_name))?,
                Some(http_connection_manager::RouteSpecifier::RouteConfig(config)) => config,
                _ => return Err(Error::NoRouteConfiguration(chain.name.clone())),
            };

            let host = call.authority();
            let virtual_host = match_virtual_host(&route_config.virtual_hosts, &host).ok_or_else(|| {
                Error::NoVirtualHost {
                    route_config: route_config.name.clone(),
                    host,
                }
            })?;
            let route = match_route(&virtual_host.routes, &call.path).ok_or_else(|| Error::NoRoute {
                virtual_host: virtual_host.name.clone(),
                path: call.path.clone(),
            })?;
            decision.cluster = route_cluster(route).ok_or_else(|| Error::NoCluster(route.name.clone()))?;
            decision.route = Some(route.name.clone());
            decision.virtual_host = Some(virtual_host.name.clone());
            decision.route_config = Some(route_config.name);
            return Ok(decision);
        }

        let tcp = chain
            .filters
            .iter()
            .find(|f| f.name == proto::TCP_PROXY)
            .and_then(|f| proto::filter_config(f, proto::TCP_PROXY_TYPE))
            .ok_or_else(|| Error::NoCluster(chain.name.clone()))?;
        let tcp = TcpProxy::decode(tcp.value.as_slice()).map_err(|source| Error::Decode {
            what: "tcp proxy",
            source,
        })?;
        decision.cluster = match tcp.cluster_specifier {
            Some(tcp_proxy::ClusterSpecifier::Cluster(cluster)) => cluster,
            Some(tcp_proxy::ClusterSpecifier::WeightedClusters(weighted)) => weighted
                .clusters
                .into_iter()
                .fold(None::<(String, u32)>, |best, c| match best {
                    Some((_, weight)) if weight >= c.weight => best,
                    _ => Some((c.name, c.weight)),
                })
                .map(|(name, _)| name)
                .ok_or_else(|| Error::NoCluster(chain.name.clone()))?,
            None => return Err(Error::NoCluster(chain.name.clone())),
        };
        Ok(decision)
    }

    /// The listener a call lands on.
    pub fn select_listener(&self, call: &Call) -> Result<&Listener> {
        let by_name = |name: &str| self.listeners.iter().find(|l| l.name == name);
        let found = match call.direction {
            Direction::Inbound => by_name(proto::VIRTUAL_INBOUND),
            Direction::Outbound => by_name(&format!("{}_{}", call.address, call.port))
                .or_else(|| by_name(&format!("0.0.0.0_{}", call.port)))
                .or_else(|| by_name(proto::VIRTUAL_OUTBOUND)),
        };
        found.ok_or_else(|| Error::NoListener {
            address: call.address.clone(),
            port: call.port,
        })
    }
}

/// Select the filter chain of `listener` that accepts `call`.
pub fn match_filter_chain<'l>(listener: &'l Listener, call: &Call) -> Result<&'l FilterChain> {
    let has_filter = |name: &str| listener.listener_filters.iter().any(|f| f.name == name);
    let tls_inspector = has_filter(proto::TLS_INSPECTOR);
    let tls = call.tls != TlsMode::Plaintext;
    let transport = if tls && tls_inspector {
        proto::TRANSPORT_TLS
    } else {
        proto::TRANSPORT_RAW
    };
    let sni = call.sni.as_deref().filter(|_| tls && tls_inspector);
    let alpn = call.offered_alpn(has_filter(proto::HTTP_INSPECTOR));
    let address: Option<IpAddr> = call.address.parse().ok();

    let mut candidates: Vec<&FilterChain> = listener.filter_chains.iter().collect();
    candidates = narrow(
        candidates,
        |m| m.destination_port.is_some(),
        |m| (m.destination_port.as_ref().map(|p| p.value) == Some(u32::from(call.port))).then_some(0),
    );
    candidates = narrow(
        candidates,
        |m| !m.prefix_ranges.is_empty(),
        |m| {
            let address = address?;
            m.prefix_ranges
                .iter()
                .filter_map(|range| {
                    let prefix: IpAddr = range.address_prefix.parse().ok()?;
                    let len = range.prefix_len.as_ref().map_or(0, |l| l.value);
                    let net = IpNet::new(prefix, u8::try_from(len).ok()?).ok()?.trunc();
                    net.contains(&address).then_some(len)
                })
                .max()
        },
    );
    candidates = narrow(
        candidates,
        |m| !m.server_names.is_empty(),
        |m| {
            let sni = sni?;
            m.server_names.iter().filter_map(|name| server_name_specificity(name, sni)).max()
        },
    );
    candidates = narrow(
        candidates,
        |m| !m.transport_protocol.is_empty(),
        |m| (m.transport_protocol == transport).then_some(0),
    );
    candidates = narrow(
        candidates,
        |m| !m.application_protocols.is_empty(),
        |m| {
            m.application_protocols
                .iter()
                .any(|p| alpn.contains(p))
                .then_some(0)
        },
    );

    match candidates.as_slice() {
        [chain] => Ok(*chain),
        [] => listener
            .default_filter_chain
            .as_ref()
            .ok_or_else(|| Error::NoFilterChain {
                listener: listener.name.clone(),
            }),
        many => Err(Error::MultipleFilterChains {
            listener: listener.name.clone(),
            chains: many.iter().map(|c| c.name.clone()).collect(),
        }),
    }
}

/// One selection stage. `declares` says whether a chain sets the criterion;
/// `specificity` returns how specifically a declaring chain matches, or
/// `None` if it does not.
fn narrow<'c>(
    candidates: Vec<&'c FilterChain>,
    declares: impl Fn(&FilterChainMatch) -> bool,
    specificity: impl Fn(&FilterChainMatch) -> Option<u32>,
) -> Vec<&'c FilterChain> {
    let declared = |chain: &FilterChain| chain.filter_chain_match.as_ref().is_some_and(|m| declares(m));
    if !candidates.iter().any(|c| declared(c)) {
        return candidates;
    }

    let scored: Vec<(&FilterChain, u32)> = candidates
        .iter()
        .filter_map(|chain| {
            let m = chain.filter_chain_match.as_ref().filter(|m| declares(m))?;
            specificity(m).map(|score| (*chain, score))
        })
        .collect();
    match scored.iter().map(|(_, score)| *score).max() {
        Some(best) => scored
            .into_iter()
            .filter(|(_, score)| *score == best)
            .map(|(chain, _)| chain)
            .collect(),
        None => candidates
            .into_iter()
            .filter(|c| !declared(c))
            .collect(),
    }
}

/// Exact names beat every wildcard; longer wildcards beat shorter ones.
fn server_name_specificity(pattern: &str, sni: &str) -> Option<u32> {
    if pattern == sni {
        return Some(u32::MAX);
    }
    let suffix = pattern.strip_prefix('*')?;
    (sni.len() > suffix.len() && sni.ends_with(suffix)).then(|| u32::try_from(suffix.len()).unwrap_or(u32::MAX - 1))
}

/// Exact domains first, then the longest `*suffix`, then the longest
/// `prefix*`, then `*`.
fn match_virtual_host<'v>(hosts: &'v [VirtualHost], host: &str) -> Option<&'v VirtualHost> {
    let domains = || hosts.iter().flat_map(|vh| vh.domains.iter().map(move |d| (vh, d.as_str())));

    if let Some((vh, _)) = domains().find(|(_, d)| *d == host) {
        return Some(vh);
    }
    let suffix = domains()
        .filter_map(|(vh, d)| {
            let suffix = d.strip_prefix('*')?;
            (!suffix.is_empty() && host.ends_with(suffix)).then_some((vh, suffix.len()))
        })
        .max_by_key(|(_, len)| *len);
    if let Some((vh, _)) = suffix {
        return Some(vh);
    }
    let prefix = domains()
        .filter_map(|(vh, d)| {
            let prefix = d.strip_suffix('*')?;
            (!prefix.is_empty() && host.starts_with(prefix)).then_some((vh, prefix.len()))
        })
        .max_by_key(|(_, len)| *len);
    if let Some((vh, _)) = prefix {
        return Some(vh);
    }
    domains().find(|(_, d)| *d == "*").map(|(vh, _)| vh)
}

fn match_route<'r>(routes: &'r [Route], path: &str) -> Option<&'r Route> {
    routes.iter().find(|route| {
        let Some(specifier) = route.r#match.as_ref().and_then(|m| m.path_specifier.as_ref()) else {
            return false;
        };
        match specifier {
            route_match::PathSpecifier::Prefix(prefix) => path.starts_with(prefix.as_str()),
            route_match::PathSpecifier::Path(exact) => path == exact,
            route_match::PathSpecifier::SafeRegex(matcher) => Regex::new(&format!("^(?:{})$", matcher.regex))
                .map(|re| re.is_match(path))
                .unwrap_or(false),
            _ => false,
        }
    })
}

fn route_cluster(route: &Route) -> Option<String> {
    let Some(route::Action::Route(action)) = &route.action else {
        return None;
    };
    match action.cluster_specifier.as_ref()? {
        route_action::ClusterSpecifier::Cluster(cluster) => Some(cluster.clone()),
        route_action::ClusterSpecifier::WeightedClusters(weighted) => weighted
            .clusters
            .iter()
            .fold(None::<(&str, u32)>, |best, c| {
                let weight = c.weight.as_ref().map_or(0, |w| w.value);
                match best {
                    Some((_, top)) if top >= weight => best,
                    _ => Some((c.name.as_str(), weight)),
                }
            })
            .map(|(name, _)| name.to_string()),
        _ => None,
    }
}
