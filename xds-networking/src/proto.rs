//! Well-known names and small helpers for building Envoy protos.

use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::config_source::ConfigSourceSpecifier;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::core::v3::{
    Address, AggregatedConfigSource, ApiVersion, ConfigSource, SocketAddress,
};
use envoy_types::pb::envoy::config::listener::v3::{Filter, Listener, filter};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    TcpProxy, tcp_proxy,
};
use envoy_types::pb::google::protobuf::{Any, BoolValue, UInt32Value};
use prost::Message;

/// The HTTP connection manager network filter.
pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
/// The TCP proxy network filter.
pub const TCP_PROXY: &str = "envoy.filters.network.tcp_proxy";
/// The router HTTP filter, always last in the HTTP filter list.
pub const ROUTER: &str = "envoy.filters.http.router";
/// Listener filter that detects TLS and reads SNI and ALPN.
pub const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
/// Listener filter that detects plaintext HTTP.
pub const HTTP_INSPECTOR: &str = "envoy.filters.listener.http_inspector";
/// Listener filter that restores the original destination.
pub const ORIGINAL_DST: &str = "envoy.filters.listener.original_dst";
/// The TLS transport socket.
pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

pub(crate) const HCM_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub(crate) const TCP_PROXY_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
pub(crate) const ROUTER_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
pub(crate) const TLS_INSPECTOR_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
pub(crate) const HTTP_INSPECTOR_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.http_inspector.v3.HttpInspector";
pub(crate) const ORIGINAL_DST_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.original_dst.v3.OriginalDst";
pub(crate) const DOWNSTREAM_TLS_TYPE: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

/// Catch-all outbound listener every redirected connection lands on first.
pub const VIRTUAL_OUTBOUND: &str = "virtualOutbound";
/// Port of [`VIRTUAL_OUTBOUND`].
pub const VIRTUAL_OUTBOUND_PORT: u16 = 15001;
/// Listener for all inbound traffic of a sidecar.
pub const VIRTUAL_INBOUND: &str = "virtualInbound";
/// Port of [`VIRTUAL_INBOUND`].
pub const VIRTUAL_INBOUND_PORT: u16 = 15006;

/// Forwards to the original destination.
pub const PASSTHROUGH_CLUSTER: &str = "PassthroughCluster";
/// Drops traffic.
pub const BLACKHOLE_CLUSTER: &str = "BlackHoleCluster";
/// Forwards inbound traffic for undeclared ports to the workload.
pub const INBOUND_PASSTHROUGH_CLUSTER: &str = "InboundPassthroughClusterIpv4";

/// ALPN values mesh peers negotiate over mutual TLS.
pub const MTLS_ALPN: &[&str] = &[
    "istio-peer-exchange",
    "istio",
    "istio-http/1.0",
    "istio-http/1.1",
    "istio-h2",
];

/// Transport protocol the TLS inspector reports for TLS connections.
pub const TRANSPORT_TLS: &str = "tls";
/// Transport protocol of everything else.
pub const TRANSPORT_RAW: &str = "raw_buffer";

/// `outbound|<port>||<hostname>`.
pub fn outbound_cluster_name(port: u16, hostname: &str) -> String {
    format!("outbound|{port}||{hostname}")
}

/// `inbound|<port>||`.
pub fn inbound_cluster_name(port: u16) -> String {
    format!("inbound|{port}||")
}

/// Split an outbound cluster name into its port and hostname.
pub fn parse_outbound_cluster_name(name: &str) -> Option<(u16, &str)> {
    let mut parts = name.splitn(4, '|');
    if parts.next()? != "outbound" {
        return None;
    }
    let port = parts.next()?.parse().ok()?;
    let _subset = parts.next()?;
    let hostname = parts.next()?;
    (!hostname.is_empty()).then_some((port, hostname))
}

/// Wrap a message in an `Any`.
pub fn any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

/// A TCP socket address.
pub fn socket_address(address: &str, port: u16) -> Address {
    Address {
        address: Some(AddressKind::SocketAddress(SocketAddress {
            address: address.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(u32::from(port))),
            ..Default::default()
        })),
    }
}

/// The port a listener binds, if it has a socket address.
pub fn listener_port(listener: &Listener) -> Option<u16> {
    match listener.address.as_ref()?.address.as_ref()? {
        AddressKind::SocketAddress(socket) => match socket.port_specifier {
            Some(PortSpecifier::PortValue(port)) => u16::try_from(port).ok(),
            _ => None,
        },
        _ => None,
    }
}

/// Config source pointing back at the ADS stream.
pub fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource {})),
        resource_api_version: ApiVersion::V3 as i32,
        ..Default::default()
    }
}

pub(crate) fn bool_value(value: bool) -> Option<BoolValue> {
    Some(BoolValue { value })
}

pub(crate) fn u32_value(value: u32) -> Option<UInt32Value> {
    Some(UInt32Value { value })
}

/// A TCP proxy network filter forwarding to `cluster`.
pub fn tcp_proxy_filter(stat_prefix: &str, cluster: &str) -> Filter {
    let proxy = TcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(tcp_proxy::ClusterSpecifier::Cluster(cluster.to_string())),
        ..Default::default()
    };
    Filter {
        name: TCP_PROXY.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any(TCP_PROXY_TYPE, &proxy))),
    }
}

/// The typed config of a network filter, if it carries one of `type_url`.
pub(crate) fn filter_config<'a>(filter: &'a Filter, type_url: &str) -> Option<&'a Any> {
    match &filter.config_type {
        Some(filter::ConfigType::TypedConfig(any)) if any.type_url == type_url => Some(any),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_cluster_names_round_trip() {
        let name = outbound_cluster_name(9080, "reviews.default.svc.cluster.local");
        assert_eq!(name, "outbound|9080||reviews.default.svc.cluster.local");
        assert_eq!(
            parse_outbound_cluster_name(&name),
            Some((9080, "reviews.default.svc.cluster.local"))
        );
        assert_eq!(parse_outbound_cluster_name("inbound|9080||"), None);
        assert_eq!(parse_outbound_cluster_name("outbound|http||x"), None);
        assert_eq!(parse_outbound_cluster_name(PASSTHROUGH_CLUSTER), None);
    }

    #[test]
    fn listener_port_reads_socket_address() {
        let listener = Listener {
            address: Some(socket_address("0.0.0.0", 8080)),
            ..Default::default()
        };
        assert_eq!(listener_port(&listener), Some(8080));
        assert_eq!(listener_port(&Listener::default()), None);
    }
}
