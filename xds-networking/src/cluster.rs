//! Clusters served over CDS.

use envoy_types::pb::envoy::config::cluster::v3::{Cluster, cluster};
use envoy_types::pb::envoy::config::endpoint::v3::{
    ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints, lb_endpoint,
};
use envoy_types::pb::google::protobuf::Duration;
use xds_server::model::proxy::NodeType;
use xds_server::{PushContext, Proxy};

use crate::proto;

const CONNECT_TIMEOUT: Duration = Duration {
    seconds: 10,
    nanos: 0,
};

/// Builds the clusters of one proxy.
#[derive(Debug, Clone, Copy)]
pub struct ClusterBuilder<'a> {
    proxy: &'a Proxy,
    push: &'a PushContext,
}

impl<'a> ClusterBuilder<'a> {
    /// Create a builder for `proxy`.
    pub fn new(proxy: &'a Proxy, push: &'a PushContext) -> Self {
        Self { proxy, push }
    }

    /// Outbound EDS clusters for every service port, inbound clusters for
    /// every port the proxy serves, and the passthrough and blackhole
    /// clusters.
    pub fn build(&self) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = self
            .push
            .services()
            .flat_map(|service| {
                service
                    .ports
                    .iter()
                    .map(|port| eds_cluster(&proto::outbound_cluster_name(port.port, &service.hostname)))
            })
            .collect();

        if self.proxy.node_type == NodeType::Sidecar {
            let mut ports: Vec<u16> = self
                .proxy
                .service_instances
                .iter()
                .map(|i| i.endpoint.port)
                .collect();
            ports.sort_unstable();
            ports.dedup();
            clusters.extend(ports.into_iter().map(inbound_cluster));
            clusters.push(original_dst_cluster(proto::INBOUND_PASSTHROUGH_CLUSTER));
        }

        clusters.push(original_dst_cluster(proto::PASSTHROUGH_CLUSTER));
        clusters.push(Cluster {
            name: proto::BLACKHOLE_CLUSTER.to_string(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::Static as i32,
            )),
            connect_timeout: Some(CONNECT_TIMEOUT),
            ..Default::default()
        });
        clusters
    }
}

fn eds_cluster(name: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Eds as i32,
        )),
        eds_cluster_config: Some(cluster::EdsClusterConfig {
            eds_config: Some(proto::ads_config_source()),
            service_name: name.to_string(),
        }),
        connect_timeout: Some(CONNECT_TIMEOUT),
        ..Default::default()
    }
}

fn inbound_cluster(port: u16) -> Cluster {
    let name = proto::inbound_cluster_name(port);
    Cluster {
        name: name.clone(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Static as i32,
        )),
        connect_timeout: Some(CONNECT_TIMEOUT),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name,
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(
                        envoy_types::pb::envoy::config::endpoint::v3::Endpoint {
                            address: Some(proto::socket_address("127.0.0.1", port)),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn original_dst_cluster(name: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::OriginalDst as i32,
        )),
        lb_policy: cluster::LbPolicy::ClusterProvided as i32,
        connect_timeout: Some(CONNECT_TIMEOUT),
        ..Default::default()
    }
}
