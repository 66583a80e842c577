//! Load assignments served over EDS.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::Locality;
use envoy_types::pb::envoy::config::endpoint::v3::{
    ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints, lb_endpoint,
};
use xds_server::PushContext;

use crate::proto;

/// Names of every EDS cluster in the push context.
pub fn cluster_names(push: &PushContext) -> Vec<String> {
    push.services()
        .flat_map(|service| {
            service
                .ports
                .iter()
                .map(|port| proto::outbound_cluster_name(port.port, &service.hostname))
        })
        .collect()
}

/// The load assignment of an outbound cluster, grouped by locality.
/// Unknown clusters get an assignment without endpoints.
pub fn load_assignment(push: &PushContext, cluster_name: &str) -> ClusterLoadAssignment {
    let mut assignment = ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        ..Default::default()
    };
    let Some((port, hostname)) = proto::parse_outbound_cluster_name(cluster_name) else {
        return assignment;
    };

    let mut by_locality: BTreeMap<&str, Vec<(LbEndpoint, u32)>> = BTreeMap::new();
    for instance in push.instances(hostname, port) {
        let endpoint = &instance.endpoint;
        let lb_endpoint = LbEndpoint {
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                address: Some(proto::socket_address(&endpoint.address, endpoint.port)),
                ..Default::default()
            })),
            load_balancing_weight: proto::u32_value(endpoint.weight),
            ..Default::default()
        };
        by_locality
            .entry(endpoint.locality.as_str())
            .or_default()
            .push((lb_endpoint, endpoint.weight));
    }

    assignment.endpoints = by_locality
        .into_iter()
        .map(|(locality, endpoints)| {
            let weight = endpoints.iter().map(|(_, w)| *w).sum();
            LocalityLbEndpoints {
                locality: Some(parse_locality(locality)),
                lb_endpoints: endpoints.into_iter().map(|(e, _)| e).collect(),
                load_balancing_weight: proto::u32_value(weight),
                ..Default::default()
            }
        })
        .collect();
    assignment
}

/// Parse `region/zone/subzone`; missing parts stay empty.
pub fn parse_locality(locality: &str) -> Locality {
    let mut parts = locality.splitn(3, '/');
    let mut next = || parts.next().unwrap_or_default().to_string();
    Locality {
        region: next(),
        zone: next(),
        sub_zone: next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{REVIEWS, push_context};

    #[test]
    fn groups_endpoints_by_locality() {
        let push = push_context(Vec::new());
        let name = proto::outbound_cluster_name(9080, REVIEWS);
        let assignment = load_assignment(&push, &name);
        assert_eq!(assignment.cluster_name, name);
        assert_eq!(assignment.endpoints.len(), 2);

        let zones: Vec<&str> = assignment
            .endpoints
            .iter()
            .map(|e| e.locality.as_ref().unwrap().zone.as_str())
            .collect();
        assert_eq!(zones, vec!["us-east1-a", "us-east1-b"]);
        assert_eq!(assignment.endpoints[1].load_balancing_weight, proto::u32_value(3));
    }

    #[test]
    fn unknown_cluster_is_empty() {
        let push = push_context(Vec::new());
        assert!(load_assignment(&push, "outbound|1||nope.default.svc.cluster.local").endpoints.is_empty());
        assert!(load_assignment(&push, proto::PASSTHROUGH_CLUSTER).endpoints.is_empty());
    }

    #[test]
    fn locality_parts() {
        let locality = parse_locality("eu-west1/eu-west1-c");
        assert_eq!(locality.region, "eu-west1");
        assert_eq!(locality.zone, "eu-west1-c");
        assert!(locality.sub_zone.is_empty());
    }
}
