//! xDS resource type URLs.

/// Listener type URL.
pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
/// Route configuration type URL.
pub const ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
/// Cluster type URL.
pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
/// Cluster load assignment type URL.
pub const ENDPOINT: &str = "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
/// Secret type URL.
pub const SECRET: &str = "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
/// Extension config type URL.
pub const EXTENSION_CONFIG: &str = "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig";

/// The order in which a full push delivers types, so that clusters arrive
/// before the endpoints and listeners that reference them.
const PUSH_ORDER: [&str; 6] = [CLUSTER, ENDPOINT, LISTENER, ROUTE, SECRET, EXTENSION_CONFIG];

/// Returns true if an empty subscription for this type means "everything".
pub fn is_wildcard_type(type_url: &str) -> bool {
    type_url == CLUSTER || type_url == LISTENER
}

/// Short human readable name for a type URL, used in logs and metric labels.
pub fn short_name(type_url: &str) -> &'static str {
    match type_url {
        LISTENER => "LDS",
        ROUTE => "RDS",
        CLUSTER => "CDS",
        ENDPOINT => "EDS",
        SECRET => "SDS",
        EXTENSION_CONFIG => "ECDS",
        _ => "UNKNOWN",
    }
}

/// Sort key for pushing types: known types first, in dependency order.
pub fn push_order(type_url: &str) -> usize {
    PUSH_ORDER
        .iter()
        .position(|t| *t == type_url)
        .unwrap_or(PUSH_ORDER.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_types() {
        assert!(is_wildcard_type(CLUSTER));
        assert!(is_wildcard_type(LISTENER));
        assert!(!is_wildcard_type(ROUTE));
        assert!(!is_wildcard_type(ENDPOINT));
    }

    #[test]
    fn clusters_push_before_listeners() {
        let mut types = vec![ROUTE, LISTENER, "type.googleapis.com/custom", ENDPOINT, CLUSTER];
        types.sort_by_key(|t| push_order(t));
        assert_eq!(
            types,
            vec![CLUSTER, ENDPOINT, LISTENER, ROUTE, "type.googleapis.com/custom"]
        );
    }
}
