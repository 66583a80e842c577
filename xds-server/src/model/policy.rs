//! Peer authentication policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Labels, selector_matches};

/// Mutual TLS mode accepted by inbound listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MtlsMode {
    /// Inherit from the enclosing scope.
    #[default]
    Unset,
    /// Plain text only.
    Disable,
    /// Accept both mTLS and plain text.
    Permissive,
    /// mTLS only.
    Strict,
}

/// Inbound mTLS requirements for a set of workloads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PeerAuthentication {
    /// Workloads the policy applies to; empty applies to the namespace.
    #[serde(default)]
    pub selector: Labels,
    /// Mode for every port not listed in `port_level_mtls`.
    #[serde(default)]
    pub mode: MtlsMode,
    /// Per-port overrides, keyed by workload port.
    #[serde(default)]
    pub port_level_mtls: BTreeMap<u16, MtlsMode>,
}

impl PeerAuthentication {
    fn mode_for(&self, port: u16) -> MtlsMode {
        match self.port_level_mtls.get(&port) {
            Some(mode) if *mode != MtlsMode::Unset => *mode,
            _ => self.mode,
        }
    }
}

/// A policy together with the namespace it was declared in.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPolicy {
    /// Namespace of the policy.
    pub namespace: String,
    /// The policy.
    pub policy: PeerAuthentication,
}

/// Resolve the effective mode for a workload port.
///
/// Workload-selected policies win over namespace-wide ones, which win over
/// mesh-wide policies in the root namespace. Unset resolves to permissive.
pub fn effective_mtls_mode(
    policies: &[ScopedPolicy],
    root_namespace: &str,
    namespace: &str,
    labels: &Labels,
    port: u16,
) -> MtlsMode {
    let workload = policies.iter().find(|p| {
        p.namespace == namespace
            && !p.policy.selector.is_empty()
            && selector_matches(&p.policy.selector, labels)
    });
    let namespace_wide = policies
        .iter()
        .find(|p| p.namespace == namespace && p.policy.selector.is_empty());
    let mesh_wide = policies
        .iter()
        .find(|p| p.namespace == root_namespace && p.policy.selector.is_empty());

    [workload, namespace_wide, mesh_wide]
        .into_iter()
        .flatten()
        .map(|p| p.policy.mode_for(port))
        .find(|mode| *mode != MtlsMode::Unset)
        .unwrap_or(MtlsMode::Permissive)
}
