//! Push requests and the law for merging them.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::model::config_store::ConfigKey;
use crate::model::push_context::PushContext;

/// Why a push was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    /// Endpoints of a service changed.
    EndpointUpdate,
    /// Generic configuration changed.
    ConfigUpdate,
    /// A service changed.
    ServiceUpdate,
    /// The proxy itself changed.
    ProxyUpdate,
    /// Everything must be recomputed.
    GlobalUpdate,
    /// A proxy asked for resources.
    ProxyRequest,
    /// A remote cluster was added, changed or removed.
    ClusterUpdate,
    /// A flow-controlled push may now be released.
    FlowControlRelease,
    /// Unknown.
    Unknown,
}

impl TriggerReason {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::EndpointUpdate => "endpoint",
            TriggerReason::ConfigUpdate => "config",
            TriggerReason::ServiceUpdate => "service",
            TriggerReason::ProxyUpdate => "proxy",
            TriggerReason::GlobalUpdate => "global",
            TriggerReason::ProxyRequest => "proxyrequest",
            TriggerReason::ClusterUpdate => "cluster",
            TriggerReason::FlowControlRelease => "flowcontrol",
            TriggerReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names a request-driven push adds to or drops from a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDelta {
    /// Newly subscribed names.
    pub subscribed: BTreeSet<String>,
    /// Dropped names.
    pub unsubscribed: BTreeSet<String>,
}

impl ResourceDelta {
    /// Returns true if the delta names nothing.
    pub fn is_empty(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty()
    }

    fn merge(mut self, other: ResourceDelta) -> ResourceDelta {
        for name in other.subscribed {
            self.unsubscribed.remove(&name);
            self.subscribed.insert(name);
        }
        for name in other.unsubscribed {
            self.subscribed.remove(&name);
            self.unsubscribed.insert(name);
        }
        self
    }
}

/// A request to push configuration to proxies.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Every type is recomputed; otherwise only incremental types are pushed.
    pub full: bool,
    /// Entries that changed; empty means everything may have changed.
    pub configs_updated: HashSet<ConfigKey>,
    /// Why the push happened, in order.
    pub reason: Vec<TriggerReason>,
    /// When the first change behind this push happened.
    pub start: Instant,
    /// The snapshot to push from; `None` until the push is scheduled.
    pub push: Option<Arc<PushContext>>,
    /// Subscription changes behind a request-driven push.
    pub delta: ResourceDelta,
}

impl PushRequest {
    /// A full push of everything.
    pub fn full(reason: TriggerReason) -> Self {
        Self {
            full: true,
            configs_updated: HashSet::new(),
            reason: vec![reason],
            start: Instant::now(),
            push: None,
            delta: ResourceDelta::default(),
        }
    }

    /// An incremental push for the given changed entries.
    pub fn incremental(reason: TriggerReason, configs: impl IntoIterator<Item = ConfigKey>) -> Self {
        Self {
            full: false,
            configs_updated: configs.into_iter().collect(),
            ..Self::full(reason)
        }
    }

    /// A full push caused by the given changed entries.
    pub fn for_configs(reason: TriggerReason, configs: impl IntoIterator<Item = ConfigKey>) -> Self {
        Self {
            configs_updated: configs.into_iter().collect(),
            ..Self::full(reason)
        }
    }

    /// The push a proxy's own request triggers.
    pub fn proxy_request(push: Arc<PushContext>, delta: ResourceDelta) -> Self {
        Self {
            push: Some(push),
            delta,
            ..Self::full(TriggerReason::ProxyRequest)
        }
    }

    /// A request asking the connection to retry its flow-controlled pushes.
    pub fn flow_control_release() -> Self {
        Self {
            full: false,
            ..Self::full(TriggerReason::FlowControlRelease)
        }
    }

    /// Returns true if this request only exists to release blocked pushes.
    pub fn is_flow_control_release(&self) -> bool {
        !self.full
            && self.configs_updated.is_empty()
            && self
                .reason
                .iter()
                .all(|r| *r == TriggerReason::FlowControlRelease)
    }

    /// Merge a later request into this one.
    ///
    /// `full` is or-ed, reasons are concatenated, the later push context wins
    /// and the earlier start is kept. The changed sets are unioned unless
    /// either side is empty, which already means "everything".
    pub fn merge(mut self, other: PushRequest) -> PushRequest {
        let everything = self.configs_updated.is_empty() || other.configs_updated.is_empty();
        self.full |= other.full;
        if everything {
            self.configs_updated.clear();
        } else {
            self.configs_updated.extend(other.configs_updated);
        }
        self.reason.extend(other.reason);
        if other.start < self.start {
            self.start = other.start;
        }
        if other.push.is_some() {
            self.push = other.push;
        }
        self.delta = self.delta.merge(other.delta);
        self
    }

    /// Returns true if the request lists the kind among its changes, or
    /// lists nothing at all.
    pub fn touches(&self, kind: crate::model::config_store::Kind) -> bool {
        self.configs_updated.is_empty() || self.configs_updated.iter().any(|k| k.kind == kind)
    }

    /// Distinct reasons, for logging.
    pub fn reason_summary(&self) -> String {
        let mut seen = Vec::new();
        for reason in &self.reason {
            if !seen.contains(reason) {
                seen.push(*reason);
            }
        }
        seen.iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Merge an optional pending request with a new one.
pub fn merge_into(pending: Option<PushRequest>, request: PushRequest) -> PushRequest {
    match pending {
        Some(pending) => pending.merge(request),
        None => request,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config_store::Kind;
    use std::time::Duration;

    fn key(name: &str) -> ConfigKey {
        ConfigKey::new(Kind::Service, name, "default")
    }

    #[test]
    fn merge_law() {
        let a = PushRequest::incremental(TriggerReason::EndpointUpdate, [key("a")]);
        let mut b = PushRequest::for_configs(TriggerReason::ServiceUpdate, [key("b")]);
        b.start = a.start + Duration::from_millis(10);
        b.push = Some(Arc::new(PushContext::default()));

        let merged = a.clone().merge(b.clone());
        assert!(merged.full);
        assert_eq!(merged.start, a.start);
        assert_eq!(
            merged.reason,
            vec![TriggerReason::EndpointUpdate, TriggerReason::ServiceUpdate]
        );
        assert_eq!(merged.configs_updated, [key("a"), key("b")].into_iter().collect());
        assert!(merged.push.is_some());
    }

    #[test]
    fn empty_configs_means_everything() {
        let a = PushRequest::for_configs(TriggerReason::ConfigUpdate, [key("a")]);
        let b = PushRequest::full(TriggerReason::GlobalUpdate);
        assert!(a.clone().merge(b.clone()).configs_updated.is_empty());
        assert!(b.merge(a).configs_updated.is_empty());
    }

    #[test]
    fn merge_keeps_earliest_start() {
        let a = PushRequest::full(TriggerReason::ConfigUpdate);
        let mut b = PushRequest::full(TriggerReason::ConfigUpdate);
        b.start = a.start - Duration::from_millis(5);
        let expected = b.start;
        assert_eq!(a.merge(b).start, expected);
    }

    #[test]
    fn delta_merge_later_wins() {
        let mut a = PushRequest::full(TriggerReason::ProxyRequest);
        a.delta.subscribed.insert("x".into());
        let mut b = PushRequest::full(TriggerReason::ProxyRequest);
        b.delta.unsubscribed.insert("x".into());
        b.delta.subscribed.insert("y".into());

        let merged = a.merge(b);
        assert_eq!(merged.delta.subscribed, ["y".to_string()].into_iter().collect());
        assert_eq!(merged.delta.unsubscribed, ["x".to_string()].into_iter().collect());
    }

    #[test]
    fn release_requests_are_recognized() {
        let release = PushRequest::flow_control_release();
        assert!(release.is_flow_control_release());
        let merged = release.merge(PushRequest::full(TriggerReason::ConfigUpdate));
        assert!(!merged.is_flow_control_release());
        assert_eq!(merged.reason_summary(), "flowcontrol,config");
    }
}
