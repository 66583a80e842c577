//! The configuration model pushes are computed from.

use std::collections::BTreeMap;

pub mod config_store;
pub mod envoy_filter;
pub mod policy;
pub mod proxy;
pub mod push_context;
pub mod push_request;
pub mod service;
pub mod workload;

/// Workload labels.
pub type Labels = BTreeMap<String, String>;

/// Returns true if every selector entry is present in `labels`.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_a_subset_match() {
        let labels: Labels = [("app", "web"), ("version", "v2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut selector = Labels::new();
        assert!(selector_matches(&selector, &labels));
        selector.insert("app".into(), "web".into());
        assert!(selector_matches(&selector, &labels));
        selector.insert("tier".into(), "front".into());
        assert!(!selector_matches(&selector, &labels));
    }
}
