//! Per-type subscription state and request classification.
//!
//! Every request a proxy sends for a type is classified exactly once against
//! the type's [`WatchedResource`]: a first request, an acknowledgement, a
//! rejection, an acknowledgement of an older response, a subscription change
//! or an unsubscribe. Classification updates the state as a side effect and
//! never performs I/O.

use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use crate::message::{DeltaDiscoveryRequest, DiscoveryRequest, ErrorDetail};
use crate::model::push_request::ResourceDelta;
use crate::resource::is_wildcard_type;

const WILDCARD: &str = "*";

/// What the server tracks about one type a proxy subscribes to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchedResource {
    /// The type URL.
    pub type_url: String,
    /// Subscribed names; for wildcard subscriptions, the names last sent.
    pub resource_names: BTreeSet<String>,
    /// The proxy wants every resource of the type.
    pub wildcard: bool,
    /// Nonce of the last response sent.
    pub nonce_sent: String,
    /// Version of the last response sent.
    pub version_sent: String,
    /// Nonce of the last response acknowledged.
    pub nonce_acked: String,
    /// Nonce of the last response rejected; empty when not rejected.
    pub nonce_nacked: String,
    /// When the last response was sent.
    pub last_sent: Option<Instant>,
    /// Size of the last response in bytes.
    pub last_size: usize,
    /// The last rejection reported by the proxy.
    pub last_error: Option<ErrorDetail>,
}

impl WatchedResource {
    /// A fresh subscription.
    pub fn new(type_url: impl Into<String>, resource_names: BTreeSet<String>, wildcard: bool) -> Self {
        Self {
            type_url: type_url.into(),
            resource_names,
            wildcard,
            ..Default::default()
        }
    }

    /// The proxy has answered the last response, positively or not.
    pub fn is_synced(&self) -> bool {
        !self.nonce_nacked.is_empty() || self.nonce_acked == self.nonce_sent
    }
}

/// The outcome of classifying a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestDecision {
    /// First request for the type, or a reconnect: respond with everything.
    Init,
    /// The subscription changed: respond.
    Respond(ResourceDelta),
    /// Acknowledges the last response and changes nothing.
    Ack,
    /// The proxy rejected the last response.
    Nack(ErrorDetail),
    /// Answers a response older than the last one sent.
    ExpiredNonce {
        /// Nonce carried by the request.
        received: String,
        /// Nonce of the last response.
        sent: String,
    },
    /// The proxy dropped the type.
    Unsubscribe,
}

impl RequestDecision {
    /// Returns true if the server must send a response.
    pub fn should_respond(&self) -> bool {
        matches!(self, RequestDecision::Init | RequestDecision::Respond(_))
    }

    /// The subscription change behind a response.
    pub fn delta(&self) -> ResourceDelta {
        match self {
            RequestDecision::Respond(delta) => delta.clone(),
            _ => ResourceDelta::default(),
        }
    }
}

fn record_nack(
    watched: &mut HashMap<String, WatchedResource>,
    type_url: &str,
    nonce: &str,
    detail: &ErrorDetail,
) -> RequestDecision {
    if let Some(w) = watched.get_mut(type_url) {
        w.nonce_nacked = nonce.to_string();
        w.last_error = Some(detail.clone());
    }
    RequestDecision::Nack(detail.clone())
}

/// Classify a state-of-the-world request and update the watch state.
pub fn classify_sotw(
    watched: &mut HashMap<String, WatchedResource>,
    request: &DiscoveryRequest,
) -> RequestDecision {
    let type_url = request.type_url.as_str();

    if let Some(detail) = &request.error_detail {
        return record_nack(watched, type_url, &request.response_nonce, detail);
    }

    if request.resource_names.is_empty() && !is_wildcard_type(type_url) {
        watched.remove(type_url);
        return RequestDecision::Unsubscribe;
    }

    let wildcard = request.resource_names.is_empty()
        || request.resource_names.iter().any(|n| n == WILDCARD);
    let names: BTreeSet<String> = request
        .resource_names
        .iter()
        .filter(|n| *n != WILDCARD)
        .cloned()
        .collect();

    let Some(previous) = watched.get_mut(type_url) else {
        watched.insert(
            type_url.to_string(),
            WatchedResource::new(type_url, names, wildcard),
        );
        return RequestDecision::Init;
    };

    if request.response_nonce.is_empty() {
        *previous = WatchedResource::new(type_url, names, wildcard);
        return RequestDecision::Init;
    }

    if request.response_nonce != previous.nonce_sent {
        previous.nonce_nacked.clear();
        return RequestDecision::ExpiredNonce {
            received: request.response_nonce.clone(),
            sent: previous.nonce_sent.clone(),
        };
    }

    previous.nonce_acked = request.response_nonce.clone();
    previous.nonce_nacked.clear();
    previous.last_error = None;

    // A wildcard watch holds the names last sent, so only names the proxy
    // has not been sent yet count as a change.
    let still_wildcard = wildcard && previous.wildcard;
    let unchanged = if still_wildcard {
        names.is_subset(&previous.resource_names)
    } else {
        previous.resource_names == names && previous.wildcard == wildcard
    };
    if unchanged {
        return RequestDecision::Ack;
    }
    let delta = ResourceDelta {
        subscribed: names.difference(&previous.resource_names).cloned().collect(),
        unsubscribed: if still_wildcard {
            BTreeSet::new()
        } else {
            previous.resource_names.difference(&names).cloned().collect()
        },
    };
    if still_wildcard {
        previous.resource_names.extend(names);
    } else {
        previous.resource_names = names;
    }
    previous.wildcard = wildcard;
    RequestDecision::Respond(delta)
}

/// Apply a delta request to an existing subscription: previous names plus
/// subscribed and initially held names, minus unsubscribed names.
pub fn delta_watched_resources(
    existing: Option<&WatchedResource>,
    request: &DeltaDiscoveryRequest,
) -> (BTreeSet<String>, bool) {
    let mut names = existing
        .map(|w| w.resource_names.clone())
        .unwrap_or_default();
    names.extend(request.resource_names_subscribe.iter().cloned());
    names.extend(request.initial_resource_versions.keys().cloned());
    for name in &request.resource_names_unsubscribe {
        names.remove(name);
    }

    let mut wildcard = match existing {
        Some(w) => w.wildcard,
        None => {
            is_wildcard_type(&request.type_url) && request.resource_names_subscribe.is_empty()
        }
    };
    if request.resource_names_subscribe.iter().any(|n| n == WILDCARD) {
        wildcard = true;
    }
    if request.resource_names_unsubscribe.iter().any(|n| n == WILDCARD) {
        wildcard = false;
    }
    names.remove(WILDCARD);
    (names, wildcard)
}

/// Classify a delta request and update the watch state.
pub fn classify_delta(
    watched: &mut HashMap<String, WatchedResource>,
    request: &DeltaDiscoveryRequest,
) -> RequestDecision {
    let type_url = request.type_url.as_str();

    if let Some(detail) = &request.error_detail {
        return record_nack(watched, type_url, &request.response_nonce, detail);
    }

    let Some(previous) = watched.get_mut(type_url) else {
        let (names, wildcard) = delta_watched_resources(None, request);
        watched.insert(
            type_url.to_string(),
            WatchedResource::new(type_url, names, wildcard),
        );
        return RequestDecision::Init;
    };

    if !request.response_nonce.is_empty() && request.response_nonce != previous.nonce_sent {
        previous.nonce_nacked.clear();
        return RequestDecision::ExpiredNonce {
            received: request.response_nonce.clone(),
            sent: previous.nonce_sent.clone(),
        };
    }

    let (names, wildcard) = delta_watched_resources(Some(previous), request);
    if !request.response_nonce.is_empty() {
        previous.nonce_acked = request.response_nonce.clone();
        previous.nonce_nacked.clear();
        previous.last_error = None;
    }

    let changed = names != previous.resource_names || wildcard != previous.wildcard;
    previous.resource_names = names;
    previous.wildcard = wildcard;
    if !changed {
        return RequestDecision::Ack;
    }
    RequestDecision::Respond(ResourceDelta {
        subscribed: request
            .resource_names_subscribe
            .iter()
            .filter(|n| *n != WILDCARD)
            .cloned()
            .collect(),
        unsubscribed: request
            .resource_names_unsubscribe
            .iter()
            .filter(|n| *n != WILDCARD)
            .cloned()
            .collect(),
    })
}
