//! Incremental (delta) ADS.

use std::collections::BTreeSet;

use tracing::debug;

use crate::connection::{Connection, RequestDecision, WatchedResource};
use crate::error::Result;
use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, Node};
use crate::model::push_request::{PushRequest, TriggerReason};
use crate::resource::short_name;
use crate::server::DiscoveryServer;
use crate::server::stream::{Protocol, generate, next_nonce, record_push, send_with_timeout};
use crate::transport::ResponseSink;

/// Responses carry only changed resources plus the names to drop.
#[derive(Debug)]
pub(crate) struct Delta;

impl Protocol for Delta {
    type Request = DeltaDiscoveryRequest;
    type Response = DeltaDiscoveryResponse;

    const NAME: &'static str = "delta";

    fn node(request: &DeltaDiscoveryRequest) -> Option<&Node> {
        request.node.as_ref()
    }

    fn type_url(request: &DeltaDiscoveryRequest) -> &str {
        &request.type_url
    }

    fn classify(con: &Connection, request: &DeltaDiscoveryRequest) -> RequestDecision {
        con.should_respond_delta(request)
    }

    async fn push<S: ResponseSink<DeltaDiscoveryResponse>>(
        server: &DiscoveryServer,
        con: &Connection,
        sink: &S,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> Result<()> {
        let request_driven = !request.delta.is_empty();

        // A subscription change only needs the newly subscribed names.
        let narrowed;
        let target = if request_driven && !watched.wildcard {
            let mut w = watched.clone();
            w.resource_names = request.delta.subscribed.clone();
            narrowed = w;
            &narrowed
        } else {
            watched
        };

        let Some((resources, push)) = generate(server, con, target, request)? else {
            return Ok(());
        };
        let version = push.version().to_string();
        let sent_names: BTreeSet<String> = resources.iter().map(|r| r.name.clone()).collect();

        let removed: Vec<String> = if request_driven {
            request
                .delta
                .unsubscribed
                .iter()
                .chain(&request.delta.subscribed)
                .filter(|name| name.as_str() != "*" && !sent_names.contains(*name))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else if request.full {
            watched
                .resource_names
                .difference(&sent_names)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let proxy_requested = request.reason.contains(&TriggerReason::ProxyRequest);
        if resources.is_empty() && removed.is_empty() && !proxy_requested {
            debug!(
                con_id = con.id(),
                type_url = short_name(&watched.type_url),
                "nothing changed, skipping delta push"
            );
            return Ok(());
        }

        let nonce = next_nonce();
        let size = resources.iter().map(|r| r.size()).sum();
        let count = resources.len();
        let response = DeltaDiscoveryResponse {
            system_version_info: version.clone(),
            resources: resources
                .into_iter()
                .map(|mut r| {
                    if r.version.is_empty() {
                        r.version = version.clone();
                    }
                    r
                })
                .collect(),
            type_url: watched.type_url.clone(),
            removed_resources: removed.clone(),
            nonce: nonce.clone(),
        };

        send_with_timeout(sink, response, server.config().send_timeout).await?;

        // Wildcard subscriptions track what the proxy actually holds.
        let tracked = watched.wildcard.then(|| {
            if request.full {
                sent_names
            } else {
                let mut names = watched.resource_names.clone();
                names.extend(sent_names);
                names
            }
        });
        record_push(con, watched, request, &nonce, &version, size, tracked);
        debug!(
            con_id = con.id(),
            type_url = short_name(&watched.type_url),
            nonce = %nonce,
            version = %version,
            resources = count,
            removed = removed.len(),
            size,
            "pushed delta"
        );
        Ok(())
    }
}
