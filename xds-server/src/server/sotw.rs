//! State-of-the-world ADS.

use std::collections::BTreeSet;

use tracing::debug;

use crate::connection::{Connection, RequestDecision, WatchedResource};
use crate::error::Result;
use crate::message::{DiscoveryRequest, DiscoveryResponse, Node};
use crate::model::push_request::PushRequest;
use crate::resource::short_name;
use crate::server::DiscoveryServer;
use crate::server::stream::{Protocol, generate, next_nonce, record_push, send_with_timeout};
use crate::transport::ResponseSink;

/// Every response carries the complete set of watched resources.
#[derive(Debug)]
pub(crate) struct Sotw;

impl Protocol for Sotw {
    type Request = DiscoveryRequest;
    type Response = DiscoveryResponse;

    const NAME: &'static str = "sotw";

    fn node(request: &DiscoveryRequest) -> Option<&Node> {
        request.node.as_ref()
    }

    fn type_url(request: &DiscoveryRequest) -> &str {
        &request.type_url
    }

    fn classify(con: &Connection, request: &DiscoveryRequest) -> RequestDecision {
        con.should_respond(request)
    }

    async fn push<S: ResponseSink<DiscoveryResponse>>(
        server: &DiscoveryServer,
        con: &Connection,
        sink: &S,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> Result<()> {
        let Some((resources, push)) = generate(server, con, watched, request)? else {
            return Ok(());
        };

        let nonce = next_nonce();
        let version = push.version().to_string();
        let size = resources.iter().map(|r| r.size()).sum();
        let count = resources.len();
        let sent_names: BTreeSet<String> = resources.iter().map(|r| r.name.clone()).collect();
        let response = DiscoveryResponse {
            version_info: version.clone(),
            resources: resources.into_iter().map(|r| r.resource).collect(),
            type_url: watched.type_url.clone(),
            nonce: nonce.clone(),
        };

        send_with_timeout(sink, response, server.config().send_timeout).await?;
        // Names the proxy just asked for stay tracked even when nothing by
        // that name exists, so repeating them reads as an ACK. An incremental
        // response carries only what changed; everything else is still served.
        let tracked = watched.wildcard.then(|| {
            let mut names = if request.full {
                BTreeSet::new()
            } else {
                watched.resource_names.clone()
            };
            names.extend(sent_names);
            names.extend(request.delta.subscribed.iter().cloned());
            names
        });
        record_push(con, watched, request, &nonce, &version, size, tracked);
        debug!(
            con_id = con.id(),
            type_url = short_name(&watched.type_url),
            nonce = %nonce,
            version = %version,
            resources = count,
            size,
            "pushed"
        );
        Ok(())
    }
}
