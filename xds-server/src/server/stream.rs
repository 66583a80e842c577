//! The per-stream machinery shared by the SotW and delta protocols.
//!
//! Each stream runs two tasks. The receive task owns the transport's inbound
//! half: it turns the first request into a registered [`Connection`] and then
//! forwards requests. The event loop owns everything else: it waits for the
//! connection, then services one inbound request or push event at a time and
//! is the only writer to the stream.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, RequestDecision, WatchedResource};
use crate::error::{Error, Result};
use crate::message::{Node, Resources};
use crate::metrics;
use crate::model::push_request::PushRequest;
use crate::push::queue::PushEvent;
use crate::resource::short_name;
use crate::server::DiscoveryServer;
use crate::transport::{RequestStream, ResponseSink};

/// Global counter for response nonces.
static NEXT_NONCE: AtomicU64 = AtomicU64::new(1);

/// Issue a nonce. Fixed-width hex keeps later nonces greater both
/// numerically and lexicographically.
pub(crate) fn next_nonce() -> String {
    format!("{:016x}", NEXT_NONCE.fetch_add(1, Ordering::Relaxed))
}

/// One flavor of the discovery protocol.
pub(crate) trait Protocol: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Protocol name for logs.
    const NAME: &'static str;

    fn node(request: &Self::Request) -> Option<&Node>;

    fn type_url(request: &Self::Request) -> &str;

    /// Classify a request against the connection's watch state.
    fn classify(con: &Connection, request: &Self::Request) -> RequestDecision;

    /// Generate and send one type's resources.
    fn push<S: ResponseSink<Self::Response>>(
        server: &DiscoveryServer,
        con: &Connection,
        sink: &S,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Serve a stream until it ends.
pub(crate) async fn serve<P, R, S>(
    server: DiscoveryServer,
    requests: R,
    sink: S,
    peer_addr: String,
    identities: Vec<String>,
) -> Result<()>
where
    P: Protocol,
    R: RequestStream<P::Request>,
    S: ResponseSink<P::Response>,
{
    if server.is_shutdown() {
        return Err(Error::Shutdown);
    }
    let stop = server.shutdown_token().child_token();
    let (req_tx, mut req_rx) = mpsc::channel(server.config().request_buffer);
    let (push_tx, mut push_rx) = mpsc::channel::<PushEvent>(1);
    let (init_tx, init_rx) = oneshot::channel();

    let mut receiver = tokio::spawn(receive::<P, R>(
        server.clone(),
        requests,
        req_tx,
        Initializer {
            init_tx,
            push_tx,
            peer_addr,
            identities,
        },
        stop.clone(),
    ));

    let con: Arc<Connection> = tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        con = init_rx => match con {
            Ok(con) => con,
            // The receive task ended before the stream was initialized.
            Err(_) => return join_receiver(&mut receiver).await,
        },
    };

    let result = loop {
        tokio::select! {
            biased;

            request = req_rx.recv() => match request {
                Some(request) => {
                    if let Err(err) = process_request::<P, S>(&server, &con, &sink, request).await {
                        break Err(err);
                    }
                }
                None => break join_receiver(&mut receiver).await,
            },
            event = push_rx.recv() => match event {
                Some(PushEvent { request, done }) => {
                    let result = push_connection::<P, S>(&server, &con, &sink, request).await;
                    drop(done);
                    if let Err(err) = result {
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
            _ = stop.cancelled() => break Ok(()),
        }
    };

    if let Err(err) = &result {
        if err.is_send_timeout() {
            warn!(con_id = con.id(), error = %err, "closing connection after send timeout");
        } else if !err.is_expected_close() {
            warn!(con_id = con.id(), error = %err, "connection failed");
        }
    }
    server.close_connection(&con);
    stop.cancel();
    result
}

async fn join_receiver(receiver: &mut JoinHandle<Result<()>>) -> Result<()> {
    match receiver.await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "receive task failed");
            metrics::internal_error();
            Err(Error::StreamClosed)
        }
    }
}

/// What the receive task needs to set up the connection.
struct Initializer {
    init_tx: oneshot::Sender<Arc<Connection>>,
    push_tx: mpsc::Sender<PushEvent>,
    peer_addr: String,
    identities: Vec<String>,
}

async fn receive<P, R>(
    server: DiscoveryServer,
    mut requests: R,
    req_tx: mpsc::Sender<P::Request>,
    init: Initializer,
    stop: CancellationToken,
) -> Result<()>
where
    P: Protocol,
    R: RequestStream<P::Request>,
{
    let mut init = Some(init);
    let mut con_id = String::new();
    loop {
        let received = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            received = requests.recv() => received,
        };
        let request = match received {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!(con_id = con_id.as_str(), protocol = P::NAME, "stream closed by client");
                return Ok(());
            }
            Err(err) if err.is_expected_close() => {
                info!(con_id = con_id.as_str(), protocol = P::NAME, error = %err, "stream terminated");
                return Ok(());
            }
            Err(err) => {
                metrics::internal_error();
                error!(con_id = con_id.as_str(), protocol = P::NAME, error = %err, "failed to receive request");
                return Err(err);
            }
        };

        if let Some(Initializer {
            init_tx,
            push_tx,
            peer_addr,
            identities,
        }) = init.take()
        {
            let con = server.initialize_connection(
                P::node(&request),
                peer_addr,
                identities,
                push_tx,
                stop.clone(),
            )?;
            con_id = con.id().to_string();
            if let Err(con) = init_tx.send(con) {
                server.close_connection(&con);
                return Ok(());
            }
        }

        if req_tx.send(request).await.is_err() {
            // The event loop is gone.
            return Ok(());
        }
    }
}

async fn process_request<P, S>(
    server: &DiscoveryServer,
    con: &Connection,
    sink: &S,
    request: P::Request,
) -> Result<()>
where
    P: Protocol,
    S: ResponseSink<P::Response>,
{
    let type_url = P::type_url(&request).to_string();
    let decision = P::classify(con, &request);
    match &decision {
        RequestDecision::Init | RequestDecision::Respond(_) => {
            debug!(
                con_id = con.id(),
                type_url = short_name(&type_url),
                init = matches!(decision, RequestDecision::Init),
                "responding to request"
            );
            // The response about to go out supersedes anything parked.
            con.take_blocked(&type_url);
            let push = PushRequest::proxy_request(server.push_context(), decision.delta());
            let Some(watched) = con.watched(&type_url) else {
                return Ok(());
            };
            return push_type::<P, S>(server, con, sink, &watched, &push).await;
        }
        RequestDecision::Nack(detail) => {
            warn!(
                con_id = con.id(),
                type_url = short_name(&type_url),
                code = detail.code,
                error = %detail.message,
                "proxy rejected response"
            );
            metrics::reject(&type_url, detail.code);
            server.notify_nack(con, &type_url, detail);
        }
        RequestDecision::ExpiredNonce { received, sent } => {
            debug!(
                con_id = con.id(),
                type_url = short_name(&type_url),
                received = %received,
                sent = %sent,
                "ignoring request with expired nonce"
            );
            metrics::expired_nonce(&type_url);
        }
        RequestDecision::Ack => {
            debug!(con_id = con.id(), type_url = short_name(&type_url), "ack");
        }
        RequestDecision::Unsubscribe => {
            debug!(con_id = con.id(), type_url = short_name(&type_url), "unsubscribed");
            return Ok(());
        }
    }

    // No response of our own; a parked push for the type goes out instead.
    let Some(blocked) = con.take_blocked(&type_url) else {
        return Ok(());
    };
    let Some(watched) = con.watched(&type_url) else {
        return Ok(());
    };
    debug!(con_id = con.id(), type_url = short_name(&type_url), "releasing blocked push");
    push_type::<P, S>(server, con, sink, &watched, &blocked).await
}

/// Push one type, absorbing generator failures.
async fn push_type<P, S>(
    server: &DiscoveryServer,
    con: &Connection,
    sink: &S,
    watched: &WatchedResource,
    request: &PushRequest,
) -> Result<()>
where
    P: Protocol,
    S: ResponseSink<P::Response>,
{
    match P::push(server, con, sink, watched, request).await {
        Err(err) if err.is_generate() => {
            warn!(
                con_id = con.id(),
                type_url = short_name(&watched.type_url),
                error = %err,
                "failed to generate resources"
            );
            metrics::generate_error(&watched.type_url);
            Ok(())
        }
        other => other,
    }
}

/// Handle a push event for a connection.
async fn push_connection<P, S>(
    server: &DiscoveryServer,
    con: &Connection,
    sink: &S,
    request: PushRequest,
) -> Result<()>
where
    P: Protocol,
    S: ResponseSink<P::Response>,
{
    let config = server.config();

    if request.is_flow_control_release() {
        for type_url in con.blocked_types() {
            let (synced, timed_out) = con.flow_state(&type_url, config.flow_control_timeout);
            if !synced && !timed_out {
                continue;
            }
            let (Some(blocked), Some(watched)) = (con.take_blocked(&type_url), con.watched(&type_url))
            else {
                continue;
            };
            if timed_out {
                warn!(
                    con_id = con.id(),
                    type_url = short_name(&type_url),
                    "flow control timed out, pushing without ack"
                );
            }
            push_type::<P, S>(server, con, sink, &watched, &blocked).await?;
        }
        return Ok(());
    }

    let push = match &request.push {
        Some(push) => Arc::clone(push),
        None => server.push_context(),
    };
    if request.full {
        let mut proxy = (*con.proxy()).clone();
        proxy.set_service_instances(&push);
        con.set_proxy(proxy);
    }
    if !push.proxy_needs_push(&con.proxy(), &request) {
        debug!(con_id = con.id(), "skipping push, no relevant changes");
        return Ok(());
    }

    for watched in con.watched_resources() {
        let Some(generator) = server.generator(&watched.type_url) else {
            continue;
        };
        if !request.full && !generator.handles_incremental() {
            continue;
        }

        let request = if config.enable_flow_control {
            let (synced, timed_out) = con.flow_state(&watched.type_url, config.flow_control_timeout);
            if !synced && !timed_out {
                debug!(
                    con_id = con.id(),
                    type_url = short_name(&watched.type_url),
                    "proxy has not acked the last response, delaying push"
                );
                con.block_push(&watched.type_url, request.clone());
                metrics::delayed_push(&watched.type_url);
                continue;
            }
            match con.take_blocked(&watched.type_url) {
                Some(blocked) => blocked.merge(request.clone()),
                None => request.clone(),
            }
        } else {
            request.clone()
        };

        push_type::<P, S>(server, con, sink, &watched, &request).await?;
    }
    Ok(())
}

/// Run a generator, normalizing its failures to [`Error::Generate`].
pub(crate) fn generate(
    server: &DiscoveryServer,
    con: &Connection,
    watched: &WatchedResource,
    request: &PushRequest,
) -> Result<Option<(Resources, Arc<crate::model::push_context::PushContext>)>> {
    let Some(generator) = server.generator(&watched.type_url) else {
        debug!(con_id = con.id(), type_url = %watched.type_url, "no generator for type");
        return Ok(None);
    };
    let push = match &request.push {
        Some(push) => Arc::clone(push),
        None => server.push_context(),
    };
    let proxy = con.proxy();
    let resources = generator
        .generate(&proxy, &push, watched, request)
        .map_err(|err| match err {
            err @ Error::Generate { .. } => err,
            other => Error::Generate {
                type_url: watched.type_url.clone(),
                message: other.to_string(),
            },
        })?;
    Ok(resources.map(|resources| (resources, push)))
}

/// Send a response, giving up after `timeout`.
///
/// The write itself runs on its own task and is left to finish or fail in the
/// background when the deadline passes.
pub(crate) async fn send_with_timeout<S, Resp>(sink: &S, response: Resp, timeout: Duration) -> Result<()>
where
    S: ResponseSink<Resp>,
    Resp: Send + 'static,
{
    let sink = sink.clone();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(sink.send(response).await);
    });
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::StreamClosed),
        Err(_) => {
            metrics::write_timeout();
            Err(Error::SendTimeout(timeout))
        }
    }
}

/// Record a successful send in the connection and metrics.
pub(crate) fn record_push(
    con: &Connection,
    watched: &WatchedResource,
    request: &PushRequest,
    nonce: &str,
    version: &str,
    size: usize,
    sent_names: Option<BTreeSet<String>>,
) {
    con.record_sent(&watched.type_url, nonce, version, size, sent_names);
    metrics::push(&watched.type_url, size);
    metrics::push_latency(&watched.type_url, request.start.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;

    #[test]
    fn nonces_increase() {
        let a = next_nonce();
        let b = next_nonce();
        assert!(b > a);
        assert!(u64::from_str_radix(&b, 16).unwrap() > u64::from_str_radix(&a, 16).unwrap());
    }

    #[derive(Clone)]
    struct StuckSink;

    impl ResponseSink<u32> for StuckSink {
        async fn send(&self, _response: u32) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_times_out() {
        let err = send_with_timeout(&StuckSink, 1, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_send_timeout());
    }

    #[tokio::test]
    async fn send_reports_closed_stream() {
        let (_requests, sink, client) = channel::pair::<(), u32>(1);
        drop(client);
        let err = send_with_timeout(&sink, 1, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, Error::StreamClosed));
    }
}
