//! The tonic Aggregated Discovery Service.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::message::{DeltaDiscoveryRequest, DiscoveryRequest};
use crate::server::DiscoveryServer;
use crate::transport::tonic::{TonicRequests, TonicSink};

/// Response stream of a state-of-the-world ADS call.
pub type AdsResponseStream = ResponseStream<discovery::DiscoveryResponse>;

/// Response stream of a delta ADS call.
pub type DeltaAdsResponseStream = ResponseStream<discovery::DeltaDiscoveryResponse>;

// One slot, so a proxy that stops reading shows up as a send timeout.
const RESPONSE_BUFFER: usize = 1;

/// Responses of one ADS call, ended by the status of a failed stream.
///
/// The terminal status does not queue behind buffered responses: a proxy
/// that stopped reading still sees its stream end. Once it is yielded the
/// buffer is closed, failing any send still parked on it.
#[derive(Debug)]
pub struct ResponseStream<T> {
    responses: ReceiverStream<Result<T, Status>>,
    terminal: Option<oneshot::Receiver<Status>>,
    done: bool,
}

impl<T> ResponseStream<T> {
    fn new(responses: mpsc::Receiver<Result<T, Status>>, terminal: oneshot::Receiver<Status>) -> Self {
        Self {
            responses: ReceiverStream::new(responses),
            terminal: Some(terminal),
            done: false,
        }
    }
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(terminal) = this.terminal.as_mut() {
            match Pin::new(terminal).poll(cx) {
                Poll::Ready(Ok(status)) => {
                    this.done = true;
                    this.terminal = None;
                    this.responses.close();
                    return Poll::Ready(Some(Err(status)));
                }
                // The stream ended cleanly.
                Poll::Ready(Err(_)) => this.terminal = None,
                Poll::Pending => {}
            }
        }
        Pin::new(&mut this.responses).poll_next(cx)
    }
}

impl DiscoveryServer {
    /// Wrap the server as a tonic service.
    pub fn into_service(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }
}

fn peer_addr<T>(request: &Request<T>) -> String {
    request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = AdsResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<discovery::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let peer = peer_addr(&request);
        let identities = self.authenticate(request.metadata())?;
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

        let requests = TonicRequests::<_, DiscoveryRequest>::new(request.into_inner());
        let (terminal_tx, terminal_rx) = oneshot::channel();

        let sink = TonicSink::new(tx);
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve_sotw(requests, sink, peer, identities).await {
                debug!(error = %err, "ads stream ended with error");
                let _ = terminal_tx.send(err.into());
            }
        });

        Ok(Response::new(ResponseStream::new(rx, terminal_rx)))
    }

    type DeltaAggregatedResourcesStream = DeltaAdsResponseStream;

    async fn delta_aggregated_resources(
        &self,
        request: Request<Streaming<discovery::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        let peer = peer_addr(&request);
        let identities = self.authenticate(request.metadata())?;
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

        let requests = TonicRequests::<_, DeltaDiscoveryRequest>::new(request.into_inner());
        let (terminal_tx, terminal_rx) = oneshot::channel();

        let sink = TonicSink::new(tx);
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve_delta(requests, sink, peer, identities).await {
                debug!(error = %err, "delta ads stream ended with error");
                let _ = terminal_tx.send(err.into());
            }
        });

        Ok(Response::new(ResponseStream::new(rx, terminal_rx)))
    }
}
