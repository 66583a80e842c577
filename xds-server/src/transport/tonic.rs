//! `tonic` based transport implementation.
//!
//! Wraps the server side of a tonic bidirectional stream. Requests arrive as
//! envoy-types protos on a [`Streaming`] and are converted into crate-owned
//! messages; responses are converted back and pushed into the channel that
//! backs the tonic response stream.

use std::marker::PhantomData;

use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use crate::error::{Error, Result};
use crate::transport::{RequestStream, ResponseSink};

/// Receiving half of a tonic server stream.
#[derive(Debug)]
pub struct TonicRequests<P, Req> {
    inner: Streaming<P>,
    _request: PhantomData<fn() -> Req>,
}

impl<P, Req> TonicRequests<P, Req> {
    /// Wrap the inbound half of a tonic stream.
    pub fn new(inner: Streaming<P>) -> Self {
        Self {
            inner,
            _request: PhantomData,
        }
    }
}

impl<P, Req> RequestStream<Req> for TonicRequests<P, Req>
where
    P: Send + 'static,
    Req: From<P> + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Req>> {
        match self.inner.message().await {
            Ok(Some(proto)) => Ok(Some(proto.into())),
            Ok(None) => Ok(None),
            Err(status) => Err(Error::Stream(status)),
        }
    }
}

/// Sending half of a tonic server stream.
#[derive(Debug)]
pub struct TonicSink<P> {
    tx: mpsc::Sender<std::result::Result<P, Status>>,
}

impl<P> TonicSink<P> {
    /// Wrap the sender that feeds a tonic response stream.
    pub fn new(tx: mpsc::Sender<std::result::Result<P, Status>>) -> Self {
        Self { tx }
    }
}

impl<P> Clone for TonicSink<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P, Resp> ResponseSink<Resp> for TonicSink<P>
where
    P: From<Resp> + Send + 'static,
    Resp: Send + 'static,
{
    async fn send(&self, response: Resp) -> Result<()> {
        self.tx
            .send(Ok(P::from(response)))
            .await
            .map_err(|_| Error::StreamClosed)
    }
}
