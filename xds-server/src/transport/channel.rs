//! In-memory transport backed by tokio channels.
//!
//! Used to drive the stream handlers without a network, both in tests and
//! for embedding the server in-process.

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{RequestStream, ResponseSink};

/// Create a connected pair of server-side stream halves and a client handle.
///
/// `buffer` bounds both directions. A full response buffer makes server sends
/// wait, which is how a slow proxy looks to the server.
pub fn pair<Req, Resp>(buffer: usize) -> (ChannelRequests<Req>, ChannelSink<Resp>, ChannelClient<Req, Resp>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (req_tx, req_rx) = mpsc::channel(buffer);
    let (resp_tx, resp_rx) = mpsc::channel(buffer);
    (
        ChannelRequests { rx: req_rx },
        ChannelSink { tx: resp_tx },
        ChannelClient {
            tx: Some(req_tx),
            rx: resp_rx,
        },
    )
}

/// Server-side receiving half.
#[derive(Debug)]
pub struct ChannelRequests<Req> {
    rx: mpsc::Receiver<Result<Req>>,
}

impl<Req: Send + 'static> RequestStream<Req> for ChannelRequests<Req> {
    async fn recv(&mut self) -> Result<Option<Req>> {
        self.rx.recv().await.transpose()
    }
}

/// Server-side sending half.
#[derive(Debug)]
pub struct ChannelSink<Resp> {
    tx: mpsc::Sender<Resp>,
}

impl<Resp> Clone for ChannelSink<Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Resp: Send + 'static> ResponseSink<Resp> for ChannelSink<Resp> {
    async fn send(&self, response: Resp) -> Result<()> {
        self.tx.send(response).await.map_err(|_| Error::StreamClosed)
    }
}

/// The proxy's end of an in-memory stream.
#[derive(Debug)]
pub struct ChannelClient<Req, Resp> {
    tx: Option<mpsc::Sender<Result<Req>>>,
    rx: mpsc::Receiver<Resp>,
}

impl<Req, Resp> ChannelClient<Req, Resp> {
    /// Send a request to the server.
    pub async fn send(&self, request: Req) -> Result<()> {
        self.send_result(Ok(request)).await
    }

    /// Make the server's next receive fail with `error`.
    pub async fn fail(&self, error: Error) -> Result<()> {
        self.send_result(Err(error)).await
    }

    async fn send_result(&self, item: Result<Req>) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(item).await.map_err(|_| Error::StreamClosed),
            None => Err(Error::StreamClosed),
        }
    }

    /// Receive the next response, or `None` once the server hung up.
    pub async fn recv(&mut self) -> Option<Resp> {
        self.rx.recv().await
    }

    /// Return a response if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Resp> {
        self.rx.try_recv().ok()
    }

    /// Half-close the request direction, as a proxy does on shutdown.
    pub fn close_send(&mut self) {
        self.tx = None;
    }
}
