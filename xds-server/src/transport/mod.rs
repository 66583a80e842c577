//! Provides abstraction for stream transports.
//!
//! A discovery stream is split into a receiving half, read by exactly one
//! receive task, and a sending half, written by exactly one connection event
//! loop. Implementations exist for tonic ADS streams and for in-memory
//! channels.

use crate::error::Result;
use std::future::Future;

pub mod channel;
pub mod tonic;

/// The receiving half of a discovery stream.
pub trait RequestStream<Req>: Send + 'static {
    /// Receive the next request from the proxy.
    ///
    /// Returns:
    /// - `Ok(Some(request))` - Received a request.
    /// - `Ok(None)` - Stream closed normally.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    fn recv(&mut self) -> impl Future<Output = Result<Option<Req>>> + Send;
}

/// The sending half of a discovery stream.
///
/// Sinks are cheap to clone so a send can keep running in the background
/// after its caller stopped waiting for it.
pub trait ResponseSink<Resp>: Clone + Send + Sync + 'static {
    /// Send a response to the proxy.
    fn send(&self, response: Resp) -> impl Future<Output = Result<()>> + Send;
}
