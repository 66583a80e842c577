//! Error types for the xDS server.

use std::time::Duration;

use thiserror::Error;

/// Error type for the xDS server.
#[derive(Debug, Error)]
pub enum Error {
    /// The first request on a stream did not identify the node.
    #[error("missing node information")]
    MissingNode,

    /// The node identifier could not be parsed into a proxy.
    #[error("invalid node id {id:?}: {reason}")]
    InvalidNode {
        /// The offending node identifier.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The caller could not be authenticated, or its identity does not match
    /// the proxy it claims to be.
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    /// Sending a response did not complete within the configured deadline.
    ///
    /// The write may still complete in the background.
    #[error("timeout sending response after {0:?}")]
    SendTimeout(Duration),

    /// The stream was closed while sending or receiving.
    #[error("stream closed")]
    StreamClosed,

    /// The transport returned a gRPC status.
    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// A generator failed to produce resources for a type.
    #[error("failed to generate {type_url}: {message}")]
    Generate {
        /// The type that failed.
        type_url: String,
        /// Generator supplied message.
        message: String,
    },

    /// A serialized resource could not be decoded.
    #[error("failed to decode {type_url}: {source}")]
    Decode {
        /// The expected type.
        type_url: String,
        /// The decode failure.
        #[source]
        source: prost::DecodeError,
    },

    /// A configuration value was invalid.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A configuration entry does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Config kind.
        kind: String,
        /// Config name.
        name: String,
        /// Config namespace.
        namespace: String,
    },

    /// A configuration entry already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Config kind.
        kind: String,
        /// Config name.
        name: String,
        /// Config namespace.
        namespace: String,
    },

    /// An update carried a stale resource version.
    #[error("conflict updating {name}: expected version {expected}, found {found}")]
    Conflict {
        /// Config name.
        name: String,
        /// Version supplied by the caller.
        expected: String,
        /// Version currently stored.
        found: String,
    },

    /// The server is shutting down.
    #[error("server is shutting down")]
    Shutdown,
}

impl Error {
    /// Returns true for receive errors that represent a normal client
    /// disconnect rather than a failure.
    pub fn is_expected_close(&self) -> bool {
        match self {
            Error::StreamClosed => true,
            Error::Stream(status) => matches!(
                status.code(),
                tonic::Code::Cancelled | tonic::Code::DeadlineExceeded
            ) || status.message().contains("transport is closing")
                || status.message().contains("stream no longer needed"),
            _ => false,
        }
    }

    /// Returns true if this error only abandons one resource type's push and
    /// leaves the stream usable.
    pub fn is_generate(&self) -> bool {
        matches!(self, Error::Generate { .. })
    }

    /// Returns true for send timeouts, which callers may retry or treat as
    /// fatal by policy.
    pub fn is_send_timeout(&self) -> bool {
        matches!(self, Error::SendTimeout(_))
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::MissingNode | Error::InvalidNode { .. } | Error::Validation(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            Error::Unauthenticated(_) => tonic::Status::unauthenticated(err.to_string()),
            Error::SendTimeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            Error::Stream(status) => status,
            Error::Shutdown | Error::StreamClosed => tonic::Status::unavailable(err.to_string()),
            Error::NotFound { .. } => tonic::Status::not_found(err.to_string()),
            Error::AlreadyExists { .. } => tonic::Status::already_exists(err.to_string()),
            Error::Conflict { .. } => tonic::Status::aborted(err.to_string()),
            Error::Generate { .. } | Error::Decode { .. } => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}

/// Result type alias for xDS server operations.
pub type Result<T> = std::result::Result<T, Error>;
