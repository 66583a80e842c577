//! A Rust implementation of an [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol)
//! control-plane push engine.
//!
//! This crate serves discovery streams to a fleet of proxies. It handles:
//! - State-of-the-world and delta ADS streams, over tonic or in-memory channels
//! - Per-connection, per-type watch tracking and the ACK/NACK protocol
//! - Debounced, merged pushes fanned out through a throttled push queue
//! - Flow control that holds pushes until the proxy acknowledged the last one
//!
//! It does NOT decide what the resources are. [`Generator`]s registered per
//! type URL turn a [`PushContext`] into resources for a proxy; the
//! `xds-networking` crate provides the listener, route, cluster and endpoint
//! generators.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xds_server::{DiscoveryServer, MemoryStore, ServerConfig, SnapshotGenerator};
//! use xds_server::resource::CLUSTER;
//!
//! let store = Arc::new(MemoryStore::new());
//! let server = DiscoveryServer::builder(ServerConfig::default(), store)
//!     .with_generator(CLUSTER, Arc::new(SnapshotGenerator::new(CLUSTER)))
//!     .build()?;
//!
//! tonic::transport::Server::builder()
//!     .add_service(server.clone().into_service())
//!     .serve("[::]:15010".parse()?)
//!     .await?;
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod generator;
pub mod message;
pub mod metrics;
pub mod model;
pub mod multicluster;
mod push;
pub mod registry;
pub mod resource;
pub mod server;
pub mod transport;

pub use connection::{Connection, RequestDecision, WatchedResource};
pub use error::{Error, Result};
pub use generator::{Generator, GeneratorRegistry, SnapshotGenerator};
pub use message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    ErrorDetail, Locality, Node, Resource, ResourceAny, Resources,
};
pub use model::config_store::{
    Config, ConfigEvent, ConfigKey, ConfigMeta, ConfigSpec, ConfigStore, Kind, MemoryStore,
};
pub use model::proxy::Proxy;
pub use model::push_context::PushContext;
pub use model::push_request::{PushRequest, TriggerReason};
pub use multicluster::{ClusterEvent, SecretController};
pub use registry::{ConnectionObserver, ConnectionRegistry};
pub use server::config::ServerConfig;
pub use server::{Authenticator, DiscoveryServer, DiscoveryServerBuilder};
