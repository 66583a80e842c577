//! Listener, route, cluster and endpoint generation for the
//! [`xds_server`] push engine.
//!
//! This crate decides what a proxy is sent. It provides:
//! - Builders for inbound, outbound and virtual listeners, with filter chains
//!   chosen by each port's mutual TLS mode
//! - The EnvoyFilter patch engine applied to every generated listener
//! - A filter chain match simulator predicting how a proxy routes a call
//! - [`Generator`](xds_server::Generator)s wiring all of it into a
//!   [`DiscoveryServer`](xds_server::DiscoveryServer)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xds_networking::{Call, Simulation, generator};
//! use xds_server::{DiscoveryServer, MemoryStore, ServerConfig};
//!
//! let store = Arc::new(MemoryStore::new());
//! let server = generator::install(DiscoveryServer::builder(ServerConfig::default(), store)).build()?;
//!
//! // Where does a sidecar send a request for reviews:9080?
//! let push = server.push_context();
//! let decision = Simulation::for_proxy(&proxy, &push)
//!     .run(&Call::new("10.96.0.10", 9080).with_host("reviews:9080"))?;
//! println!("{}", decision.cluster);
//! ```

pub mod bootstrap;
pub mod cluster;
pub mod endpoint;
pub mod envoyfilter;
pub mod error;
pub mod generator;
pub mod listener;
pub mod proto;
pub mod route;
pub mod simulator;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::Bootstrap;
pub use cluster::ClusterBuilder;
pub use envoyfilter::apply_listener_patches;
pub use error::{Error, Result};
pub use listener::ListenerBuilder;
pub use route::RouteBuilder;
pub use simulator::{Call, RouteDecision, Simulation, TlsMode};
