//! Conversions between crate-owned messages and wire protos.
//!
//! The stream handlers only see the types in [`crate::message`]. The
//! [`prost`] module converts them to and from the envoy-types generated
//! discovery messages used by the tonic transport.

pub mod prost;
