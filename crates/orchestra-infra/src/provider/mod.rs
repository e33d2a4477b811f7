//! Capability provider implementations.

pub mod http;

pub use http::{HttpCapabilityProvider, build_registry};
