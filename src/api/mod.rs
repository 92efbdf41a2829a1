//! HTTP surface of the provider
//!
//! Gatekeeper external data endpoints (`/validate`, `/mutate`) plus the
//! readiness and metrics probes.

pub mod handlers;
pub mod mapper;
pub mod protocol;
mod router;
pub mod types;

pub use protocol::{gatekeeper_error, gatekeeper_response};
pub use router::router;
pub use types::{Item, ProviderRequest, ProviderResponse, ValidationValue};
