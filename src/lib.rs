//! Attest Provider Library
//!
//! Gatekeeper external data provider that verifies container image
//! attestations against TUF-distributed policy (`/validate`) and pins image
//! tags to content digests (`/mutate`).
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (image references, outcomes, configuration)
//! - [`infra`] - Registry client, TUF client, policy engine, verifiers
//! - [`api`] - Provider protocol types, handlers and router
//! - [`config`] - Command-line configuration
//! - [`metrics`] - In-process metrics and Prometheus export
//! - [`telemetry`] - Logging setup
//! - [`server`] - HTTPS server bootstrap

pub mod api;
pub mod config;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{ImageReference, Outcome, VerificationResult, VerifierConfig, Violation};

pub use infra::{ImageVerifier, ProviderError, Registry, Result, VerifierFactory};
