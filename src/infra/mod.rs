//! Infrastructure layer for the attest provider
//!
//! Contains capability traits and their default implementations:
//! - Registry client (OCI distribution, anonymous bearer auth)
//! - Attestation discovery (referrers and attached styles)
//! - TUF metadata client (policy distribution)
//! - Policy mapping, resolution and evaluation
//! - Verifier construction
//! - Retry with backoff, graceful shutdown

pub mod attestation;
mod error;
pub mod oci;
pub mod policy;
pub mod registry;
pub mod retry;
mod shutdown;
pub mod tuf;
pub mod verifier;

pub use attestation::{
    Attestation, AttestationResolver, Envelope, RegistryAttestationResolver, ResolvedImage,
};
pub use error::*;
pub use registry::{FetchedManifest, Registry, RegistryClient};
pub use retry::{Retry, RetryConfig};
pub use shutdown::{
    shutdown_signal, ConnectionGuard, ConnectionTracker, ShutdownCoordinator, ShutdownSignal,
};
pub use verifier::{AttestVerifier, AttestVerifierFactory, ImageVerifier, VerifierFactory};

/// User-Agent sent on every outbound request
pub const USER_AGENT: &str = concat!("attest-provider/", env!("CARGO_PKG_VERSION"));
