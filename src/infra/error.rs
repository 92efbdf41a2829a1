//! Error types for the attest provider

use thiserror::Error;

/// Errors that can occur while serving provider requests
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Unreadable body, invalid JSON or an unparseable image key
    #[error("{0}")]
    RequestMalformed(String),

    /// Configuration rejected (unknown trust root, bad attestation style, ...)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Trust bootstrap or metadata refresh failed
    #[error("unable to create verifier: {0}")]
    VerifierUnavailable(String),

    /// Verification engine failure, distinct from a policy denial
    #[error("{0}")]
    EvaluationFailed(String),

    /// Registry request failed
    #[error("registry error: {0}")]
    Registry(String),

    /// A tag could not be pinned to a digest
    #[error("unable to get digest for reference {key}: {cause}")]
    DigestResolution { key: String, cause: String },

    /// TUF metadata error
    #[error("tuf error: {0}")]
    Tuf(String),

    /// Policy resolution or evaluation error
    #[error("policy error: {0}")]
    Policy(String),

    /// Operation exceeded the handler deadline
    #[error("operation timed out")]
    Timeout,

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Registry(err.to_string())
    }
}

impl From<tuf::Error> for ProviderError {
    fn from(err: tuf::Error) -> Self {
        ProviderError::Tuf(err.to_string())
    }
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;
