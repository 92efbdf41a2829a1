//! Provider endpoint handlers.

pub mod metrics;
pub mod mutate;
pub mod ready;
pub mod validate;

pub use metrics::metrics;
pub use mutate::{mutate, resolve_digest_reference};
pub use ready::ready;
pub use validate::{validate, warm_up_verifier};

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::response::Response;
use tracing::{info, warn};

use crate::api::protocol::send_system_error;
use crate::api::types::ProviderRequest;
use crate::infra::ProviderError;
use crate::metrics::{metric_names, MetricsRegistry};

/// Read and parse a provider request body
pub(crate) fn decode_request(
    body: Result<Bytes, BytesRejection>,
) -> Result<ProviderRequest, ProviderError> {
    let body = body.map_err(|e| {
        ProviderError::RequestMalformed(format!("unable to read request body: {e}"))
    })?;

    info!(body = %String::from_utf8_lossy(&body), "Received request");

    serde_json::from_slice(&body).map_err(|e| {
        ProviderError::RequestMalformed(format!("unable to unmarshal request body: {e}"))
    })
}

/// Abort the request with a system error
pub(crate) async fn abort(metrics: &MetricsRegistry, message: &str) -> Response {
    warn!(error = message, "Request aborted with system error");
    metrics.inc_counter(metric_names::SYSTEM_ERRORS).await;
    send_system_error(message)
}
