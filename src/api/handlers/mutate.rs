//! `POST /mutate`: pin image tags to content digests.

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::response::Response;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use super::{abort, decode_request};
use crate::api::mapper::mutation_item;
use crate::api::protocol::send_items;
use crate::domain::{validate_digest, ImageReference};
use crate::infra::{ProviderError, Registry, Result};
use crate::metrics::{metric_names, timed};
use crate::server::AppState;

/// Resolve one key to `name@digest`.
///
/// Keys that already carry a digest come back unchanged, which keeps the
/// mutation idempotent.
pub async fn resolve_digest_reference(registry: &dyn Registry, key: &str) -> Result<String> {
    let reference = ImageReference::parse(key)?;
    if reference.is_digest() {
        return Ok(key.to_string());
    }

    let unresolved = |cause: String| ProviderError::DigestResolution {
        key: key.to_string(),
        cause,
    };
    let digest = registry
        .head_digest(&reference)
        .await
        .map_err(|e| unresolved(e.to_string()))?;
    validate_digest(&digest).map_err(unresolved)?;

    debug!(key = %key, digest = %digest, "Resolved digest");
    Ok(reference.with_digest(&digest))
}

pub async fn mutate(
    State(state): State<AppState>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    state
        .metrics
        .inc_counter(metric_names::MUTATE_REQUESTS)
        .await;
    let span = info_span!("mutate", request_id = %Uuid::new_v4());
    timed(
        &state.metrics,
        metric_names::MUTATE_LATENCY,
        handle_mutate(&state, body).instrument(span),
    )
    .await
}

async fn handle_mutate(
    state: &AppState,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let request = match decode_request(body) {
        Ok(request) => request,
        Err(e) => return abort(&state.metrics, &e.to_string()).await,
    };
    let keys = request.keys();
    state
        .metrics
        .add_counter(metric_names::KEYS_RECEIVED, keys.len() as u64)
        .await;

    let mut items = Vec::with_capacity(keys.len());
    for key in keys {
        match resolve_digest_reference(state.registry.as_ref(), key).await {
            Ok(resolved) => items.push(mutation_item(key, resolved)),
            Err(e) => return abort(&state.metrics, &e.to_string()).await,
        }
    }

    send_items(items)
}
