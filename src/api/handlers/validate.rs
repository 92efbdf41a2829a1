//! `POST /validate`: verify image attestations against policy.

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::response::Response;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::{abort, decode_request};
use crate::api::mapper::validation_item;
use crate::api::protocol::send_items;
use crate::domain::ImageReference;
use crate::infra::ProviderError;
use crate::metrics::{metric_names, timed};
use crate::server::AppState;

/// Build a verifier once at startup so bad trust configuration shows up
/// in the logs early. Failure is logged and otherwise ignored: every
/// request builds its own verifier and can recover once the TUF
/// repository is reachable again.
pub async fn warm_up_verifier(state: &AppState) {
    match state
        .verifier_factory
        .new_verifier(&state.verifier_config)
        .await
    {
        Ok(_) => info!(
            root = %state.verifier_config.trust_root,
            "Validate handler initialized"
        ),
        Err(e) => {
            state
                .metrics
                .inc_counter(metric_names::VERIFIER_BUILD_ERRORS)
                .await;
            error!(
                root = %state.verifier_config.trust_root,
                error = %e,
                "Failed to initialize verifier"
            );
        }
    }
}

pub async fn validate(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    state
        .metrics
        .inc_counter(metric_names::VALIDATE_REQUESTS)
        .await;
    let span = info_span!("validate", request_id = %Uuid::new_v4());
    timed(
        &state.metrics,
        metric_names::VALIDATE_LATENCY,
        handle_validate(&state, body).instrument(span),
    )
    .await
}

async fn handle_validate(state: &AppState, body: Result<Bytes, BytesRejection>) -> Response {
    let request = match decode_request(body) {
        Ok(request) => request,
        Err(e) => return abort(&state.metrics, &e.to_string()).await,
    };
    let keys = request.keys();
    state
        .metrics
        .add_counter(metric_names::KEYS_RECEIVED, keys.len() as u64)
        .await;

    // One verifier per request: TUF metadata is refreshed every time.
    let verifier = match state
        .verifier_factory
        .new_verifier(&state.verifier_config)
        .await
    {
        Ok(verifier) => verifier,
        Err(e) => {
            state
                .metrics
                .inc_counter(metric_names::VERIFIER_BUILD_ERRORS)
                .await;
            let message = match e {
                ProviderError::VerifierUnavailable(_) => e.to_string(),
                other => ProviderError::VerifierUnavailable(other.to_string()).to_string(),
            };
            return abort(&state.metrics, &message).await;
        }
    };

    let mut items = Vec::with_capacity(keys.len());
    for key in keys {
        let reference = match ImageReference::parse(key) {
            Ok(reference) => reference,
            Err(e) => return abort(&state.metrics, &e.to_string()).await,
        };

        let result = match verifier.verify(&reference).await {
            Ok(result) => result,
            Err(e) => return abort(&state.metrics, &e.to_string()).await,
        };

        info!(key = %key, outcome = %result.outcome, "Evaluated image");
        state.metrics.record_outcome(result.outcome).await;
        match validation_item(key, result) {
            Ok(item) => items.push(item),
            Err(e) => return abort(&state.metrics, &e.to_string()).await,
        }
    }

    send_items(items)
}
