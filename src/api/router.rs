//! Router assembly: provider routes plus the deadline and panic boundaries.

use std::any::Any;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use super::handlers::{metrics, mutate, ready, validate};
use super::protocol::{gatekeeper_error, send_response};
use crate::infra::ProviderError;
use crate::metrics::metric_names;
use crate::server::AppState;

/// Build the provider router.
///
/// Layers, outermost first: request tracing, panic recovery, deadline.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/validate", post(validate))
        .route("/mutate", post(mutate))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_deadline,
        ))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cancel the handler once the configured timeout elapses.
async fn enforce_deadline(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    match tokio::time::timeout(state.handler_timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            state.metrics.inc_counter(metric_names::TIMEOUTS).await;
            warn!(
                path = %path,
                timeout_secs = state.handler_timeout.as_secs(),
                "Request timed out"
            );
            send_response(
                &gatekeeper_error(&ProviderError::Timeout.to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            )
        }
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    error!(panic = %detail, "Recovered from panic in request handler");
    send_response(
        &gatekeeper_error(&ProviderError::Internal(detail).to_string()),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}
