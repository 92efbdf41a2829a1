//! `GET /ready`

use axum::http::StatusCode;

/// Readiness probe; the listener is up once this can answer.
pub async fn ready() -> StatusCode {
    StatusCode::OK
}
