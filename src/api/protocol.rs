//! Response envelope construction.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, info};

use super::types::{Item, ProviderResponse, ResponseBody, API_VERSION, RESPONSE_KIND};

/// Serialized form of a failure to serialize, kept static so it cannot fail
const MARSHAL_FAILURE_BODY: &str = r#"{"apiVersion":"externaldata.gatekeeper.sh/v1beta1","kind":"ProviderResponse","response":{"idempotent":true,"systemError":"unable to marshal response"}}"#;

/// Build the envelope; `items` wins over `system_error` when both are given
pub fn gatekeeper_response(items: Option<Vec<Item>>, system_error: &str) -> ProviderResponse {
    let response = match items {
        Some(items) => ResponseBody {
            // Gatekeeper mutation requires idempotent results.
            idempotent: true,
            items: Some(items),
            system_error: None,
        },
        None => ResponseBody {
            idempotent: true,
            items: None,
            system_error: Some(system_error.to_string()),
        },
    };
    ProviderResponse {
        api_version: API_VERSION.to_string(),
        kind: RESPONSE_KIND.to_string(),
        response,
    }
}

/// Envelope carrying only a system error
pub fn gatekeeper_error(system_error: &str) -> ProviderResponse {
    gatekeeper_response(None, system_error)
}

/// Serialize an envelope into an HTTP response
pub fn send_response(response: &ProviderResponse, status: StatusCode) -> Response {
    let (status, body) = match serde_json::to_string(response) {
        Ok(body) => (status, body),
        Err(e) => {
            error!(error = %e, "Unable to marshal response");
            (StatusCode::INTERNAL_SERVER_ERROR, MARSHAL_FAILURE_BODY.to_string())
        }
    };

    info!(response = %body, "Sending response");

    let mut http = (status, body).into_response();
    http.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    http
}

/// Items response with HTTP 200
pub fn send_items(items: Vec<Item>) -> Response {
    send_response(&gatekeeper_response(Some(items), ""), StatusCode::OK)
}

/// System error response with HTTP 200
pub fn send_system_error(system_error: &str) -> Response {
    send_response(&gatekeeper_error(system_error), StatusCode::OK)
}
