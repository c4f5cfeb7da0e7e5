//! Webhook endpoint handler.
//!
//! Accepts platform deliveries, validates signatures against the untouched
//! raw bytes, and acknowledges with 202 **before** any processing: platforms
//! time out webhooks aggressively, so comment lookups, comment posts, and
//! subprocess work all happen in a spawned task after the response is on
//! the wire. Event-path errors are therefore never reflected in webhook
//! status codes.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::AppState;

/// Errors that map straight to webhook HTTP responses.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The server is draining; new deliveries are refused.
    #[error("shutting down")]
    Draining,

    /// No provider is registered under the path segment.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The content type is neither JSON nor form-encoded.
    #[error("unsupported content type")]
    UnsupportedContentType,

    /// The body is not valid JSON (or the form `payload` field is not).
    #[error("invalid JSON body")]
    InvalidJson,

    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            WebhookError::UnsupportedContentType | WebhookError::InvalidJson => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Form-encoded envelope used by platforms that wrap JSON in a `payload`
/// field.
#[derive(Debug, Deserialize)]
struct FormEnvelope {
    payload: String,
}

/// Webhook handler.
///
/// # Response
///
/// - 202 `{"status":"accepted"}`: delivery accepted for processing
/// - 200 `{"challenge": ...}`: platform URL-verification handshake
/// - 400: unsupported content type or malformed body
/// - 401: signature verification failed
/// - 404: unknown provider
/// - 503: server is draining
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    if app_state.is_draining() {
        return Err(WebhookError::Draining);
    }
    let _guard = app_state.track_request();

    let entry = app_state
        .provider(&provider_name)
        .ok_or_else(|| WebhookError::UnknownProvider(provider_name.clone()))?;

    let parsed = parse_body(&headers, &body)?;

    // Platform handshakes answer immediately: no validation, no dispatch.
    if let Some(challenge) = handshake_challenge(&parsed) {
        debug!(provider = %provider_name, "answering URL-verification handshake");
        return Ok((StatusCode::OK, Json(json!({ "challenge": challenge }))).into_response());
    }

    // Signature verification sees the untouched raw bytes.
    if let Err(e) = entry.provider.validate_webhook(&headers, &body) {
        warn!(provider = %provider_name, error = %e, "webhook validation failed");
        return Err(WebhookError::InvalidSignature);
    }

    // Ack-first: processing happens after the 202 is on the wire.
    let provider = entry.provider.clone();
    let sink = entry.sink.clone();
    tokio::spawn(async move {
        if let Err(e) = provider.handle_webhook(&headers, &parsed, &sink).await {
            warn!(provider = %provider.name(), error = %e, "webhook processing failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response())
}

/// Normalizes the body envelope: JSON directly, or form-encoded with a
/// JSON string in the `payload` field.
fn parse_body(headers: &HeaderMap, body: &Bytes) -> Result<Value, WebhookError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    if content_type.starts_with("application/json") {
        serde_json::from_slice(body).map_err(|_| WebhookError::InvalidJson)
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let envelope: FormEnvelope =
            serde_urlencoded::from_bytes(body).map_err(|_| WebhookError::InvalidJson)?;
        serde_json::from_str(&envelope.payload).map_err(|_| WebhookError::InvalidJson)
    } else {
        Err(WebhookError::UnsupportedContentType)
    }
}

/// Returns the challenge string for URL-verification handshakes.
fn handshake_challenge(body: &Value) -> Option<&str> {
    if body.get("type").and_then(Value::as_str) == Some("url_verification") {
        body.get("challenge").and_then(Value::as_str)
    } else {
        None
    }
}
