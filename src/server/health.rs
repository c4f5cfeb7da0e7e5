//! Health check endpoint for liveness probes.
//!
//! Returns 200 with `{"status":"ok"}` whenever the listener is accepting.
//! Draining does not affect this endpoint; once the socket closes it simply
//! becomes unavailable.

use axum::Json;
use axum::http::StatusCode;
use serde_json::{Value, json};

/// Health check handler.
pub async fn health_handler() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_returns_ok_body() {
        let (status, Json(body)) = health_handler().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }
}
