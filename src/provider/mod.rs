//! The provider contract.
//!
//! A provider adapts one external platform: it owns the platform API client
//! and credentials, validates webhook signatures, normalizes native payloads
//! into [`NormalizedEvent`]s, runs the incremental poll, and builds the
//! per-event [`Reactor`] handed to the dispatcher.
//!
//! Providers are registered with the watcher behind `Arc<dyn Provider>`;
//! the trait uses `async_trait` so it stays object-safe.

pub mod github;
pub mod gitlab;
pub mod linear;
pub mod slack;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::Value;
use thiserror::Error;

use crate::event::NormalizedEvent;
use crate::reactor::Reactor;
use crate::retry::ApiError;
use crate::secret::SecretError;
use crate::signature::SignatureError;

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Initialization failed (bad credentials, unreachable platform).
    #[error("initialization failed: {0}")]
    Init(String),

    /// A configured secret could not be resolved.
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// A platform API call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The payload is missing a field the normalizer requires.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// The future returned by the dispatcher's event handler.
pub type EventFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The dispatcher's per-provider event handler.
///
/// Providers call this once per normalized event that survives filtering,
/// passing the freshly built reactor. The reactor is consumed by the
/// handler and never outlives it.
pub type EventSink = Arc<dyn Fn(NormalizedEvent, Box<dyn Reactor>) -> EventFuture + Send + Sync>;

/// A platform adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider's registered name; also its webhook path segment.
    fn name(&self) -> &'static str;

    /// Validates credentials and discovers the bot identity when it is not
    /// configured. Called once, during watcher start; a failure aborts
    /// start.
    async fn init(&self) -> Result<(), ProviderError>;

    /// Verifies the webhook signature envelope against the raw body.
    ///
    /// When no secret is configured, the provider logs a warning and
    /// accepts any request carrying its event headers.
    fn validate_webhook(&self, headers: &HeaderMap, raw_body: &[u8])
    -> Result<(), SignatureError>;

    /// Parses, filters, and normalizes a validated webhook body, emitting
    /// each surviving event (with its reactor) through `sink`.
    ///
    /// Runs after the HTTP 202 acknowledgement; errors are logged by the
    /// caller, never reflected in the webhook response.
    async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        body: &Value,
        sink: &EventSink,
    ) -> Result<(), ProviderError>;

    /// Fetches items updated since the per-container cursor and emits the
    /// ones that survive filtering. Advances cursors only on success.
    async fn poll(&self, sink: &EventSink) -> Result<(), ProviderError>;

    /// The poll tick interval, or `None` when this provider should not be
    /// polled (no containers configured, or no interval).
    fn polling_interval(&self) -> Option<Duration>;

    /// Releases provider resources. Called during watcher stop, after the
    /// pollers and the HTTP server are down.
    async fn shutdown(&self) {}
}

/// Extracts a header as a string, when present and valid UTF-8.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Walks a path of object keys and returns the string at the end.
pub(crate) fn json_str(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_str().map(str::to_string)
}

/// Walks a path of object keys and returns the integer at the end.
pub(crate) fn json_u64(value: &Value, path: &[&str]) -> Option<u64> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_u64()
}

/// Resolves the effective polling interval for a provider: its own
/// override, else the global default; `None` (or an empty container list
/// at the call site) disables polling.
pub(crate) fn effective_interval(
    own: Option<Duration>,
    default: Option<Duration>,
    has_containers: bool,
) -> Option<Duration> {
    if !has_containers {
        return None;
    }
    own.or(default)
}

/// The lower bound of a poll window: the stored cursor, or exactly
/// `now - lookback` on the first poll for a container.
pub(crate) fn poll_since(
    cursor: Option<chrono::DateTime<chrono::Utc>>,
    now: chrono::DateTime<chrono::Utc>,
    lookback: Duration,
) -> chrono::DateTime<chrono::Utc> {
    cursor.unwrap_or_else(|| {
        now - chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::hours(1))
    })
}
