//! HTTP server for webhook ingestion.
//!
//! One axum server multiplexes every registered provider:
//!
//! - `POST {base_path}/webhook/{provider}` - accepts platform deliveries
//!   (202 ack-first; processing happens in a spawned task)
//! - `GET /health` - liveness probe
//!
//! The raw request bytes are preserved for signature verification; body
//! parsing happens only after the signature check. During drain, webhook
//! posts are rejected with 503 while the health endpoint keeps answering
//! until the listener closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{EventSink, Provider};

pub mod health;
pub mod webhook;

pub use health::health_handler;
pub use webhook::webhook_handler;

/// How long `stop` waits for in-flight requests before force-closing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered provider plus the dispatcher's event handler for it.
#[derive(Clone)]
pub struct ProviderEntry {
    pub provider: Arc<dyn Provider>,
    pub sink: EventSink,
}

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    providers: HashMap<String, ProviderEntry>,
    draining: AtomicBool,
    active_requests: AtomicUsize,
}

impl AppState {
    /// Creates state over the given provider table.
    pub fn new(providers: HashMap<String, ProviderEntry>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                providers,
                draining: AtomicBool::new(false),
                active_requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Looks up a provider entry by its path segment.
    pub fn provider(&self, name: &str) -> Option<ProviderEntry> {
        self.inner.providers.get(name).cloned()
    }

    /// Whether the server is refusing new webhook posts.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Flips the draining flag; new webhook posts get 503 from here on.
    pub fn begin_drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
    }

    /// Number of webhook requests currently being answered.
    pub fn active_requests(&self) -> usize {
        self.inner.active_requests.load(Ordering::SeqCst)
    }

    /// RAII guard tracking one in-flight request.
    pub(crate) fn track_request(&self) -> RequestGuard {
        self.inner.active_requests.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            state: self.clone(),
        }
    }
}

/// Decrements the active-request counter on drop.
pub(crate) struct RequestGuard {
    state: AppState,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.state
            .inner
            .active_requests
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builds the axum router with all endpoints.
///
/// `base_path` is the prefix for webhook endpoints (empty for the root);
/// the health endpoint always lives at `/health`.
pub fn build_router(app_state: AppState, base_path: &str) -> axum::Router {
    use axum::routing::{get, post};

    let webhook_path = format!("{}/webhook/{{provider}}", normalize_base_path(base_path));

    axum::Router::new()
        .route(&webhook_path, post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

/// Ensures the base path is either empty or `/`-prefixed without a
/// trailing slash.
fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// The running webhook server.
pub struct WebhookServer {
    state: AppState,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), std::io::Error>>,
}

impl WebhookServer {
    /// Binds the listener and starts serving.
    pub async fn bind(
        addr: SocketAddr,
        state: AppState,
        base_path: &str,
    ) -> Result<Self, std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let app = build_router(state.clone(), base_path);

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await
        });

        info!(addr = %local_addr, "webhook server listening");
        Ok(WebhookServer {
            state,
            local_addr,
            shutdown,
            handle,
        })
    }

    /// The address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drains and stops the server.
    ///
    /// New webhook posts get 503 immediately; in-flight requests get up to
    /// 30 s to finish, then the serve task is aborted (force-close).
    pub async fn stop(mut self) {
        self.state.begin_drain();
        self.shutdown.cancel();

        match tokio::time::timeout(DRAIN_TIMEOUT, &mut self.handle).await {
            Ok(Ok(Ok(()))) => debug!("webhook server drained cleanly"),
            Ok(Ok(Err(e))) => warn!(error = %e, "webhook server exited with I/O error"),
            Ok(Err(e)) => warn!(error = %e, "webhook server task panicked"),
            Err(_) => {
                warn!(
                    active = self.state.active_requests(),
                    "drain timeout exceeded, force-closing webhook server"
                );
                self.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_path_shapes() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("hooks"), "/hooks");
        assert_eq!(normalize_base_path("/hooks"), "/hooks");
        assert_eq!(normalize_base_path("/hooks/"), "/hooks");
    }

    #[test]
    fn request_guard_tracks_in_flight_count() {
        let state = AppState::new(HashMap::new());
        assert_eq!(state.active_requests(), 0);

        let guard_a = state.track_request();
        let guard_b = state.track_request();
        assert_eq!(state.active_requests(), 2);

        drop(guard_a);
        assert_eq!(state.active_requests(), 1);
        drop(guard_b);
        assert_eq!(state.active_requests(), 0);
    }

    #[test]
    fn drain_flag_flips_once() {
        let state = AppState::new(HashMap::new());
        assert!(!state.is_draining());
        state.begin_drain();
        assert!(state.is_draining());
        state.begin_drain();
        assert!(state.is_draining());
    }

    #[tokio::test]
    async fn server_binds_and_stops() {
        let state = AppState::new(HashMap::new());
        let server = WebhookServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), state, "")
            .await
            .unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        // Health answers while running.
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        server.stop().await;

        // The listener is gone after stop.
        assert!(reqwest::get(format!("http://{addr}/health")).await.is_err());
    }
}
