//! Exponential backoff retry for platform API calls.
//!
//! All outbound platform calls share one retry discipline: transient
//! rejections (HTTP 409, 429, rate limits, 5xx, network errors) are retried
//! with exponential backoff; everything else is surfaced immediately.
//!
//! Defaults: 5 attempts with a 1 s base delay doubling up to a 30 s cap.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// The kind of API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Safe to retry with backoff: 409, 429, rate limits, 5xx, network errors.
    Transient,

    /// Requires intervention: auth failures, 404, malformed requests.
    Permanent,
}

/// A platform API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct ApiError {
    /// Whether the error is retriable.
    pub kind: ApiErrorKind,

    /// The HTTP status code, if the error came from an HTTP response.
    pub status: Option<u16>,

    /// Human-readable description.
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(code) => write!(f, "{} (HTTP {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl ApiError {
    /// Creates a transient (retriable) error.
    pub fn transient(message: impl Into<String>) -> Self {
        ApiError {
            kind: ApiErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    /// Creates a permanent (non-retriable) error.
    pub fn permanent(message: impl Into<String>) -> Self {
        ApiError {
            kind: ApiErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    /// Categorizes an HTTP status code, attaching the response body excerpt.
    ///
    /// 409 (conflict), 429 (rate limited), and 5xx are transient; other
    /// non-success codes are permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            409 | 429 => ApiErrorKind::Transient,
            s if s >= 500 => ApiErrorKind::Transient,
            _ => ApiErrorKind::Permanent,
        };
        ApiError {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    /// Returns true if this error is retriable.
    pub fn is_transient(&self) -> bool {
        self.kind == ApiErrorKind::Transient
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        // Connection-level failures are transient; anything carrying a
        // status goes through the status classifier.
        match err.status() {
            Some(status) => ApiError::from_status(status.as_u16(), err.to_string()),
            None => ApiError::transient(err.to_string()),
        }
    }
}

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Default retry discipline for platform API calls:
    /// 5 attempts with 1 s, 2 s, 4 s, 8 s delays (cap 30 s).
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
    };

    /// Computes the delay before retry number `attempt` (1-indexed):
    /// `min(base · 2^(attempt-1), cap)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 2u64.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier.min(u32::MAX as u64) as u32);
        delay.min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Executes an async operation, retrying transient errors with backoff.
///
/// Permanent errors are returned immediately. When retries are exhausted the
/// last transient error is returned.
pub async fn retry_with_backoff<T, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient API error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
