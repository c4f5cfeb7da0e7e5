//! Per-provider polling loops.
//!
//! Webhooks are the primary trigger, but deliveries get lost: network
//! problems, platform outages, misconfigured hooks. Each pollable provider
//! gets a fixed-interval tick loop as a fallback.
//!
//! Ticks are single-flight: the loop body runs to completion before the
//! next tick is taken, and ticks that would have fired in the meantime are
//! skipped. Failures back off exponentially (`min(base · 2^(n-1), cap)`),
//! and a streak of `max_error_count` consecutive failures disables the
//! poller for good. A single success resets the streak.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::PollSettings;
use crate::provider::{EventSink, Provider};

/// A running poll loop for one provider.
pub struct Poller {
    provider_name: &'static str,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Spawns the poll loop.
    ///
    /// `interval` is the provider's effective tick interval; back-off and
    /// the hard-fail threshold come from `settings`.
    pub fn start(
        provider: Arc<dyn Provider>,
        sink: EventSink,
        interval: Duration,
        settings: &PollSettings,
    ) -> Self {
        let provider_name = provider.name();
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let loop_cancel = cancel.clone();
        let loop_running = running.clone();
        let backoff_base = settings.backoff_base;
        let backoff_cap = settings.backoff_cap;
        let max_error_count = settings.max_error_count.max(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut error_count: u32 = 0;

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match provider.poll(&sink).await {
                    Ok(()) => {
                        if error_count > 0 {
                            debug!(provider = provider_name, "poll recovered, resetting error count");
                        }
                        error_count = 0;
                    }
                    Err(e) => {
                        error_count += 1;
                        let delay = backoff_delay(backoff_base, backoff_cap, error_count);
                        warn!(
                            provider = provider_name,
                            error = %e,
                            error_count,
                            backoff_secs = delay.as_secs_f64(),
                            "poll failed"
                        );

                        if error_count >= max_error_count {
                            error!(
                                provider = provider_name,
                                failures = error_count,
                                "poller disabled after consecutive failures"
                            );
                            break;
                        }

                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }

            loop_running.store(false, Ordering::SeqCst);
        });

        Poller {
            provider_name,
            cancel,
            running,
            handle,
        }
    }

    /// Whether the loop is still alive (not stopped, not self-disabled).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The provider this poller drives.
    pub fn provider_name(&self) -> &'static str {
        self.provider_name
    }

    /// Stops the loop on the current tick boundary and waits for it.
    ///
    /// Idempotent; a poller that already disabled itself stops immediately.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(provider = self.provider_name, error = %e, "poller task panicked");
            }
        }
    }
}

/// `min(base · 2^(n-1), cap)` for failure number `n` (1-indexed).
fn backoff_delay(base: Duration, cap: Duration, error_count: u32) -> Duration {
    let exponent = error_count.saturating_sub(1).min(31);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use axum::http::HeaderMap;
    use serde_json::Value;

    use crate::provider::ProviderError;
    use crate::retry::ApiError;
    use crate::signature::SignatureError;

    use super::*;

    /// Polls according to a scripted pass/fail sequence, then succeeds.
    struct ScriptedProvider {
        calls: Arc<AtomicU32>,
        failures: Vec<bool>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn init(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        fn validate_webhook(
            &self,
            _headers: &HeaderMap,
            _raw_body: &[u8],
        ) -> Result<(), SignatureError> {
            Ok(())
        }

        async fn handle_webhook(
            &self,
            _headers: &HeaderMap,
            _body: &Value,
            _sink: &EventSink,
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn poll(&self, _sink: &EventSink) -> Result<(), ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if self.failures.get(n).copied().unwrap_or(false) {
                Err(ProviderError::Api(ApiError::transient("poll failed")))
            } else {
                Ok(())
            }
        }

        fn polling_interval(&self) -> Option<Duration> {
            Some(Duration::from_millis(5))
        }
    }

    fn noop_sink() -> EventSink {
        Arc::new(|_, _| Box::pin(async {}))
    }

    fn fast_settings() -> PollSettings {
        PollSettings {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            max_error_count: 5,
            ..PollSettings::default()
        }
    }

    async fn wait_until_stopped(poller: &Poller) {
        for _ in 0..200 {
            if !poller.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("poller did not stop in time");
    }

    #[test]
    fn backoff_delays_follow_the_formula() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);

        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, cap, 5), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, cap, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, cap, 12), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn disables_after_consecutive_failure_threshold() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = Arc::new(ScriptedProvider {
            calls: calls.clone(),
            failures: vec![true; 64],
        });

        let poller = Poller::start(
            provider,
            noop_sink(),
            Duration::from_millis(2),
            &fast_settings(),
        );

        wait_until_stopped(&poller).await;

        // Exactly the threshold number of attempts, then no more ticks.
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let observed = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), observed);
    }

    #[tokio::test]
    async fn success_resets_the_error_streak() {
        let calls = Arc::new(AtomicU32::new(0));
        // Two failures, one success, then failures: the streak restarts
        // after the success, so the poller survives past call 5.
        let mut failures = vec![true, true, false];
        failures.extend(vec![true; 4]);
        failures.push(false);
        let provider = Arc::new(ScriptedProvider {
            calls: calls.clone(),
            failures,
        });

        let settings = PollSettings {
            max_error_count: 5,
            ..fast_settings()
        };
        let poller = Poller::start(provider, noop_sink(), Duration::from_millis(2), &settings);

        // Give it room for all scripted calls.
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(
            poller.is_running(),
            "a success inside the streak must reset the counter"
        );
        poller.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_on_tick_boundary() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = Arc::new(ScriptedProvider {
            calls: calls.clone(),
            failures: Vec::new(),
        });

        let poller = Poller::start(
            provider,
            noop_sink(),
            Duration::from_millis(5),
            &fast_settings(),
        );

        tokio::time::sleep(Duration::from_millis(12)).await;
        poller.stop().await;
        let after_stop = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn is_running_reports_liveness() {
        let provider = Arc::new(ScriptedProvider {
            calls: Arc::new(AtomicU32::new(0)),
            failures: Vec::new(),
        });

        let poller = Poller::start(
            provider,
            noop_sink(),
            Duration::from_millis(5),
            &fast_settings(),
        );

        assert!(poller.is_running());
        assert_eq!(poller.provider_name(), "scripted");
        poller.stop().await;
    }
}
