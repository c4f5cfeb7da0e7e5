//! The watcher: provider registry, dispatch closure, and lifecycle.
//!
//! The watcher owns the registered providers, the pollers, the webhook
//! server, and the notification bus. For each provider it builds the
//! event-handler closure that providers call with `(event, reactor)`:
//!
//! 1. **Duplicate check** - read the last comment; if a configured bot
//!    identity wrote it, the resource is already acknowledged and the event
//!    is dropped. This is the sole idempotency mechanism: there is no
//!    in-memory dedup cache, so restarts and horizontal duplicates are
//!    naturally safe.
//! 2. **Emit** - publish the event to in-process subscribers.
//! 3. **Dispatch** - run the configured command, or post the
//!    acknowledgement comment directly when no command is configured (the
//!    comment doubles as the dedup marker either way).
//!
//! Every error inside the closure is logged, published on the bus's error
//! channel, and swallowed: event processing is best-effort and never takes
//! the watcher down.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Notice, Subscriber};
use crate::config::WatcherConfig;
use crate::event::NormalizedEvent;
use crate::executor::CommandExecutor;
use crate::poller::Poller;
use crate::provider::github::GithubProvider;
use crate::provider::gitlab::GitlabProvider;
use crate::provider::linear::LinearProvider;
use crate::provider::slack::SlackProvider;
use crate::provider::{EventSink, Provider, ProviderError};
use crate::reactor::Reactor;
use crate::server::{AppState, ProviderEntry, WebhookServer};
use crate::template;

/// Lifecycle errors. Only these abort; event-path errors never do.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// `start` was called twice, or the registry was mutated while running.
    #[error("watcher is already started")]
    AlreadyStarted,

    /// The resolved configuration is missing a required field.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A provider failed to construct or initialize.
    #[error("provider {name}: {source}")]
    Provider {
        name: String,
        #[source]
        source: ProviderError,
    },

    /// The webhook server could not bind.
    #[error("webhook server error: {0}")]
    Server(#[from] std::io::Error),
}

/// The dispatcher and lifecycle supervisor.
pub struct Watcher {
    config: WatcherConfig,
    providers: Vec<Arc<dyn Provider>>,
    bus: Arc<EventBus>,
    executor: Arc<CommandExecutor>,
    server: Option<WebhookServer>,
    pollers: Vec<Poller>,
    started: bool,
}

impl Watcher {
    /// Creates a watcher with an empty provider registry.
    pub fn new(config: WatcherConfig) -> Self {
        let executor = Arc::new(CommandExecutor::new(config.command.clone()));
        Watcher {
            config,
            providers: Vec::new(),
            bus: Arc::new(EventBus::new()),
            executor,
            server: None,
            pollers: Vec::new(),
            started: false,
        }
    }

    /// Creates a watcher and registers a provider for every configured
    /// platform block.
    pub fn from_config(config: WatcherConfig) -> Result<Self, WatcherError> {
        let mut watcher = Watcher::new(config.clone());

        if let Some(github) = config.github {
            let provider = GithubProvider::new(github, &config.poll)
                .map_err(|source| WatcherError::Provider {
                    name: "github".to_string(),
                    source,
                })?;
            watcher.register_provider(Arc::new(provider))?;
        }
        if let Some(gitlab) = config.gitlab {
            let provider = GitlabProvider::new(gitlab, &config.poll)
                .map_err(|source| WatcherError::Provider {
                    name: "gitlab".to_string(),
                    source,
                })?;
            watcher.register_provider(Arc::new(provider))?;
        }
        if let Some(linear) = config.linear {
            let provider = LinearProvider::new(linear, &config.poll)
                .map_err(|source| WatcherError::Provider {
                    name: "linear".to_string(),
                    source,
                })?;
            watcher.register_provider(Arc::new(provider))?;
        }
        if let Some(slack) = config.slack {
            let provider = SlackProvider::new(slack, &config.poll)
                .map_err(|source| WatcherError::Provider {
                    name: "slack".to_string(),
                    source,
                })?;
            watcher.register_provider(Arc::new(provider))?;
        }

        Ok(watcher)
    }

    /// Registers a provider. Valid only while stopped.
    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) -> Result<(), WatcherError> {
        if self.started {
            return Err(WatcherError::AlreadyStarted);
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Removes a provider by name. Valid only while stopped.
    pub fn unregister_provider(&mut self, name: &str) -> Result<(), WatcherError> {
        if self.started {
            return Err(WatcherError::AlreadyStarted);
        }
        self.providers.retain(|p| p.name() != name);
        Ok(())
    }

    /// Registered provider names, in registration order.
    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Registers a notification subscriber.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.bus.subscribe(subscriber);
    }

    /// Whether `start` has completed and `stop` has not.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Number of live pollers (running or self-disabled but not stopped).
    pub fn poller_count(&self) -> usize {
        self.pollers.len()
    }

    /// The address the webhook server bound, when running.
    pub fn server_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr())
    }

    /// Start sequence: init providers in registration order, start the
    /// webhook server, start pollers, announce `Started`.
    ///
    /// A provider init failure aborts start; already-initialized providers
    /// are left for `stop` to tear down.
    pub async fn start(&mut self) -> Result<(), WatcherError> {
        if self.started {
            return Err(WatcherError::AlreadyStarted);
        }

        if self.config.command.enabled && self.config.command.command.trim().is_empty() {
            return Err(WatcherError::Config(
                "command execution is enabled but no command is configured".to_string(),
            ));
        }

        for provider in &self.providers {
            let name = provider.name();
            provider
                .init()
                .await
                .map_err(|source| WatcherError::Provider {
                    name: name.to_string(),
                    source,
                })?;
            info!(provider = name, "provider initialized");
        }

        if !self.providers.is_empty() {
            let mut entries = HashMap::new();
            for provider in &self.providers {
                entries.insert(
                    provider.name().to_string(),
                    ProviderEntry {
                        provider: provider.clone(),
                        sink: self.event_sink(provider.name()),
                    },
                );
            }
            let state = AppState::new(entries);
            let server =
                WebhookServer::bind(self.config.listen_addr, state, &self.config.base_path)
                    .await?;
            self.server = Some(server);
        }

        for provider in &self.providers {
            if let Some(interval) = provider.polling_interval() {
                info!(
                    provider = provider.name(),
                    interval_secs = interval.as_secs(),
                    "starting poller"
                );
                self.pollers.push(Poller::start(
                    provider.clone(),
                    self.event_sink(provider.name()),
                    interval,
                    &self.config.poll,
                ));
            }
        }

        self.started = true;
        self.bus.publish(&Notice::Started);
        Ok(())
    }

    /// Stop sequence: pollers, then the server drain, then provider
    /// shutdown, then `Stopped`. A no-op when not started.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }

        for poller in self.pollers.drain(..) {
            debug!(provider = poller.provider_name(), "stopping poller");
            poller.stop().await;
        }

        if let Some(server) = self.server.take() {
            server.stop().await;
        }

        for provider in &self.providers {
            provider.shutdown().await;
        }

        self.started = false;
        self.bus.publish(&Notice::Stopped);
    }

    /// Builds the per-provider event-handler closure handed to webhook
    /// processing and pollers.
    pub(crate) fn event_sink(&self, provider_name: &'static str) -> EventSink {
        let bus = self.bus.clone();
        let executor = self.executor.clone();
        let bot_usernames = self.config.bot.usernames.clone();
        let comment_template = self.config.bot.comment_template.clone();

        Arc::new(move |event, reactor| {
            let bus = bus.clone();
            let executor = executor.clone();
            let bot_usernames = bot_usernames.clone();
            let comment_template = comment_template.clone();
            Box::pin(async move {
                handle_event(
                    provider_name,
                    event,
                    reactor,
                    bus,
                    executor,
                    bot_usernames,
                    comment_template,
                )
                .await;
            })
        })
    }
}

/// One event through the dispatch sequence: duplicate check, emit,
/// dispatch.
async fn handle_event(
    provider_name: &'static str,
    event: NormalizedEvent,
    reactor: Box<dyn Reactor>,
    bus: Arc<EventBus>,
    executor: Arc<CommandExecutor>,
    bot_usernames: Vec<String>,
    comment_template: String,
) {
    if let Err(e) = event.validate() {
        warn!(provider = provider_name, error = %e, "dropping malformed event");
        bus.publish(&Notice::Error {
            provider: provider_name.to_string(),
            message: e.to_string(),
        });
        return;
    }

    // Duplicate check against the platform-hosted comment stream.
    if let Some(last) = reactor.last_comment().await {
        let is_bot =
            reactor.is_bot_author(&last.author) || bot_usernames.iter().any(|n| n == &last.author);
        if is_bot {
            info!(
                provider = provider_name,
                event_id = %event.id,
                author = %last.author,
                "last comment is ours, skipping"
            );
            return;
        }
    }

    bus.publish(&Notice::Event {
        provider: provider_name.to_string(),
        event: event.clone(),
    });

    if executor.enabled() {
        if let Err(e) = executor.execute(&event, reactor.as_ref()).await {
            warn!(provider = provider_name, event_id = %event.id, error = %e,
                "command dispatch failed");
            bus.publish(&Notice::Error {
                provider: provider_name.to_string(),
                message: e.to_string(),
            });
        }
    } else {
        // No command configured: the acknowledgement comment is still the
        // dedup marker for future deliveries.
        let body = template::render(&comment_template, &json!({ "id": event.display_string() }));
        if let Err(e) = reactor.post_comment(&body).await {
            warn!(provider = provider_name, event_id = %event.id, error = %e,
                "failed to post acknowledgement");
            bus.publish(&Notice::Error {
                provider: provider_name.to_string(),
                message: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::HeaderMap;
    use chrono::Utc;
    use serde_json::{Value, json};

    use crate::config::{BotConfig, CommandConfig};
    use crate::event::{Actor, Metadata, Resource};
    use crate::reactor::{ReactorError, ThreadComment};
    use crate::signature::SignatureError;

    use super::*;

    // ─── Test doubles ───

    struct StubProvider {
        name: &'static str,
        fail_init: bool,
        interval: Option<Duration>,
        init_calls: Arc<AtomicUsize>,
        shutdown_calls: Arc<AtomicUsize>,
    }

    impl StubProvider {
        fn ok(name: &'static str) -> Self {
            StubProvider {
                name,
                fail_init: false,
                interval: None,
                init_calls: Arc::new(AtomicUsize::new(0)),
                shutdown_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn init(&self) -> Result<(), ProviderError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                Err(ProviderError::Init("bad credentials".to_string()))
            } else {
                Ok(())
            }
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
            Ok(())
        }

        fn polling_interval(&self) -> Option<Duration> {
            self.interval
        }

        async fn shutdown(&self) {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A reactor with a scripted last comment that records posts.
    struct ScriptedReactor {
        last: Option<ThreadComment>,
        bot_names: Vec<String>,
        posts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Reactor for ScriptedReactor {
        async fn last_comment(&self) -> Option<ThreadComment> {
            self.last.clone()
        }

        async fn post_comment(&self, body: &str) -> Result<String, ReactorError> {
            self.posts.lock().unwrap().push(body.to_string());
            Ok("c-1".to_string())
        }

        fn is_bot_author(&self, name: &str) -> bool {
            self.bot_names.iter().any(|n| n == name)
        }
    }

    fn test_config() -> WatcherConfig {
        WatcherConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            bot: BotConfig {
                usernames: vec!["agent-bot".to_string()],
                ..BotConfig::default()
            },
            ..WatcherConfig::default()
        }
    }

    fn sample_event() -> NormalizedEvent {
        NormalizedEvent {
            id: "github:o/r:created:9:d-77".to_string(),
            provider: "github".to_string(),
            kind: "issue".to_string(),
            action: "created".to_string(),
            resource: Resource::new(42, "Fix it", "https://example.test/42", "open", "o/r"),
            actor: Actor {
                username: "alice".to_string(),
                id: "1".to_string(),
            },
            metadata: Metadata::delivered(Utc::now(), Some("d-77".to_string())),
            raw: json!({}),
        }
    }

    fn event_notices(bus: &EventBus) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(Arc::new(move |notice| {
            let tag = match notice {
                Notice::Started => "started".to_string(),
                Notice::Stopped => "stopped".to_string(),
                Notice::Event { event, .. } => format!("event:{}", event.id),
                Notice::Error { message, .. } => format!("error:{message}"),
            };
            seen_clone.lock().unwrap().push(tag);
        }));
        seen
    }

    // ─── Registry rules ───

    #[tokio::test]
    async fn register_is_rejected_while_started() {
        let mut watcher = Watcher::new(test_config());
        watcher
            .register_provider(Arc::new(StubProvider::ok("stub")))
            .unwrap();
        watcher.start().await.unwrap();

        let result = watcher.register_provider(Arc::new(StubProvider::ok("other")));
        assert!(matches!(result, Err(WatcherError::AlreadyStarted)));
        let result = watcher.unregister_provider("stub");
        assert!(matches!(result, Err(WatcherError::AlreadyStarted)));

        watcher.stop().await;
        watcher.unregister_provider("stub").unwrap();
        assert!(watcher.provider_names().is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut watcher = Watcher::new(test_config());
        watcher.start().await.unwrap();
        assert!(matches!(
            watcher.start().await,
            Err(WatcherError::AlreadyStarted)
        ));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn enabled_command_without_a_command_line_aborts_start() {
        let mut config = test_config();
        config.command = CommandConfig {
            enabled: true,
            command: "  ".to_string(),
            ..CommandConfig::default()
        };
        let mut watcher = Watcher::new(config);

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(err, WatcherError::Config(_)));
        assert!(!watcher.is_started());
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let mut watcher = Watcher::new(test_config());
        watcher.stop().await;
        assert!(!watcher.is_started());
    }

    // ─── Start/stop sequence ───

    #[tokio::test]
    async fn init_failure_aborts_start_with_provider_name() {
        let good = StubProvider::ok("good");
        let good_inits = good.init_calls.clone();
        let bad = StubProvider {
            fail_init: true,
            ..StubProvider::ok("bad")
        };
        let never = StubProvider::ok("never");
        let never_inits = never.init_calls.clone();

        let mut watcher = Watcher::new(test_config());
        watcher.register_provider(Arc::new(good)).unwrap();
        watcher.register_provider(Arc::new(bad)).unwrap();
        watcher.register_provider(Arc::new(never)).unwrap();

        let err = watcher.start().await.unwrap_err();
        match err {
            WatcherError::Provider { name, .. } => assert_eq!(name, "bad"),
            other => panic!("unexpected error: {other}"),
        }

        assert!(!watcher.is_started());
        assert_eq!(good_inits.load(Ordering::SeqCst), 1);
        // Providers after the failing one are never initialized.
        assert_eq!(never_inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_and_stop_emit_notices_and_tear_down() {
        let provider = StubProvider::ok("stub");
        let shutdowns = provider.shutdown_calls.clone();

        let mut watcher = Watcher::new(test_config());
        let notices = event_notices(&watcher.bus);
        watcher.register_provider(Arc::new(provider)).unwrap();

        watcher.start().await.unwrap();
        assert!(watcher.is_started());
        assert!(watcher.server_addr().is_some());

        watcher.stop().await;
        assert!(!watcher.is_started());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(
            *notices.lock().unwrap(),
            vec!["started".to_string(), "stopped".to_string()]
        );
    }

    #[tokio::test]
    async fn pollers_start_only_for_pollable_providers() {
        let pollable = StubProvider {
            interval: Some(Duration::from_secs(3600)),
            ..StubProvider::ok("pollable")
        };
        let webhook_only = StubProvider::ok("webhook-only");

        let mut watcher = Watcher::new(test_config());
        watcher.register_provider(Arc::new(pollable)).unwrap();
        watcher.register_provider(Arc::new(webhook_only)).unwrap();

        watcher.start().await.unwrap();
        assert_eq!(watcher.poller_count(), 1);

        watcher.stop().await;
        assert_eq!(watcher.poller_count(), 0);
    }

    #[tokio::test]
    async fn no_providers_means_no_server() {
        let mut watcher = Watcher::new(test_config());
        watcher.start().await.unwrap();
        assert!(watcher.server_addr().is_none());
        watcher.stop().await;
    }

    // ─── Dispatch closure ───

    async fn dispatch(
        watcher: &Watcher,
        event: NormalizedEvent,
        reactor: ScriptedReactor,
    ) -> Arc<Mutex<Vec<String>>> {
        let posts = reactor.posts.clone();
        let sink = watcher.event_sink("github");
        sink(event, Box::new(reactor)).await;
        posts
    }

    #[tokio::test]
    async fn bot_authored_last_comment_skips_everything() {
        let watcher = Watcher::new(test_config());
        let notices = event_notices(&watcher.bus);

        let reactor = ScriptedReactor {
            last: Some(ThreadComment {
                author: "agent-bot".to_string(),
                body: "Agent is working on o/r#42".to_string(),
            }),
            bot_names: vec!["agent-bot".to_string()],
            posts: Arc::new(Mutex::new(Vec::new())),
        };

        let posts = dispatch(&watcher, sample_event(), reactor).await;

        assert!(posts.lock().unwrap().is_empty(), "no comment may be posted");
        assert!(
            notices.lock().unwrap().is_empty(),
            "skipped events are not published"
        );
    }

    #[tokio::test]
    async fn global_bot_username_also_marks_duplicates() {
        let watcher = Watcher::new(test_config());

        // The reactor itself does not know the name; the watcher's
        // configured identity list must still match.
        let reactor = ScriptedReactor {
            last: Some(ThreadComment {
                author: "agent-bot".to_string(),
                body: "working".to_string(),
            }),
            bot_names: Vec::new(),
            posts: Arc::new(Mutex::new(Vec::new())),
        };

        let posts = dispatch(&watcher, sample_event(), reactor).await;
        assert!(posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn human_last_comment_proceeds_to_acknowledgement() {
        let mut config = test_config();
        config.command = CommandConfig {
            enabled: true,
            command: "true".to_string(),
            ..CommandConfig::default()
        };
        let watcher = Watcher::new(config);
        let notices = event_notices(&watcher.bus);

        let reactor = ScriptedReactor {
            last: Some(ThreadComment {
                author: "alice".to_string(),
                body: "please look".to_string(),
            }),
            bot_names: vec!["agent-bot".to_string()],
            posts: Arc::new(Mutex::new(Vec::new())),
        };

        let posts = dispatch(&watcher, sample_event(), reactor).await;

        let posts = posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0], "Agent is working on o/r#42");
        assert_eq!(
            *notices.lock().unwrap(),
            vec!["event:github:o/r:created:9:d-77".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_thread_proceeds() {
        let mut config = test_config();
        config.command = CommandConfig {
            enabled: true,
            command: "true".to_string(),
            ..CommandConfig::default()
        };
        let watcher = Watcher::new(config);

        let reactor = ScriptedReactor {
            last: None,
            bot_names: vec!["agent-bot".to_string()],
            posts: Arc::new(Mutex::new(Vec::new())),
        };

        let posts = dispatch(&watcher, sample_event(), reactor).await;
        assert_eq!(posts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_executor_posts_rendered_marker() {
        let mut config = test_config();
        config.bot.comment_template = "Acknowledged {{ id }}".to_string();
        let watcher = Watcher::new(config);

        let reactor = ScriptedReactor {
            last: None,
            bot_names: Vec::new(),
            posts: Arc::new(Mutex::new(Vec::new())),
        };

        let posts = dispatch(&watcher, sample_event(), reactor).await;
        assert_eq!(*posts.lock().unwrap(), vec!["Acknowledged o/r#42".to_string()]);
    }

    #[tokio::test]
    async fn replay_after_acknowledgement_is_skipped() {
        // Scenario: first delivery processes and posts the marker; the
        // replayed delivery observes the marker and is dropped.
        let mut config = test_config();
        config.command = CommandConfig {
            enabled: true,
            command: "true".to_string(),
            ..CommandConfig::default()
        };
        let watcher = Watcher::new(config);

        let reactor = ScriptedReactor {
            last: Some(ThreadComment {
                author: "alice".to_string(),
                body: "please look".to_string(),
            }),
            bot_names: vec!["agent-bot".to_string()],
            posts: Arc::new(Mutex::new(Vec::new())),
        };
        let posts = dispatch(&watcher, sample_event(), reactor).await;
        assert_eq!(posts.lock().unwrap().len(), 1);

        // Replay: the platform now shows the bot's marker as the tail.
        let replay_reactor = ScriptedReactor {
            last: Some(ThreadComment {
                author: "agent-bot".to_string(),
                body: "Agent is working on o/r#42".to_string(),
            }),
            bot_names: vec!["agent-bot".to_string()],
            posts: Arc::new(Mutex::new(Vec::new())),
        };
        let replay_posts = dispatch(&watcher, sample_event(), replay_reactor).await;
        assert!(replay_posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_event_is_dropped_with_error_notice() {
        let watcher = Watcher::new(test_config());
        let notices = event_notices(&watcher.bus);

        let mut event = sample_event();
        event.resource.repository.clear();

        let reactor = ScriptedReactor {
            last: None,
            bot_names: Vec::new(),
            posts: Arc::new(Mutex::new(Vec::new())),
        };
        let posts = dispatch(&watcher, event, reactor).await;

        assert!(posts.lock().unwrap().is_empty());
        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("error:"));
    }
}
