//! Slack provider.
//!
//! Webhooks (the Events API) use the replay-guarded envelope: the signature
//! header carries `v0=<hex>` over `"v0:" + timestamp + ":" + raw body`, with
//! deliveries outside the 300 s window rejected. Only `app_mention` inner
//! events are actionable; the channel is the container and the thread
//! timestamp is the threading key.
//!
//! The Web API reports failures as HTTP 200 with `{"ok": false}`; those map
//! to permanent errors except for `ratelimited`, which is retried.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{PollSettings, SlackConfig};
use crate::event::filter::skip_reason;
use crate::event::{Actor, Metadata, NormalizedEvent, Resource};
use crate::reactor::{Reactor, ReactorError, ThreadComment, matches_bot_identity};
use crate::retry::{ApiError, RetryConfig, retry_with_backoff};
use crate::signature::{SignatureError, verify_replay_guarded};

use super::{EventSink, Provider, ProviderError, effective_interval, header_str, json_str, poll_since};

/// Header name for the request timestamp.
const HEADER_TIMESTAMP: &str = "x-slack-request-timestamp";
/// Header name for the signature.
const HEADER_SIGNATURE: &str = "x-slack-signature";

/// Production Web API base.
const SLACK_API_URL: &str = "https://slack.com/api";

/// Thin Slack Web API client.
#[derive(Clone)]
struct SlackClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl SlackClient {
    fn new(api_base: String, token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        SlackClient {
            http,
            api_base,
            token,
        }
    }

    /// Interprets a Web API response envelope: HTTP status first, then the
    /// `ok` flag.
    fn interpret(status: u16, body: Value) -> Result<Value, ApiError> {
        if status == 429 {
            return Err(ApiError::from_status(429, "rate limited"));
        }
        if !(200..300).contains(&status) {
            return Err(ApiError::from_status(status, body.to_string()));
        }
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(body)
        } else {
            let error = json_str(&body, &["error"]).unwrap_or_else(|| "unknown error".to_string());
            if error == "ratelimited" {
                Err(ApiError::transient(format!("Slack API: {error}")))
            } else {
                Err(ApiError::permanent(format!("Slack API: {error}")))
            }
        }
    }

    async fn get(&self, method: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.api_base, method);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.map_err(ApiError::from)?;
        Self::interpret(status, body)
    }

    async fn post(&self, method: &str, payload: &Value) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.api_base, method);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.map_err(ApiError::from)?;
        Self::interpret(status, body)
    }
}

/// Slack platform adapter.
pub struct SlackProvider {
    client: SlackClient,
    signing_secret: Option<String>,
    channels: Vec<String>,
    bot_identities: RwLock<Vec<String>>,
    cursors: RwLock<HashMap<String, DateTime<Utc>>>,
    interval: Option<Duration>,
    initial_lookback: Duration,
    max_items: usize,
}

impl SlackProvider {
    /// Builds the provider, resolving secrets. The token is checked against
    /// `auth.test` in [`Provider::init`].
    pub fn new(config: SlackConfig, poll: &PollSettings) -> Result<Self, ProviderError> {
        Self::with_api_base(config, poll, SLACK_API_URL.to_string())
    }

    fn with_api_base(
        config: SlackConfig,
        poll: &PollSettings,
        api_base: String,
    ) -> Result<Self, ProviderError> {
        let token = config.bot_token.resolve()?;
        let signing_secret = config
            .signing_secret
            .as_ref()
            .map(|s| s.resolve())
            .transpose()?;

        let interval = effective_interval(
            config.polling_interval,
            poll.interval,
            !config.channels.is_empty(),
        );

        Ok(SlackProvider {
            client: SlackClient::new(api_base, token),
            signing_secret,
            channels: config.channels,
            bot_identities: RwLock::new(config.bot_user_id.into_iter().collect()),
            cursors: RwLock::new(HashMap::new()),
            interval,
            initial_lookback: poll.initial_lookback,
            max_items: poll.max_items,
        })
    }

    fn identities(&self) -> Vec<String> {
        self.bot_identities
            .read()
            .expect("bot identity lock poisoned")
            .clone()
    }

    /// The bot's user id, when one is configured or discovered.
    fn bot_user_id(&self) -> Option<String> {
        self.identities().first().cloned()
    }

    fn reactor(&self, channel: String, thread_ts: String) -> SlackReactor {
        SlackReactor {
            client: self.client.clone(),
            channel,
            thread_ts,
            bot_names: self.identities(),
        }
    }

    /// Maps an Events API callback to the normalized form.
    ///
    /// The inner event type becomes the normalized `action`, so the shared
    /// filter can drop everything that is not an `app_mention`.
    fn normalize_event(&self, body: &Value) -> Option<(NormalizedEvent, String)> {
        if body.get("type").and_then(Value::as_str) != Some("event_callback") {
            debug!("ignoring non-callback Slack payload");
            return None;
        }

        let event = body.get("event")?;
        let inner_type = json_str(event, &["type"])?;
        let channel = json_str(event, &["channel"])?;
        let ts = json_str(event, &["ts"])?;
        let text = json_str(event, &["text"]).unwrap_or_default();
        let user = json_str(event, &["user"]).unwrap_or_default();
        let thread_ts = json_str(event, &["thread_ts"]).unwrap_or_else(|| ts.clone());

        let delivery_id = json_str(body, &["event_id"]);
        let timestamp = slack_ts_to_datetime(&ts).unwrap_or_else(Utc::now);

        let mut resource = Resource::new(
            0,
            first_line(&text),
            message_permalink(&channel, &ts),
            "open".to_string(),
            channel.clone(),
        );
        resource.description = text;
        resource.author = Some(user.clone());

        let event_record = NormalizedEvent {
            id: NormalizedEvent::compose_id(
                "slack",
                &channel,
                &inner_type,
                &ts,
                delivery_id.as_deref().unwrap_or("-"),
            ),
            provider: "slack".to_string(),
            kind: "message".to_string(),
            action: inner_type,
            resource,
            actor: Actor {
                username: user.clone(),
                id: user,
            },
            metadata: Metadata::delivered(timestamp, delivery_id)
                .with_extra("channel", channel)
                .with_extra("ts", ts)
                .with_extra("thread_ts", thread_ts.clone()),
            raw: body.clone(),
        };
        Some((event_record, thread_ts))
    }

    async fn poll_channel(&self, channel: &str, sink: &EventSink) -> Result<(), ProviderError> {
        let Some(bot_id) = self.bot_user_id() else {
            debug!(channel, "no bot identity known, skipping mention poll");
            return Ok(());
        };
        let mention = format!("<@{bot_id}>");

        let poll_start = Utc::now();
        let since = {
            let cursors = self.cursors.read().expect("cursor lock poisoned");
            poll_since(cursors.get(channel).copied(), poll_start, self.initial_lookback)
        };

        let data = self
            .client
            .get(
                "conversations.history",
                &[
                    ("channel", channel.to_string()),
                    ("oldest", format!("{}.000000", since.timestamp())),
                    ("limit", self.max_items.to_string()),
                ],
            )
            .await
            .map_err(ProviderError::Api)?;

        let messages = data
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for message in messages {
            let text = json_str(&message, &["text"]).unwrap_or_default();
            if !text.contains(&mention) {
                continue;
            }
            let Some(ts) = json_str(&message, &["ts"]) else {
                continue;
            };
            let user = json_str(&message, &["user"]).unwrap_or_default();

            // The bot's own messages mention nobody new.
            if matches_bot_identity(&self.identities(), &user) {
                continue;
            }

            let thread_ts = json_str(&message, &["thread_ts"]).unwrap_or_else(|| ts.clone());
            let timestamp = slack_ts_to_datetime(&ts).unwrap_or(poll_start);

            let mut resource = Resource::new(
                0,
                first_line(&text),
                message_permalink(channel, &ts),
                "open".to_string(),
                channel.to_string(),
            );
            resource.description = text;
            resource.author = Some(user.clone());

            let event = NormalizedEvent {
                id: NormalizedEvent::compose_id("slack", channel, "poll", &ts, &ts),
                provider: "slack".to_string(),
                kind: "message".to_string(),
                action: "poll".to_string(),
                resource,
                actor: Actor {
                    username: user.clone(),
                    id: user,
                },
                metadata: Metadata::polled(timestamp)
                    .with_extra("channel", channel.to_string())
                    .with_extra("ts", ts.clone())
                    .with_extra("thread_ts", thread_ts.clone()),
                raw: message.clone(),
            };

            if let Some(reason) = skip_reason(&event, true) {
                debug!(event_id = %event.id, %reason, "skipping polled Slack message");
                continue;
            }

            let reactor = self.reactor(channel.to_string(), thread_ts);
            sink(event, Box::new(reactor)).await;
        }

        self.cursors
            .write()
            .expect("cursor lock poisoned")
            .insert(channel.to_string(), poll_start);
        Ok(())
    }
}

#[async_trait]
impl Provider for SlackProvider {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn init(&self) -> Result<(), ProviderError> {
        let data = self
            .client
            .post("auth.test", &json!({}))
            .await
            .map_err(|e| ProviderError::Init(format!("Slack token validation failed: {e}")))?;

        let mut identities = self.bot_identities.write().expect("bot identity lock poisoned");
        if identities.is_empty() {
            for field in ["user_id", "user"] {
                if let Some(identity) = json_str(&data, &[field])
                    && !identities.contains(&identity)
                {
                    debug!(identity = %identity, "discovered Slack bot identity");
                    identities.push(identity);
                }
            }
        }
        Ok(())
    }

    fn validate_webhook(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<(), SignatureError> {
        let timestamp = header_str(headers, HEADER_TIMESTAMP)
            .ok_or(SignatureError::MissingHeader(HEADER_TIMESTAMP))?;

        let Some(secret) = &self.signing_secret else {
            warn!("no Slack signing secret configured, accepting delivery unverified");
            return Ok(());
        };

        let signature = header_str(headers, HEADER_SIGNATURE)
            .ok_or(SignatureError::MissingHeader(HEADER_SIGNATURE))?;

        verify_replay_guarded(
            raw_body,
            timestamp,
            signature,
            secret.as_bytes(),
            Utc::now().timestamp(),
        )
    }

    async fn handle_webhook(
        &self,
        _headers: &HeaderMap,
        body: &Value,
        sink: &EventSink,
    ) -> Result<(), ProviderError> {
        let Some((event, thread_ts)) = self.normalize_event(body) else {
            return Ok(());
        };

        if let Some(reason) = skip_reason(&event, true) {
            debug!(event_id = %event.id, %reason, "skipping Slack event");
            return Ok(());
        }

        let reactor = self.reactor(event.resource.repository.clone(), thread_ts);
        sink(event, Box::new(reactor)).await;
        Ok(())
    }

    async fn poll(&self, sink: &EventSink) -> Result<(), ProviderError> {
        for channel in self.channels.clone() {
            self.poll_channel(&channel, sink).await?;
        }
        Ok(())
    }

    fn polling_interval(&self) -> Option<Duration> {
        self.interval
    }
}

/// Per-event reactor over one Slack thread.
struct SlackReactor {
    client: SlackClient,
    channel: String,
    thread_ts: String,
    bot_names: Vec<String>,
}

#[async_trait]
impl Reactor for SlackReactor {
    async fn last_comment(&self) -> Option<ThreadComment> {
        let result = retry_with_backoff(RetryConfig::DEFAULT, || async {
            self.client
                .get(
                    "conversations.replies",
                    &[
                        ("channel", self.channel.clone()),
                        ("ts", self.thread_ts.clone()),
                    ],
                )
                .await
        })
        .await;

        match result {
            Ok(data) => {
                let messages = data.get("messages").and_then(Value::as_array)?;
                // The first entry is the thread parent; a lone parent means
                // nobody has replied yet.
                if messages.len() < 2 {
                    return None;
                }
                let last = messages.last()?;
                Some(ThreadComment {
                    author: json_str(last, &["user"])
                        .or_else(|| json_str(last, &["bot_id"]))
                        .unwrap_or_default(),
                    body: json_str(last, &["text"]).unwrap_or_default(),
                })
            }
            Err(e) => {
                warn!(channel = %self.channel, thread = %self.thread_ts, error = %e,
                    "failed to read thread tail");
                None
            }
        }
    }

    async fn post_comment(&self, body: &str) -> Result<String, ReactorError> {
        let payload = json!({
            "channel": self.channel,
            "text": body,
            "thread_ts": self.thread_ts,
        });

        let data = retry_with_backoff(RetryConfig::DEFAULT, || async {
            self.client.post("chat.postMessage", &payload).await
        })
        .await?;

        Ok(json_str(&data, &["ts"]).unwrap_or_default())
    }

    fn is_bot_author(&self, name: &str) -> bool {
        matches_bot_identity(&self.bot_names, name)
    }
}

/// Converts a Slack `ts` ("1700000000.000100") to a UTC datetime.
fn slack_ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let seconds: i64 = ts.split('.').next()?.parse().ok()?;
    DateTime::from_timestamp(seconds, 0)
}

/// The first line of a message, used as the resource title.
fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}

/// Archive permalink for a message.
fn message_permalink(channel: &str, ts: &str) -> String {
    format!("https://slack.com/archives/{}/p{}", channel, ts.replace('.', ""))
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use crate::secret::SecretSource;
    use crate::signature::compute_signature;

    use super::*;

    fn provider_at(api_base: &str, secret: Option<&str>) -> SlackProvider {
        let config = SlackConfig {
            bot_token: SecretSource::literal("xoxb-test"),
            signing_secret: secret.map(SecretSource::literal),
            channels: vec!["C01".to_string()],
            bot_user_id: Some("UBOT".to_string()),
            polling_interval: None,
        };
        SlackProvider::with_api_base(config, &PollSettings::default(), api_base.to_string())
            .unwrap()
    }

    fn app_mention_payload() -> Value {
        json!({
            "type": "event_callback",
            "event_id": "Ev001",
            "event": {
                "type": "app_mention",
                "channel": "C01",
                "user": "U9",
                "text": "<@UBOT> do X",
                "ts": "1700000000.000100",
                "thread_ts": "1699999999.000100"
            }
        })
    }

    // ─── Envelope ───

    #[test]
    fn validate_accepts_fresh_signed_delivery() {
        let provider = provider_at("https://slack.test", Some("signing"));
        let body = br#"{"type":"event_callback"}"#;
        let ts = Utc::now().timestamp();

        let basestring = format!("v0:{}:{}", ts, std::str::from_utf8(body).unwrap());
        let sig = format!(
            "v0={}",
            hex::encode(compute_signature(basestring.as_bytes(), b"signing"))
        );

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_TIMESTAMP, ts.to_string().parse().unwrap());
        headers.insert(HEADER_SIGNATURE, sig.parse().unwrap());

        assert!(provider.validate_webhook(&headers, body).is_ok());
    }

    #[test]
    fn validate_rejects_stale_delivery() {
        let provider = provider_at("https://slack.test", Some("signing"));
        let body = b"{}";
        let ts = Utc::now().timestamp() - 301;

        let basestring = format!("v0:{}:{}", ts, std::str::from_utf8(body).unwrap());
        let sig = format!(
            "v0={}",
            hex::encode(compute_signature(basestring.as_bytes(), b"signing"))
        );

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_TIMESTAMP, ts.to_string().parse().unwrap());
        headers.insert(HEADER_SIGNATURE, sig.parse().unwrap());

        assert!(matches!(
            provider.validate_webhook(&headers, body),
            Err(SignatureError::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn validate_requires_timestamp_header() {
        let provider = provider_at("https://slack.test", Some("signing"));
        let headers = HeaderMap::new();
        assert_eq!(
            provider.validate_webhook(&headers, b"{}"),
            Err(SignatureError::MissingHeader(HEADER_TIMESTAMP))
        );
    }

    // ─── Normalization ───

    #[test]
    fn normalizes_app_mention_with_thread() {
        let provider = provider_at("https://slack.test", None);
        let (event, thread_ts) = provider.normalize_event(&app_mention_payload()).unwrap();

        assert_eq!(thread_ts, "1699999999.000100");
        assert_eq!(event.provider, "slack");
        assert_eq!(event.kind, "message");
        assert_eq!(event.action, "app_mention");
        assert_eq!(event.resource.number, 0);
        assert_eq!(event.resource.repository, "C01");
        assert_eq!(event.actor.username, "U9");
        assert_eq!(
            event.metadata.extra.get("thread_ts").and_then(Value::as_str),
            Some("1699999999.000100")
        );
        assert_eq!(event.validate(), Ok(()));
        assert!(skip_reason(&event, true).is_none());
    }

    #[test]
    fn unthreaded_mention_anchors_its_own_thread() {
        let provider = provider_at("https://slack.test", None);
        let mut payload = app_mention_payload();
        payload["event"].as_object_mut().unwrap().remove("thread_ts");

        let (_, thread_ts) = provider.normalize_event(&payload).unwrap();
        assert_eq!(thread_ts, "1700000000.000100");
    }

    #[test]
    fn non_mention_inner_events_are_filtered() {
        let provider = provider_at("https://slack.test", None);
        let mut payload = app_mention_payload();
        payload["event"]["type"] = json!("message");

        let (event, _) = provider.normalize_event(&payload).unwrap();
        assert!(skip_reason(&event, true).is_some());
    }

    #[test]
    fn non_callback_payload_is_ignored() {
        let provider = provider_at("https://slack.test", None);
        let payload = json!({"type": "url_verification", "challenge": "abc123"});
        assert!(provider.normalize_event(&payload).is_none());
    }

    // ─── Client (mocked Web API) ───

    #[tokio::test]
    async fn reactor_posts_into_thread() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/chat.postMessage")
                    .json_body(json!({
                        "channel": "C01",
                        "text": "Agent is working on C01 (thread 1699999999.000100)",
                        "thread_ts": "1699999999.000100"
                    }));
                then.status(200)
                    .json_body(json!({"ok": true, "ts": "1700000001.000001"}));
            })
            .await;

        let provider = provider_at(&server.base_url(), None);
        let reactor = provider.reactor("C01".to_string(), "1699999999.000100".to_string());

        let handle = reactor
            .post_comment("Agent is working on C01 (thread 1699999999.000100)")
            .await
            .unwrap();
        assert_eq!(handle, "1700000001.000001");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reactor_reads_thread_tail() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/conversations.replies");
                then.status(200).json_body(json!({
                    "ok": true,
                    "messages": [
                        {"user": "U9", "text": "<@UBOT> do X", "ts": "1699999999.000100"},
                        {"user": "UBOT", "text": "Agent is working on it", "ts": "1700000001.000001"}
                    ]
                }));
            })
            .await;

        let provider = provider_at(&server.base_url(), None);
        let reactor = provider.reactor("C01".to_string(), "1699999999.000100".to_string());

        let comment = reactor.last_comment().await.unwrap();
        assert_eq!(comment.author, "UBOT");
        assert!(reactor.is_bot_author(&comment.author));
    }

    #[tokio::test]
    async fn lone_parent_means_no_replies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/conversations.replies");
                then.status(200).json_body(json!({
                    "ok": true,
                    "messages": [{"user": "U9", "text": "hello", "ts": "1699999999.000100"}]
                }));
            })
            .await;

        let provider = provider_at(&server.base_url(), None);
        let reactor = provider.reactor("C01".to_string(), "1699999999.000100".to_string());
        assert!(reactor.last_comment().await.is_none());
    }

    #[tokio::test]
    async fn poll_surfaces_unanswered_mentions_only() {
        use std::sync::{Arc, Mutex};

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/conversations.history");
                then.status(200).json_body(json!({
                    "ok": true,
                    "messages": [
                        {"user": "U9", "text": "<@UBOT> please deploy",
                         "ts": "1700000000.000100"},
                        {"user": "UBOT", "text": "echoing <@UBOT> myself",
                         "ts": "1700000000.000200"},
                        {"user": "U9", "text": "unrelated chatter",
                         "ts": "1700000000.000300"}
                    ]
                }));
            })
            .await;

        let provider = provider_at(&server.base_url(), None);

        let events: Arc<Mutex<Vec<NormalizedEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let sink: EventSink = Arc::new(move |event, _reactor| {
            let events = events_clone.clone();
            Box::pin(async move {
                events.lock().unwrap().push(event);
            })
        });

        provider.poll(&sink).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1, "only the human mention is surfaced");
        assert_eq!(events[0].action, "poll");
        assert_eq!(events[0].resource.repository, "C01");
        assert_eq!(events[0].actor.username, "U9");
        assert!(events[0].metadata.polled);
    }

    #[tokio::test]
    async fn api_not_ok_is_permanent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/auth.test");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "invalid_auth"}));
            })
            .await;

        let provider = provider_at(&server.base_url(), None);
        let err = provider.init().await.unwrap_err();
        assert!(matches!(err, ProviderError::Init(_)));
    }

    #[test]
    fn permalink_shape() {
        assert_eq!(
            message_permalink("C01", "1700000000.000100"),
            "https://slack.com/archives/C01/p1700000000000100"
        );
    }
}
