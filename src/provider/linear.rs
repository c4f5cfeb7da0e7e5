//! Linear provider.
//!
//! Webhooks are signed with a bare-hex HMAC-SHA256 of the raw body in the
//! `Linear-Signature` header. The API is GraphQL: polling filters issues by
//! team key and `updatedAt`, and the reactor reads/writes issue comments.
//!
//! The container key is the team key (the `ENG` of `ENG-123`); the reactor
//! addresses issues by their GraphQL id, which every webhook and poll
//! payload carries.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{LinearConfig, PollSettings};
use crate::event::filter::skip_reason;
use crate::event::{Actor, EventComment, Metadata, NormalizedEvent, Resource};
use crate::reactor::{Reactor, ReactorError, ThreadComment, matches_bot_identity};
use crate::retry::{ApiError, RetryConfig, retry_with_backoff};
use crate::signature::{SignatureError, verify_bare_hex};

use super::{
    EventSink, Provider, ProviderError, effective_interval, header_str, json_str, json_u64,
    poll_since,
};

/// Header name for the Linear event type.
const HEADER_EVENT: &str = "linear-event";
/// Header name for the Linear delivery id.
const HEADER_DELIVERY: &str = "linear-delivery";
/// Header name for the Linear signature.
const HEADER_SIGNATURE: &str = "linear-signature";

/// Production GraphQL endpoint.
const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

const ISSUES_QUERY: &str = r#"
query($teamKey: String!, $since: DateTime!, $limit: Int!) {
    issues(
        filter: { team: { key: { eq: $teamKey } }, updatedAt: { gt: $since } }
        first: $limit
    ) {
        nodes {
            id
            identifier
            number
            title
            description
            url
            updatedAt
            state { name }
            team { key }
            creator { name displayName }
            assignee { name }
        }
    }
}
"#;

const LAST_COMMENT_QUERY: &str = r#"
query($issueId: String!) {
    issue(id: $issueId) {
        comments(last: 1) {
            nodes {
                body
                user { name displayName }
            }
        }
    }
}
"#;

const COMMENT_CREATE_MUTATION: &str = r#"
mutation($issueId: String!, $body: String!) {
    commentCreate(input: { issueId: $issueId, body: $body }) {
        success
        comment { id }
    }
}
"#;

const VIEWER_QUERY: &str = "{ viewer { id name displayName } }";

/// Thin GraphQL client for the Linear API.
#[derive(Clone)]
struct LinearClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl LinearClient {
    fn new(endpoint: String, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        LinearClient {
            http,
            endpoint,
            api_key,
        }
    }

    /// Executes a query and returns the `data` field.
    ///
    /// GraphQL-level errors are permanent: the query shape is wrong, not
    /// the transport.
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, ApiError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        let body: Value = response.json().await.map_err(ApiError::from)?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            return Err(ApiError::permanent(format!("GraphQL errors: {errors:?}")));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// Linear platform adapter.
pub struct LinearProvider {
    client: LinearClient,
    webhook_secret: Option<String>,
    teams: Vec<String>,
    bot_identities: RwLock<Vec<String>>,
    cursors: RwLock<HashMap<String, DateTime<Utc>>>,
    interval: Option<Duration>,
    initial_lookback: Duration,
    max_items: usize,
}

impl LinearProvider {
    /// Builds the provider, resolving secrets. Credentials are checked in
    /// [`Provider::init`].
    pub fn new(config: LinearConfig, poll: &PollSettings) -> Result<Self, ProviderError> {
        Self::with_endpoint(config, poll, LINEAR_API_URL.to_string())
    }

    fn with_endpoint(
        config: LinearConfig,
        poll: &PollSettings,
        endpoint: String,
    ) -> Result<Self, ProviderError> {
        let api_key = config.api_key.resolve()?;
        let webhook_secret = config
            .webhook_secret
            .as_ref()
            .map(|s| s.resolve())
            .transpose()?;

        let interval = effective_interval(
            config.polling_interval,
            poll.interval,
            !config.teams.is_empty(),
        );

        Ok(LinearProvider {
            client: LinearClient::new(endpoint, api_key),
            webhook_secret,
            teams: config.teams,
            bot_identities: RwLock::new(config.bot_name.into_iter().collect()),
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

    fn reactor(&self, issue_id: String) -> LinearReactor {
        LinearReactor {
            client: self.client.clone(),
            issue_id,
            bot_names: self.identities(),
        }
    }

    /// Maps a webhook payload to the normalized form.
    ///
    /// Returns the event plus the GraphQL issue id for the reactor.
    fn normalize_webhook(
        &self,
        body: &Value,
        delivery_id: Option<&str>,
    ) -> Option<(NormalizedEvent, String)> {
        let payload_type = body.get("type").and_then(Value::as_str)?;
        let action = body.get("action").and_then(Value::as_str)?.to_string();
        let data = body.get("data")?;
        let timestamp = Utc::now();

        let actor = Actor {
            username: json_str(body, &["actor", "name"])
                .or_else(|| json_str(data, &["user", "name"]))
                .unwrap_or_default(),
            id: json_str(body, &["actor", "id"]).unwrap_or_default(),
        };

        let (issue_obj, issue_id, comment, native_id) = match payload_type {
            "Issue" => {
                let id = json_str(data, &["id"])?;
                (data, id.clone(), None, id)
            }
            "Comment" => {
                let issue = data.get("issue")?;
                let issue_id = json_str(data, &["issueId"])
                    .or_else(|| json_str(issue, &["id"]))?;
                let comment = EventComment {
                    body: json_str(data, &["body"]).unwrap_or_default(),
                    author: json_str(data, &["user", "name"]).unwrap_or_default(),
                    url: json_str(data, &["url"]),
                };
                let native_id = json_str(data, &["id"]).unwrap_or_else(|| issue_id.clone());
                (issue, issue_id, Some(comment), native_id)
            }
            other => {
                debug!(payload_type = %other, "ignoring unsupported Linear payload type");
                return None;
            }
        };

        let team_key = json_str(issue_obj, &["team", "key"])
            .or_else(|| {
                json_str(issue_obj, &["identifier"])
                    .and_then(|ident| ident.split('-').next().map(str::to_string))
            })
            .unwrap_or_else(|| "linear".to_string());

        let mut resource = Resource::new(
            json_u64(issue_obj, &["number"]).unwrap_or(0),
            json_str(issue_obj, &["title"]).unwrap_or_default(),
            json_str(issue_obj, &["url"]).unwrap_or_default(),
            json_str(issue_obj, &["state", "name"]).unwrap_or_else(|| "Triage".to_string()),
            team_key.clone(),
        );
        resource.description = json_str(issue_obj, &["description"]).unwrap_or_default();
        resource.author = json_str(issue_obj, &["creator", "name"]);
        if let Some(assignee) = json_str(issue_obj, &["assignee", "name"]) {
            resource.assignees = vec![assignee];
        }
        resource.comment = comment;

        let delivery_or_ts = delivery_id
            .map(str::to_string)
            .unwrap_or_else(|| timestamp.timestamp().to_string());
        let event = NormalizedEvent {
            id: NormalizedEvent::compose_id(
                "linear",
                &team_key,
                &action,
                &native_id,
                &delivery_or_ts,
            ),
            provider: "linear".to_string(),
            kind: "issue".to_string(),
            action,
            resource,
            actor,
            metadata: Metadata::delivered(timestamp, delivery_id.map(str::to_string)),
            raw: body.clone(),
        };
        Some((event, issue_id))
    }

    async fn poll_team(&self, team: &str, sink: &EventSink) -> Result<(), ProviderError> {
        let poll_start = Utc::now();
        let since = {
            let cursors = self.cursors.read().expect("cursor lock poisoned");
            poll_since(cursors.get(team).copied(), poll_start, self.initial_lookback)
        };

        let data = self
            .client
            .execute(
                ISSUES_QUERY,
                json!({
                    "teamKey": team,
                    "since": since.to_rfc3339(),
                    "limit": self.max_items as u64,
                }),
            )
            .await
            .map_err(ProviderError::Api)?;

        let nodes = data
            .pointer("/issues/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for node in nodes {
            let Some(issue_id) = json_str(&node, &["id"]) else {
                continue;
            };

            let updated_at = json_str(&node, &["updatedAt"])
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(poll_start);

            let mut resource = Resource::new(
                json_u64(&node, &["number"]).unwrap_or(0),
                json_str(&node, &["title"]).unwrap_or_default(),
                json_str(&node, &["url"]).unwrap_or_default(),
                json_str(&node, &["state", "name"]).unwrap_or_else(|| "Triage".to_string()),
                team.to_string(),
            );
            resource.description = json_str(&node, &["description"]).unwrap_or_default();
            resource.author = json_str(&node, &["creator", "name"]);
            if let Some(assignee) = json_str(&node, &["assignee", "name"]) {
                resource.assignees = vec![assignee];
            }

            let event = NormalizedEvent {
                id: NormalizedEvent::compose_id(
                    "linear",
                    team,
                    "poll",
                    &issue_id,
                    &updated_at.timestamp().to_string(),
                ),
                provider: "linear".to_string(),
                kind: "issue".to_string(),
                action: "poll".to_string(),
                resource,
                actor: Actor {
                    username: json_str(&node, &["creator", "name"]).unwrap_or_default(),
                    id: String::new(),
                },
                metadata: Metadata::polled(updated_at),
                raw: node.clone(),
            };

            if let Some(reason) = skip_reason(&event, true) {
                debug!(event_id = %event.id, %reason, "skipping polled Linear issue");
                continue;
            }

            let reactor = self.reactor(issue_id);
            sink(event, Box::new(reactor)).await;
        }

        self.cursors
            .write()
            .expect("cursor lock poisoned")
            .insert(team.to_string(), poll_start);
        Ok(())
    }
}

#[async_trait]
impl Provider for LinearProvider {
    fn name(&self) -> &'static str {
        "linear"
    }

    async fn init(&self) -> Result<(), ProviderError> {
        let data = self
            .client
            .execute(VIEWER_QUERY, json!({}))
            .await
            .map_err(|e| ProviderError::Init(format!("Linear API key validation failed: {e}")))?;

        let mut identities = self.bot_identities.write().expect("bot identity lock poisoned");
        if identities.is_empty() {
            for field in ["name", "displayName"] {
                if let Some(name) = json_str(&data, &["viewer", field])
                    && !identities.contains(&name)
                {
                    debug!(identity = %name, "discovered Linear bot identity");
                    identities.push(name);
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
        if header_str(headers, HEADER_EVENT).is_none() {
            return Err(SignatureError::MissingHeader(HEADER_EVENT));
        }

        let Some(secret) = &self.webhook_secret else {
            warn!("no Linear webhook secret configured, accepting delivery unverified");
            return Ok(());
        };

        let signature = header_str(headers, HEADER_SIGNATURE)
            .ok_or(SignatureError::MissingHeader(HEADER_SIGNATURE))?;

        if verify_bare_hex(raw_body, signature, secret.as_bytes()) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        body: &Value,
        sink: &EventSink,
    ) -> Result<(), ProviderError> {
        let delivery_id = header_str(headers, HEADER_DELIVERY);

        let Some((event, issue_id)) = self.normalize_webhook(body, delivery_id) else {
            return Ok(());
        };

        if let Some(reason) = skip_reason(&event, true) {
            debug!(event_id = %event.id, %reason, "skipping Linear webhook event");
            return Ok(());
        }

        let reactor = self.reactor(issue_id);
        sink(event, Box::new(reactor)).await;
        Ok(())
    }

    async fn poll(&self, sink: &EventSink) -> Result<(), ProviderError> {
        for team in self.teams.clone() {
            self.poll_team(&team, sink).await?;
        }
        Ok(())
    }

    fn polling_interval(&self) -> Option<Duration> {
        self.interval
    }
}

/// Per-event reactor over Linear issue comments.
struct LinearReactor {
    client: LinearClient,
    issue_id: String,
    bot_names: Vec<String>,
}

#[async_trait]
impl Reactor for LinearReactor {
    async fn last_comment(&self) -> Option<ThreadComment> {
        let result = retry_with_backoff(RetryConfig::DEFAULT, || async {
            self.client
                .execute(LAST_COMMENT_QUERY, json!({ "issueId": self.issue_id }))
                .await
        })
        .await;

        match result {
            Ok(data) => {
                let node = data.pointer("/issue/comments/nodes/0")?;
                Some(ThreadComment {
                    author: json_str(node, &["user", "displayName"])
                        .or_else(|| json_str(node, &["user", "name"]))
                        .unwrap_or_default(),
                    body: json_str(node, &["body"]).unwrap_or_default(),
                })
            }
            Err(e) => {
                warn!(issue_id = %self.issue_id, error = %e, "failed to read last comment");
                None
            }
        }
    }

    async fn post_comment(&self, body: &str) -> Result<String, ReactorError> {
        let data = retry_with_backoff(RetryConfig::DEFAULT, || async {
            self.client
                .execute(
                    COMMENT_CREATE_MUTATION,
                    json!({ "issueId": self.issue_id, "body": body }),
                )
                .await
        })
        .await?;

        if data
            .pointer("/commentCreate/success")
            .and_then(Value::as_bool)
            != Some(true)
        {
            return Err(ReactorError::PostFailed(ApiError::permanent(
                "commentCreate reported failure",
            )));
        }

        Ok(data
            .pointer("/commentCreate/comment/id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn is_bot_author(&self, name: &str) -> bool {
        matches_bot_identity(&self.bot_names, name)
    }
}
