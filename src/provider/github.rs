//! GitHub provider.
//!
//! Webhooks are signed with the HMAC prefix-tag envelope
//! (`X-Hub-Signature-256: sha256=<hex>`) and must carry the event-name and
//! delivery-id headers. Polling lists issues updated since the per-repo
//! cursor; the issues listing carries pull requests too (marked by the
//! `pull_request` field), so one listing covers both resource kinds.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{GithubConfig, PollSettings, RepoId};
use crate::event::filter::skip_reason;
use crate::event::{Actor, EventComment, Metadata, NormalizedEvent, Resource};
use crate::reactor::{Reactor, ReactorError, ThreadComment, matches_bot_identity};
use crate::retry::{ApiError, RetryConfig, retry_with_backoff};
use crate::signature::{SignatureError, verify_hmac_prefix};

use super::{EventSink, Provider, ProviderError, effective_interval, header_str, json_str, poll_since};

/// Header name for the GitHub event type.
const HEADER_EVENT: &str = "x-github-event";
/// Header name for the GitHub delivery id.
const HEADER_DELIVERY: &str = "x-github-delivery";
/// Header name for the GitHub signature.
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Comment-probe depth for the recent-human-activity heuristic.
const ACTIVITY_PROBE_LIMIT: u8 = 5;

/// GitHub platform adapter.
pub struct GithubProvider {
    client: Octocrab,
    webhook_secret: Option<String>,
    repositories: Vec<RepoId>,
    bot_identities: RwLock<Vec<String>>,
    cursors: RwLock<HashMap<String, DateTime<Utc>>>,
    interval: Option<Duration>,
    initial_lookback: Duration,
    max_items: usize,
}

impl GithubProvider {
    /// Builds the provider, resolving secrets and constructing the API
    /// client. Token validity is checked later, in [`Provider::init`].
    pub fn new(config: GithubConfig, poll: &PollSettings) -> Result<Self, ProviderError> {
        let token = config.token.resolve()?;
        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| ProviderError::Init(format!("failed to build GitHub client: {e}")))?;

        let webhook_secret = config
            .webhook_secret
            .as_ref()
            .map(|s| s.resolve())
            .transpose()?;

        let interval = effective_interval(
            config.polling_interval,
            poll.interval,
            !config.repositories.is_empty(),
        );

        Ok(GithubProvider {
            client,
            webhook_secret,
            repositories: config.repositories,
            bot_identities: RwLock::new(config.bot_username.into_iter().collect()),
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

    /// Maps a native webhook payload to the normalized form.
    ///
    /// Returns `None` for event kinds the watcher does not react to.
    fn normalize_webhook(
        &self,
        event_type: &str,
        body: &Value,
        delivery_id: Option<&str>,
    ) -> Option<NormalizedEvent> {
        let repository = body
            .get("repository")
            .and_then(|r| r.get("full_name"))
            .and_then(Value::as_str)?
            .to_string();
        let action = body.get("action").and_then(Value::as_str)?.to_string();
        let actor = actor_from(body.get("sender"));
        let timestamp = Utc::now();

        match event_type {
            "issues" => {
                let issue = body.get("issue")?;
                let resource = issue_resource(issue, &repository)?;
                let native_id = resource.number.to_string();
                Some(self.assemble(
                    "issue", action, resource, actor, &native_id, delivery_id, timestamp, body,
                ))
            }
            "pull_request" => {
                let pr = body.get("pull_request")?;
                let mut resource = issue_resource(pr, &repository)?;
                resource.branch = json_str(pr, &["head", "ref"]);
                resource.merge_to = json_str(pr, &["base", "ref"]);
                let native_id = resource.number.to_string();
                Some(self.assemble(
                    "pull_request",
                    action,
                    resource,
                    actor,
                    &native_id,
                    delivery_id,
                    timestamp,
                    body,
                ))
            }
            "issue_comment" => {
                let issue = body.get("issue")?;
                let kind = if issue.get("pull_request").is_some_and(|v| !v.is_null()) {
                    "pull_request"
                } else {
                    "issue"
                };
                let mut resource = issue_resource(issue, &repository)?;

                let comment = body.get("comment")?;
                let comment_id = comment.get("id").and_then(Value::as_u64)?;
                resource.comment = Some(EventComment {
                    body: json_str(comment, &["body"]).unwrap_or_default(),
                    author: json_str(comment, &["user", "login"]).unwrap_or_default(),
                    url: json_str(comment, &["html_url"]),
                });

                let native_id = comment_id.to_string();
                Some(self.assemble(
                    kind, action, resource, actor, &native_id, delivery_id, timestamp, body,
                ))
            }
            other => {
                debug!(event_type = %other, "ignoring unsupported GitHub event kind");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        kind: &str,
        action: String,
        resource: Resource,
        actor: Actor,
        native_id: &str,
        delivery_id: Option<&str>,
        timestamp: DateTime<Utc>,
        raw: &Value,
    ) -> NormalizedEvent {
        let delivery_or_ts = delivery_id
            .map(str::to_string)
            .unwrap_or_else(|| timestamp.timestamp().to_string());
        NormalizedEvent {
            id: NormalizedEvent::compose_id(
                "github",
                &resource.repository,
                &action,
                native_id,
                &delivery_or_ts,
            ),
            provider: "github".to_string(),
            kind: kind.to_string(),
            action,
            resource,
            actor,
            metadata: Metadata::delivered(timestamp, delivery_id.map(str::to_string)),
            raw: raw.clone(),
        }
    }

    fn reactor(&self, repo: RepoId, number: u64) -> GithubReactor {
        GithubReactor {
            client: self.client.clone(),
            repo,
            number,
            bot_names: self.identities(),
        }
    }

    /// Whether anyone commented recently on the given issue/PR.
    ///
    /// Probe errors fail open (assume activity): the comment-based
    /// duplicate check downstream independently prevents bot loops.
    async fn has_recent_activity(&self, repo: &RepoId, number: u64) -> bool {
        let result = self
            .client
            .issues(&repo.owner, &repo.repo)
            .list_comments(number)
            .per_page(ACTIVITY_PROBE_LIMIT)
            .send()
            .await;

        match result {
            Ok(page) => !page.items.is_empty(),
            Err(e) => {
                warn!(repo = %repo, number, error = %e, "comment probe failed, assuming activity");
                true
            }
        }
    }

    async fn poll_repository(&self, repo: &RepoId, sink: &EventSink) -> Result<(), ProviderError> {
        let container = repo.full_name();
        let poll_start = Utc::now();
        let since = {
            let cursors = self.cursors.read().expect("cursor lock poisoned");
            poll_since(cursors.get(&container).copied(), poll_start, self.initial_lookback)
        };

        let page = self
            .client
            .issues(&repo.owner, &repo.repo)
            .list()
            .state(octocrab::params::State::All)
            .since(since)
            .per_page(100)
            .send()
            .await
            .map_err(map_octocrab_error)?;

        let total = page.items.len();
        if total > self.max_items {
            debug!(
                repo = %repo,
                total,
                cap = self.max_items,
                "poll result truncated to item cap"
            );
        }

        for issue in page.items.into_iter().take(self.max_items) {
            let is_pr = issue.pull_request.is_some();
            let kind = if is_pr { "pull_request" } else { "issue" };
            let number = issue.number;

            let resource = Resource {
                number,
                title: issue.title.clone(),
                description: issue.body.clone().unwrap_or_default(),
                url: issue.html_url.to_string(),
                state: issue_state_name(&issue.state).to_string(),
                repository: container.clone(),
                author: Some(issue.user.login.clone()),
                assignees: issue.assignees.iter().map(|a| a.login.clone()).collect(),
                labels: issue.labels.iter().map(|l| l.name.clone()).collect(),
                branch: None,
                merge_to: None,
                comment: None,
            };

            let raw = serde_json::to_value(&issue).unwrap_or(Value::Null);
            let event = NormalizedEvent {
                id: NormalizedEvent::compose_id(
                    "github",
                    &container,
                    "poll",
                    &number.to_string(),
                    &issue.updated_at.timestamp().to_string(),
                ),
                provider: "github".to_string(),
                kind: kind.to_string(),
                action: "poll".to_string(),
                resource,
                actor: Actor {
                    username: issue.user.login.clone(),
                    id: issue.user.id.into_inner().to_string(),
                },
                metadata: Metadata::polled(issue.updated_at),
                raw,
            };

            let has_activity = if is_pr {
                self.has_recent_activity(repo, number).await
            } else {
                true
            };

            if let Some(reason) = skip_reason(&event, has_activity) {
                debug!(event_id = %event.id, %reason, "skipping polled GitHub item");
                continue;
            }

            let reactor = self.reactor(repo.clone(), number);
            sink(event, Box::new(reactor)).await;
        }

        self.cursors
            .write()
            .expect("cursor lock poisoned")
            .insert(container, poll_start);
        Ok(())
    }

    #[cfg(test)]
    fn cursor_for(&self, container: &str) -> Option<DateTime<Utc>> {
        self.cursors
            .read()
            .expect("cursor lock poisoned")
            .get(container)
            .copied()
    }
}

#[async_trait]
impl Provider for GithubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn init(&self) -> Result<(), ProviderError> {
        // Token validation doubles as bot-identity discovery.
        let user = self
            .client
            .current()
            .user()
            .await
            .map_err(|e| ProviderError::Init(format!("GitHub token validation failed: {e}")))?;

        let mut identities = self.bot_identities.write().expect("bot identity lock poisoned");
        if identities.is_empty() {
            debug!(login = %user.login, "discovered GitHub bot identity");
            identities.push(user.login);
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
        if header_str(headers, HEADER_DELIVERY).is_none() {
            return Err(SignatureError::MissingHeader(HEADER_DELIVERY));
        }

        let Some(secret) = &self.webhook_secret else {
            warn!("no GitHub webhook secret configured, accepting delivery unverified");
            return Ok(());
        };

        let signature = header_str(headers, HEADER_SIGNATURE)
            .ok_or(SignatureError::MissingHeader(HEADER_SIGNATURE))?;

        if verify_hmac_prefix(raw_body, signature, secret.as_bytes()) {
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
        let event_type = header_str(headers, HEADER_EVENT).unwrap_or_default().to_string();
        let delivery_id = header_str(headers, HEADER_DELIVERY).map(str::to_string);

        let Some(event) = self.normalize_webhook(&event_type, body, delivery_id.as_deref()) else {
            return Ok(());
        };

        if let Some(reason) = skip_reason(&event, true) {
            debug!(event_id = %event.id, %reason, "skipping GitHub webhook event");
            return Ok(());
        }

        let repo = RepoId::parse(&event.resource.repository).ok_or_else(|| {
            ProviderError::MalformedPayload(format!(
                "repository is not owner/repo: {}",
                event.resource.repository
            ))
        })?;
        let reactor = self.reactor(repo, event.resource.number);

        sink(event, Box::new(reactor)).await;
        Ok(())
    }

    async fn poll(&self, sink: &EventSink) -> Result<(), ProviderError> {
        for repo in self.repositories.clone() {
            self.poll_repository(&repo, sink).await?;
        }
        Ok(())
    }

    fn polling_interval(&self) -> Option<Duration> {
        self.interval
    }
}

/// Per-event reactor over the GitHub issues API.
struct GithubReactor {
    client: Octocrab,
    repo: RepoId,
    number: u64,
    bot_names: Vec<String>,
}

#[async_trait]
impl Reactor for GithubReactor {
    async fn last_comment(&self) -> Option<ThreadComment> {
        let result = retry_with_backoff(RetryConfig::DEFAULT, || async {
            let mut page: u32 = 1;
            let mut last = None;

            // Comments are listed oldest-first; walk to the final page.
            loop {
                let batch = self
                    .client
                    .issues(&self.repo.owner, &self.repo.repo)
                    .list_comments(self.number)
                    .per_page(100)
                    .page(page)
                    .send()
                    .await
                    .map_err(map_octocrab_error)?;

                let is_last_page = batch.items.len() < 100;
                if let Some(comment) = batch.items.into_iter().last() {
                    last = Some(comment);
                }
                if is_last_page {
                    return Ok(last);
                }
                page += 1;
            }
        })
        .await;

        match result {
            Ok(comment) => comment.map(|c| ThreadComment {
                author: c.user.login,
                body: c.body.unwrap_or_default(),
            }),
            Err(e) => {
                warn!(repo = %self.repo, number = self.number, error = %e, "failed to read last comment");
                None
            }
        }
    }

    async fn post_comment(&self, body: &str) -> Result<String, ReactorError> {
        let comment = retry_with_backoff(RetryConfig::DEFAULT, || async {
            self.client
                .issues(&self.repo.owner, &self.repo.repo)
                .create_comment(self.number, body)
                .await
                .map_err(map_octocrab_error)
        })
        .await?;

        Ok(comment.id.into_inner().to_string())
    }

    fn is_bot_author(&self, name: &str) -> bool {
        matches_bot_identity(&self.bot_names, name)
    }
}

/// Categorizes an octocrab error for the retry discipline.
fn map_octocrab_error(err: octocrab::Error) -> ApiError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            ApiError::from_status(source.status_code.as_u16(), source.message.clone())
        }
        // Transport-level failures (hyper, serde on truncated bodies, ...)
        // are worth a retry.
        _ => ApiError::transient(err.to_string()),
    }
}

fn issue_state_name(state: &octocrab::models::IssueState) -> &'static str {
    match state {
        octocrab::models::IssueState::Closed => "closed",
        _ => "open",
    }
}

/// Builds the shared resource record for issue-shaped payload objects
/// (`issue` and `pull_request` webhook bodies have the same core fields).
fn issue_resource(obj: &Value, repository: &str) -> Option<Resource> {
    let number = obj.get("number").and_then(Value::as_u64)?;
    let mut resource = Resource::new(
        number,
        json_str(obj, &["title"]).unwrap_or_default(),
        json_str(obj, &["html_url"]).unwrap_or_default(),
        json_str(obj, &["state"]).unwrap_or_else(|| "open".to_string()),
        repository,
    );
    resource.description = json_str(obj, &["body"]).unwrap_or_default();
    resource.author = json_str(obj, &["user", "login"]);
    if let Some(assignees) = obj.get("assignees").and_then(Value::as_array) {
        resource.assignees = assignees
            .iter()
            .filter_map(|a| a.get("login").and_then(Value::as_str).map(str::to_string))
            .collect();
    }
    if let Some(labels) = obj.get("labels").and_then(Value::as_array) {
        resource.labels = labels
            .iter()
            .filter_map(|l| l.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();
    }
    Some(resource)
}

fn actor_from(sender: Option<&Value>) -> Actor {
    Actor {
        username: sender
            .and_then(|s| s.get("login"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        id: sender
            .and_then(|s| s.get("id"))
            .and_then(Value::as_u64)
            .map(|id| id.to_string())
            .unwrap_or_default(),
    }
}
