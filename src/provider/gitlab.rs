//! GitLab provider.
//!
//! Webhooks use the token-compare envelope: `X-Gitlab-Token` carries the
//! shared secret verbatim. Issue, merge-request, and note hooks are
//! normalized; polling lists issues and merge requests per project with
//! `updated_after`, and the reactor speaks the notes API. System notes
//! ("changed the description ...") are not conversation and are skipped.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{GitlabConfig, PollSettings};
use crate::event::filter::skip_reason;
use crate::event::{Actor, EventComment, Metadata, NormalizedEvent, Resource};
use crate::reactor::{Reactor, ReactorError, ThreadComment, matches_bot_identity};
use crate::retry::{ApiError, RetryConfig, retry_with_backoff};
use crate::signature::{SignatureError, verify_token};

use super::{
    EventSink, Provider, ProviderError, effective_interval, header_str, json_str, json_u64,
    poll_since,
};

/// Header name for the GitLab event kind.
const HEADER_EVENT: &str = "x-gitlab-event";
/// Header name for the shared webhook token.
const HEADER_TOKEN: &str = "x-gitlab-token";

/// Note-probe depth for the recent-human-activity heuristic.
const ACTIVITY_PROBE_LIMIT: usize = 5;

/// Which notes endpoint a resource lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotableKind {
    Issue,
    MergeRequest,
}

impl NotableKind {
    fn path_segment(self) -> &'static str {
        match self {
            NotableKind::Issue => "issues",
            NotableKind::MergeRequest => "merge_requests",
        }
    }

    fn event_kind(self) -> &'static str {
        match self {
            NotableKind::Issue => "issue",
            NotableKind::MergeRequest => "merge_request",
        }
    }
}

/// Thin REST v4 client scoped to one GitLab instance.
#[derive(Clone)]
struct GitlabClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GitlabClient {
    fn new(base_url: String, token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        GitlabClient {
            http,
            base_url,
            token,
        }
    }

    fn project_url(&self, project: &str, tail: &str) -> String {
        // Project paths address the API with `/` encoded.
        let encoded = project.replace('/', "%2F");
        format!("{}/api/v4/projects/{}{}", self.base_url, encoded, tail)
    }

    async fn get_json(&self, url: &str) -> Result<Value, ApiError> {
        let response = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        response.json().await.map_err(ApiError::from)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, ApiError> {
        let response = self
            .http
            .post(url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        response.json().await.map_err(ApiError::from)
    }

    /// Lists the newest non-system notes on a resource, newest first.
    async fn recent_notes(
        &self,
        project: &str,
        kind: NotableKind,
        iid: u64,
        limit: usize,
    ) -> Result<Vec<Value>, ApiError> {
        let url = self.project_url(
            project,
            &format!(
                "/{}/{}/notes?sort=desc&order_by=created_at&per_page={}",
                kind.path_segment(),
                iid,
                limit.max(ACTIVITY_PROBE_LIMIT)
            ),
        );
        let notes = self.get_json(&url).await?;
        let notes = notes.as_array().cloned().unwrap_or_default();
        Ok(notes
            .into_iter()
            .filter(|n| !n.get("system").and_then(Value::as_bool).unwrap_or(false))
            .take(limit)
            .collect())
    }
}

/// GitLab platform adapter.
pub struct GitlabProvider {
    client: GitlabClient,
    webhook_token: Option<String>,
    projects: Vec<String>,
    bot_identities: RwLock<Vec<String>>,
    cursors: RwLock<HashMap<String, DateTime<Utc>>>,
    interval: Option<Duration>,
    initial_lookback: Duration,
    max_items: usize,
}

impl GitlabProvider {
    /// Builds the provider, resolving secrets. Token validity is checked in
    /// [`Provider::init`].
    pub fn new(config: GitlabConfig, poll: &PollSettings) -> Result<Self, ProviderError> {
        let token = config.token.resolve()?;
        let webhook_token = config
            .webhook_token
            .as_ref()
            .map(|s| s.resolve())
            .transpose()?;

        let interval = effective_interval(
            config.polling_interval,
            poll.interval,
            !config.projects.is_empty(),
        );

        Ok(GitlabProvider {
            client: GitlabClient::new(config.base_url.trim_end_matches('/').to_string(), token),
            webhook_token,
            projects: config.projects,
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

    fn reactor(&self, project: String, kind: NotableKind, iid: u64) -> GitlabReactor {
        GitlabReactor {
            client: self.client.clone(),
            project,
            kind,
            iid,
            bot_names: self.identities(),
        }
    }

    /// Maps a native hook payload to the normalized form.
    fn normalize_webhook(&self, body: &Value) -> Option<(NormalizedEvent, NotableKind)> {
        let object_kind = body.get("object_kind").and_then(Value::as_str)?;
        let project = json_str(body, &["project", "path_with_namespace"])?;
        let actor = Actor {
            username: json_str(body, &["user", "username"]).unwrap_or_default(),
            id: json_u64(body, &["user", "id"])
                .map(|id| id.to_string())
                .unwrap_or_default(),
        };
        let timestamp = Utc::now();

        let (attrs, kind, action, comment) = match object_kind {
            "issue" => {
                let attrs = body.get("object_attributes")?;
                let action = json_str(attrs, &["action"]).unwrap_or_else(|| "update".to_string());
                (attrs, NotableKind::Issue, action, None)
            }
            "merge_request" => {
                let attrs = body.get("object_attributes")?;
                let action = json_str(attrs, &["action"]).unwrap_or_else(|| "update".to_string());
                (attrs, NotableKind::MergeRequest, action, None)
            }
            "note" => {
                let note = body.get("object_attributes")?;
                let comment = EventComment {
                    body: json_str(note, &["note"]).unwrap_or_default(),
                    author: json_str(body, &["user", "username"]).unwrap_or_default(),
                    url: json_str(note, &["url"]),
                };

                if let Some(issue) = body.get("issue") {
                    (issue, NotableKind::Issue, "commented".to_string(), Some(comment))
                } else if let Some(mr) = body.get("merge_request") {
                    (mr, NotableKind::MergeRequest, "commented".to_string(), Some(comment))
                } else {
                    debug!("ignoring GitLab note hook on unsupported noteable");
                    return None;
                }
            }
            other => {
                debug!(object_kind = %other, "ignoring unsupported GitLab hook kind");
                return None;
            }
        };

        let iid = json_u64(attrs, &["iid"])?;
        let mut resource = Resource::new(
            iid,
            json_str(attrs, &["title"]).unwrap_or_default(),
            json_str(attrs, &["url"])
                .or_else(|| json_str(attrs, &["web_url"]))
                .unwrap_or_default(),
            json_str(attrs, &["state"]).unwrap_or_else(|| "opened".to_string()),
            project.clone(),
        );
        resource.description = json_str(attrs, &["description"]).unwrap_or_default();
        resource.branch = json_str(attrs, &["source_branch"]);
        resource.merge_to = json_str(attrs, &["target_branch"]);
        resource.comment = comment;

        // Note hooks have a note id; resource hooks use the iid.
        let native_id = json_u64(body, &["object_attributes", "id"])
            .filter(|_| object_kind == "note")
            .map(|id| id.to_string())
            .unwrap_or_else(|| iid.to_string());

        let event = NormalizedEvent {
            id: NormalizedEvent::compose_id(
                "gitlab",
                &project,
                &action,
                &native_id,
                &timestamp.timestamp().to_string(),
            ),
            provider: "gitlab".to_string(),
            kind: kind.event_kind().to_string(),
            action,
            resource,
            actor,
            metadata: Metadata::delivered(timestamp, None),
            raw: body.clone(),
        };
        Some((event, kind))
    }

    async fn poll_project(&self, project: &str, sink: &EventSink) -> Result<(), ProviderError> {
        let poll_start = Utc::now();
        let since = {
            let cursors = self.cursors.read().expect("cursor lock poisoned");
            poll_since(cursors.get(project).copied(), poll_start, self.initial_lookback)
        };
        let updated_after = since.to_rfc3339();

        let mut items: Vec<(Value, NotableKind)> = Vec::new();
        for kind in [NotableKind::Issue, NotableKind::MergeRequest] {
            let url = self.client.project_url(
                project,
                &format!(
                    "/{}?updated_after={}&per_page=100",
                    kind.path_segment(),
                    updated_after
                ),
            );
            let listed = self
                .client
                .get_json(&url)
                .await
                .map_err(ProviderError::Api)?;
            for item in listed.as_array().cloned().unwrap_or_default() {
                items.push((item, kind));
            }
        }

        if items.len() > self.max_items {
            debug!(
                project,
                total = items.len(),
                cap = self.max_items,
                "poll result truncated to item cap"
            );
            items.truncate(self.max_items);
        }

        for (item, kind) in items {
            let Some(iid) = json_u64(&item, &["iid"]) else {
                continue;
            };

            let mut resource = Resource::new(
                iid,
                json_str(&item, &["title"]).unwrap_or_default(),
                json_str(&item, &["web_url"]).unwrap_or_default(),
                json_str(&item, &["state"]).unwrap_or_else(|| "opened".to_string()),
                project.to_string(),
            );
            resource.description = json_str(&item, &["description"]).unwrap_or_default();
            resource.author = json_str(&item, &["author", "username"]);
            resource.branch = json_str(&item, &["source_branch"]);
            resource.merge_to = json_str(&item, &["target_branch"]);
            if let Some(labels) = item.get("labels").and_then(Value::as_array) {
                resource.labels = labels
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect();
            }

            let updated_at = json_str(&item, &["updated_at"])
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(poll_start);

            let event = NormalizedEvent {
                id: NormalizedEvent::compose_id(
                    "gitlab",
                    project,
                    "poll",
                    &iid.to_string(),
                    &updated_at.timestamp().to_string(),
                ),
                provider: "gitlab".to_string(),
                kind: kind.event_kind().to_string(),
                action: "poll".to_string(),
                resource,
                actor: Actor {
                    username: json_str(&item, &["author", "username"]).unwrap_or_default(),
                    id: json_u64(&item, &["author", "id"])
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                },
                metadata: Metadata::polled(updated_at),
                raw: item.clone(),
            };

            let has_activity = if kind == NotableKind::MergeRequest {
                match self
                    .client
                    .recent_notes(project, kind, iid, ACTIVITY_PROBE_LIMIT)
                    .await
                {
                    Ok(notes) => !notes.is_empty(),
                    Err(e) => {
                        warn!(project, iid, error = %e, "note probe failed, assuming activity");
                        true
                    }
                }
            } else {
                true
            };

            if let Some(reason) = skip_reason(&event, has_activity) {
                debug!(event_id = %event.id, %reason, "skipping polled GitLab item");
                continue;
            }

            let reactor = self.reactor(project.to_string(), kind, iid);
            sink(event, Box::new(reactor)).await;
        }

        self.cursors
            .write()
            .expect("cursor lock poisoned")
            .insert(project.to_string(), poll_start);
        Ok(())
    }
}

#[async_trait]
impl Provider for GitlabProvider {
    fn name(&self) -> &'static str {
        "gitlab"
    }

    async fn init(&self) -> Result<(), ProviderError> {
        let url = format!("{}/api/v4/user", self.client.base_url);
        let user = self
            .client
            .get_json(&url)
            .await
            .map_err(|e| ProviderError::Init(format!("GitLab token validation failed: {e}")))?;

        let mut identities = self.bot_identities.write().expect("bot identity lock poisoned");
        if identities.is_empty() {
            if let Some(username) = json_str(&user, &["username"]) {
                debug!(username = %username, "discovered GitLab bot identity");
                identities.push(username);
            }
        }
        Ok(())
    }

    fn validate_webhook(
        &self,
        headers: &HeaderMap,
        _raw_body: &[u8],
    ) -> Result<(), SignatureError> {
        if header_str(headers, HEADER_EVENT).is_none() {
            return Err(SignatureError::MissingHeader(HEADER_EVENT));
        }

        let Some(expected) = &self.webhook_token else {
            warn!("no GitLab webhook token configured, accepting delivery unverified");
            return Ok(());
        };

        let candidate =
            header_str(headers, HEADER_TOKEN).ok_or(SignatureError::MissingHeader(HEADER_TOKEN))?;

        if verify_token(candidate, expected) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    async fn handle_webhook(
        &self,
        _headers: &HeaderMap,
        body: &Value,
        sink: &EventSink,
    ) -> Result<(), ProviderError> {
        let Some((event, kind)) = self.normalize_webhook(body) else {
            return Ok(());
        };

        if let Some(reason) = skip_reason(&event, true) {
            debug!(event_id = %event.id, %reason, "skipping GitLab webhook event");
            return Ok(());
        }

        let reactor = self.reactor(event.resource.repository.clone(), kind, event.resource.number);
        sink(event, Box::new(reactor)).await;
        Ok(())
    }

    async fn poll(&self, sink: &EventSink) -> Result<(), ProviderError> {
        for project in self.projects.clone() {
            self.poll_project(&project, sink).await?;
        }
        Ok(())
    }

    fn polling_interval(&self) -> Option<Duration> {
        self.interval
    }
}

/// Per-event reactor over the GitLab notes API.
struct GitlabReactor {
    client: GitlabClient,
    project: String,
    kind: NotableKind,
    iid: u64,
    bot_names: Vec<String>,
}

#[async_trait]
impl Reactor for GitlabReactor {
    async fn last_comment(&self) -> Option<ThreadComment> {
        let result = retry_with_backoff(RetryConfig::DEFAULT, || async {
            self.client
                .recent_notes(&self.project, self.kind, self.iid, 1)
                .await
        })
        .await;

        match result {
            Ok(notes) => notes.first().map(|note| ThreadComment {
                author: json_str(note, &["author", "username"]).unwrap_or_default(),
                body: json_str(note, &["body"]).unwrap_or_default(),
            }),
            Err(e) => {
                warn!(project = %self.project, iid = self.iid, error = %e, "failed to read last note");
                None
            }
        }
    }

    async fn post_comment(&self, body: &str) -> Result<String, ReactorError> {
        let url = self.client.project_url(
            &self.project,
            &format!("/{}/{}/notes", self.kind.path_segment(), self.iid),
        );
        let payload = serde_json::json!({ "body": body });

        let note = retry_with_backoff(RetryConfig::DEFAULT, || async {
            self.client.post_json(&url, &payload).await
        })
        .await?;

        Ok(json_u64(&note, &["id"])
            .map(|id| id.to_string())
            .unwrap_or_default())
    }

    fn is_bot_author(&self, name: &str) -> bool {
        matches_bot_identity(&self.bot_names, name)
    }
}
