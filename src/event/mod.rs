//! The normalized event record.
//!
//! Every provider maps its native payloads into [`NormalizedEvent`], the
//! single shape consumed downstream. The dispatcher treats `kind` and
//! `action` as opaque strings apart from the filtering rules in
//! [`filter`]; the `raw` payload is retained verbatim for template
//! rendering and is never inspected by the dispatcher.

pub mod filter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Violation of a normalized-event invariant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventInvariantError {
    /// `id` must be non-empty.
    #[error("event id is empty")]
    EmptyId,

    /// `provider` must be non-empty.
    #[error("event provider is empty")]
    EmptyProvider,

    /// `resource.repository` must be non-empty.
    #[error("event resource.repository is empty")]
    EmptyRepository,
}

/// A conversation note attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventComment {
    /// The comment text.
    pub body: String,

    /// The comment author's platform username.
    pub author: String,

    /// Web link to the comment, when the platform provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The resource an event is about: an issue, a pull/merge request, or a
/// threaded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Small integer handle local to `repository`; `0` when the platform
    /// has none (e.g., chat messages).
    pub number: u64,

    /// Resource title (for messages, the text or its first line).
    pub title: String,

    /// Resource body text.
    #[serde(default)]
    pub description: String,

    /// Web link to the resource.
    pub url: String,

    /// Platform state name (`open`, `closed`, `opened`, `Done`, ...).
    pub state: String,

    /// Logical container key: repo full name, project path, team key, or
    /// channel id.
    pub repository: String,

    /// Resource author, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Assignee usernames.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<String>,

    /// Label names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Source branch, for pull/merge requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Target branch, for pull/merge requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_to: Option<String>,

    /// The conversation note, when the event is about one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<EventComment>,
}

impl Resource {
    /// A minimal resource with the mandatory facts filled in.
    pub fn new(
        number: u64,
        title: impl Into<String>,
        url: impl Into<String>,
        state: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Resource {
            number,
            title: title.into(),
            description: String::new(),
            url: url.into(),
            state: state.into(),
            repository: repository.into(),
            author: None,
            assignees: Vec::new(),
            labels: Vec::new(),
            branch: None,
            merge_to: None,
            comment: None,
        }
    }
}

/// Who caused the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    /// Platform username.
    pub username: String,

    /// Platform user id, as a string.
    pub id: String,
}

/// Event provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// When the event happened (ISO-8601 on the wire).
    pub timestamp: DateTime<Utc>,

    /// The platform's delivery id, for webhook events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,

    /// True when the event was surfaced by polling rather than a webhook.
    #[serde(default)]
    pub polled: bool,

    /// Provider-specific extras (threading keys, inner event types, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Metadata {
    /// Metadata for a webhook delivery.
    pub fn delivered(timestamp: DateTime<Utc>, delivery_id: Option<String>) -> Self {
        Metadata {
            timestamp,
            delivery_id,
            polled: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Metadata for a polled item.
    pub fn polled(timestamp: DateTime<Utc>) -> Self {
        Metadata {
            timestamp,
            delivery_id: None,
            polled: true,
            extra: serde_json::Map::new(),
        }
    }

    /// Attaches a provider-specific extra field.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// The uniform event record passed from providers to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Globally unique, stable within the source delivery. Format
    /// `{provider}:{resource-key}:{action}:{native-id}:{delivery-or-ts}`.
    /// Used only for logging and short-id derivation.
    pub id: String,

    /// Source provider name (`github`, `gitlab`, `linear`, `slack`).
    pub provider: String,

    /// Resource kind (`issue`, `pull_request`, `merge_request`, `message`).
    #[serde(rename = "type")]
    pub kind: String,

    /// Verb: a native action, or the sentinel `poll` for polled items.
    pub action: String,

    /// Mandatory resource facts.
    pub resource: Resource,

    /// Who caused the event.
    pub actor: Actor,

    /// Provenance.
    pub metadata: Metadata,

    /// The source payload, retained verbatim for template rendering.
    pub raw: Value,
}

impl NormalizedEvent {
    /// Composes the canonical event id.
    pub fn compose_id(
        provider: &str,
        resource_key: &str,
        action: &str,
        native_id: &str,
        delivery_or_ts: &str,
    ) -> String {
        format!("{provider}:{resource_key}:{action}:{native_id}:{delivery_or_ts}")
    }

    /// Checks the non-empty invariants.
    pub fn validate(&self) -> Result<(), EventInvariantError> {
        if self.id.is_empty() {
            return Err(EventInvariantError::EmptyId);
        }
        if self.provider.is_empty() {
            return Err(EventInvariantError::EmptyProvider);
        }
        if self.resource.repository.is_empty() {
            return Err(EventInvariantError::EmptyRepository);
        }
        Ok(())
    }

    /// The event's display handle: `{repository}#{number}`, or a threaded
    /// form for messaging resources with no number.
    pub fn display_string(&self) -> String {
        if self.resource.number == 0 {
            match self.metadata.extra.get("thread_ts").and_then(Value::as_str) {
                Some(ts) => format!("{} (thread {})", self.resource.repository, ts),
                None => self.resource.repository.clone(),
            }
        } else {
            format!("{}#{}", self.resource.repository, self.resource.number)
        }
    }

    /// The JSON form used as the template-rendering context.
    pub fn to_context(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_event() -> NormalizedEvent {
        NormalizedEvent {
            id: NormalizedEvent::compose_id("github", "o/r", "created", "9", "d-1"),
            provider: "github".to_string(),
            kind: "issue".to_string(),
            action: "created".to_string(),
            resource: Resource::new(42, "Fix it", "https://example.test/42", "open", "o/r"),
            actor: Actor {
                username: "alice".to_string(),
                id: "1001".to_string(),
            },
            metadata: Metadata::delivered(Utc::now(), Some("d-1".to_string())),
            raw: json!({"action": "created"}),
        }
    }

    #[test]
    fn compose_id_format() {
        let id = NormalizedEvent::compose_id("github", "o/r", "opened", "42", "delivery-7");
        assert_eq!(id, "github:o/r:opened:42:delivery-7");
    }

    #[test]
    fn validate_accepts_sample() {
        assert_eq!(sample_event().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let mut e = sample_event();
        e.id.clear();
        assert_eq!(e.validate(), Err(EventInvariantError::EmptyId));

        let mut e = sample_event();
        e.provider.clear();
        assert_eq!(e.validate(), Err(EventInvariantError::EmptyProvider));

        let mut e = sample_event();
        e.resource.repository.clear();
        assert_eq!(e.validate(), Err(EventInvariantError::EmptyRepository));
    }

    #[test]
    fn display_string_uses_number() {
        assert_eq!(sample_event().display_string(), "o/r#42");
    }

    #[test]
    fn display_string_threaded_form_for_messages() {
        let mut e = sample_event();
        e.kind = "message".to_string();
        e.resource.number = 0;
        e.resource.repository = "C01".to_string();
        e.metadata = e.metadata.with_extra("thread_ts", "1699999999.0001");

        assert_eq!(e.display_string(), "C01 (thread 1699999999.0001)");
    }

    #[test]
    fn serializes_kind_as_type() {
        let value = sample_event().to_context();
        assert_eq!(value["type"], "issue");
        assert_eq!(value["resource"]["repository"], "o/r");
        assert_eq!(value["raw"]["action"], "created");
    }

    #[test]
    fn metadata_extra_flattens() {
        let mut e = sample_event();
        e.metadata = e.metadata.with_extra("channel", "C01");
        let value = e.to_context();
        assert_eq!(value["metadata"]["channel"], "C01");
    }

    #[test]
    fn roundtrips_through_json() {
        let e = sample_event();
        let value = serde_json::to_string(&e).unwrap();
        let back: NormalizedEvent = serde_json::from_str(&value).unwrap();
        assert_eq!(back, e);
    }
}
