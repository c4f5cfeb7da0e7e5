//! The per-event thread capability.
//!
//! A [`Reactor`] is the only contract the dispatcher uses to interact with
//! the source platform: look at the tail of the conversation, speak into it,
//! and recognize the bot's own voice. One reactor is created per processed
//! event, immediately before emission, and discarded after the event handler
//! returns; it borrows the provider's platform client for that lifetime.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from reactor operations.
///
/// Only `post_comment` surfaces errors; `last_comment` degrades to `None`
/// (logged at the call site inside the reactor).
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Posting the comment failed after retries.
    #[error("failed to post comment: {0}")]
    PostFailed(#[from] crate::retry::ApiError),
}

/// The tail comment of a resource's conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadComment {
    /// The comment author's platform username.
    pub author: String,

    /// The comment text.
    pub body: String,
}

/// Uniform "inspect / mutate the conversation" capability over
/// heterogeneous platform APIs.
///
/// For messaging providers, `post_comment` writes into the thread keyed by
/// the originating message's `thread_ts` (or starts a thread anchored at the
/// message itself), and `last_comment` reads the tail of the same thread.
#[async_trait]
pub trait Reactor: Send + Sync {
    /// Returns the most recent comment on the resource, or `None` when the
    /// thread is empty or the platform call failed (the failure is logged).
    async fn last_comment(&self) -> Option<ThreadComment>;

    /// Posts a comment and returns an opaque platform handle for it.
    async fn post_comment(&self, body: &str) -> Result<String, ReactorError>;

    /// Whether `name` is one of the identities the bot may appear under.
    ///
    /// Matching is exact, case-sensitive string equality.
    fn is_bot_author(&self, name: &str) -> bool;
}

/// Shared identity matching used by every concrete reactor.
///
/// `bot_names` is the configured identity set, possibly extended by a
/// discovered who-am-i identity.
pub fn matches_bot_identity(bot_names: &[String], candidate: &str) -> bool {
    bot_names.iter().any(|name| name == candidate)
}
