//! Event filtering rules.
//!
//! Applied uniformly to webhook and polled events, on the normalized form.
//! The rules key on `(type, action, state, has_recent_human_activity)` and
//! decide whether an event is worth reacting to at all; the comment-based
//! idempotency check in the dispatcher is a separate, later gate.

use std::fmt;

use super::NormalizedEvent;

/// Resource kinds that represent pull/merge requests.
const MERGE_KINDS: [&str; 2] = ["pull_request", "merge_request"];

/// Actions on pull/merge requests that are automated or metadata-only.
const METADATA_ACTIONS: [&str; 9] = [
    "synchronize",
    "update",
    "edited",
    "labeled",
    "unlabeled",
    "assigned",
    "unassigned",
    "locked",
    "unlocked",
];

/// Platform state names that mark a resource as finished or abandoned.
const TERMINAL_STATES: [&str; 3] = ["Done", "Cancelled", "Canceled"];

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `opened`/`open`: nothing to respond to yet.
    NothingToRespondTo,

    /// Automated or metadata-only update on a pull/merge request.
    MetadataOnlyUpdate,

    /// Polled pull/merge request with no recent human activity
    /// (surfaced only because of a commit push).
    NoRecentHumanActivity,

    /// The resource is closed and the event does not reopen it.
    ResourceClosed,

    /// Messaging event that is not a direct mention of the bot.
    NotAMention,

    /// The platform's terminal/cancelled state.
    TerminalState,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NothingToRespondTo => "nothing to respond to yet",
            SkipReason::MetadataOnlyUpdate => "automated or metadata-only update",
            SkipReason::NoRecentHumanActivity => "no recent human activity",
            SkipReason::ResourceClosed => "resource is closed",
            SkipReason::NotAMention => "not a direct mention",
            SkipReason::TerminalState => "terminal state",
        };
        f.write_str(s)
    }
}

/// Decides whether an event should be dropped, and why.
///
/// Returns `None` when the event should be processed.
/// `has_recent_human_activity` is resolved by the provider for polled
/// pull/merge requests and is `true` for everything else (fail-open).
pub fn skip_reason(
    event: &NormalizedEvent,
    has_recent_human_activity: bool,
) -> Option<SkipReason> {
    let kind = event.kind.as_str();
    let action = event.action.as_str();
    let state = event.resource.state.as_str();
    let is_merge_kind = MERGE_KINDS.contains(&kind);

    if matches!(action, "opened" | "open") {
        return Some(SkipReason::NothingToRespondTo);
    }

    if is_merge_kind && METADATA_ACTIONS.contains(&action) {
        return Some(SkipReason::MetadataOnlyUpdate);
    }

    if is_merge_kind && action == "poll" && !has_recent_human_activity {
        return Some(SkipReason::NoRecentHumanActivity);
    }

    if state == "closed" && !matches!(action, "reopened" | "reopen") {
        return Some(SkipReason::ResourceClosed);
    }

    if kind == "message" && !matches!(action, "app_mention" | "poll") {
        return Some(SkipReason::NotAMention);
    }

    if TERMINAL_STATES.contains(&state) {
        return Some(SkipReason::TerminalState);
    }

    None
}
