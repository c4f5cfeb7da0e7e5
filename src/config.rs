//! Resolved configuration records.
//!
//! The watcher core receives configuration that has already been resolved:
//! loading from disk or the environment happens in the binary shell (see
//! `main.rs`), not here. Secrets are carried as [`SecretSource`] values and
//! resolved once, when a provider is constructed.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secret::SecretSource;

/// Default first-poll lookback window (1 hour).
pub const DEFAULT_INITIAL_LOOKBACK: Duration = Duration::from_secs(3600);

/// Default consecutive-failure threshold before a poller self-disables.
pub const DEFAULT_MAX_ERROR_COUNT: u32 = 5;

/// Default per-container item cap for one poll tick.
pub const DEFAULT_MAX_POLL_ITEMS: usize = 50;

/// A repository identifier (owner/repo format).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Parses `owner/repo`. Returns `None` when the shape is wrong.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, repo) = full_name.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some(RepoId::new(owner, repo))
    }

    /// The `owner/repo` form used as a container key.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Identities the watcher's comments may appear under, plus the
/// acknowledgement template used when the command executor is disabled.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Username(s) to match against the last comment's author. A match
    /// against any entry marks a resource as already acknowledged.
    pub usernames: Vec<String>,

    /// Template for the acknowledgement comment posted when no command is
    /// configured. Rendered with `{ "id": <display string> }`.
    pub comment_template: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        BotConfig {
            usernames: Vec::new(),
            comment_template: "Agent is working on {{ id }}".to_string(),
        }
    }
}

/// Configuration for the external command run per actionable event.
#[derive(Debug, Clone, Default)]
pub struct CommandConfig {
    /// When false the executor is a no-op and the dispatcher posts the
    /// acknowledgement comment itself.
    pub enabled: bool,

    /// Shell command line, executed via `sh -c`.
    pub command: String,

    /// Default prompt template text.
    pub prompt_template: Option<String>,

    /// Path to the default prompt template; `prompt_template` wins when
    /// both are set.
    pub prompt_template_file: Option<PathBuf>,

    /// Per-provider template paths, overriding the default.
    pub prompts: HashMap<String, PathBuf>,

    /// Deliver the prompt on stdin (true) or via the `PROMPT` environment
    /// variable (false).
    pub use_stdin: bool,

    /// Post the subprocess's stdout as a follow-up comment on success.
    pub follow_up: bool,

    /// Log the would-be invocation instead of spawning; the initial
    /// acknowledgement comment is still posted.
    pub dry_run: bool,
}

/// Polling behavior shared by all providers.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Default tick interval for providers that do not set their own.
    /// `None` disables polling for providers without an override.
    pub interval: Option<Duration>,

    /// First-poll lookback window used before a cursor exists.
    pub initial_lookback: Duration,

    /// Consecutive-failure threshold at which a poller self-disables.
    pub max_error_count: u32,

    /// Per-container item cap for one tick; overflow is dropped and logged.
    pub max_items: usize,

    /// Base back-off delay after the first failure.
    pub backoff_base: Duration,

    /// Back-off cap.
    pub backoff_cap: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            interval: None,
            initial_lookback: DEFAULT_INITIAL_LOOKBACK,
            max_error_count: DEFAULT_MAX_ERROR_COUNT,
            max_items: DEFAULT_MAX_POLL_ITEMS,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// GitHub provider configuration.
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// API token.
    pub token: SecretSource,

    /// Webhook signing secret. When absent, deliveries carrying the GitHub
    /// event headers are accepted with a logged warning.
    pub webhook_secret: Option<SecretSource>,

    /// Repositories to poll.
    pub repositories: Vec<RepoId>,

    /// Bot login override; discovered via the API when unset.
    pub bot_username: Option<String>,

    /// Per-provider polling interval override.
    pub polling_interval: Option<Duration>,
}

/// GitLab provider configuration.
#[derive(Debug, Clone)]
pub struct GitlabConfig {
    /// Instance base URL, e.g. `https://gitlab.com`.
    pub base_url: String,

    /// API token (sent as `PRIVATE-TOKEN`).
    pub token: SecretSource,

    /// Webhook shared token (`X-Gitlab-Token`, compared verbatim).
    pub webhook_token: Option<SecretSource>,

    /// Project paths (`group/project`) to poll.
    pub projects: Vec<String>,

    /// Bot username override; discovered via the API when unset.
    pub bot_username: Option<String>,

    /// Per-provider polling interval override.
    pub polling_interval: Option<Duration>,
}

/// Linear provider configuration.
#[derive(Debug, Clone)]
pub struct LinearConfig {
    /// API key for the GraphQL endpoint.
    pub api_key: SecretSource,

    /// Webhook signing secret (bare-hex envelope).
    pub webhook_secret: Option<SecretSource>,

    /// Team keys to poll.
    pub teams: Vec<String>,

    /// Bot display name override; discovered via the API when unset.
    pub bot_name: Option<String>,

    /// Per-provider polling interval override.
    pub polling_interval: Option<Duration>,
}

/// Slack provider configuration.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// Bot token for the Web API.
    pub bot_token: SecretSource,

    /// Signing secret for the replay-guarded envelope.
    pub signing_secret: Option<SecretSource>,

    /// Channel ids to poll for mentions.
    pub channels: Vec<String>,

    /// Bot user id override; discovered via `auth.test` when unset.
    pub bot_user_id: Option<String>,

    /// Per-provider polling interval override.
    pub polling_interval: Option<Duration>,
}

/// The fully-resolved watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Path prefix for webhook endpoints: `POST {base_path}/webhook/{provider}`.
    /// Empty means the endpoints live at the root.
    pub base_path: String,

    /// Bot identity and acknowledgement template.
    pub bot: BotConfig,

    /// External command configuration.
    pub command: CommandConfig,

    /// Polling behavior.
    pub poll: PollSettings,

    pub github: Option<GithubConfig>,
    pub gitlab: Option<GitlabConfig>,
    pub linear: Option<LinearConfig>,
    pub slack: Option<SlackConfig>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            base_path: String::new(),
            bot: BotConfig::default(),
            command: CommandConfig::default(),
            poll: PollSettings::default(),
            github: None,
            gitlab: None,
            linear: None,
            slack: None,
        }
    }
}
