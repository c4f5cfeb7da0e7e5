//! Threadwatch - main entry point.
//!
//! Builds a resolved configuration from environment variables, registers a
//! provider per configured platform, and runs the watcher until SIGINT.

use std::net::SocketAddr;
use std::time::Duration;

use threadwatch::config::{
    CommandConfig, GithubConfig, GitlabConfig, LinearConfig, RepoId, SlackConfig, WatcherConfig,
};
use threadwatch::secret::SecretSource;
use threadwatch::watcher::Watcher;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Loads configuration from environment variables with defaults.
///
/// Platform blocks are present only when their token variable is set; the
/// per-platform webhook secrets are optional (a warning is logged on each
/// unverified delivery).
fn config_from_env() -> WatcherConfig {
    let mut config = WatcherConfig {
        listen_addr: env_parse("LISTEN_ADDR")
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000))),
        base_path: std::env::var("BASE_PATH").unwrap_or_default(),
        ..WatcherConfig::default()
    };

    if let Ok(usernames) = std::env::var("BOT_USERNAME") {
        config.bot.usernames = split_list(&usernames);
    }

    config.poll.interval = env_parse::<u64>("POLL_INTERVAL_SECS").map(Duration::from_secs);

    config.command = CommandConfig {
        enabled: env_flag("COMMAND_ENABLED"),
        command: std::env::var("COMMAND").unwrap_or_default(),
        prompt_template: std::env::var("PROMPT_TEMPLATE").ok(),
        prompt_template_file: std::env::var("PROMPT_TEMPLATE_FILE").ok().map(Into::into),
        prompts: Default::default(),
        use_stdin: !env_flag("PROMPT_VIA_ENV"),
        follow_up: env_flag("FOLLOW_UP"),
        dry_run: env_flag("DRY_RUN"),
    };

    if std::env::var("GITHUB_TOKEN").is_ok() {
        config.github = Some(GithubConfig {
            token: SecretSource::env("GITHUB_TOKEN"),
            webhook_secret: optional_secret("GITHUB_WEBHOOK_SECRET"),
            repositories: std::env::var("GITHUB_REPOSITORIES")
                .map(|v| split_list(&v).iter().filter_map(|s| RepoId::parse(s)).collect())
                .unwrap_or_default(),
            bot_username: None,
            polling_interval: None,
        });
    }

    if std::env::var("GITLAB_TOKEN").is_ok() {
        config.gitlab = Some(GitlabConfig {
            base_url: std::env::var("GITLAB_URL")
                .unwrap_or_else(|_| "https://gitlab.com".to_string()),
            token: SecretSource::env("GITLAB_TOKEN"),
            webhook_token: optional_secret("GITLAB_WEBHOOK_TOKEN"),
            projects: std::env::var("GITLAB_PROJECTS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            bot_username: None,
            polling_interval: None,
        });
    }

    if std::env::var("LINEAR_API_KEY").is_ok() {
        config.linear = Some(LinearConfig {
            api_key: SecretSource::env("LINEAR_API_KEY"),
            webhook_secret: optional_secret("LINEAR_WEBHOOK_SECRET"),
            teams: std::env::var("LINEAR_TEAMS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            bot_name: None,
            polling_interval: None,
        });
    }

    if std::env::var("SLACK_BOT_TOKEN").is_ok() {
        config.slack = Some(SlackConfig {
            bot_token: SecretSource::env("SLACK_BOT_TOKEN"),
            signing_secret: optional_secret("SLACK_SIGNING_SECRET"),
            channels: std::env::var("SLACK_CHANNELS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            bot_user_id: None,
            polling_interval: None,
        });
    }

    config
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

fn optional_secret(name: &str) -> Option<SecretSource> {
    if std::env::var(name).is_ok() {
        Some(SecretSource::env(name))
    } else {
        tracing::warn!(
            variable = name,
            "webhook secret not set, deliveries will be accepted unverified"
        );
        None
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config_from_env();
    tracing::info!(addr = %config.listen_addr, "starting threadwatch");

    let mut watcher = match Watcher::from_config(config) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = %e, "failed to build watcher");
            std::process::exit(1);
        }
    };

    if watcher.provider_names().is_empty() {
        tracing::error!("no providers configured, nothing to watch");
        std::process::exit(1);
    }

    if let Err(e) = watcher.start().await {
        tracing::error!(error = %e, "failed to start watcher");
        std::process::exit(1);
    }
    tracing::info!(providers = ?watcher.provider_names(), "watcher started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    tracing::info!("shutting down");
    watcher.stop().await;
}
