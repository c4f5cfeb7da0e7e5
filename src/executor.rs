//! External command execution for actionable events.
//!
//! For each event that survives the duplicate check the executor renders a
//! prompt, posts the "working on it" acknowledgement (the idempotency
//! marker), and spawns the configured shell command with a curated
//! environment. Stdout can be posted back as a follow-up comment.
//!
//! Everything after the acknowledgement is best-effort: template problems,
//! spawn failures, and follow-up errors are logged and swallowed so event
//! processing never takes the watcher down. In-flight subprocesses are not
//! killed on shutdown.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::CommandConfig;
use crate::event::NormalizedEvent;
use crate::reactor::{Reactor, ReactorError};
use crate::template;

/// Preview length for the PROMPT excerpt in dry-run logs.
const DRY_RUN_PROMPT_PREVIEW: usize = 100;
/// Preview length for the stdin excerpt in dry-run logs.
const DRY_RUN_STDIN_PREVIEW: usize = 500;

/// Errors that abort processing of one event.
///
/// Only the acknowledgement post aborts; later failures are swallowed.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The acknowledgement comment could not be posted, so the idempotency
    /// marker is absent and the command must not run.
    #[error("failed to post acknowledgement: {0}")]
    Acknowledge(#[from] ReactorError),
}

/// Runs the configured external command for actionable events.
pub struct CommandExecutor {
    config: CommandConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandConfig) -> Self {
        CommandExecutor { config }
    }

    /// Whether a command is configured to run.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Processes one event end to end: acknowledge, render, spawn, report.
    pub async fn execute(
        &self,
        event: &NormalizedEvent,
        reactor: &dyn Reactor,
    ) -> Result<(), ExecutorError> {
        let display = event.display_string();

        // The acknowledgement is the idempotency marker; it must be visible
        // on the platform before (or regardless of) the subprocess launch.
        reactor
            .post_comment(&format!("Agent is working on {display}"))
            .await?;

        let prompt = self.render_prompt(event).await;

        if self.config.dry_run {
            let stdin_preview = if self.config.use_stdin {
                truncate_chars(&prompt, DRY_RUN_STDIN_PREVIEW)
            } else {
                String::new()
            };
            info!(
                event_id = %event.id,
                command = %self.config.command,
                event_short_id = %short_id(event),
                prompt_preview = %truncate_chars(&prompt, DRY_RUN_PROMPT_PREVIEW),
                stdin_preview = %stdin_preview,
                "dry run: skipping command execution"
            );
            return Ok(());
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.config.command)
            .env("EVENT_ID", &event.id)
            .env("EVENT_SAFE_ID", safe_id(&event.id))
            .env("EVENT_SHORT_ID", short_id(event))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.config.use_stdin {
            command.stdin(Stdio::piped());
        } else {
            command.env("PROMPT", &prompt);
            command.stdin(Stdio::null());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "failed to spawn command");
                return Ok(());
            }
        };

        if self.config.use_stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(event_id = %event.id, error = %e, "failed to write prompt to stdin");
            }
            // Dropping the handle closes stdin so the child sees EOF.
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "failed to wait for command");
                return Ok(());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            debug!(event_id = %event.id, "command completed");
            if self.config.follow_up && !stdout.trim().is_empty() {
                if let Err(e) = reactor.post_comment(&stdout).await {
                    warn!(event_id = %event.id, error = %e, "failed to post follow-up comment");
                }
            }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                event_id = %event.id,
                exit_code = output.status.code().unwrap_or(-1),
                stderr = %stderr,
                "command failed"
            );
        }

        Ok(())
    }

    /// Renders the prompt for an event: the per-provider template when one
    /// is configured, else the default template, else empty.
    async fn render_prompt(&self, event: &NormalizedEvent) -> String {
        let template_text = if let Some(path) = self.config.prompts.get(&event.provider) {
            match tokio::fs::read_to_string(path).await {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(provider = %event.provider, path = %path.display(), error = %e,
                        "failed to read provider template, falling back to default");
                    None
                }
            }
        } else {
            None
        };

        let template_text = match template_text {
            Some(text) => Some(text),
            None => {
                if let Some(text) = &self.config.prompt_template {
                    Some(text.clone())
                } else if let Some(path) = &self.config.prompt_template_file {
                    match tokio::fs::read_to_string(path).await {
                        Ok(text) => Some(text),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to read template");
                            None
                        }
                    }
                } else {
                    None
                }
            }
        };

        match template_text {
            Some(text) => template::render(&text, &event.to_context()),
            None => String::new(),
        }
    }
}

/// The event id with everything outside `[A-Za-z0-9_-]` replaced by `_`.
pub fn safe_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The compact id exposed to the command:
/// `{provider}-{repository with / as -}-{number}-{last 6 alphanumerics of
/// the event id, lowercased}`.
pub fn short_id(event: &NormalizedEvent) -> String {
    let repo = event.resource.repository.replace('/', "-");
    let alnum: Vec<char> = event
        .id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let suffix: String = alnum[alnum.len().saturating_sub(6)..]
        .iter()
        .collect::<String>()
        .to_ascii_lowercase();
    format!(
        "{}-{}-{}-{}",
        event.provider, repo, event.resource.number, suffix
    )
}

/// Truncates to a character count (not bytes, so multi-byte text is safe).
fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}
