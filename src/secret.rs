//! Secret resolution from literal values, environment variables, or files.
//!
//! Webhook secrets and API tokens can be configured three ways:
//!
//! - **Literal**: the value itself, inline in configuration
//! - **Env**: the name of an environment variable holding the value
//! - **File**: a path to a file holding the value (trailing newline trimmed)
//!
//! Resolution happens once, when the configuration record is built. The
//! resolved string is then carried in memory for the lifetime of the process.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Errors from secret resolution.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The named environment variable is not set or not valid UTF-8.
    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),

    /// The secret file could not be read.
    #[error("failed to read secret file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a secret value comes from.
///
/// Deserializes from either a bare string (treated as a literal) or a
/// tagged map such as `{ "env": "GITHUB_WEBHOOK_SECRET" }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    /// The secret value itself.
    Literal(String),

    /// A tagged source.
    Tagged(TaggedSecretSource),
}

/// The explicit map form of a [`SecretSource`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaggedSecretSource {
    /// Name of an environment variable holding the secret.
    Env(String),

    /// Path to a file holding the secret.
    File(PathBuf),
}

impl SecretSource {
    /// Resolves the secret to its string value.
    ///
    /// File contents have a single trailing newline trimmed, matching how
    /// secrets are typically mounted (e.g., Kubernetes secret volumes).
    pub fn resolve(&self) -> Result<String, SecretError> {
        match self {
            SecretSource::Literal(value) => Ok(value.clone()),
            SecretSource::Tagged(TaggedSecretSource::Env(name)) => {
                std::env::var(name).map_err(|_| SecretError::MissingEnvVar(name.clone()))
            }
            SecretSource::Tagged(TaggedSecretSource::File(path)) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| SecretError::FileRead {
                        path: path.clone(),
                        source,
                    })?;
                Ok(contents
                    .strip_suffix('\n')
                    .map(|s| s.strip_suffix('\r').unwrap_or(s))
                    .unwrap_or(&contents)
                    .to_string())
            }
        }
    }

    /// Convenience constructor for a literal secret.
    pub fn literal(value: impl Into<String>) -> Self {
        SecretSource::Literal(value.into())
    }

    /// Convenience constructor for an environment-variable secret.
    pub fn env(name: impl Into<String>) -> Self {
        SecretSource::Tagged(TaggedSecretSource::Env(name.into()))
    }

    /// Convenience constructor for a file-backed secret.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SecretSource::Tagged(TaggedSecretSource::File(path.into()))
    }
}
