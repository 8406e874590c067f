//! Secret resolution for provider credentials.
//!
//! OAuth client credentials and IMAP passwords can be supplied in three ways,
//! checked in this order:
//!
//! 1. **Direct value** in the config file (`"value": "..."`), for quick local testing
//! 2. **File reference** (`"file": "/run/secrets/imap_password"`)
//! 3. **Env var reference** (`"envVar": "MAILPRINT_IMAP_PASSWORD"`)

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;

/// Error type for secret resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: value, file, or envVar)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where a secret comes from, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl SecretSource {
    /// A source that only reads the given environment variable.
    pub fn env(name: &str) -> Self {
        Self {
            env_var: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Resolves the secret, trying the direct value, then the file, then the
    /// environment variable. Empty entries are skipped.
    pub fn resolve(&self) -> Result<SecretString> {
        if let Some(value) = non_empty(&self.value) {
            return Ok(SecretString::from(value.to_string()));
        }

        if let Some(path) = non_empty(&self.file) {
            let expanded = expand_home(path);
            return match fs::read_to_string(&expanded) {
                Ok(content) => Ok(SecretString::from(content.trim().to_string())),
                Err(e) => Err(SecretError::FileReadError {
                    path: expanded,
                    source: e,
                }),
            };
        }

        if let Some(name) = non_empty(&self.env_var) {
            return match std::env::var(name) {
                // env vars written by shells often carry a trailing newline
                Ok(value) => Ok(SecretString::from(value.trim())),
                Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                    name: name.to_string(),
                }),
                Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                    name: name.to_string(),
                }),
            };
        }

        Err(SecretError::NoSourceProvided)
    }

    /// A short description of where the secret is expected, for error messages.
    /// Never includes the value itself.
    pub fn describe(&self) -> String {
        if non_empty(&self.value).is_some() {
            "the value in the config file".to_string()
        } else if let Some(path) = non_empty(&self.file) {
            format!("file '{}'", path)
        } else if let Some(name) = non_empty(&self.env_var) {
            format!("environment variable {}", name)
        } else {
            "(nothing configured)".to_string()
        }
    }
}

fn non_empty(entry: &Option<String>) -> Option<&str> {
    entry.as_deref().filter(|s| !s.is_empty())
}

/// Expands `~` to the user's home directory.
///
/// Only `~` and `~/path` are supported, not `~user/path`.
pub(crate) fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if path == "~" {
                return home.to_string_lossy().into_owned();
            }
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
