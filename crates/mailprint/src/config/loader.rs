use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::provider::ProviderKind;
use crate::storage::write_private;

pub const CONFIG_FILE: &str = "config.json";
const APP_DIR: &str = "mailprint";

/// `<data_dir>/mailprint`, the home of config, state and token files.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(ConfigError::NoDataDir)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads `config.json` from `dir`. When it does not exist yet a default file is
/// written and [`ConfigError::NotInitialized`] is returned so the user can fill
/// in senders and credentials first.
pub fn load_or_init(dir: &Path) -> Result<Config, ConfigError> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        save_config(&path, &Config::default())?;
        return Err(ConfigError::NotInitialized(path));
    }
    load_config(&path)
}

pub fn save_config<P: AsRef<Path>>(path: P, config: &Config) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let json = serde_json::to_vec_pretty(config)?;
    write_private(path, &json).map_err(|e| ConfigError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

const MAX_QUERY_SKEW_SECS: u64 = 24 * 60 * 60;

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let kind: ProviderKind = config.provider.parse()?;

    if config.senders().is_empty() {
        return Err(ConfigError::Validation {
            message: "allowedSenders must list at least one sender address".to_string(),
        });
    }

    if config
        .allowed_senders
        .iter()
        .any(|s| s.contains('"') || s.contains(')') || s.contains('('))
    {
        return Err(ConfigError::Validation {
            message: "allowedSenders entries must be plain addresses".to_string(),
        });
    }

    if config.poll_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "pollIntervalSecs must be greater than zero".to_string(),
        });
    }

    if config.reauth_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "reauthIntervalSecs must be greater than zero".to_string(),
        });
    }

    if config.query_skew_secs > MAX_QUERY_SKEW_SECS {
        return Err(ConfigError::Validation {
            message: format!(
                "querySkewSecs must be at most {} (one day)",
                MAX_QUERY_SKEW_SECS
            ),
        });
    }

    // Kept mail is searched from `watermark - skew`; a skew shorter than the
    // poll interval lets a late message match at most one extra cycle
    if !config.delete_printed && config.query_skew_secs >= config.poll_interval_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "querySkewSecs ({}) must be less than pollIntervalSecs ({}) when deletePrinted is false",
                config.query_skew_secs, config.poll_interval_secs
            ),
        });
    }

    if config.callback_port == 0 {
        return Err(ConfigError::Validation {
            message: "callbackPort must be a fixed port so it can match the OAuth redirect URI"
                .to_string(),
        });
    }

    if kind == ProviderKind::Imap {
        match &config.imap {
            None => {
                return Err(ConfigError::Validation {
                    message: "provider 'imap' requires an 'imap' settings block".to_string(),
                })
            }
            Some(imap) if imap.host.trim().is_empty() || imap.username.trim().is_empty() => {
                return Err(ConfigError::Validation {
                    message: "imap.host and imap.username must not be empty".to_string(),
                })
            }
            Some(_) => {}
        }
    }

    Ok(())
}
