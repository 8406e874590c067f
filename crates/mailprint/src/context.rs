//! Everything a run needs, built once in `main` and passed by reference.

use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::sync::watch;

use crate::config::{load_or_init, save_config, Config, CONFIG_FILE};
use crate::error::{ConfigError, Result};
use crate::extract::Extractor;
use crate::print::PrintOptions;
use crate::provider::ProviderKind;
use crate::secrets::expand_home;
use crate::state::{delete_state, StateStore, STATE_FILE};
use crate::vault::TokenStore;

pub struct AppContext {
    pub config: Config,
    pub config_dir: PathBuf,
    pub state: StateStore,
    /// Flips to `true` once when the process is asked to stop.
    pub shutdown: watch::Receiver<bool>,
}

impl AppContext {
    /// Loads config and state from `config_dir`. A pending `reset` in the
    /// config is carried out first and then cleared.
    pub fn open(config_dir: &Path, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let mut config = load_or_init(config_dir)?;

        if config.reset {
            info!("Reset requested in config, clearing state and stored tokens");
            reset(config_dir)?;
            config.reset = false;
            save_config(config_dir.join(CONFIG_FILE), &config)?;
        }

        let state = StateStore::open(config_dir.join(STATE_FILE))?;
        Ok(Self::new(config, config_dir, state, shutdown))
    }

    pub fn new(
        config: Config,
        config_dir: impl Into<PathBuf>,
        state: StateStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            config_dir: config_dir.into(),
            state,
            shutdown,
        }
    }

    pub fn provider_kind(&self) -> std::result::Result<ProviderKind, ConfigError> {
        self.config.provider.parse()
    }

    pub fn token_store(&self, provider: &str) -> TokenStore {
        TokenStore::new(token_path(&self.config_dir, provider))
    }

    /// Extracts into `downloadDir`, or the system temp dir.
    pub fn extractor(&self) -> Extractor {
        match &self.config.download_dir {
            Some(dir) if !dir.trim().is_empty() => Extractor::new(expand_home(dir)),
            _ => Extractor::new(std::env::temp_dir()),
        }
    }

    pub fn query_skew(&self) -> chrono::Duration {
        i64::try_from(self.config.query_skew_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::zero())
    }

    pub fn print_options(&self) -> PrintOptions {
        PrintOptions::from_config(&self.config)
    }
}

pub fn token_path(config_dir: &Path, provider: &str) -> PathBuf {
    config_dir.join(format!("token-{}.bin", provider))
}

/// Deletes the state file and every provider's stored token. The config is
/// left alone.
pub fn reset(config_dir: &Path) -> Result<()> {
    delete_state(&config_dir.join(STATE_FILE))?;
    for kind in ProviderKind::ALL {
        let store = TokenStore::new(token_path(config_dir, kind.name()));
        if let Err(e) = store.delete() {
            warn!("Failed to delete {}: {}", store.path().display(), e);
        }
    }
    Ok(())
}
