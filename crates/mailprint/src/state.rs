//! Persistent installation state: the fetch watermark and the vault key.
//!
//! Watermark writes happen in the background after each cycle. The store keeps
//! the handle of the in-flight write and every reader or writer awaits it
//! first, so writes never overlap and reads never see a stale file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::StateError;
use crate::storage::write_private;
use crate::vault::EncryptionKey;

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub last_fetch: DateTime<Utc>,
    #[serde(with = "key_base64")]
    pub encryption_key: EncryptionKey,
}

impl AppState {
    /// Fresh state: watermark one second after the Unix epoch and a new key.
    pub fn fresh() -> Result<Self, StateError> {
        let encryption_key =
            EncryptionKey::generate().map_err(|e| StateError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            last_fetch: initial_watermark(),
            encryption_key,
        })
    }
}

pub fn initial_watermark() -> DateTime<Utc> {
    Utc.timestamp_opt(1, 0).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

mod key_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::vault::EncryptionKey;

    pub fn serialize<S: Serializer>(key: &EncryptionKey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<EncryptionKey, D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        EncryptionKey::from_slice(&bytes)
            .ok_or_else(|| D::Error::custom(format!("expected 32 key bytes, got {}", bytes.len())))
    }
}

type PendingWrite = JoinHandle<Result<(), StateError>>;

pub struct StateStore {
    path: PathBuf,
    current: Mutex<AppState>,
    pending: tokio::sync::Mutex<Option<PendingWrite>>,
}

impl StateStore {
    /// Opens the state file, creating it when missing. An unreadable file is
    /// replaced by fresh state, which also means a new key and re-authentication.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<AppState>(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    log::warn!(
                        "Unable to read state file {} ({}), resetting state",
                        path.display(),
                        e
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StateError::ReadFile { path, source: e }),
        };

        let state = match state {
            Some(state) => state,
            None => {
                let fresh = AppState::fresh()?;
                write_state(&path, &fresh)?;
                fresh
            }
        };

        Ok(Self {
            path,
            current: Mutex::new(state),
            pending: tokio::sync::Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encryption_key(&self) -> EncryptionKey {
        self.snapshot().encryption_key
    }

    /// The persisted watermark, after any in-flight write has landed.
    pub async fn last_fetch(&self) -> DateTime<Utc> {
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            log_background_result(join_write(handle).await);
        }
        self.snapshot().last_fetch
    }

    /// Updates the watermark and persists it in the background. Returns once
    /// the write has been started; the previous write is awaited first.
    pub async fn record_fetch(&self, at: DateTime<Utc>) {
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            log_background_result(join_write(handle).await);
        }

        let snapshot = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            current.last_fetch = at;
            current.clone()
        };
        let path = self.path.clone();
        *pending = Some(tokio::task::spawn_blocking(move || {
            write_state(&path, &snapshot)
        }));
    }

    /// Waits for the in-flight write and saves the current state synchronously.
    pub async fn flush(&self) -> Result<(), StateError> {
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            log_background_result(join_write(handle).await);
        }
        write_state(&self.path, &self.snapshot())
    }

    fn snapshot(&self) -> AppState {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Removes the state file at `path`. Missing files are fine.
pub fn delete_state(path: &Path) -> Result<(), StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn write_state(path: &Path, state: &AppState) -> Result<(), StateError> {
    let json = serde_json::to_vec_pretty(state)?;
    write_private(path, &json).map_err(|e| StateError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

async fn join_write(handle: PendingWrite) -> Result<(), StateError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(StateError::Background(e.to_string())),
    }
}

fn log_background_result(result: Result<(), StateError>) {
    if let Err(e) = result {
        log::error!("Failed to persist state: {}", e);
    }
}
