//! Encrypted at-rest storage for OAuth tokens.
//!
//! Blobs are AES-256-GCM with a fresh 12-byte nonce prepended:
//! `nonce || ciphertext || tag`. The key belongs to the installation state and
//! is passed into every call; nothing here keeps it.

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use crate::auth::Token;
use crate::storage::write_private;

const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("No stored token at '{0}'")]
    NotFound(PathBuf),

    /// Wrong key, tampered blob, truncated blob or unreadable payload.
    #[error("Stored token could not be decrypted")]
    Decrypt,

    #[error("Failed to encrypt token: {0}")]
    Encrypt(String),

    #[error("Failed to serialize token: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Token file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-installation symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Draws a new key from the OS random source.
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::fill(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_SIZE]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Encrypt(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    getrandom::fill(&mut nonce_bytes)
        .map_err(|e| VaultError::Encrypt(format!("Failed to generate nonce: {}", e)))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::Encrypt(e.to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend(ciphertext);
    Ok(blob)
}

/// Decrypts a blob produced by [`encrypt`]. Every failure is [`VaultError::Decrypt`].
pub fn decrypt(key: &EncryptionKey, blob: &[u8]) -> Result<Vec<u8>, VaultError> {
    if blob.len() < NONCE_SIZE {
        return Err(VaultError::Decrypt);
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| VaultError::Decrypt)?;
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| VaultError::Decrypt)
}

/// One provider's encrypted token file.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, key: &EncryptionKey) -> Result<Token, VaultError> {
        let blob = match std::fs::read(&self.path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(self.path.clone()))
            }
            Err(e) => {
                return Err(VaultError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        let plaintext = decrypt(key, &blob)?;
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::Decrypt)
    }

    /// Encrypts and writes the token. Nothing is written if encryption fails.
    pub fn save(&self, key: &EncryptionKey, token: &Token) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(token)?;
        let blob = encrypt(key, &plaintext)?;
        write_private(&self.path, &blob).map_err(|e| VaultError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        log::debug!("Saved encrypted token to {}", self.path.display());
        Ok(())
    }

    /// Removes the token file. A missing file is not an error.
    pub fn delete(&self) -> Result<(), VaultError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}
