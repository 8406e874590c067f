use std::path::PathBuf;
use thiserror::Error;

use crate::auth::AuthError;
use crate::print::PrintError;

#[derive(Error, Debug)]
pub enum MailprintError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Printing error: {0}")]
    Print(#[from] PrintError),

    #[error("Failed to start the async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Unknown provider '{name}' (valid providers: {valid})")]
    UnknownProvider { name: String, valid: String },

    #[error("No config found; a default config was written to '{0}'. Edit it and run again")]
    NotInitialized(PathBuf),

    #[error("Could not determine a data directory; pass --config-dir")]
    NoDataDir,
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unable to generate an encryption key: {0}")]
    KeyGeneration(String),

    #[error("Background state write did not complete: {0}")]
    Background(String),
}

pub type Result<T> = std::result::Result<T, MailprintError>;
