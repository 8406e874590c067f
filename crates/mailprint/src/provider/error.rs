//! Mail provider error types.

use thiserror::Error;

use crate::auth::AuthError;

/// Errors from a fetch cycle. The scheduler logs these and retries next
/// cycle, except authentication failures that are not transient.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Failed to connect to the IMAP server.
    #[error("IMAP connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS/SSL error during connection.
    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IMAP folder '{0}' not found")]
    FolderNotFound(String),

    /// Non-success response from a REST API.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(String),

    /// The access token was rejected; it has been invalidated for the next call.
    #[error("Access token was rejected by the provider")]
    Unauthorized,

    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<async_native_tls::Error> for FetchError {
    fn from(err: async_native_tls::Error) -> Self {
        FetchError::TlsError(err.to_string())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
