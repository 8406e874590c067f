//! Token lifecycle: interactive grant, refresh, and encrypted persistence.

pub mod callback;
pub mod credentials;
pub mod oauth;
pub mod token;

pub use callback::{AuthCallback, AuthorizationCode, CallbackError, CallbackState, CodeSource};
pub use credentials::{Credentials, OAuthIssuer, TokenIssuer};
pub use oauth::{OAuthClient, OAuthEndpoints, GMAIL_MODIFY_SCOPE, GOOGLE_MAIL_SCOPE};
pub use token::Token;

use thiserror::Error;

use crate::vault::VaultError;

/// Authentication failures. Fatal for the running process unless
/// [`AuthError::is_transient`] says otherwise; each message says what to fix.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{what} is not configured (expected in {location}): {reason}")]
    MissingCredentials {
        what: String,
        location: String,
        reason: String,
    },

    #[error("Failed to exchange the authorization code: {0}. Run `mailprint auth` to try again")]
    Exchange(String),

    /// The token endpoint could not be reached or failed on its side.
    #[error("Failed to refresh the access token: {0}")]
    Refresh(String),

    #[error("The refresh token was rejected: {0}. Run `mailprint auth` to sign in again")]
    RefreshRejected(String),

    #[error("The token endpoint refused the refresh: {0}. Check the Google OAuth client settings")]
    RefreshFailed(String),

    #[error("Authorization did not complete: {0}")]
    Callback(#[from] CallbackError),

    #[error("Credential storage failed: {0}. Run `mailprint reset` if the problem persists")]
    Vault(#[from] VaultError),

    #[error("Login to {server} failed: {reason}. Check the username and password settings")]
    Login { server: String, reason: String },

    #[error("Could not reach {server}: {reason}")]
    Unreachable { server: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(String),
}

impl AuthError {
    /// Network trouble that may clear up on its own. Everything else needs
    /// the user to act.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Refresh(_) | AuthError::Unreachable { .. })
    }
}
