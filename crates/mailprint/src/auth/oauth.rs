//! OAuth 2 authorization code flow against a provider's endpoints.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use super::token::{Token, TokenErrorResponse, TokenResponse};
use super::AuthError;

/// Read, send, and trash access for the Gmail REST API.
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
/// Full mailbox access; required for IMAP with XOAUTH2.
pub const GOOGLE_MAIL_SCOPE: &str = "https://mail.google.com/";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Truncates an error body so large responses do not flood the logs.
pub(crate) fn sanitize_error_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

pub(crate) fn create_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

impl OAuthEndpoints {
    pub fn google(scopes: &[&str]) -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub struct OAuthClient {
    http: Client,
    endpoints: OAuthEndpoints,
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
}

impl OAuthClient {
    pub fn new(
        endpoints: OAuthEndpoints,
        client_id: impl Into<String>,
        client_secret: SecretString,
        redirect_uri: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let http = create_http_client()
            .map_err(|e| AuthError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoints,
            client_id: client_id.into(),
            client_secret,
            redirect_uri: redirect_uri.into(),
        })
    }

    /// The URL the user opens to grant access. Requests offline access with
    /// a forced consent screen so a refresh token is always returned.
    pub fn authorization_url(&self, state: &str) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.endpoints.auth_url).map_err(|e| {
            AuthError::Http(format!(
                "Invalid authorization URL '{}': {}",
                self.endpoints.auth_url, e
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.endpoints.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        Ok(url)
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Token, AuthError> {
        info!("Exchanging authorization code for a token");

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Exchange(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Exchange(format!(
                "Token endpoint returned {}: {}",
                status,
                sanitize_error_body(&body)
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Exchange(format!("Failed to parse token response: {}", e)))?;

        info!("Successfully obtained access token");
        Ok(Token::from_response(parsed, Utc::now()))
    }

    /// Refreshes `token`. A rejected refresh token (`invalid_grant`) maps to
    /// [`AuthError::RefreshRejected`] so callers can fall back to a new grant.
    /// Transport failures, 5xx and 429 map to the retryable
    /// [`AuthError::Refresh`]; any other refusal is [`AuthError::RefreshFailed`].
    pub async fn refresh(&self, token: &Token) -> Result<Token, AuthError> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::RefreshRejected("token has no refresh token".to_string()))?;

        debug!("Refreshing access token");

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Refresh(format!("Token refresh failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if let Ok(error) = serde_json::from_str::<TokenErrorResponse>(&body) {
                if error.error == "invalid_grant" {
                    return Err(AuthError::RefreshRejected(
                        error
                            .error_description
                            .unwrap_or_else(|| "invalid_grant".to_string()),
                    ));
                }
            }
            let detail = format!("Token endpoint returned {}: {}", status, sanitize_error_body(&body));
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                AuthError::Refresh(detail)
            } else {
                AuthError::RefreshFailed(detail)
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Refresh(format!("Failed to parse refresh response: {}", e)))?;

        info!("Successfully refreshed access token");
        Ok(token.refreshed(parsed, Utc::now()))
    }
}
