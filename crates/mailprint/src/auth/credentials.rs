use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};

use super::callback::AuthCallback;
use super::oauth::{OAuthClient, OAuthEndpoints};
use super::token::Token;
use super::AuthError;
use crate::context::AppContext;
use crate::vault::{EncryptionKey, TokenStore, VaultError};

/// Source of new and refreshed tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Runs the interactive grant and returns a brand new token.
    async fn authorize_interactively(&self) -> Result<Token, AuthError>;

    async fn refresh(&self, token: &Token) -> Result<Token, AuthError>;
}

/// Browser-based authorization code flow with the loopback callback.
pub struct OAuthIssuer {
    client: OAuthClient,
    bind_addr: SocketAddr,
    callback_path: String,
    cancel: watch::Receiver<bool>,
}

impl OAuthIssuer {
    pub fn new(
        client: OAuthClient,
        bind_addr: SocketAddr,
        callback_path: impl Into<String>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            bind_addr,
            callback_path: callback_path.into(),
            cancel,
        }
    }
}

#[async_trait]
impl TokenIssuer for OAuthIssuer {
    async fn authorize_interactively(&self) -> Result<Token, AuthError> {
        let state = uuid::Uuid::new_v4().to_string();
        let mut callback = AuthCallback::bind(self.bind_addr, self.callback_path.clone())
            .await?
            .with_expected_state(state.clone());
        let url = self.client.authorization_url(&state)?;

        let prompt = format!(
            "\nOpen the following link in your browser to authenticate:\n{}\n\nAuthorization code (or finish in the browser): ",
            url
        );
        let mut stdout = tokio::io::stdout();
        // The prompt is best effort; the browser redirect works without it
        if let Err(e) = stdout.write_all(prompt.as_bytes()).await {
            debug!("Could not write the authorization prompt: {}", e);
        }
        if let Err(e) = stdout.flush().await {
            debug!("Could not flush the authorization prompt: {}", e);
        }

        let code = callback
            .await_code(
                BufReader::new(tokio::io::stdin()),
                None,
                self.cancel.clone(),
            )
            .await?;
        self.client.exchange_code(&code.code).await
    }

    async fn refresh(&self, token: &Token) -> Result<Token, AuthError> {
        self.client.refresh(token).await
    }
}

/// Vault-backed token with transparent refresh.
///
/// The token file and the cached token are only touched while holding the
/// internal lock.
pub struct Credentials {
    store: TokenStore,
    key: EncryptionKey,
    issuer: Arc<dyn TokenIssuer>,
    cached: Mutex<Option<Token>>,
}

impl Credentials {
    pub fn new(store: TokenStore, key: EncryptionKey, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            store,
            key,
            issuer,
            cached: Mutex::new(None),
        }
    }

    /// Credentials for a Google-backed provider using the configured OAuth
    /// client and the callback path `/auth/callback/<provider>`.
    pub fn google(ctx: &AppContext, provider: &str, scopes: &[&str]) -> Result<Self, AuthError> {
        let google = &ctx.config.google;
        let client_id = google.client_id.resolve().map_err(|e| AuthError::MissingCredentials {
            what: "Google OAuth client id".to_string(),
            location: google.client_id.describe(),
            reason: e.to_string(),
        })?;
        let client_secret =
            google
                .client_secret
                .resolve()
                .map_err(|e| AuthError::MissingCredentials {
                    what: "Google OAuth client secret".to_string(),
                    location: google.client_secret.describe(),
                    reason: e.to_string(),
                })?;

        let port = ctx.config.callback_port;
        let path = format!("/auth/callback/{}", provider);
        let redirect_uri = format!("http://localhost:{}{}", port, path);
        let client = OAuthClient::new(
            OAuthEndpoints::google(scopes),
            client_id.expose_secret(),
            client_secret,
            redirect_uri,
        )?;
        let issuer = OAuthIssuer::new(
            client,
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            path,
            ctx.shutdown.clone(),
        );

        Ok(Self::new(
            ctx.token_store(provider),
            ctx.state.encryption_key(),
            Arc::new(issuer),
        ))
    }

    /// Loads the stored token, refreshing it or running the interactive
    /// grant when it is missing, unreadable, expired or rejected.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        let mut cached = self.cached.lock().await;
        self.ensure_valid(&mut cached).await
    }

    /// Discards any stored token and runs the interactive grant.
    pub async fn reauthorize(&self) -> Result<(), AuthError> {
        let mut cached = self.cached.lock().await;
        let token = self.issuer.authorize_interactively().await?;
        self.store.save(&self.key, &token)?;
        *cached = Some(token);
        Ok(())
    }

    /// A currently valid access token, refreshed and persisted first if it
    /// expires within a minute.
    pub async fn access_token(&self) -> Result<SecretString, AuthError> {
        let mut cached = self.cached.lock().await;
        self.ensure_valid(&mut cached).await?;
        cached
            .as_ref()
            .map(|token| SecretString::from(token.access_token.clone()))
            .ok_or_else(|| AuthError::Refresh("no token available after refresh".to_string()))
    }

    /// Marks the cached access token as expired, e.g. after a 401.
    pub async fn invalidate(&self) {
        if let Some(token) = self.cached.lock().await.as_mut() {
            token.expires_at = Some(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
        }
    }

    async fn ensure_valid(&self, slot: &mut Option<Token>) -> Result<(), AuthError> {
        let current = match slot.take() {
            Some(token) => Some(token),
            None => self.load_stored()?,
        };

        if let Some(token) = current {
            if !token.is_expired() {
                *slot = Some(token);
                return Ok(());
            }

            if token.can_refresh() {
                match self.issuer.refresh(&token).await {
                    Ok(fresh) => {
                        self.store.save(&self.key, &fresh)?;
                        *slot = Some(fresh);
                        return Ok(());
                    }
                    Err(AuthError::RefreshRejected(reason)) => {
                        warn!("Refresh token was rejected ({}), re-authentication required", reason);
                    }
                    Err(e) => {
                        *slot = Some(token);
                        return Err(e);
                    }
                }
            } else {
                info!("Stored token expired and has no refresh token, re-authentication required");
            }
        }

        let token = self.issuer.authorize_interactively().await?;
        self.store.save(&self.key, &token)?;
        info!("Saved new credentials to {}", self.store.path().display());
        *slot = Some(token);
        Ok(())
    }

    fn load_stored(&self) -> Result<Option<Token>, AuthError> {
        match self.store.load(&self.key) {
            Ok(token) => Ok(Some(token)),
            Err(VaultError::NotFound(path)) => {
                info!("No stored token at {}", path.display());
                Ok(None)
            }
            Err(VaultError::Decrypt) => {
                warn!(
                    "Stored token at {} could not be decrypted, re-authentication required",
                    self.store.path().display()
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
