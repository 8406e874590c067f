//! Mail providers and the fetch algorithm they share.
//!
//! A backend only knows how to list, fetch, and delete messages and how to
//! get at a part's bytes. [`fetch_batch`] drives it: query, extract each
//! message, and delete the ones that were fully extracted.

pub mod error;
pub mod gmail;
pub mod imap;
pub mod query;

pub use error::{FetchError, Result};
pub use query::SearchQuery;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::auth::{AuthError, Credentials, GMAIL_MODIFY_SCOPE, GOOGLE_MAIL_SCOPE};
use crate::config::ImapAuth;
use crate::context::AppContext;
use crate::error::ConfigError;
use crate::extract::{ExtractedFile, Extractor, FetchedMessage, PartSource};

/// A configured, authenticated source of attachments.
#[async_trait]
pub trait MailProvider: Send {
    fn name(&self) -> &str;

    /// Attachments of matching messages received after `after`. With
    /// `delete_fetched`, fully extracted messages are removed from the mailbox.
    async fn fetch_attachments(
        &mut self,
        after: DateTime<Utc>,
        delete_fetched: bool,
    ) -> Result<Vec<ExtractedFile>>;
}

/// Identifies a message in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
}

/// Low-level mailbox operations a provider is built from.
#[async_trait]
pub trait MailBackend: PartSource {
    /// All messages matching `query`, across every result page.
    async fn list_messages(&mut self, query: &SearchQuery) -> Result<Vec<MessageRef>>;

    async fn fetch_message(&mut self, message: &MessageRef) -> Result<FetchedMessage>;

    async fn delete_message(&mut self, message: &FetchedMessage) -> Result<()>;
}

/// Runs one fetch against `backend`.
///
/// Every listed message is fetched and extracted before anything is deleted,
/// so failing to fetch one message fails the whole batch with the mailbox
/// untouched and the caller does not advance its watermark. Failing parts
/// only skip that part, and a message with skipped parts is never deleted. A
/// failed delete is logged and the batch continues.
pub async fn fetch_batch<B>(
    backend: &mut B,
    extractor: &Extractor,
    query: &SearchQuery,
    delete_fetched: bool,
) -> Result<Vec<ExtractedFile>>
where
    B: MailBackend + ?Sized,
{
    let listed = backend.list_messages(query).await?;
    debug!("{} message(s) matched the search", listed.len());

    let mut files = Vec::new();
    let mut complete = Vec::new();
    let mut kept = 0usize;

    for message_ref in &listed {
        let message = backend.fetch_message(message_ref).await?;

        if !query.admits(message.received_at) {
            debug!(
                "Message {} received before the search window, ignoring",
                message.id
            );
            continue;
        }

        let extraction = extractor.extract(&mut *backend, &message).await;
        if extraction.is_complete() {
            // Bodies are not needed to delete; keep only the identity
            complete.push(FetchedMessage {
                parts: Vec::new(),
                ..message
            });
        } else if delete_fetched {
            warn!(
                "Message {} had attachments that could not be extracted, leaving it in the mailbox",
                message.id
            );
            kept += 1;
        }
        files.extend(extraction.files);
    }

    let mut deleted = 0usize;
    if delete_fetched {
        for message in &complete {
            match backend.delete_message(message).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete message {}: {}", message.id, e),
            }
        }
    }

    info!(
        "Fetched {} attachment(s) from {} message(s){}",
        files.len(),
        listed.len(),
        if delete_fetched {
            format!(", deleted {}, kept {}", deleted, kept)
        } else {
            String::new()
        }
    );
    Ok(files)
}

/// Registry of available providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gmail,
    Imap,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Gmail, ProviderKind::Imap];

    /// Name used in file names and the callback path.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "google",
            ProviderKind::Imap => "imap",
        }
    }

    /// Builds the provider, resuming stored credentials or running the
    /// interactive grant when needed.
    pub async fn initialize(
        self,
        ctx: &AppContext,
        allowed_senders: &[String],
    ) -> std::result::Result<Box<dyn MailProvider>, AuthError> {
        info!(
            "Initializing {} provider for {} sender(s)",
            self.name(),
            allowed_senders.len()
        );
        match self {
            ProviderKind::Gmail => {
                let provider = gmail::GmailProvider::initialize(ctx, allowed_senders).await?;
                Ok(Box::new(provider))
            }
            ProviderKind::Imap => {
                let provider = imap::ImapProvider::initialize(ctx, allowed_senders).await?;
                Ok(Box::new(provider))
            }
        }
    }

    /// Discards the stored token and runs the interactive grant again.
    /// Returns `false` when the provider is not set up for OAuth.
    pub async fn reauthorize(self, ctx: &AppContext) -> std::result::Result<bool, AuthError> {
        let scope = match self {
            ProviderKind::Gmail => GMAIL_MODIFY_SCOPE,
            ProviderKind::Imap => match ctx.config.imap.as_ref().map(|imap| imap.auth) {
                Some(ImapAuth::Oauth2) => GOOGLE_MAIL_SCOPE,
                _ => return Ok(false),
            },
        };
        Credentials::google(ctx, self.name(), &[scope])?
            .reauthorize()
            .await?;
        Ok(true)
    }

    fn valid_names() -> String {
        let mut names = vec!["gmail"];
        names.extend(Self::ALL.iter().map(|kind| kind.name()));
        names.sort_unstable();
        names.join(", ")
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gmail" => Ok(ProviderKind::Gmail),
            "imap" => Ok(ProviderKind::Imap),
            _ => Err(ConfigError::UnknownProvider {
                name: s.to_string(),
                valid: Self::valid_names(),
            }),
        }
    }
}

/// Builds providers on demand; the scheduler uses it for periodic
/// re-initialization.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(&self) -> std::result::Result<Box<dyn MailProvider>, AuthError>;
}

pub struct ContextProviderFactory {
    ctx: Arc<AppContext>,
    kind: ProviderKind,
}

impl ContextProviderFactory {
    pub fn new(ctx: Arc<AppContext>, kind: ProviderKind) -> Self {
        Self { ctx, kind }
    }
}

#[async_trait]
impl ProviderFactory for ContextProviderFactory {
    async fn build(&self) -> std::result::Result<Box<dyn MailProvider>, AuthError> {
        let senders = self.ctx.config.senders();
        self.kind.initialize(&self.ctx, &senders).await
    }
}
