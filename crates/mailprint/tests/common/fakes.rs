//! In-memory stand-ins for the mailbox, clock, print sink and token issuer.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailprint::auth::{AuthError, Credentials, Token, TokenIssuer};
use mailprint::extract::{
    inline_body, ExtractedFile, ExtractionError, Extractor, FetchedMessage, MessagePart, PartBody,
    PartSource,
};
use mailprint::print::{PrintError, PrintSink};
use mailprint::provider::{
    fetch_batch, FetchError, MailBackend, MailProvider, MessageRef, ProviderFactory, Result,
    SearchQuery,
};
use mailprint::scheduler::Clock;

/// Inline body that fails to decode.
pub const CORRUPT: &[u8] = b"CORRUPT";

pub fn attachment(name: &str, content: &[u8]) -> MessagePart {
    MessagePart::leaf(Some(name), "application/pdf", PartBody::Inline(content.to_vec()))
}

/// A `multipart/mixed` message with a text body and the given attachments.
pub fn message(id: &str, received_at: DateTime<Utc>, attachments: Vec<MessagePart>) -> FetchedMessage {
    let mut children = vec![MessagePart::leaf(
        None,
        "text/plain",
        PartBody::Inline(b"see attached".to_vec()),
    )];
    children.extend(attachments);
    FetchedMessage {
        id: id.to_string(),
        received_at: Some(received_at),
        parts: vec![MessagePart::multipart("multipart/mixed", children)],
    }
}

#[derive(Debug, Default)]
struct MailboxInner {
    messages: Vec<(String, FetchedMessage)>,
    deletes: Vec<String>,
    queries: Vec<SearchQuery>,
    fail_listing: bool,
    fail_fetch: Vec<String>,
    reject_login: bool,
}

/// Shared mailbox contents; clones see the same messages.
#[derive(Debug, Clone, Default)]
pub struct FakeMailbox {
    inner: Arc<Mutex<MailboxInner>>,
}

impl FakeMailbox {
    pub fn deliver(&self, from: &str, message: FetchedMessage) {
        self.lock().messages.push((from.to_string(), message));
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    /// Makes fetching message `id` fail as if the connection dropped.
    pub fn fail_fetch_of(&self, id: &str) {
        self.lock().fail_fetch.push(id.to_string());
    }

    /// Makes the server refuse the account's credentials.
    pub fn set_reject_login(&self, reject: bool) {
        self.lock().reject_login = reject;
    }

    /// Ids passed to `delete_message`, in call order.
    pub fn deletes(&self) -> Vec<String> {
        self.lock().deletes.clone()
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.lock().queries.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().messages.iter().any(|(_, m)| m.id == id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MailboxInner> {
        self.inner.lock().unwrap()
    }
}

/// Backend over a [`FakeMailbox`]. Listing filters by sender and received
/// time the way a server would.
pub struct FakeBackend {
    mailbox: FakeMailbox,
}

impl FakeBackend {
    pub fn new(mailbox: FakeMailbox) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl PartSource for FakeBackend {
    async fn retrieve_part(
        &mut self,
        _message: &FetchedMessage,
        part: &MessagePart,
    ) -> std::result::Result<Vec<u8>, ExtractionError> {
        inline_body(part)
    }

    fn decode(&self, raw: Vec<u8>) -> std::result::Result<Vec<u8>, ExtractionError> {
        if raw == CORRUPT {
            Err(ExtractionError::Decode("corrupt part".to_string()))
        } else {
            Ok(raw)
        }
    }
}

#[async_trait]
impl MailBackend for FakeBackend {
    async fn list_messages(&mut self, query: &SearchQuery) -> Result<Vec<MessageRef>> {
        let mut inner = self.mailbox.lock();
        inner.queries.push(query.clone());
        if inner.reject_login {
            return Err(FetchError::Auth(AuthError::Login {
                server: "imap.example.com:993".to_string(),
                reason: "NO [AUTHENTICATIONFAILED] Invalid credentials".to_string(),
            }));
        }
        if inner.fail_listing {
            return Err(FetchError::Request("mailbox unavailable".to_string()));
        }

        Ok(inner
            .messages
            .iter()
            .filter(|(from, _)| query.senders.iter().any(|s| s == from))
            .filter(|(_, m)| match (query.received_after, m.received_at) {
                (Some(bound), Some(received)) => received >= bound,
                _ => true,
            })
            .map(|(_, m)| MessageRef { id: m.id.clone() })
            .collect())
    }

    async fn fetch_message(&mut self, message: &MessageRef) -> Result<FetchedMessage> {
        let inner = self.mailbox.lock();
        if inner.fail_fetch.contains(&message.id) {
            return Err(FetchError::Request(format!(
                "connection reset while fetching {}",
                message.id
            )));
        }
        inner
            .messages
            .iter()
            .find(|(_, m)| m.id == message.id)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| FetchError::Protocol(format!("no message {}", message.id)))
    }

    async fn delete_message(&mut self, message: &FetchedMessage) -> Result<()> {
        let mut inner = self.mailbox.lock();
        inner.deletes.push(message.id.clone());
        inner.messages.retain(|(_, m)| m.id != message.id);
        Ok(())
    }
}

/// Provider that runs the shared fetch algorithm over a [`FakeBackend`].
pub struct FakeProvider {
    backend: FakeBackend,
    extractor: Extractor,
    senders: Vec<String>,
    skew: chrono::Duration,
}

#[async_trait]
impl MailProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch_attachments(
        &mut self,
        after: DateTime<Utc>,
        delete_fetched: bool,
    ) -> Result<Vec<ExtractedFile>> {
        let query = SearchQuery::build(after, &self.senders, delete_fetched, self.skew);
        fetch_batch(&mut self.backend, &self.extractor, &query, delete_fetched).await
    }
}

#[derive(Clone)]
pub struct FakeFactory {
    mailbox: FakeMailbox,
    extractor: Extractor,
    senders: Vec<String>,
    skew: chrono::Duration,
    builds: Arc<AtomicUsize>,
}

impl FakeFactory {
    pub fn new(
        mailbox: FakeMailbox,
        extractor: Extractor,
        senders: Vec<String>,
        skew: chrono::Duration,
    ) -> Self {
        Self {
            mailbox,
            extractor,
            senders,
            skew,
            builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn provider(&self) -> FakeProvider {
        FakeProvider {
            backend: FakeBackend::new(self.mailbox.clone()),
            extractor: self.extractor.clone(),
            senders: self.senders.clone(),
            skew: self.skew,
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderFactory for FakeFactory {
    async fn build(&self) -> std::result::Result<Box<dyn MailProvider>, AuthError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.provider()))
    }
}

/// Provider that needs a valid access token before every fetch, the way the
/// real backends do.
pub struct TokenGatedProvider {
    credentials: Arc<Credentials>,
    inner: FakeProvider,
}

#[async_trait]
impl MailProvider for TokenGatedProvider {
    fn name(&self) -> &str {
        "fake-oauth"
    }

    async fn fetch_attachments(
        &mut self,
        after: DateTime<Utc>,
        delete_fetched: bool,
    ) -> Result<Vec<ExtractedFile>> {
        self.credentials.access_token().await?;
        self.inner.fetch_attachments(after, delete_fetched).await
    }
}

/// Factory that initializes the shared credentials on every build.
pub struct TokenGatedFactory {
    credentials: Arc<Credentials>,
    inner: FakeFactory,
}

impl TokenGatedFactory {
    pub fn new(credentials: Arc<Credentials>, inner: FakeFactory) -> Self {
        Self { credentials, inner }
    }
}

#[async_trait]
impl ProviderFactory for TokenGatedFactory {
    async fn build(&self) -> std::result::Result<Box<dyn MailProvider>, AuthError> {
        self.credentials.initialize().await?;
        self.inner.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TokenGatedProvider {
            credentials: self.credentials.clone(),
            inner: self.inner.provider(),
        }))
    }
}

/// Clock that only moves when told to; sleeping advances it.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(chrono::Duration::from_std(duration).unwrap());
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    Accept,
    /// Files whose content starts with `OFFLINE` fail as a single job.
    FailOffline,
    NoDefaultPrinter,
}

/// Print sink that records the content of every file it is handed.
#[derive(Clone)]
pub struct RecordingSink {
    mode: SinkMode,
    printed: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSink {
    pub fn new(mode: SinkMode) -> Self {
        Self {
            mode,
            printed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn printed(&self) -> Vec<Vec<u8>> {
        self.printed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PrintSink for RecordingSink {
    async fn print(&self, file: &Path) -> std::result::Result<(), PrintError> {
        let content = std::fs::read(file).unwrap();
        match self.mode {
            SinkMode::NoDefaultPrinter => Err(PrintError::NoDefaultPrinter {
                detail: "lp: Error - No default destination.".to_string(),
            }),
            SinkMode::FailOffline if content.starts_with(b"OFFLINE") => Err(PrintError::JobFailed {
                file: file.to_path_buf(),
                printer: "the default printer".to_string(),
                detail: "printer is offline".to_string(),
            }),
            _ => {
                self.printed.lock().unwrap().push(content);
                Ok(())
            }
        }
    }
}

/// Token issuer that counts interactive grants and successful refreshes.
#[derive(Default)]
pub struct FakeIssuer {
    pub grants: AtomicUsize,
    pub refreshes: AtomicUsize,
    /// While set, refreshing fails as if the token endpoint were unreachable.
    pub refresh_offline: AtomicBool,
}

#[async_trait]
impl TokenIssuer for FakeIssuer {
    async fn authorize_interactively(&self) -> std::result::Result<Token, AuthError> {
        let n = self.grants.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token::new(format!("interactive-{}", n), "Bearer")
            .with_refresh_token("refresh-token")
            .with_expires_at(Utc::now() + chrono::Duration::hours(1)))
    }

    async fn refresh(&self, token: &Token) -> std::result::Result<Token, AuthError> {
        if self.refresh_offline.load(Ordering::SeqCst) {
            return Err(AuthError::Refresh(
                "Token refresh failed: error sending request: connection refused".to_string(),
            ));
        }
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut next = token.clone();
        next.access_token = format!("refreshed-{}", n);
        next.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        Ok(next)
    }
}
