//! IMAP backend: one TLS session per fetch, password or XOAUTH2 login.

use std::sync::Arc;

use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use futures_util::TryStreamExt;
use log::{debug, info, warn};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use secrecy::{ExposeSecret, SecretString};

use crate::auth::{AuthError, Credentials, GOOGLE_MAIL_SCOPE};
use crate::config::{ImapAuth, ImapSettings};
use crate::context::AppContext;
use crate::extract::{
    inline_body, ExtractedFile, ExtractionError, Extractor, FetchedMessage, MessagePart, PartBody,
    PartSource,
};

use super::{
    fetch_batch, FetchError, MailBackend, MailProvider, MessageRef, ProviderKind, Result,
    SearchQuery,
};

type AsyncTcpStream = async_io::Async<std::net::TcpStream>;
type TlsStream = async_native_tls::TlsStream<AsyncTcpStream>;

/// Nested multiparts deeper than this are not descended into.
const MAX_PART_DEPTH: usize = 32;

struct XOAuth2Authenticator {
    response: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _data: &[u8]) -> Self::Response {
        std::mem::take(&mut self.response)
    }
}

/// Renders a search as IMAP `UID SEARCH` criteria. `SINCE` only has day
/// granularity, so the exact bound is applied client-side.
pub fn imap_search(query: &SearchQuery) -> String {
    let mut criteria = Vec::new();
    if let Some(after) = query.received_after {
        criteria.push(format!("SINCE {}", after.format("%-d-%b-%Y")));
    }

    let from: Vec<String> = query
        .senders
        .iter()
        .map(|s| format!("FROM {}", quote(s)))
        .collect();
    if let Some(senders) = from
        .iter()
        .rev()
        .cloned()
        .reduce(|acc, term| format!("OR {} {}", term, acc))
    {
        criteria.push(if from.len() > 1 {
            format!("({})", senders)
        } else {
            senders
        });
    }

    if criteria.is_empty() {
        "ALL".to_string()
    } else {
        criteria.join(" ")
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Builds the part tree of a raw RFC 822 message. Bodies are already
/// transfer-decoded; attached messages are not descended into.
pub fn parse_message(
    id: &str,
    raw: &[u8],
    received_at: Option<DateTime<Utc>>,
) -> Result<FetchedMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| FetchError::Parse(format!("message {} is not valid MIME", id)))?;

    let received_at = received_at.or_else(|| {
        message
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
    });

    let parts = if message.parts.is_empty() {
        Vec::new()
    } else {
        vec![convert_part(&message.parts, 0, 0)]
    };

    Ok(FetchedMessage {
        id: id.to_string(),
        received_at,
        parts,
    })
}

fn convert_part(parts: &[mail_parser::MessagePart<'_>], index: usize, depth: usize) -> MessagePart {
    let Some(part) = parts.get(index) else {
        return MessagePart::default();
    };

    let mime_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| "text/plain".to_string())
        .to_ascii_lowercase();
    let filename = part.attachment_name();

    match &part.body {
        PartType::Multipart(children) => {
            let children = if depth >= MAX_PART_DEPTH {
                warn!("MIME tree deeper than {} levels, truncating", MAX_PART_DEPTH);
                Vec::new()
            } else {
                children
                    .iter()
                    .map(|child| convert_part(parts, *child as usize, depth + 1))
                    .collect()
            };
            MessagePart::multipart(&mime_type, children)
        }
        PartType::Binary(data) | PartType::InlineBinary(data) => {
            MessagePart::leaf(filename, &mime_type, PartBody::Inline(data.to_vec()))
        }
        PartType::Text(text) | PartType::Html(text) => {
            MessagePart::leaf(filename, &mime_type, PartBody::Inline(text.as_bytes().to_vec()))
        }
        PartType::Message(_) => MessagePart::leaf(filename, &mime_type, PartBody::Empty),
    }
}

/// How the provider logs in.
enum ImapLogin {
    Password(SecretString),
    OAuth2(Arc<Credentials>),
}

/// An open, authenticated session with the folder selected.
struct ImapBackend {
    session: Session<TlsStream>,
    folder: String,
}

impl ImapBackend {
    async fn connect(settings: &ImapSettings, login: &ImapLogin, writable: bool) -> Result<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);
        debug!("Connecting to IMAP server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| FetchError::ConnectionFailed(format!("{}: {}", addr, e)))?
            .next()
            .ok_or_else(|| FetchError::ConnectionFailed(format!("{}: no address", addr)))?;
        let tcp_stream = AsyncTcpStream::connect(socket_addr)
            .await
            .map_err(|e| FetchError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        let tls_stream = TlsConnector::new()
            .connect(&settings.host, tcp_stream)
            .await?;
        let client = async_imap::Client::new(tls_stream);

        let rejected = |e: async_imap::error::Error| {
            FetchError::Auth(AuthError::Login {
                server: addr.clone(),
                reason: e.to_string(),
            })
        };
        let mut session = match login {
            ImapLogin::Password(password) => client
                .login(&settings.username, password.expose_secret())
                .await
                .map_err(|(e, _)| rejected(e))?,
            ImapLogin::OAuth2(credentials) => {
                let token = credentials.access_token().await?;
                let response = STANDARD.encode(format!(
                    "user={}\x01auth=Bearer {}\x01\x01",
                    settings.username,
                    token.expose_secret()
                ));
                match client
                    .authenticate("XOAUTH2", XOAuth2Authenticator { response })
                    .await
                {
                    Ok(session) => session,
                    Err((e, _)) => {
                        credentials.invalidate().await;
                        return Err(rejected(e));
                    }
                }
            }
        };

        let selected = if writable {
            session.select(&settings.folder).await
        } else {
            session.examine(&settings.folder).await
        };
        if let Err(e) = selected {
            if let Err(logout) = session.logout().await {
                debug!("IMAP logout after a failed select failed: {}", logout);
            }
            return Err(match e {
                async_imap::error::Error::No(_) => {
                    FetchError::FolderNotFound(settings.folder.clone())
                }
                other => FetchError::Protocol(other.to_string()),
            });
        }

        Ok(Self {
            session,
            folder: settings.folder.clone(),
        })
    }

    async fn logout(mut self) {
        if let Err(e) = self.session.logout().await {
            debug!("IMAP logout failed: {}", e);
        }
    }

    fn uid(message_id: &str) -> Result<u32> {
        message_id
            .parse()
            .map_err(|_| FetchError::Protocol(format!("invalid UID '{}'", message_id)))
    }
}

/// Part access for trees built by [`parse_message`]: every body is inline
/// and already transfer-decoded, so nothing goes back to the server.
struct ParsedParts;

#[async_trait]
impl PartSource for ParsedParts {
    async fn retrieve_part(
        &mut self,
        _message: &FetchedMessage,
        part: &MessagePart,
    ) -> std::result::Result<Vec<u8>, ExtractionError> {
        inline_body(part)
    }

    fn decode(&self, raw: Vec<u8>) -> std::result::Result<Vec<u8>, ExtractionError> {
        Ok(raw)
    }
}

#[async_trait]
impl PartSource for ImapBackend {
    async fn retrieve_part(
        &mut self,
        message: &FetchedMessage,
        part: &MessagePart,
    ) -> std::result::Result<Vec<u8>, ExtractionError> {
        ParsedParts.retrieve_part(message, part).await
    }

    fn decode(&self, raw: Vec<u8>) -> std::result::Result<Vec<u8>, ExtractionError> {
        ParsedParts.decode(raw)
    }
}

#[async_trait]
impl MailBackend for ImapBackend {
    async fn list_messages(&mut self, query: &SearchQuery) -> Result<Vec<MessageRef>> {
        let criteria = imap_search(query);
        debug!("Searching {} with: {}", self.folder, criteria);

        let mut uids: Vec<u32> = self
            .session
            .uid_search(&criteria)
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?
            .into_iter()
            .collect();
        uids.sort_unstable();

        Ok(uids
            .into_iter()
            .map(|uid| MessageRef {
                id: uid.to_string(),
            })
            .collect())
    }

    async fn fetch_message(&mut self, message: &MessageRef) -> Result<FetchedMessage> {
        let uid = Self::uid(&message.id)?;
        let fetches: Vec<_> = self
            .session
            .uid_fetch(uid.to_string(), "(UID INTERNALDATE BODY.PEEK[])")
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?;

        let fetch = fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .or_else(|| fetches.first())
            .ok_or_else(|| FetchError::Protocol(format!("message with UID {} not found", uid)))?;
        let body = fetch
            .body()
            .ok_or_else(|| FetchError::Protocol(format!("message {} has no body", uid)))?;
        let received_at = fetch.internal_date().map(|d| d.with_timezone(&Utc));

        parse_message(&message.id, body, received_at)
    }

    async fn delete_message(&mut self, message: &FetchedMessage) -> Result<()> {
        let uid = Self::uid(&message.id)?;
        let _: Vec<_> = self
            .session
            .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?;
        let _: Vec<_> = self
            .session
            .expunge()
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?;
        debug!("Deleted message {} from {}", uid, self.folder);
        Ok(())
    }
}

pub struct ImapProvider {
    settings: ImapSettings,
    login: ImapLogin,
    extractor: Extractor,
    senders: Vec<String>,
    skew: Duration,
}

impl ImapProvider {
    pub async fn initialize(
        ctx: &AppContext,
        senders: &[String],
    ) -> std::result::Result<Self, AuthError> {
        let settings = ctx
            .config
            .imap
            .clone()
            .ok_or_else(|| AuthError::MissingCredentials {
                what: "IMAP account".to_string(),
                location: "the `imap` block of config.json".to_string(),
                reason: "no IMAP settings".to_string(),
            })?;

        let login = match settings.auth {
            ImapAuth::Password => {
                let password =
                    settings
                        .password
                        .resolve()
                        .map_err(|e| AuthError::MissingCredentials {
                            what: "IMAP password".to_string(),
                            location: settings.password.describe(),
                            reason: e.to_string(),
                        })?;
                ImapLogin::Password(password)
            }
            ImapAuth::Oauth2 => {
                let credentials =
                    Credentials::google(ctx, ProviderKind::Imap.name(), &[GOOGLE_MAIL_SCOPE])?;
                credentials.initialize().await?;
                ImapLogin::OAuth2(Arc::new(credentials))
            }
        };

        // Log in once so bad credentials surface now rather than every cycle
        ImapBackend::connect(&settings, &login, false)
            .await
            .map_err(|e| startup_error(&settings, e))?
            .logout()
            .await;

        info!(
            "IMAP provider ready for {}@{}:{} ({})",
            settings.username, settings.host, settings.port, settings.folder
        );
        Ok(Self {
            settings,
            login,
            extractor: ctx.extractor(),
            senders: senders.to_vec(),
            skew: ctx.query_skew(),
        })
    }
}

/// Classifies a failed first login. Network trouble stays retryable; a
/// missing folder is a settings problem.
fn startup_error(settings: &ImapSettings, err: FetchError) -> AuthError {
    match err {
        FetchError::Auth(e) => e,
        FetchError::FolderNotFound(folder) => AuthError::MissingCredentials {
            what: "IMAP folder".to_string(),
            location: "`imap.folder` in config.json".to_string(),
            reason: format!("the server has no folder '{}'", folder),
        },
        other => AuthError::Unreachable {
            server: format!("{}:{}", settings.host, settings.port),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl MailProvider for ImapProvider {
    fn name(&self) -> &str {
        ProviderKind::Imap.name()
    }

    async fn fetch_attachments(
        &mut self,
        after: DateTime<Utc>,
        delete_fetched: bool,
    ) -> Result<Vec<ExtractedFile>> {
        let query = SearchQuery::build(after, &self.senders, delete_fetched, self.skew);
        let mut backend = ImapBackend::connect(&self.settings, &self.login, delete_fetched).await?;
        let result = fetch_batch(&mut backend, &self.extractor, &query, delete_fetched).await;
        backend.logout().await;
        result
    }
}
