//! Gmail REST API backend.

use std::sync::Arc;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use reqwest::{Client, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::error::{FetchError, Result};
use super::{fetch_batch, MailBackend, MailProvider, MessageRef, ProviderKind, SearchQuery};
use crate::auth::oauth::{create_http_client, sanitize_error_body};
use crate::auth::{AuthError, Credentials, GMAIL_MODIFY_SCOPE};
use crate::context::AppContext;
use crate::extract::{
    inline_body, ExtractedFile, ExtractionError, Extractor, FetchedMessage, MessagePart, PartBody,
    PartSource,
};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const PAGE_SIZE: &str = "100";

/// Gmail sends base64url, with or without padding.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Renders the Gmail search syntax for `query`.
pub fn gmail_query(query: &SearchQuery) -> String {
    let mut terms = Vec::new();
    if !query.senders.is_empty() {
        terms.push(format!("from:({})", query.senders.join(" OR ")));
    }
    terms.push("has:attachment".to_string());
    if let Some(after) = query.received_after {
        terms.push(format!("after:{}", after.timestamp()));
    }
    terms.join(" ")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ListedMessage>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    /// Milliseconds since the epoch, as a string.
    internal_date: Option<String>,
    payload: Option<GmailPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    attachment_id: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    #[serde(default)]
    data: String,
}

impl GmailPart {
    fn into_part(self) -> MessagePart {
        let body = match self.body {
            Some(GmailBody {
                attachment_id: Some(id),
                ..
            }) if !id.is_empty() => PartBody::Remote(id),
            Some(GmailBody {
                data: Some(data), ..
            }) if !data.is_empty() => PartBody::Inline(data.into_bytes()),
            _ => PartBody::Empty,
        };
        MessagePart {
            filename: Some(self.filename).filter(|f| !f.is_empty()),
            mime_type: self.mime_type,
            body,
            children: self.parts.into_iter().map(GmailPart::into_part).collect(),
        }
    }
}

impl GmailMessage {
    fn into_fetched(self) -> FetchedMessage {
        let received_at = self
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        FetchedMessage {
            id: self.id,
            received_at,
            parts: self.payload.map(GmailPart::into_part).into_iter().collect(),
        }
    }
}

/// Authenticated client for the Gmail API.
pub struct GmailApi {
    http: Client,
    base_url: String,
    credentials: Arc<Credentials>,
}

impl GmailApi {
    pub fn new(credentials: Arc<Credentials>) -> std::result::Result<Self, AuthError> {
        Self::with_base_url(credentials, GMAIL_API_BASE)
    }

    pub fn with_base_url(
        credentials: Arc<Credentials>,
        base_url: impl Into<String>,
    ) -> std::result::Result<Self, AuthError> {
        let http = create_http_client()
            .map_err(|e| AuthError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let token = self.credentials.access_token().await?;
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await?;
        let response = self.check(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }

    async fn post(&self, path: &str) -> Result<()> {
        let token = self.credentials.access_token().await?;
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token.expose_secret())
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate().await;
            return Err(FetchError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                body: sanitize_error_body(&body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PartSource for GmailApi {
    async fn retrieve_part(
        &mut self,
        message: &FetchedMessage,
        part: &MessagePart,
    ) -> std::result::Result<Vec<u8>, ExtractionError> {
        match &part.body {
            PartBody::Remote(attachment_id) => {
                let path = format!("/messages/{}/attachments/{}", message.id, attachment_id);
                let attachment: AttachmentResponse = self
                    .get_json(&path, &[])
                    .await
                    .map_err(|e| ExtractionError::Retrieve(e.to_string()))?;
                Ok(attachment.data.into_bytes())
            }
            _ => inline_body(part),
        }
    }

    fn decode(&self, raw: Vec<u8>) -> std::result::Result<Vec<u8>, ExtractionError> {
        GMAIL_BASE64
            .decode(raw)
            .map_err(|e| ExtractionError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MailBackend for GmailApi {
    async fn list_messages(&mut self, query: &SearchQuery) -> Result<Vec<MessageRef>> {
        let q = gmail_query(query);
        debug!("Gmail search: {}", q);

        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("q", q.as_str()), ("labelIds", "INBOX"), ("maxResults", PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let page: ListResponse = self.get_json("/messages", &params).await?;
            refs.extend(page.messages.into_iter().map(|m| MessageRef { id: m.id }));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(refs)
    }

    async fn fetch_message(&mut self, message: &MessageRef) -> Result<FetchedMessage> {
        let path = format!("/messages/{}", message.id);
        let full: GmailMessage = self.get_json(&path, &[("format", "full")]).await?;
        Ok(full.into_fetched())
    }

    async fn delete_message(&mut self, message: &FetchedMessage) -> Result<()> {
        self.post(&format!("/messages/{}/trash", message.id)).await?;
        debug!("Moved message {} to trash", message.id);
        Ok(())
    }
}

pub struct GmailProvider {
    api: GmailApi,
    extractor: Extractor,
    senders: Vec<String>,
    skew: Duration,
}

impl GmailProvider {
    pub async fn initialize(
        ctx: &AppContext,
        senders: &[String],
    ) -> std::result::Result<Self, AuthError> {
        let credentials =
            Credentials::google(ctx, ProviderKind::Gmail.name(), &[GMAIL_MODIFY_SCOPE])?;
        credentials.initialize().await?;
        let api = GmailApi::new(Arc::new(credentials))?;
        Ok(Self::new(api, ctx.extractor(), senders.to_vec(), ctx.query_skew()))
    }

    pub fn new(api: GmailApi, extractor: Extractor, senders: Vec<String>, skew: Duration) -> Self {
        Self {
            api,
            extractor,
            senders,
            skew,
        }
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn name(&self) -> &str {
        ProviderKind::Gmail.name()
    }

    async fn fetch_attachments(
        &mut self,
        after: DateTime<Utc>,
        delete_fetched: bool,
    ) -> Result<Vec<ExtractedFile>> {
        let query = SearchQuery::build(after, &self.senders, delete_fetched, self.skew);
        fetch_batch(&mut self.api, &self.extractor, &query, delete_fetched).await
    }
}
