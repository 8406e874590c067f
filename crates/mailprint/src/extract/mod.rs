//! Turns a message's attachment parts into temporary files.

pub mod message;

pub use message::{FetchedMessage, MessagePart, PartBody};

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempPath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Failed to retrieve part: {0}")]
    Retrieve(String),

    #[error("Failed to decode part: {0}")]
    Decode(String),

    #[error("Failed to write attachment to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Part has no retrievable content")]
    Unsupported,
}

/// Backend hooks the extractor needs to get at a part's bytes.
#[async_trait]
pub trait PartSource: Send {
    /// Raw part content in the backend's transport encoding.
    async fn retrieve_part(
        &mut self,
        message: &FetchedMessage,
        part: &MessagePart,
    ) -> Result<Vec<u8>, ExtractionError>;

    /// Converts retrieved bytes into file content.
    fn decode(&self, raw: Vec<u8>) -> Result<Vec<u8>, ExtractionError>;
}

/// Content of an inline part, for backends that have nothing to fetch.
pub fn inline_body(part: &MessagePart) -> Result<Vec<u8>, ExtractionError> {
    match &part.body {
        PartBody::Inline(bytes) => Ok(bytes.clone()),
        PartBody::Remote(_) | PartBody::Empty => Err(ExtractionError::Unsupported),
    }
}

/// An attachment written to disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct ExtractedFile {
    path: TempPath,
    pub original_name: String,
    pub message_id: String,
}

impl ExtractedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file now, reporting failures instead of ignoring them.
    pub fn remove(self) -> std::io::Result<()> {
        self.path.close()
    }
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub files: Vec<ExtractedFile>,
    /// Attachment parts that failed and were left out.
    pub skipped: usize,
}

impl Extraction {
    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }
}

#[derive(Debug, Clone)]
pub struct Extractor {
    download_dir: PathBuf,
}

impl Extractor {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Writes every attachment of `message` to a temp file. A part that cannot
    /// be retrieved, decoded or written is logged and counted in `skipped`;
    /// the rest of the message is still extracted.
    pub async fn extract<S>(&self, source: &mut S, message: &FetchedMessage) -> Extraction
    where
        S: PartSource + ?Sized,
    {
        let mut extraction = Extraction::default();

        for part in message.walk().filter(|p| p.is_attachment()) {
            let filename = part.filename.as_deref().unwrap_or_default();
            match self.materialize(source, message, part).await {
                Ok(file) => {
                    log::debug!(
                        "Extracted '{}' from message {} to {}",
                        filename,
                        message.id,
                        file.path().display()
                    );
                    extraction.files.push(file);
                }
                Err(e) => {
                    log::warn!(
                        "Skipping attachment '{}' of message {}: {}",
                        filename,
                        message.id,
                        e
                    );
                    extraction.skipped += 1;
                }
            }
        }

        extraction
    }

    async fn materialize<S>(
        &self,
        source: &mut S,
        message: &FetchedMessage,
        part: &MessagePart,
    ) -> Result<ExtractedFile, ExtractionError>
    where
        S: PartSource + ?Sized,
    {
        let raw = source.retrieve_part(message, part).await?;
        let content = source.decode(raw)?;

        let original_name = part.filename.clone().unwrap_or_default();
        let extension = file_extension(&original_name, &part.mime_type);
        let write_err = |source: std::io::Error| ExtractionError::Write {
            path: self.download_dir.clone(),
            source,
        };

        std::fs::create_dir_all(&self.download_dir).map_err(write_err)?;
        let mut file = tempfile::Builder::new()
            .prefix("mailprint-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.download_dir)
            .map_err(write_err)?;
        file.write_all(&content).map_err(write_err)?;
        file.flush().map_err(write_err)?;

        Ok(ExtractedFile {
            path: file.into_temp_path(),
            original_name,
            message_id: message.id.clone(),
        })
    }
}

/// Extension for an extracted file: the filename's suffix when it has a sane
/// one, otherwise one known for the MIME type, otherwise `bin`.
pub fn file_extension(filename: &str, mime_type: &str) -> String {
    let sanitized = sanitize_filename(filename);
    if let Some((stem, ext)) = sanitized.rsplit_once('.') {
        if !stem.is_empty()
            && !ext.is_empty()
            && ext.len() <= 10
            && ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return ext.to_ascii_lowercase();
        }
    }

    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| "bin".to_string())
}

/// Replaces anything but alphanumerics, `.`, `-`, `_` and spaces.
fn sanitize_filename(filename: &str) -> String {
    let filename = filename
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();

    filename.trim_matches(|c| c == '.' || c == ' ').to_string()
}
