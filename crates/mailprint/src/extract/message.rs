use chrono::{DateTime, Utc};

/// A message with its full part tree, as returned by a mail backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub id: String,
    pub received_at: Option<DateTime<Utc>>,
    /// Top-level parts. A single-part message has one entry.
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePart {
    pub filename: Option<String>,
    pub mime_type: String,
    pub body: PartBody,
    pub children: Vec<MessagePart>,
}

/// Where a part's content lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PartBody {
    /// Bytes carried in the message, still in the backend's transport encoding.
    Inline(Vec<u8>),
    /// Content fetched separately by id.
    Remote(String),
    #[default]
    Empty,
}

impl MessagePart {
    pub fn leaf(filename: Option<&str>, mime_type: &str, body: PartBody) -> Self {
        Self {
            filename: filename.map(String::from),
            mime_type: mime_type.to_string(),
            body,
            children: Vec::new(),
        }
    }

    pub fn multipart(mime_type: &str, children: Vec<MessagePart>) -> Self {
        Self {
            filename: None,
            mime_type: mime_type.to_string(),
            body: PartBody::Empty,
            children,
        }
    }

    /// True for parts that name a file and carry content.
    pub fn is_attachment(&self) -> bool {
        self.filename.as_deref().is_some_and(|f| !f.trim().is_empty())
            && !matches!(self.body, PartBody::Empty)
    }
}

impl FetchedMessage {
    /// Depth-first, pre-order iteration over every part.
    pub fn walk(&self) -> PartWalk<'_> {
        PartWalk {
            stack: self.parts.iter().rev().collect(),
        }
    }
}

pub struct PartWalk<'a> {
    stack: Vec<&'a MessagePart>,
}

impl<'a> Iterator for PartWalk<'a> {
    type Item = &'a MessagePart;

    fn next(&mut self) -> Option<Self::Item> {
        let part = self.stack.pop()?;
        self.stack.extend(part.children.iter().rev());
        Some(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_is_depth_first_in_order() {
        let message = FetchedMessage {
            id: "m1".to_string(),
            received_at: None,
            parts: vec![
                MessagePart::multipart(
                    "multipart/alternative",
                    vec![
                        MessagePart::leaf(None, "text/plain", PartBody::Inline(b"hi".to_vec())),
                        MessagePart::leaf(None, "text/html", PartBody::Inline(b"<p>hi</p>".to_vec())),
                    ],
                ),
                MessagePart::leaf(Some("a.pdf"), "application/pdf", PartBody::Remote("att-1".into())),
            ],
        };

        let order: Vec<&str> = message.walk().map(|p| p.mime_type.as_str()).collect();
        assert_eq!(
            order,
            vec!["multipart/alternative", "text/plain", "text/html", "application/pdf"]
        );
    }

    #[test]
    fn test_is_attachment() {
        assert!(MessagePart::leaf(Some("a.pdf"), "application/pdf", PartBody::Remote("x".into()))
            .is_attachment());
        assert!(!MessagePart::leaf(Some("a.pdf"), "application/pdf", PartBody::Empty).is_attachment());
        assert!(!MessagePart::leaf(Some("  "), "application/pdf", PartBody::Inline(vec![1])).is_attachment());
        assert!(!MessagePart::leaf(None, "text/plain", PartBody::Inline(vec![1])).is_attachment());
    }
}
