//! Inbound email types and the RFC 5322 decoder.

use mail_parser::{MessageParser, MimeHeaders, PartType};

use crate::error::IngestError;
use crate::tickets::AttachmentMeta;

/// Body used when a message has neither a text nor an HTML part.
pub const NO_CONTENT_PLACEHOLDER: &str = "(no readable content)";

/// Which part the body text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Plain,
    /// Verbatim HTML; converted to text by the sanitizer.
    Html,
    /// No readable part, body is the placeholder.
    Empty,
}

/// A decoded attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: usize,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn meta(&self) -> AttachmentMeta {
        AttachmentMeta {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// A decoded inbound message, alive for one pass through the engine.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Lowercased sender address.
    pub sender_address: String,
    pub sender_display_name: String,
    /// May be empty.
    pub subject: String,
    /// Body before sanitization.
    pub body_text: String,
    pub body_kind: BodyKind,
    pub attachments: Vec<Attachment>,
    /// `Message-ID` header, used as the ingest idempotency key.
    pub message_key: Option<String>,
}

/// Decode raw message bytes.
pub fn decode(raw: &[u8]) -> Result<IncomingMessage, IngestError> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(IngestError::Parse("empty message".into()));
    }

    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| IngestError::Parse("not an RFC 5322 message".into()))?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .ok_or_else(|| IngestError::Parse("missing From header".into()))?;

    let sender_address = from
        .address()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| a.contains('@'))
        .ok_or_else(|| IngestError::Parse("From header has no email address".into()))?;

    let sender_display_name = from
        .name()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| local_part(&sender_address).to_string());

    let subject = parsed.subject().map(|s| s.trim().to_string()).unwrap_or_default();
    let (body_text, body_kind) = extract_body(&parsed);
    let attachments = extract_attachments(&parsed);
    let message_key = parsed
        .message_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    Ok(IncomingMessage {
        sender_address,
        sender_display_name,
        subject,
        body_text,
        body_kind,
        attachments,
        message_key,
    })
}

/// The portion of an address before `@`.
pub fn local_part(address: &str) -> &str {
    address.split('@').next().unwrap_or(address)
}

/// Plain text first, then HTML verbatim, then the placeholder.
fn extract_body(parsed: &mail_parser::Message) -> (String, BodyKind) {
    let candidates = [parsed.text_part(0), parsed.html_part(0)];

    for part in candidates.iter().flatten() {
        if let PartType::Text(text) = &part.body {
            return (text.to_string(), BodyKind::Plain);
        }
    }
    for part in candidates.iter().flatten() {
        if let PartType::Html(html) = &part.body {
            return (html.to_string(), BodyKind::Html);
        }
    }
    (NO_CONTENT_PLACEHOLDER.to_string(), BodyKind::Empty)
}

fn extract_attachments(parsed: &mail_parser::Message) -> Vec<Attachment> {
    parsed
        .attachments()
        .enumerate()
        .map(|(i, part)| {
            let name = part
                .attachment_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment-{}", i + 1));
            let mime_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let bytes = part.contents().to_vec();
            Attachment {
                name,
                mime_type,
                size_bytes: bytes.len(),
                bytes,
            }
        })
        .collect()
}
