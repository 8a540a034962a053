//! Ticket, reply and customer types shared between the engine and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every human-readable ticket reference.
pub const REFERENCE_PREFIX: &str = "TKT-";

/// Opaque customer identifier handed out by the directory.
pub type CustomerId = Uuid;

/// Ticket lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    #[default]
    Open,
    Pending,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

/// Ticket category. Mail-created tickets use the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketType {
    #[default]
    Question,
    Incident,
    Problem,
    Task,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Incident => "incident",
            Self::Problem => "problem",
            Self::Task => "task",
        }
    }
}

/// Ticket priority. Mail-created tickets use the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// Who wrote a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorKind {
    Customer,
    Agent,
}

impl AuthorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
        }
    }
}

/// Attachment metadata recorded alongside a ticket or reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: usize,
}

/// What the engine needs back after a write: enough to notify and log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketHandle {
    pub id: Uuid,
    /// Human-readable reference, e.g. `TKT-000042`.
    pub reference: String,
    pub subject: String,
    pub status: TicketStatus,
    pub customer_id: CustomerId,
}

/// Input for creating a ticket from an inbound message.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub customer_id: CustomerId,
    pub subject: String,
    pub body: String,
    pub channel: String,
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    pub attachments: Vec<AttachmentMeta>,
    /// Idempotency key, normally the `Message-ID` header.
    pub source_key: Option<String>,
}

/// Result of appending a reply to an existing ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAppended {
    pub ticket: TicketHandle,
    pub reply_id: Uuid,
    /// True when the ticket was `Closed` and the reply moved it back to `Open`.
    pub reopened: bool,
}

/// Full ticket record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub reference: String,
    pub subject: String,
    pub body: String,
    pub status: TicketStatus,
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    pub channel: String,
    pub customer_id: CustomerId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentMeta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn handle(&self) -> TicketHandle {
        TicketHandle {
            id: self.id,
            reference: self.reference.clone(),
            subject: self.subject.clone(),
            status: self.status,
            customer_id: self.customer_id,
        }
    }
}

/// A reply on a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub author_kind: AuthorKind,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A customer known to the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub email: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Format a ticket sequence number as its reference, zero padded to six digits.
pub fn format_reference(seq: i64) -> String {
    format!("{REFERENCE_PREFIX}{seq:06}")
}

/// Parse a reference back to its sequence number.
///
/// `None` for anything that is not `TKT-` followed by digits, or that does
/// not fit a sequence number.
pub fn parse_reference(reference: &str) -> Option<i64> {
    let digits = reference.strip_prefix(REFERENCE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_is_zero_padded() {
        assert_eq!(format_reference(42), "TKT-000042");
        assert_eq!(format_reference(1_234_567), "TKT-1234567");
    }

    #[test]
    fn parse_reference_accepts_padded_and_unpadded() {
        assert_eq!(parse_reference("TKT-000042"), Some(42));
        assert_eq!(parse_reference("TKT-42"), Some(42));
    }

    #[test]
    fn parse_reference_rejects_malformed() {
        assert_eq!(parse_reference("TKT-"), None);
        assert_eq!(parse_reference("tkt-42"), None);
        assert_eq!(parse_reference("TKT-4a"), None);
        assert_eq!(parse_reference("TKT-+42"), None);
        assert_eq!(parse_reference("TKT-99999999999999999999999"), None);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TicketStatus::Open,
            TicketStatus::Pending,
            TicketStatus::Resolved,
            TicketStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<TicketStatus>().unwrap(), status);
        }
        assert!("archived".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TicketStatus::Closed).unwrap();
        assert_eq!(json, "\"closed\"");
    }
}
