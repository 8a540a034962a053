//! Mailbox abstraction — a session-oriented source of raw messages.

use async_trait::async_trait;

use crate::error::IngestError;

/// Server-side identifier of a message (an IMAP UID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u32);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mailbox reachable over a stateful, connection-oriented protocol.
///
/// The session is an explicit value: every call borrows it, and `close`
/// consumes it. Implementations hold no connection state of their own, so
/// independent sessions never interfere.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    type Session: Send;

    /// Connect and authenticate. Failures are `IngestError::Connection`.
    async fn open(&self) -> Result<Self::Session, IngestError>;

    /// Unread message ids, in server order. Empty means no new mail.
    async fn list_unseen(&self, session: &mut Self::Session) -> Result<Vec<MessageId>, IngestError>;

    /// Raw RFC 5322 bytes. Must not mark the message as read.
    async fn fetch_raw(
        &self,
        session: &mut Self::Session,
        id: MessageId,
    ) -> Result<Vec<u8>, IngestError>;

    /// Flag the message so it is not listed again.
    async fn mark_consumed(
        &self,
        session: &mut Self::Session,
        id: MessageId,
    ) -> Result<(), IngestError>;

    /// End the session. Errors are logged, never returned.
    async fn close(&self, session: Self::Session);
}
