//! Persistence boundaries the ingestion engine writes through.
//!
//! The helpdesk's REST layer shares the same backend; the engine only needs
//! the create/find/update operations declared here.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tickets::{
    AttachmentMeta, AuthorKind, Customer, CustomerId, NewTicket, Reply, ReplyAppended, Ticket,
    TicketHandle, TicketStatus,
};

/// Resolves sender addresses to customer identities.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Return the customer for `address`, creating it on first contact.
    ///
    /// Idempotent per normalized address: repeated calls return the same id.
    async fn resolve_or_create(
        &self,
        address: &str,
        display_name: &str,
    ) -> Result<CustomerId, DatabaseError>;

    /// Look up a customer by address without creating one.
    async fn find_by_email(&self, address: &str) -> Result<Option<Customer>, DatabaseError>;
}

/// Ticket persistence.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Create a ticket from an inbound message and assign its reference.
    async fn create_from_message(&self, ticket: NewTicket) -> Result<TicketHandle, DatabaseError>;

    /// Append a customer reply to the ticket with the given reference.
    ///
    /// Returns `Ok(None)` when no such ticket exists. A `Closed` ticket is
    /// moved back to `Open` as part of the append.
    async fn append_reply(
        &self,
        reference: &str,
        customer_id: CustomerId,
        body: &str,
        source_key: Option<&str>,
    ) -> Result<Option<ReplyAppended>, DatabaseError>;

    /// The ticket a previously ingested message was written to, if any.
    async fn find_by_source_key(&self, key: &str) -> Result<Option<TicketHandle>, DatabaseError>;

    /// Load a ticket by reference.
    async fn get_ticket(&self, reference: &str) -> Result<Option<Ticket>, DatabaseError>;

    /// Replies on a ticket, oldest first.
    async fn list_replies(&self, reference: &str) -> Result<Vec<Reply>, DatabaseError>;

    /// Set a ticket's status (agent-side transition).
    async fn set_status(&self, reference: &str, status: TicketStatus)
    -> Result<(), DatabaseError>;

    /// Append a reply with an explicit author kind.
    async fn add_reply(
        &self,
        reference: &str,
        author_kind: AuthorKind,
        author_id: Uuid,
        body: &str,
    ) -> Result<Option<ReplyAppended>, DatabaseError>;
}

/// Receives decoded attachment bytes once the owning ticket exists.
#[async_trait]
pub trait AttachmentSink: Send + Sync {
    async fn store(
        &self,
        ticket: &TicketHandle,
        meta: &AttachmentMeta,
        bytes: &[u8],
    ) -> Result<(), DatabaseError>;
}

/// Sink that drops attachment bytes; metadata still travels with the ticket.
pub struct NoopAttachmentSink;

#[async_trait]
impl AttachmentSink for NoopAttachmentSink {
    async fn store(
        &self,
        ticket: &TicketHandle,
        meta: &AttachmentMeta,
        _bytes: &[u8],
    ) -> Result<(), DatabaseError> {
        tracing::debug!(
            reference = %ticket.reference,
            name = %meta.name,
            size = meta.size_bytes,
            "Attachment not persisted (no sink configured)"
        );
        Ok(())
    }
}
