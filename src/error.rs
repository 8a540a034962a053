//! Error types for ticket intake.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while pulling a message out of the mailbox and into the store.
///
/// `Connection` is transient and only costs the current poll cycle. Every
/// other variant is local to one message and is caught at the per-message
/// boundary in the engine.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Mailbox connection failed: {0}")]
    Connection(String),

    #[error("Failed to fetch message {id}: {reason}")]
    Fetch { id: String, reason: String },

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Failed to mark message {id} consumed: {reason}")]
    Mark { id: String, reason: String },

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Outbound notification errors. Never propagated past the engine.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("Failed to build email: {0}")]
    Build(String),

    #[error("SMTP send failed: {0}")]
    Send(String),

    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),
}
