//! Persistence layer — libSQL-backed customers, tickets and replies.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{LibSqlBackend, normalize_address};
pub use traits::{AttachmentSink, Directory, NoopAttachmentSink, TicketStore};
