//! Mail I/O — the inbound mailbox, message decoding and outbound notifications.

pub mod email_types;
pub mod imap;
pub mod mailbox;
pub mod notifier;

pub use email_types::{Attachment, BodyKind, IncomingMessage, decode};
pub use imap::{ImapMailbox, ImapSession};
pub use mailbox::{MailboxClient, MessageId};
pub use notifier::{LogNotifier, Notifier, SmtpNotifier};
