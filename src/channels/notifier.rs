//! Outbound confirmation email — SMTP via lettre, or log-only.
//!
//! Both notifications are best effort. The engine logs and drops any error.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::NotifyError;
use crate::pipeline::thread::reply_subject;
use crate::tickets::TicketHandle;

/// Sends ticket notifications to the customer.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A new ticket was created from the customer's message.
    async fn notify_created(
        &self,
        ticket: &TicketHandle,
        recipient_address: &str,
        recipient_name: &str,
    ) -> Result<(), NotifyError>;

    /// The customer's message was appended to an existing ticket.
    async fn notify_reply_added(
        &self,
        ticket: &TicketHandle,
        recipient_address: &str,
        recipient_name: &str,
    ) -> Result<(), NotifyError>;
}

/// Subject and body for the "ticket created" confirmation.
pub fn created_email(ticket: &TicketHandle, recipient_name: &str) -> (String, String) {
    let body = format!(
        "Hello {recipient_name},\n\n\
         Thanks for contacting support. Your request has been logged as {reference}.\n\n\
         To add information, reply to this email and keep [#{reference}] in the subject line.\n",
        reference = ticket.reference,
    );
    (reply_subject(&ticket.subject, &ticket.reference), body)
}

/// Subject and body for the "reply added" confirmation.
pub fn reply_added_email(ticket: &TicketHandle, recipient_name: &str) -> (String, String) {
    let body = format!(
        "Hello {recipient_name},\n\n\
         Your message has been added to ticket {reference}. Current status: {status}.\n",
        reference = ticket.reference,
        status = ticket.status,
    );
    (reply_subject(&ticket.subject, &ticket.reference), body)
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Sends notifications through an SMTP relay.
pub struct SmtpNotifier {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from = config
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::Address {
                address: config.from_address.clone(),
                reason: e.to_string(),
            })?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| NotifyError::Send(format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self { transport, from })
    }

    async fn send(
        &self,
        to: &str,
        name: &str,
        subject: String,
        body: String,
    ) -> Result<(), NotifyError> {
        let address = to
            .parse::<lettre::Address>()
            .map_err(|e| NotifyError::Address {
                address: to.to_string(),
                reason: e.to_string(),
            })?;
        let recipient = Mailbox::new(Some(name.to_string()), address);

        let email = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .body(body)
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| NotifyError::Send(format!("SMTP task panicked: {e}")))?
            .map_err(|e| NotifyError::Send(e.to_string()))?;

        info!(to = %to, "Notification email sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify_created(
        &self,
        ticket: &TicketHandle,
        recipient_address: &str,
        recipient_name: &str,
    ) -> Result<(), NotifyError> {
        let (subject, body) = created_email(ticket, recipient_name);
        self.send(recipient_address, recipient_name, subject, body).await
    }

    async fn notify_reply_added(
        &self,
        ticket: &TicketHandle,
        recipient_address: &str,
        recipient_name: &str,
    ) -> Result<(), NotifyError> {
        let (subject, body) = reply_added_email(ticket, recipient_name);
        self.send(recipient_address, recipient_name, subject, body).await
    }
}

// ── Log only ────────────────────────────────────────────────────────

/// Used when no SMTP relay is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_created(
        &self,
        ticket: &TicketHandle,
        recipient_address: &str,
        _recipient_name: &str,
    ) -> Result<(), NotifyError> {
        info!(
            reference = %ticket.reference,
            to = %recipient_address,
            "Ticket created (SMTP disabled, notification not sent)"
        );
        Ok(())
    }

    async fn notify_reply_added(
        &self,
        ticket: &TicketHandle,
        recipient_address: &str,
        _recipient_name: &str,
    ) -> Result<(), NotifyError> {
        info!(
            reference = %ticket.reference,
            to = %recipient_address,
            "Reply added (SMTP disabled, notification not sent)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use uuid::Uuid;

    use super::*;
    use crate::pipeline::thread::{ThreadDecision, classify};
    use crate::tickets::TicketStatus;

    fn handle(subject: &str, status: TicketStatus) -> TicketHandle {
        TicketHandle {
            id: Uuid::new_v4(),
            reference: "TKT-000042".into(),
            subject: subject.into(),
            status,
            customer_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn created_email_subject_round_trips_through_classifier() {
        let (subject, body) = created_email(&handle("Cannot login", TicketStatus::Open), "Ann");
        assert_eq!(subject, "Cannot login [#TKT-000042]");
        assert_eq!(
            classify(&format!("Re: {subject}")),
            ThreadDecision::ExistingThread {
                ticket_reference: "TKT-000042".into()
            }
        );
        assert!(body.starts_with("Hello Ann,"));
        assert!(body.contains("TKT-000042"));
    }

    #[test]
    fn reply_email_mentions_status() {
        let (_, body) = reply_added_email(&handle("Broken", TicketStatus::Open), "Ann");
        assert!(body.contains("Current status: open"));
    }

    #[test]
    fn smtp_notifier_rejects_bad_from_address() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "user".into(),
            password: SecretString::from("pass"),
            from_address: "not an address".into(),
        };
        assert!(matches!(
            SmtpNotifier::new(&config),
            Err(NotifyError::Address { .. })
        ));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let ticket = handle("Broken", TicketStatus::Open);
        LogNotifier
            .notify_created(&ticket, "a@example.com", "A")
            .await
            .unwrap();
        LogNotifier
            .notify_reply_added(&ticket, "a@example.com", "A")
            .await
            .unwrap();
    }
}
