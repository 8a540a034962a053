//! Ingestion engine — one mailbox session per cycle, one isolation boundary
//! per message.
//!
//! Cycle: `Idle → Connecting → Listing → Draining → Closing → Idle`.
//! Per message: fetch → decode → intake rules → duplicate check → clean body
//! → classify → resolve customer → create or append → attachments → notify
//! → mark consumed.
//!
//! Any error inside the per-message pipeline becomes a `MessageFailure` and
//! the next message is processed. Failed messages stay unread and are
//! retried next cycle. Notification errors are logged and never fail the
//! message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::channels::email_types::{IncomingMessage, decode};
use crate::channels::mailbox::{MailboxClient, MessageId};
use crate::channels::notifier::Notifier;
use crate::config::IngestConfig;
use crate::error::{IngestError, NotifyError};
use crate::pipeline::rules::IntakeRules;
use crate::pipeline::sanitizer::clean_body;
use crate::pipeline::scheduler::ShutdownSignal;
use crate::pipeline::thread::{FALLBACK_SUBJECT, ThreadDecision, classify};
use crate::store::traits::{AttachmentSink, Directory, NoopAttachmentSink, TicketStore};
use crate::tickets::{NewTicket, TicketHandle, TicketPriority, TicketType};

/// Where the engine is within a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Connecting,
    Listing,
    Draining,
    Closing,
}

/// Step of the per-message pipeline a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Decode,
    Customer,
    Persist,
    Mark,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::Decode => "decode",
            Self::Customer => "customer",
            Self::Persist => "persist",
            Self::Mark => "mark",
        };
        f.write_str(s)
    }
}

/// What happened to a successfully processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// A new ticket was opened.
    Created { reference: String },
    /// Appended to an existing ticket.
    Replied { reference: String, reopened: bool },
    /// Already ingested under the same Message-ID.
    Duplicate { reference: String },
    /// Matched an intake rule; nothing written.
    Ignored { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMessage {
    pub id: MessageId,
    pub disposition: Disposition,
}

/// Structured record of one message that could not be processed.
#[derive(Debug)]
pub struct MessageFailure {
    pub id: MessageId,
    pub stage: Stage,
    pub error: IngestError,
}

/// Result of a cycle that reached the mailbox.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Number of unseen ids the server returned.
    pub listed: usize,
    pub processed: Vec<ProcessedMessage>,
    pub failures: Vec<MessageFailure>,
    /// Draining stopped early because shutdown was requested.
    pub interrupted: bool,
}

impl CycleReport {
    /// Ids that were processed and marked consumed, in processing order.
    pub fn consumed(&self) -> Vec<MessageId> {
        self.processed.iter().map(|p| p.id).collect()
    }

    /// References of tickets created or replied to in this cycle.
    pub fn written_references(&self) -> Vec<&str> {
        self.processed
            .iter()
            .filter_map(|p| match &p.disposition {
                Disposition::Created { reference } | Disposition::Replied { reference, .. } => {
                    Some(reference.as_str())
                }
                Disposition::Duplicate { .. } | Disposition::Ignored { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Another cycle was already running.
    Skipped,
    /// The mailbox could not be opened or listed.
    Aborted { reason: String },
    Completed(CycleReport),
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ingress channel recorded on created tickets.
    pub channel_tag: String,
    /// Address outbound mail is sent from; mail from it is ignored.
    pub from_address: String,
    /// Empty means everyone may open tickets.
    pub allowed_senders: Vec<String>,
    /// Upper bound on one notification attempt.
    pub notify_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            channel_tag: "email".into(),
            from_address: String::new(),
            allowed_senders: Vec::new(),
            notify_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            channel_tag: config.channel_tag.clone(),
            from_address: config.from_address.clone(),
            allowed_senders: config.allowed_senders.clone(),
            notify_timeout: config.notify_timeout,
        }
    }
}

/// Which confirmation to send after a write.
#[derive(Debug, Clone, Copy)]
enum Notice {
    Created,
    ReplyAdded,
}

/// Drives poll cycles against one mailbox.
pub struct IngestionEngine<M: MailboxClient> {
    mailbox: M,
    directory: Arc<dyn Directory>,
    tickets: Arc<dyn TicketStore>,
    notifier: Arc<dyn Notifier>,
    attachments: Arc<dyn AttachmentSink>,
    rules: IntakeRules,
    settings: EngineSettings,
    state: watch::Sender<EngineState>,
    /// Held for the whole cycle; `try_lock` failure means a cycle is running.
    cycle_lock: Mutex<()>,
}

impl<M: MailboxClient> IngestionEngine<M> {
    pub fn new(
        mailbox: M,
        directory: Arc<dyn Directory>,
        tickets: Arc<dyn TicketStore>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        let rules = IntakeRules::default_rules(
            &settings.from_address,
            settings.allowed_senders.clone(),
        );
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            mailbox,
            directory,
            tickets,
            notifier,
            attachments: Arc::new(NoopAttachmentSink),
            rules,
            settings,
            state,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Replace the default no-op attachment sink.
    pub fn with_attachment_sink(mut self, sink: Arc<dyn AttachmentSink>) -> Self {
        self.attachments = sink;
        self
    }

    /// Replace the default intake rules.
    pub fn with_rules(mut self, rules: IntakeRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn mailbox(&self) -> &M {
        &self.mailbox
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }

    /// Run one poll cycle.
    ///
    /// Returns `Skipped` immediately if another cycle holds the session.
    /// Shutdown is checked between messages, never inside one.
    pub async fn run_cycle(&self, shutdown: &ShutdownSignal) -> CycleOutcome {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("Ingestion cycle already running, skipping");
            return CycleOutcome::Skipped;
        };

        self.set_state(EngineState::Connecting);
        let mut session = match self.mailbox.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Mailbox unavailable, retrying next cycle");
                self.set_state(EngineState::Idle);
                return CycleOutcome::Aborted {
                    reason: e.to_string(),
                };
            }
        };

        self.set_state(EngineState::Listing);
        let ids = match self.mailbox.list_unseen(&mut session).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list unseen messages");
                self.close_session(session).await;
                return CycleOutcome::Aborted {
                    reason: e.to_string(),
                };
            }
        };

        let mut report = CycleReport {
            listed: ids.len(),
            ..CycleReport::default()
        };

        if !ids.is_empty() {
            debug!(count = ids.len(), "Unseen messages listed");
            self.set_state(EngineState::Draining);

            for id in ids {
                if shutdown.is_shutdown() {
                    info!(uid = %id, "Shutdown requested, leaving remaining messages for next run");
                    report.interrupted = true;
                    break;
                }

                match self.process_message(&mut session, id).await {
                    Ok(disposition) => {
                        report.processed.push(ProcessedMessage { id, disposition });
                    }
                    Err(failure) => {
                        error!(
                            uid = %failure.id,
                            stage = %failure.stage,
                            error = %failure.error,
                            "Message failed, left unread for retry"
                        );
                        report.failures.push(failure);
                    }
                }
            }
        }

        self.close_session(session).await;

        if report.listed > 0 {
            info!(
                listed = report.listed,
                processed = report.processed.len(),
                failed = report.failures.len(),
                interrupted = report.interrupted,
                "Ingestion cycle complete"
            );
        }
        CycleOutcome::Completed(report)
    }

    async fn close_session(&self, session: M::Session) {
        self.set_state(EngineState::Closing);
        self.mailbox.close(session).await;
        self.set_state(EngineState::Idle);
    }

    /// The per-message isolation boundary.
    async fn process_message(
        &self,
        session: &mut M::Session,
        id: MessageId,
    ) -> Result<Disposition, MessageFailure> {
        let fail = |stage: Stage| move |error: IngestError| MessageFailure { id, stage, error };

        let raw = self
            .mailbox
            .fetch_raw(session, id)
            .await
            .map_err(fail(Stage::Fetch))?;
        let message = decode(&raw).map_err(fail(Stage::Decode))?;

        let disposition = if let Some(reason) = self.rules.evaluate(&message) {
            info!(uid = %id, sender = %message.sender_address, reason = %reason, "Ignoring message");
            Disposition::Ignored { reason }
        } else if let Some(existing) = self
            .already_ingested(&message)
            .await
            .map_err(fail(Stage::Persist))?
        {
            info!(
                uid = %id,
                reference = %existing.reference,
                "Message already ingested, marking consumed"
            );
            Disposition::Duplicate {
                reference: existing.reference,
            }
        } else {
            self.dispatch(id, &message)
                .await
                .map_err(|(stage, error)| MessageFailure { id, stage, error })?
        };

        self.mailbox
            .mark_consumed(session, id)
            .await
            .map_err(fail(Stage::Mark))?;
        Ok(disposition)
    }

    async fn already_ingested(
        &self,
        message: &IncomingMessage,
    ) -> Result<Option<TicketHandle>, IngestError> {
        let Some(key) = message.message_key.as_deref() else {
            return Ok(None);
        };
        Ok(self.tickets.find_by_source_key(key).await?)
    }

    /// Resolve the customer and write a ticket or reply.
    async fn dispatch(
        &self,
        id: MessageId,
        message: &IncomingMessage,
    ) -> Result<Disposition, (Stage, IngestError)> {
        let body = clean_body(&message.body_text, message.body_kind);

        let customer_id = self
            .directory
            .resolve_or_create(&message.sender_address, &message.sender_display_name)
            .await
            .map_err(|e| (Stage::Customer, IngestError::Store(e)))?;

        if let ThreadDecision::ExistingThread { ticket_reference } = classify(&message.subject) {
            let appended = self
                .tickets
                .append_reply(
                    &ticket_reference,
                    customer_id,
                    &body,
                    message.message_key.as_deref(),
                )
                .await
                .map_err(|e| (Stage::Persist, IngestError::Store(e)))?;

            match appended {
                Some(appended) => {
                    info!(
                        uid = %id,
                        reference = %appended.ticket.reference,
                        reopened = appended.reopened,
                        "Reply appended from email"
                    );
                    self.store_attachments(&appended.ticket, message).await;
                    self.notify(Notice::ReplyAdded, &appended.ticket, message).await;
                    return Ok(Disposition::Replied {
                        reference: appended.ticket.reference,
                        reopened: appended.reopened,
                    });
                }
                None => {
                    warn!(
                        uid = %id,
                        reference = %ticket_reference,
                        "Referenced ticket not found, opening a new ticket instead"
                    );
                }
            }
        }

        let subject = if message.subject.is_empty() {
            FALLBACK_SUBJECT.to_string()
        } else {
            message.subject.clone()
        };

        let ticket = self
            .tickets
            .create_from_message(NewTicket {
                customer_id,
                subject,
                body,
                channel: self.settings.channel_tag.clone(),
                ticket_type: TicketType::default(),
                priority: TicketPriority::default(),
                attachments: message.attachments.iter().map(|a| a.meta()).collect(),
                source_key: message.message_key.clone(),
            })
            .await
            .map_err(|e| (Stage::Persist, IngestError::Store(e)))?;

        info!(uid = %id, reference = %ticket.reference, "Ticket created from email");
        self.store_attachments(&ticket, message).await;
        self.notify(Notice::Created, &ticket, message).await;

        Ok(Disposition::Created {
            reference: ticket.reference,
        })
    }

    /// Best effort; failures are logged.
    async fn store_attachments(&self, ticket: &TicketHandle, message: &IncomingMessage) {
        for attachment in &message.attachments {
            if let Err(e) = self
                .attachments
                .store(ticket, &attachment.meta(), &attachment.bytes)
                .await
            {
                warn!(
                    reference = %ticket.reference,
                    name = %attachment.name,
                    error = %e,
                    "Failed to store attachment"
                );
            }
        }
    }

    /// Best effort; failures and timeouts are logged.
    async fn notify(&self, notice: Notice, ticket: &TicketHandle, message: &IncomingMessage) {
        let address = message.sender_address.as_str();
        let name = message.sender_display_name.as_str();
        let send = match notice {
            Notice::Created => self.notifier.notify_created(ticket, address, name),
            Notice::ReplyAdded => self.notifier.notify_reply_added(ticket, address, name),
        };

        let result = match tokio::time::timeout(self.settings.notify_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.settings.notify_timeout)),
        };

        if let Err(e) = result {
            warn!(
                reference = %ticket.reference,
                to = %address,
                notice = ?notice,
                error = %e,
                "Notification failed"
            );
        }
    }
}
