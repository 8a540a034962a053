//! libSQL backend — async `Directory` and `TicketStore` implementation.
//!
//! Supports local file and in-memory databases. The connection is shared
//! with the rest of the helpdesk. Concurrent API writes resolve
//! last-write-wins per record; a reply and its re-open commit together.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Directory, TicketStore};
use crate::tickets::{
    AttachmentMeta, AuthorKind, Customer, CustomerId, NewTicket, Reply, ReplyAppended, Ticket,
    TicketHandle, TicketPriority, TicketStatus, TicketType, format_reference, parse_reference,
};

/// Length of the generated customer credential.
const CREDENTIAL_LEN: usize = 32;

/// libSQL database backend.
pub struct LibSqlBackend {
    /// Keeps the database open for `conn`.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
        })
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn ticket_by_seq(&self, seq: i64) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets t WHERE t.seq = ?1"),
                params![seq],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ticket_by_seq: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_ticket(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("ticket_by_seq row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("ticket_by_seq: {e}"))),
        }
    }

    async fn ticket_by_reference(&self, reference: &str) -> Result<Option<Ticket>, DatabaseError> {
        match parse_reference(reference) {
            Some(seq) => self.ticket_by_seq(seq).await,
            None => Ok(None),
        }
    }

    async fn first_ticket(&self, sql: &str, key: &str) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_source_key: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_ticket(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("find_by_source_key row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_source_key: {e}"))),
        }
    }

    /// Insert a reply and re-open the ticket if it was closed, in one
    /// transaction.
    async fn insert_reply(
        &self,
        reference: &str,
        author_kind: AuthorKind,
        author_id: Uuid,
        body: &str,
        source_key: Option<&str>,
    ) -> Result<Option<ReplyAppended>, DatabaseError> {
        let Some(ticket) = self.ticket_by_reference(reference).await? else {
            return Ok(None);
        };

        let reply_id = Uuid::new_v4();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_reply begin: {e}")))?;

        let written = write_reply(
            &tx,
            &ReplyRow {
                reply_id,
                ticket_id: ticket.id,
                author_kind,
                author_id,
                body,
                source_key,
            },
        )
        .await;

        let reopened = match written {
            Ok(reopened) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_reply commit: {e}")))?;
                reopened
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "insert_reply rollback failed");
                }
                return Err(e);
            }
        };

        let mut handle = ticket.handle();
        if reopened {
            handle.status = TicketStatus::Open;
            info!(reference = %handle.reference, "Closed ticket re-opened by reply");
        }

        debug!(
            reference = %handle.reference,
            reply_id = %reply_id,
            author = author_kind.as_str(),
            "Reply appended"
        );

        Ok(Some(ReplyAppended {
            ticket: handle,
            reply_id,
            reopened,
        }))
    }
}

// ── Helper functions ────────────────────────────────────────────────

struct ReplyRow<'a> {
    reply_id: Uuid,
    ticket_id: Uuid,
    author_kind: AuthorKind,
    author_id: Uuid,
    body: &'a str,
    source_key: Option<&'a str>,
}

/// Reply insert plus status update. Returns whether a closed ticket was
/// re-opened.
async fn write_reply(conn: &Connection, reply: &ReplyRow<'_>) -> Result<bool, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let ticket_id = reply.ticket_id.to_string();

    conn.execute(
        "INSERT INTO ticket_replies (id, ticket_id, author_kind, author_id, body, created_at, source_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            reply.reply_id.to_string(),
            ticket_id.clone(),
            reply.author_kind.as_str(),
            reply.author_id.to_string(),
            reply.body,
            now.clone(),
            opt_text(reply.source_key),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_reply: {e}")))?;

    let reopened = conn
        .execute(
            "UPDATE tickets SET status = 'open', updated_at = ?1
             WHERE id = ?2 AND status = 'closed'",
            params![now.clone(), ticket_id.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_reply reopen: {e}")))?
        > 0;

    if !reopened {
        conn.execute(
            "UPDATE tickets SET updated_at = ?1 WHERE id = ?2",
            params![now, ticket_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_reply touch: {e}")))?;
    }

    Ok(reopened)
}

/// Normalize an email address for lookup and uniqueness.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn str_to_type(s: &str) -> TicketType {
    match s {
        "incident" => TicketType::Incident,
        "problem" => TicketType::Problem,
        "task" => TicketType::Task,
        _ => TicketType::Question,
    }
}

fn str_to_priority(s: &str) -> TicketPriority {
    match s {
        "low" => TicketPriority::Low,
        "high" => TicketPriority::High,
        "urgent" => TicketPriority::Urgent,
        _ => TicketPriority::Medium,
    }
}

fn str_to_author(s: &str) -> AuthorKind {
    match s {
        "agent" => AuthorKind::Agent,
        _ => AuthorKind::Customer,
    }
}

fn generate_credential() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const TICKET_COLUMNS: &str = "t.seq, t.id, t.subject, t.body, t.status, t.ticket_type, t.priority, t.channel, t.customer_id, t.attachments, t.created_at, t.updated_at";

const REPLY_COLUMNS: &str = "r.id, r.ticket_id, r.author_kind, r.author_id, r.body, r.created_at";

const CUSTOMER_COLUMNS: &str = "id, email, name, created_at";

/// Map a libsql Row to a Ticket. Column order matches TICKET_COLUMNS.
fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, libsql::Error> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let status_str: String = row.get(4)?;
    let type_str: String = row.get(5)?;
    let priority_str: String = row.get(6)?;
    let customer_str: String = row.get(8)?;
    let attachments_str: Option<String> = row.get::<String>(9).ok();
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    let status = status_str.parse().unwrap_or_else(|e| {
        warn!(seq, "{e}; treating as open");
        TicketStatus::Open
    });

    let attachments: Vec<AttachmentMeta> = attachments_str
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    Ok(Ticket {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        reference: format_reference(seq),
        subject: row.get(2)?,
        body: row.get(3)?,
        status,
        ticket_type: str_to_type(&type_str),
        priority: str_to_priority(&priority_str),
        channel: row.get(7)?,
        customer_id: Uuid::parse_str(&customer_str).unwrap_or_else(|_| Uuid::nil()),
        attachments,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a Reply. Column order matches REPLY_COLUMNS.
fn row_to_reply(row: &libsql::Row) -> Result<Reply, libsql::Error> {
    let id_str: String = row.get(0)?;
    let ticket_str: String = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let author_str: String = row.get(3)?;
    let created_str: String = row.get(5)?;

    Ok(Reply {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        ticket_id: Uuid::parse_str(&ticket_str).unwrap_or_else(|_| Uuid::nil()),
        author_kind: str_to_author(&kind_str),
        author_id: Uuid::parse_str(&author_str).unwrap_or_else(|_| Uuid::nil()),
        body: row.get(4)?,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a Customer. Column order matches CUSTOMER_COLUMNS.
fn row_to_customer(row: &libsql::Row) -> Result<Customer, libsql::Error> {
    let id_str: String = row.get(0)?;
    let created_str: String = row.get(3)?;

    Ok(Customer {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        email: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_datetime(&created_str),
    })
}

// ── Directory ───────────────────────────────────────────────────────

#[async_trait]
impl Directory for LibSqlBackend {
    async fn resolve_or_create(
        &self,
        address: &str,
        display_name: &str,
    ) -> Result<CustomerId, DatabaseError> {
        let email = normalize_address(address);
        if email.is_empty() {
            return Err(DatabaseError::Query(
                "resolve_or_create: empty address".into(),
            ));
        }

        let name = match display_name.trim() {
            "" => email.split('@').next().unwrap_or(&email).to_string(),
            n => n.to_string(),
        };

        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT INTO customers (id, email, name, credential, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(email) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    email.clone(),
                    name,
                    generate_credential(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_or_create insert: {e}")))?;

        let customer = self
            .find_by_email(&email)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "customer".into(),
                id: email.clone(),
            })?;

        if inserted > 0 {
            info!(customer_id = %customer.id, email = %email, "Customer created on first contact");
        }
        Ok(customer.id)
    }

    async fn find_by_email(&self, address: &str) -> Result<Option<Customer>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE email = ?1"),
                params![normalize_address(address)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_customer(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("find_by_email row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_email: {e}"))),
        }
    }
}

// ── TicketStore ─────────────────────────────────────────────────────

#[async_trait]
impl TicketStore for LibSqlBackend {
    async fn create_from_message(&self, ticket: NewTicket) -> Result<TicketHandle, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let attachments = if ticket.attachments.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&ticket.attachments)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )
        };

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO tickets (id, subject, body, status, ticket_type, priority, channel,
                    customer_id, attachments, source_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 RETURNING seq",
                params![
                    id.to_string(),
                    ticket.subject.clone(),
                    ticket.body,
                    ticket.ticket_type.as_str(),
                    ticket.priority.as_str(),
                    ticket.channel,
                    ticket.customer_id.to_string(),
                    opt_text(attachments.as_deref()),
                    opt_text(ticket.source_key.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_from_message: {e}")))?;

        let seq: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("create_from_message seq: {e}")))?,
            Ok(None) => {
                return Err(DatabaseError::Query(
                    "create_from_message: no sequence returned".into(),
                ));
            }
            Err(e) => return Err(DatabaseError::Query(format!("create_from_message: {e}"))),
        };

        let handle = TicketHandle {
            id,
            reference: format_reference(seq),
            subject: ticket.subject,
            status: TicketStatus::Open,
            customer_id: ticket.customer_id,
        };
        debug!(reference = %handle.reference, id = %id, "Ticket inserted into DB");
        Ok(handle)
    }

    async fn append_reply(
        &self,
        reference: &str,
        customer_id: CustomerId,
        body: &str,
        source_key: Option<&str>,
    ) -> Result<Option<ReplyAppended>, DatabaseError> {
        self.insert_reply(reference, AuthorKind::Customer, customer_id, body, source_key)
            .await
    }

    async fn find_by_source_key(&self, key: &str) -> Result<Option<TicketHandle>, DatabaseError> {
        let direct = format!("SELECT {TICKET_COLUMNS} FROM tickets t WHERE t.source_key = ?1");
        if let Some(ticket) = self.first_ticket(&direct, key).await? {
            return Ok(Some(ticket.handle()));
        }

        let via_reply = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets t
             JOIN ticket_replies r ON r.ticket_id = t.id
             WHERE r.source_key = ?1"
        );
        Ok(self
            .first_ticket(&via_reply, key)
            .await?
            .map(|ticket| ticket.handle()))
    }

    async fn get_ticket(&self, reference: &str) -> Result<Option<Ticket>, DatabaseError> {
        self.ticket_by_reference(reference).await
    }

    async fn list_replies(&self, reference: &str) -> Result<Vec<Reply>, DatabaseError> {
        let Some(seq) = parse_reference(reference) else {
            return Ok(Vec::new());
        };

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REPLY_COLUMNS} FROM ticket_replies r
                     JOIN tickets t ON t.id = r.ticket_id
                     WHERE t.seq = ?1
                     ORDER BY r.created_at ASC, r.rowid ASC"
                ),
                params![seq],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_replies: {e}")))?;

        let mut replies = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_reply(&row) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    warn!("Skipping reply row: {e}");
                }
            }
        }
        Ok(replies)
    }

    async fn set_status(
        &self,
        reference: &str,
        status: TicketStatus,
    ) -> Result<(), DatabaseError> {
        let not_found = || DatabaseError::NotFound {
            entity: "ticket".into(),
            id: reference.to_string(),
        };
        let seq = parse_reference(reference).ok_or_else(not_found)?;

        let count = self
            .conn()
            .execute(
                "UPDATE tickets SET status = ?1, updated_at = ?2 WHERE seq = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), seq],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_status: {e}")))?;

        if count == 0 {
            return Err(not_found());
        }
        debug!(reference, status = %status, "Ticket status updated");
        Ok(())
    }

    async fn add_reply(
        &self,
        reference: &str,
        author_kind: AuthorKind,
        author_id: Uuid,
        body: &str,
    ) -> Result<Option<ReplyAppended>, DatabaseError> {
        self.insert_reply(reference, author_kind, author_id, body, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_ticket(customer_id: CustomerId, subject: &str, key: Option<&str>) -> NewTicket {
        NewTicket {
            customer_id,
            subject: subject.to_string(),
            body: "It is broken".to_string(),
            channel: "email".to_string(),
            ticket_type: TicketType::default(),
            priority: TicketPriority::default(),
            attachments: Vec::new(),
            source_key: key.map(str::to_string),
        }
    }

    // ── Directory ───────────────────────────────────────────────────

    #[tokio::test]
    async fn resolve_or_create_is_idempotent() {
        let db = backend().await;
        let first = db.resolve_or_create("new@example.com", "New").await.unwrap();
        let second = db.resolve_or_create("new@example.com", "New").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn resolve_or_create_normalizes_address() {
        let db = backend().await;
        let first = db.resolve_or_create("Alice@Example.COM ", "Alice").await.unwrap();
        let second = db.resolve_or_create("alice@example.com", "").await.unwrap();
        assert_eq!(first, second);

        let customer = db.find_by_email("ALICE@example.com").await.unwrap().unwrap();
        assert_eq!(customer.email, "alice@example.com");
        assert_eq!(customer.name, "Alice");
    }

    #[tokio::test]
    async fn resolve_or_create_defaults_name_to_local_part() {
        let db = backend().await;
        db.resolve_or_create("bob@example.com", "  ").await.unwrap();
        let customer = db.find_by_email("bob@example.com").await.unwrap().unwrap();
        assert_eq!(customer.name, "bob");
    }

    #[tokio::test]
    async fn resolve_or_create_generates_credential() {
        let db = backend().await;
        db.resolve_or_create("carol@example.com", "Carol").await.unwrap();
        let mut rows = db
            .conn()
            .query(
                "SELECT credential FROM customers WHERE email = 'carol@example.com'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let credential: String = row.get(0).unwrap();
        assert_eq!(credential.len(), CREDENTIAL_LEN);
    }

    #[tokio::test]
    async fn resolve_or_create_rejects_empty_address() {
        let db = backend().await;
        assert!(db.resolve_or_create("   ", "x").await.is_err());
    }

    // ── Tickets ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_assigns_sequential_references() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();

        let first = db
            .create_from_message(new_ticket(customer, "One", None))
            .await
            .unwrap();
        let second = db
            .create_from_message(new_ticket(customer, "Two", None))
            .await
            .unwrap();

        assert_eq!(first.reference, "TKT-000001");
        assert_eq!(second.reference, "TKT-000002");
        assert_eq!(first.status, TicketStatus::Open);

        let stored = db.get_ticket("TKT-000002").await.unwrap().unwrap();
        assert_eq!(stored.subject, "Two");
        assert_eq!(stored.channel, "email");
        assert_eq!(stored.customer_id, customer);
        assert_eq!(stored.ticket_type, TicketType::Question);
        assert_eq!(stored.priority, TicketPriority::Medium);
    }

    #[tokio::test]
    async fn create_persists_attachment_metadata() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();
        let mut ticket = new_ticket(customer, "Logs", None);
        ticket.attachments.push(AttachmentMeta {
            name: "trace.log".into(),
            mime_type: "text/plain".into(),
            size_bytes: 12,
        });
        let handle = db.create_from_message(ticket).await.unwrap();

        let stored = db.get_ticket(&handle.reference).await.unwrap().unwrap();
        assert_eq!(stored.attachments.len(), 1);
        assert_eq!(stored.attachments[0].name, "trace.log");
    }

    #[tokio::test]
    async fn append_reply_to_missing_ticket_returns_none() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();
        let result = db
            .append_reply("TKT-000042", customer, "hello?", None)
            .await
            .unwrap();
        assert!(result.is_none());

        let malformed = db
            .append_reply("not-a-ref", customer, "hello?", None)
            .await
            .unwrap();
        assert!(malformed.is_none());
    }

    #[tokio::test]
    async fn append_reply_reopens_closed_ticket() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();
        let handle = db
            .create_from_message(new_ticket(customer, "Broken", None))
            .await
            .unwrap();
        db.set_status(&handle.reference, TicketStatus::Closed)
            .await
            .unwrap();

        let appended = db
            .append_reply(&handle.reference, customer, "Still broken", None)
            .await
            .unwrap()
            .unwrap();
        assert!(appended.reopened);
        assert_eq!(appended.ticket.status, TicketStatus::Open);

        let stored = db.get_ticket(&handle.reference).await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Open);

        let replies = db.list_replies(&handle.reference).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, "Still broken");
        assert_eq!(replies[0].author_kind, AuthorKind::Customer);
        assert_eq!(replies[0].author_id, customer);
    }

    #[tokio::test]
    async fn failed_reopen_leaves_no_reply_behind() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();
        let handle = db
            .create_from_message(new_ticket(customer, "Broken", None))
            .await
            .unwrap();
        db.set_status(&handle.reference, TicketStatus::Closed)
            .await
            .unwrap();
        db.conn()
            .execute(
                "CREATE TRIGGER reject_ticket_update BEFORE UPDATE ON tickets
                 BEGIN SELECT RAISE(ABORT, 'ticket update rejected'); END",
                (),
            )
            .await
            .unwrap();

        let result = db
            .append_reply(&handle.reference, customer, "Still broken", Some("<r1@example.com>"))
            .await;
        assert!(matches!(result, Err(DatabaseError::Query(_))));

        assert!(db.list_replies(&handle.reference).await.unwrap().is_empty());
        assert!(
            db.find_by_source_key("<r1@example.com>")
                .await
                .unwrap()
                .is_none()
        );
        let stored = db.get_ticket(&handle.reference).await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Closed);

        // The connection is usable again once the update is allowed.
        db.conn()
            .execute("DROP TRIGGER reject_ticket_update", ())
            .await
            .unwrap();
        let appended = db
            .append_reply(&handle.reference, customer, "Still broken", Some("<r1@example.com>"))
            .await
            .unwrap()
            .unwrap();
        assert!(appended.reopened);
    }

    #[tokio::test]
    async fn append_reply_keeps_pending_status() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();
        let handle = db
            .create_from_message(new_ticket(customer, "Broken", None))
            .await
            .unwrap();
        db.set_status(&handle.reference, TicketStatus::Pending)
            .await
            .unwrap();

        let appended = db
            .append_reply(&handle.reference, customer, "More info", None)
            .await
            .unwrap()
            .unwrap();
        assert!(!appended.reopened);
        assert_eq!(appended.ticket.status, TicketStatus::Pending);
    }

    #[tokio::test]
    async fn agent_reply_recorded_with_author_kind() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();
        let handle = db
            .create_from_message(new_ticket(customer, "Broken", None))
            .await
            .unwrap();
        let agent = Uuid::new_v4();
        db.add_reply(&handle.reference, AuthorKind::Agent, agent, "Try again")
            .await
            .unwrap()
            .unwrap();

        let replies = db.list_replies(&handle.reference).await.unwrap();
        assert_eq!(replies[0].author_kind, AuthorKind::Agent);
        assert_eq!(replies[0].author_id, agent);
    }

    #[tokio::test]
    async fn find_by_source_key_covers_tickets_and_replies() {
        let db = backend().await;
        let customer = db.resolve_or_create("a@example.com", "A").await.unwrap();
        let handle = db
            .create_from_message(new_ticket(customer, "Broken", Some("<m1@example.com>")))
            .await
            .unwrap();
        db.append_reply(&handle.reference, customer, "again", Some("<m2@example.com>"))
            .await
            .unwrap()
            .unwrap();

        let by_ticket = db.find_by_source_key("<m1@example.com>").await.unwrap();
        assert_eq!(by_ticket.unwrap().reference, handle.reference);
        let by_reply = db.find_by_source_key("<m2@example.com>").await.unwrap();
        assert_eq!(by_reply.unwrap().reference, handle.reference);
        assert!(db.find_by_source_key("<m3@example.com>").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_status_on_missing_ticket_is_not_found() {
        let db = backend().await;
        let err = db
            .set_status("TKT-000009", TicketStatus::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn new_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("helpdesk.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        db.resolve_or_create("a@example.com", "A").await.unwrap();
        assert!(db_path.exists());
    }
}
