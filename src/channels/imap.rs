//! IMAP mailbox client — raw IMAP4rev1 over TCP, optionally TLS via rustls.
//!
//! Socket I/O is blocking and runs in `spawn_blocking`. The connection lives
//! inside an `ImapSession` value that moves into the blocking task for each
//! command and back out afterwards.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::channels::mailbox::{MailboxClient, MessageId};
use crate::config::MailboxConfig;
use crate::error::IngestError;

// ── Transport ───────────────────────────────────────────────────────

enum ImapStream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// Why a single command failed.
#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("server rejected command: {0}")]
    Rejected(String),
}

/// One untagged response, with any literals that followed it.
#[derive(Debug, Default)]
struct ResponseItem {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// An open, authenticated, mailbox-selected IMAP connection.
struct ImapConnection {
    reader: BufReader<ImapStream>,
    next_tag: u32,
    /// Set after an I/O failure mid-command. The stream may still hold the
    /// tail of that response, so the connection must not be reused.
    broken: bool,
}

impl ImapConnection {
    fn connect(config: &MailboxConfig) -> Result<Self, IngestError> {
        let conn_err = |what: &str, e: &dyn std::fmt::Display| {
            IngestError::Connection(format!("{what} {}:{}: {e}", config.host, config.port))
        };

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| conn_err("resolve", &e))?
            .next()
            .ok_or_else(|| conn_err("resolve", &"no addresses"))?;

        let tcp = TcpStream::connect_timeout(&addr, config.timeout)
            .map_err(|e| conn_err("connect", &e))?;
        tcp.set_read_timeout(Some(config.timeout))
            .map_err(|e| conn_err("configure", &e))?;
        tcp.set_write_timeout(Some(config.timeout))
            .map_err(|e| conn_err("configure", &e))?;

        let stream = if config.use_tls {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| conn_err("tls setup", &e))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

            let server_name = ServerName::try_from(config.host.clone())
                .map_err(|e| conn_err("tls server name", &e))?;
            let tls = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
                .map_err(|e| conn_err("tls handshake", &e))?;
            ImapStream::Tls(Box::new(rustls::StreamOwned::new(tls, tcp)))
        } else {
            ImapStream::Plain(tcp)
        };

        let mut conn = Self {
            reader: BufReader::new(stream),
            next_tag: 1,
            broken: false,
        };

        let greeting = conn.read_line().map_err(|e| conn_err("greeting from", &e))?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(IngestError::Connection(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }

        let login = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        conn.command(&login).map_err(|e| match e {
            CommandError::Rejected(reason) => {
                IngestError::Connection(format!("authentication rejected: {reason}"))
            }
            other => conn_err("login on", &other),
        })?;

        conn.command(&format!("SELECT {}", quote(&config.mailbox)))
            .map_err(|e| IngestError::Connection(format!("SELECT {} failed: {e}", config.mailbox)))?;

        Ok(conn)
    }

    /// Read one CRLF-terminated line.
    fn read_line(&mut self) -> Result<String, CommandError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(CommandError::Closed);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a tagged command and collect untagged responses until completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseItem>, CommandError> {
        let result = self.exchange(cmd);
        if matches!(result, Err(CommandError::Io(_) | CommandError::Closed)) {
            self.broken = true;
        }
        result
    }

    fn exchange(&mut self, cmd: &str) -> Result<Vec<ResponseItem>, CommandError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let tag_prefix = format!("{tag} ");
        let mut items = Vec::new();
        let mut current: Option<ResponseItem> = None;

        loop {
            let line = self.read_line()?;
            let literal = literal_len(&line);
            current
                .get_or_insert_with(ResponseItem::default)
                .text
                .push_str(&line);

            if let Some(len) = literal {
                let mut buf = vec![0u8; len];
                self.reader.read_exact(&mut buf)?;
                if let Some(item) = current.as_mut() {
                    item.literals.push(buf);
                }
                continue;
            }

            let Some(item) = current.take() else {
                continue;
            };

            if let Some(status) = item.text.strip_prefix(&tag_prefix) {
                let status = status.trim_end();
                if status.starts_with("OK") {
                    return Ok(items);
                }
                return Err(CommandError::Rejected(status.to_string()));
            }
            items.push(item);
        }
    }
}

// ── Protocol helpers ────────────────────────────────────────────────

/// Quote a string for use as an IMAP quoted string.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Length of the literal announced at the end of a line (`{123}` or `{123+}`).
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\r', '\n']);
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// The `UID` data item of an untagged FETCH response.
fn fetch_uid(text: &str) -> Option<u32> {
    let mut tokens = text
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|t| !t.is_empty());
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("UID") {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

/// The message body from the FETCH response for `id`. Responses for other
/// UIDs are ignored.
fn body_for(items: Vec<ResponseItem>, id: MessageId) -> Option<Vec<u8>> {
    items
        .into_iter()
        .filter(|item| item.text.contains(" FETCH ") && fetch_uid(&item.text) == Some(id.0))
        .find_map(|item| item.literals.into_iter().next())
}

/// UIDs from `* SEARCH` responses, in server order.
fn parse_search(items: &[ResponseItem]) -> Vec<MessageId> {
    items
        .iter()
        .filter_map(|item| item.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|token| token.parse::<u32>().ok())
        .map(MessageId)
        .collect()
}

// ── Session & client ────────────────────────────────────────────────

/// One IMAP session. Owned by a single poll cycle.
pub struct ImapSession {
    conn: Option<ImapConnection>,
}

/// Run a blocking command on the session's connection.
async fn with_connection<T, F>(session: &mut ImapSession, op: F) -> Result<T, IngestError>
where
    T: Send + 'static,
    F: FnOnce(&mut ImapConnection) -> Result<T, IngestError> + Send + 'static,
{
    let mut conn = session
        .conn
        .take()
        .ok_or_else(|| IngestError::Protocol("IMAP session is no longer usable".into()))?;

    let (conn, result) = tokio::task::spawn_blocking(move || {
        let result = op(&mut conn);
        (conn, result)
    })
    .await
    .map_err(|e| IngestError::Protocol(format!("IMAP task panicked: {e}")))?;

    if conn.broken {
        warn!("IMAP connection out of sync after I/O failure, dropping it");
    } else {
        session.conn = Some(conn);
    }
    result
}

/// IMAP implementation of `MailboxClient`.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    type Session = ImapSession;

    async fn open(&self) -> Result<ImapSession, IngestError> {
        let config = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || ImapConnection::connect(&config))
            .await
            .map_err(|e| IngestError::Connection(format!("IMAP connect task panicked: {e}")))??;

        info!(
            host = %self.config.host,
            mailbox = %self.config.mailbox,
            "IMAP session opened"
        );
        Ok(ImapSession { conn: Some(conn) })
    }

    async fn list_unseen(&self, session: &mut ImapSession) -> Result<Vec<MessageId>, IngestError> {
        let mut ids = with_connection(session, |conn| {
            conn.command("UID SEARCH UNSEEN")
                .map(|items| parse_search(&items))
                .map_err(|e| IngestError::Protocol(format!("UID SEARCH failed: {e}")))
        })
        .await?;
        ids.sort_unstable();
        ids.dedup();

        debug!(count = ids.len(), "Unseen messages listed");
        Ok(ids)
    }

    async fn fetch_raw(
        &self,
        session: &mut ImapSession,
        id: MessageId,
    ) -> Result<Vec<u8>, IngestError> {
        with_connection(session, move |conn| {
            let fetch_err = |reason: String| IngestError::Fetch {
                id: id.to_string(),
                reason,
            };
            let items = conn
                .command(&format!("UID FETCH {id} BODY.PEEK[]"))
                .map_err(|e| fetch_err(e.to_string()))?;

            body_for(items, id).ok_or_else(|| fetch_err("no message body returned".into()))
        })
        .await
    }

    async fn mark_consumed(
        &self,
        session: &mut ImapSession,
        id: MessageId,
    ) -> Result<(), IngestError> {
        with_connection(session, move |conn| {
            conn.command(&format!("UID STORE {id} +FLAGS.SILENT (\\Seen)"))
                .map(|_| ())
                .map_err(|e| IngestError::Mark {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
        })
        .await
    }

    async fn close(&self, mut session: ImapSession) {
        if session.conn.is_none() {
            debug!("IMAP session already dropped, skipping logout");
            return;
        }
        let result = with_connection(&mut session, |conn| {
            conn.command("LOGOUT")
                .map(|_| ())
                .map_err(|e| IngestError::Protocol(e.to_string()))
        })
        .await;

        match result {
            Ok(()) => debug!("IMAP session closed"),
            Err(e) => warn!(error = %e, "IMAP logout failed"),
        }
    }
}
