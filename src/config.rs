//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default poll interval: one minute.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub use_tls: bool,
    /// Folder to poll.
    pub mailbox: String,
    /// Connect, read and write timeout.
    pub timeout: Duration,
}

/// SMTP settings for outbound confirmations.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

/// Ingestion worker configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub mailbox: MailboxConfig,
    /// `None` means confirmations are only logged.
    pub smtp: Option<SmtpConfig>,
    pub poll_interval: Duration,
    /// Address the helpdesk sends from. Mail from it is never ingested.
    pub from_address: String,
    /// Ingress channel recorded on created tickets.
    pub channel_tag: String,
    /// Empty list allows every sender.
    pub allowed_senders: Vec<String>,
    pub notify_timeout: Duration,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl IngestConfig {
    /// Build config from the process environment.
    ///
    /// Returns `Ok(None)` when mailbox credentials are absent, which means
    /// email intake is disabled.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let (Some(host), Some(username), Some(password)) = (
            get("HELPDESK_IMAP_HOST"),
            get("HELPDESK_IMAP_USERNAME"),
            get("HELPDESK_IMAP_PASSWORD"),
        ) else {
            return Ok(None);
        };

        let use_tls: bool = parse_or(get("HELPDESK_IMAP_TLS"), "HELPDESK_IMAP_TLS", true)?;
        let default_port = if use_tls { 993 } else { 143 };
        let port: u16 = parse_or(get("HELPDESK_IMAP_PORT"), "HELPDESK_IMAP_PORT", default_port)?;
        let timeout_secs: u64 =
            parse_or(get("HELPDESK_IMAP_TIMEOUT_SECS"), "HELPDESK_IMAP_TIMEOUT_SECS", 30)?;

        let mailbox = MailboxConfig {
            host,
            port,
            username: username.clone(),
            password: SecretString::from(password.clone()),
            use_tls,
            mailbox: get("HELPDESK_IMAP_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            timeout: Duration::from_secs(timeout_secs),
        };

        let poll_interval_ms: u64 = parse_or(
            get("HELPDESK_POLL_INTERVAL_MS"),
            "HELPDESK_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HELPDESK_POLL_INTERVAL_MS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let from_address = get("HELPDESK_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        let smtp = match get("HELPDESK_SMTP_HOST") {
            Some(smtp_host) => Some(SmtpConfig {
                host: smtp_host,
                port: parse_or(get("HELPDESK_SMTP_PORT"), "HELPDESK_SMTP_PORT", 587)?,
                username: get("HELPDESK_SMTP_USERNAME").unwrap_or_else(|| username.clone()),
                password: SecretString::from(get("HELPDESK_SMTP_PASSWORD").unwrap_or(password)),
                from_address: from_address.clone(),
            }),
            None => None,
        };

        let allowed_senders: Vec<String> = get("HELPDESK_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let notify_timeout_secs: u64 = parse_or(
            get("HELPDESK_NOTIFY_TIMEOUT_SECS"),
            "HELPDESK_NOTIFY_TIMEOUT_SECS",
            30,
        )?;

        Ok(Some(Self {
            mailbox,
            smtp,
            poll_interval: Duration::from_millis(poll_interval_ms),
            from_address,
            channel_tag: get("HELPDESK_CHANNEL_TAG").unwrap_or_else(|| "email".to_string()),
            allowed_senders,
            notify_timeout: Duration::from_secs(notify_timeout_secs),
            db_path: get("HELPDESK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/helpdesk.db")),
            log_dir: get("HELPDESK_LOG_DIR").map(PathBuf::from),
        }))
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CREDS: [(&str, &str); 3] = [
        ("HELPDESK_IMAP_HOST", "imap.example.com"),
        ("HELPDESK_IMAP_USERNAME", "support@example.com"),
        ("HELPDESK_IMAP_PASSWORD", "hunter2"),
    ];

    #[test]
    fn missing_credentials_disables_intake() {
        assert!(IngestConfig::from_lookup(lookup(&[])).unwrap().is_none());
        assert!(
            IngestConfig::from_lookup(lookup(&CREDS[..2]))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn blank_password_counts_as_missing() {
        let cfg = IngestConfig::from_lookup(lookup(&[
            ("HELPDESK_IMAP_HOST", "imap.example.com"),
            ("HELPDESK_IMAP_USERNAME", "support@example.com"),
            ("HELPDESK_IMAP_PASSWORD", "   "),
        ]))
        .unwrap();
        assert!(cfg.is_none());
    }

    #[test]
    fn defaults_applied() {
        let cfg = IngestConfig::from_lookup(lookup(&CREDS)).unwrap().unwrap();
        assert_eq!(cfg.mailbox.port, 993);
        assert!(cfg.mailbox.use_tls);
        assert_eq!(cfg.mailbox.mailbox, "INBOX");
        assert_eq!(cfg.mailbox.password.expose_secret(), "hunter2");
        assert_eq!(cfg.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.from_address, "support@example.com");
        assert_eq!(cfg.channel_tag, "email");
        assert!(cfg.smtp.is_none());
        assert!(cfg.allowed_senders.is_empty());
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn plaintext_mailbox_defaults_to_port_143() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("HELPDESK_IMAP_TLS", "false"));
        let cfg = IngestConfig::from_lookup(lookup(&pairs)).unwrap().unwrap();
        assert!(!cfg.mailbox.use_tls);
        assert_eq!(cfg.mailbox.port, 143);
    }

    #[test]
    fn smtp_inherits_mailbox_credentials() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("HELPDESK_SMTP_HOST", "smtp.example.com"));
        pairs.push(("HELPDESK_FROM_ADDRESS", "help@example.com"));
        let cfg = IngestConfig::from_lookup(lookup(&pairs)).unwrap().unwrap();
        let smtp = cfg.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.username, "support@example.com");
        assert_eq!(smtp.password.expose_secret(), "hunter2");
        assert_eq!(smtp.from_address, "help@example.com");
    }

    #[test]
    fn poll_interval_and_allowlist_parsed() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("HELPDESK_POLL_INTERVAL_MS", "1500"));
        pairs.push(("HELPDESK_ALLOWED_SENDERS", "@acme.com, vip@other.org ,"));
        let cfg = IngestConfig::from_lookup(lookup(&pairs)).unwrap().unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(1500));
        assert_eq!(cfg.allowed_senders, vec!["@acme.com", "vip@other.org"]);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("HELPDESK_IMAP_PORT", "imap"));
        let err = IngestConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HELPDESK_IMAP_PORT"));

        let mut pairs = CREDS.to_vec();
        pairs.push(("HELPDESK_POLL_INTERVAL_MS", "0"));
        assert!(IngestConfig::from_lookup(lookup(&pairs)).is_err());
    }
}
