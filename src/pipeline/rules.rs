//! Intake rules: mail that must never become a ticket.
//!
//! Runs right after decoding. A match means the message is marked consumed
//! and nothing is written:
//! - our own outbound address → Ignore (prevents notification loops)
//! - mailer-daemon/postmaster bounces → Ignore
//! - noreply/no-reply senders → Ignore
//! - senders outside a non-empty allowlist → Ignore

use regex::Regex;
use tracing::debug;

use crate::channels::email_types::IncomingMessage;

/// Which field a rule matches against.
#[derive(Debug, Clone)]
pub enum RuleField {
    Sender,
    Subject,
}

/// A single ignore rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct IgnoreRule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    /// Why this rule triggers.
    pub reason: String,
}

/// Sender filters applied before any ticket is written.
pub struct IntakeRules {
    /// Lowercased addresses this system sends from.
    own_addresses: Vec<String>,
    /// Empty means everyone may open tickets.
    allowed_senders: Vec<String>,
    ignore_rules: Vec<IgnoreRule>,
}

impl IntakeRules {
    /// Default rules for a helpdesk sending from `own_address`.
    pub fn default_rules(own_address: &str, allowed_senders: Vec<String>) -> Self {
        let ignore_rules = vec![
            IgnoreRule {
                pattern: "noreply@*".into(),
                regex: Regex::new(r"(?i)^no[\-_.]?reply@").expect("valid pattern"),
                field: RuleField::Sender,
                reason: "noreply sender".into(),
            },
            IgnoreRule {
                pattern: "mailer-daemon".into(),
                regex: Regex::new(r"(?i)^(mailer[\-_]?daemon|postmaster)@").expect("valid pattern"),
                field: RuleField::Sender,
                reason: "automated mail system".into(),
            },
            IgnoreRule {
                pattern: "delivery status notification".into(),
                regex: Regex::new(
                    r"(?i)^(undeliverable|undelivered mail returned to sender|delivery status notification)",
                )
                .expect("valid pattern"),
                field: RuleField::Subject,
                reason: "bounce notification".into(),
            },
        ];

        let own = own_address.trim().to_lowercase();
        Self {
            own_addresses: if own.is_empty() { Vec::new() } else { vec![own] },
            allowed_senders,
            ignore_rules,
        }
    }

    /// No rules at all (for testing).
    pub fn empty() -> Self {
        Self {
            own_addresses: Vec::new(),
            allowed_senders: Vec::new(),
            ignore_rules: Vec::new(),
        }
    }

    /// Add a custom ignore rule.
    pub fn add_ignore_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.ignore_rules.push(IgnoreRule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Evaluate a message. `Some(reason)` means ignore it.
    pub fn evaluate(&self, message: &IncomingMessage) -> Option<String> {
        let sender = message.sender_address.as_str();

        if self.own_addresses.iter().any(|a| a == sender) {
            debug!(sender = %sender, "Message sent from our own address");
            return Some("sent by this helpdesk".into());
        }

        for rule in &self.ignore_rules {
            let field_value = match rule.field {
                RuleField::Sender => sender,
                RuleField::Subject => message.subject.as_str(),
            };

            if rule.regex.is_match(field_value) {
                debug!(
                    sender = %sender,
                    rule = %rule.pattern,
                    reason = %rule.reason,
                    "Message matched ignore rule"
                );
                return Some(rule.reason.clone());
            }
        }

        if !is_sender_allowed(&self.allowed_senders, sender) {
            debug!(sender = %sender, "Sender not in allowlist");
            return Some("sender not in allowlist".into());
        }

        None
    }
}

/// Allowlist check. An empty list allows everyone.
///
/// Entries: `*` (anyone), `user@example.com` (exact), `@example.com` or
/// `example.com` (domain).
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::email_types::BodyKind;

    fn make_message(sender: &str, subject: &str) -> IncomingMessage {
        IncomingMessage {
            sender_address: sender.into(),
            sender_display_name: "Test".into(),
            subject: subject.into(),
            body_text: "body".into(),
            body_kind: BodyKind::Plain,
            attachments: vec![],
            message_key: None,
        }
    }

    fn rules() -> IntakeRules {
        IntakeRules::default_rules("Support@Example.com", vec![])
    }

    #[test]
    fn ignores_own_address() {
        let msg = make_message("support@example.com", "Re: your ticket");
        assert!(rules().evaluate(&msg).is_some());
    }

    #[test]
    fn ignores_noreply() {
        assert!(rules().evaluate(&make_message("noreply@company.com", "Hi")).is_some());
        assert!(rules().evaluate(&make_message("no-reply@service.io", "Hi")).is_some());
    }

    #[test]
    fn ignores_bounces() {
        assert!(
            rules()
                .evaluate(&make_message("mailer-daemon@mx.example.net", "Failure"))
                .is_some()
        );
        assert!(
            rules()
                .evaluate(&make_message("postmaster@example.net", "Failure"))
                .is_some()
        );
        assert!(
            rules()
                .evaluate(&make_message(
                    "alerts@example.net",
                    "Undeliverable: Cannot login"
                ))
                .is_some()
        );
    }

    #[test]
    fn passes_through_customer_mail() {
        let msg = make_message("alice@customer.com", "Cannot login");
        assert!(rules().evaluate(&msg).is_none());
    }

    #[test]
    fn allowlist_restricts_senders() {
        let rules = IntakeRules::default_rules("support@example.com", vec!["@acme.com".into()]);
        assert!(rules.evaluate(&make_message("bob@acme.com", "Help")).is_none());
        assert_eq!(
            rules.evaluate(&make_message("eve@other.com", "Help")).as_deref(),
            Some("sender not in allowlist")
        );
    }

    #[test]
    fn custom_ignore_rule() {
        let mut rules = IntakeRules::empty();
        rules
            .add_ignore_rule(r"(?i)@spam\.org$", RuleField::Sender, "custom spam")
            .unwrap();
        assert_eq!(
            rules.evaluate(&make_message("anyone@spam.org", "Hi")).as_deref(),
            Some("custom spam")
        );
    }

    #[test]
    fn empty_rules_pass_everything() {
        let msg = make_message("noreply@company.com", "Spam");
        assert!(IntakeRules::empty().evaluate(&msg).is_none());
    }

    // ── Allowlist ───────────────────────────────────────────────

    #[test]
    fn allowlist_empty_allows_all() {
        assert!(is_sender_allowed(&[], "anyone@example.com"));
    }

    #[test]
    fn allowlist_wildcard_allows_all() {
        let allowed = vec!["*".to_string()];
        assert!(is_sender_allowed(&allowed, "test@other.org"));
    }

    #[test]
    fn allowlist_exact_email_match() {
        let allowed = vec!["alice@example.com".to_string()];
        assert!(is_sender_allowed(&allowed, "Alice@Example.com"));
        assert!(!is_sender_allowed(&allowed, "bob@example.com"));
    }

    #[test]
    fn allowlist_domain_forms() {
        let allowed = vec!["@Example.COM".to_string(), "partner.io".to_string()];
        assert!(is_sender_allowed(&allowed, "user@example.com"));
        assert!(is_sender_allowed(&allowed, "ceo@partner.io"));
        assert!(!is_sender_allowed(&allowed, "ceo@notpartner.io.evil"));
        assert!(!is_sender_allowed(&allowed, "random@evil.com"));
    }
}
