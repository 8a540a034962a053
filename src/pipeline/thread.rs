//! Subject-line threading.
//!
//! Outbound mail carries `[#TKT-000042]` in its subject; a customer's reply
//! keeps it, and `classify` reads it back. Only the exact bracketed form
//! continues a thread.

use std::sync::LazyLock;

use regex::Regex;

static THREAD_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[#(TKT-[0-9]+)\]").expect("valid thread token pattern")
});

/// Subject used on outbound mail when the customer sent none.
pub const FALLBACK_SUBJECT: &str = "Support request";

/// Whether a message starts a new ticket or continues an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadDecision {
    NewThread,
    ExistingThread { ticket_reference: String },
}

/// Classify a subject line. Never fails; anything unrecognised is `NewThread`.
pub fn classify(subject: &str) -> ThreadDecision {
    match THREAD_TOKEN.captures(subject).and_then(|c| c.get(1)) {
        Some(reference) => ThreadDecision::ExistingThread {
            ticket_reference: reference.as_str().to_string(),
        },
        None => ThreadDecision::NewThread,
    }
}

/// Subject for outbound mail about `reference`: `<human text> [#TKT-xxxxxx]`.
pub fn reply_subject(subject: &str, reference: &str) -> String {
    let stripped = THREAD_TOKEN.replace_all(subject, "");
    let human = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let human = if human.is_empty() {
        FALLBACK_SUBJECT
    } else {
        human.as_str()
    };
    format!("{human} [#{reference}]")
}
