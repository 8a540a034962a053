//! Body cleanup before a message becomes a ticket description.
//!
//! Pure string processing. `sanitize` never fails: the worst case is an
//! empty string.

use std::sync::LazyLock;

use regex::Regex;

use crate::channels::email_types::BodyKind;

/// Longest description stored, in characters.
pub const MAX_BODY_CHARS: usize = 5000;

/// Appended when a body is cut at `MAX_BODY_CHARS`.
pub const TRUNCATION_MARKER: &str = "\n\n[message truncated]";

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("valid pattern")
});
static BLOCK_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|li|tr|h[1-6]|blockquote|pre|table)\s*>")
        .expect("valid pattern")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid pattern"));

/// Strip signature, quoted reply and forwarded original, then cap the length.
///
/// Rules run in order, each on the output of the previous one:
/// 1. cut at the first line that is exactly `--` (trailing whitespace ignored)
/// 2. cut at the first `On <date> <name> wrote:` line
/// 3. cut at the first line beginning with `From:`
/// 4. trim
/// 5. cap at `MAX_BODY_CHARS`, appending `TRUNCATION_MARKER` when cut
pub fn sanitize(body: &str) -> String {
    let body = truncate_at(body, is_signature_delimiter);
    let body = truncate_at(body, is_quote_header);
    let body = truncate_at(body, is_forwarded_header);
    cap_length(body.trim())
}

/// Convert HTML to text if needed, then `sanitize`.
pub fn clean_body(body: &str, kind: BodyKind) -> String {
    match kind {
        BodyKind::Html => sanitize(&html_to_text(body)),
        BodyKind::Plain | BodyKind::Empty => sanitize(body),
    }
}

/// Render HTML as plain text: block-level tags become line breaks, other
/// tags are dropped and common entities decoded.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_OR_STYLE.replace_all(html, "");
    let text = BLOCK_BREAK.replace_all(&text, "\n");
    let text = TAG.replace_all(&text, "");
    let text = decode_entities(&text);

    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        // Collapse runs of blank lines to one.
        if line.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        // Last, so `&amp;lt;` becomes `&lt;` and not `<`.
        .replace("&amp;", "&")
}

/// Everything before the first line matching `pred`.
fn truncate_at(body: &str, pred: fn(&str) -> bool) -> &str {
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if pred(line.trim_end_matches(['\r', '\n'])) {
            return &body[..offset];
        }
        offset += line.len();
    }
    body
}

fn is_signature_delimiter(line: &str) -> bool {
    line.trim_end() == "--"
}

fn is_quote_header(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("On ") && trimmed.ends_with("wrote:")
}

fn is_forwarded_header(line: &str) -> bool {
    line.starts_with("From:")
}

fn cap_length(body: &str) -> String {
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_signature() {
        let body = "I cannot log in.\n\n--\nAlice\nACME Corp";
        assert_eq!(sanitize(body), "I cannot log in.");
    }

    #[test]
    fn strips_rfc3676_signature_delimiter() {
        let body = "Still broken.\r\n-- \r\nBob\r\n";
        assert_eq!(sanitize(body), "Still broken.");
    }

    #[test]
    fn dashes_inside_a_line_are_kept() {
        let body = "Step 1 -- open the app\n--- not a delimiter\nStep 2";
        assert_eq!(sanitize(body), body);
    }

    #[test]
    fn strips_quoted_reply() {
        let body = "Thanks, that worked.\n\nOn Mon, Jan 1, 2026 at 10:00 AM Support <help@example.com> wrote:\n> Try restarting";
        assert_eq!(sanitize(body), "Thanks, that worked.");
    }

    #[test]
    fn strips_prepended_original() {
        let body = "See below.\nFrom: Support <help@example.com>\nSent: Monday\nOriginal text";
        assert_eq!(sanitize(body), "See below.");
    }

    #[test]
    fn from_must_start_the_line() {
        let body = "Mail from: my boss is not arriving";
        assert_eq!(sanitize(body), body);
    }

    #[test]
    fn trims_whitespace() {
        assert_eq!(sanitize("\n\n   hello  \n\n"), "hello");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn caps_long_bodies() {
        let body = "x".repeat(MAX_BODY_CHARS + 250);
        let out = sanitize(&body);
        assert_eq!(
            out,
            format!("{}{TRUNCATION_MARKER}", "x".repeat(MAX_BODY_CHARS))
        );
    }

    #[test]
    fn body_at_limit_is_untouched() {
        let body = "y".repeat(MAX_BODY_CHARS);
        assert_eq!(sanitize(&body), body);
    }

    #[test]
    fn cap_counts_characters_not_bytes() {
        let body = "é".repeat(MAX_BODY_CHARS + 1);
        let out = sanitize(&body);
        let kept = out.strip_suffix(TRUNCATION_MARKER).unwrap();
        assert_eq!(kept.chars().count(), MAX_BODY_CHARS);
    }

    #[test]
    fn signature_is_removed_before_capping() {
        let body = format!("short question\n--\n{}", "s".repeat(MAX_BODY_CHARS * 2));
        assert_eq!(sanitize(&body), "short question");
    }

    #[test]
    fn html_is_rendered_as_text() {
        let html = "<html><head><style>p { color: red }</style></head><body><p>Hello&nbsp;<b>there</b></p><p>Line&nbsp;2 &amp; more</p></body></html>";
        assert_eq!(html_to_text(html), "Hello there\nLine 2 & more");
    }

    #[test]
    fn clean_body_sanitizes_html() {
        let html = "<div>Need help</div><div>--</div><div>Sig</div>";
        assert_eq!(clean_body(html, BodyKind::Html), "Need help");
    }

    #[test]
    fn clean_body_leaves_plain_markup_alone() {
        assert_eq!(clean_body("a <b> c", BodyKind::Plain), "a <b> c");
    }
}
