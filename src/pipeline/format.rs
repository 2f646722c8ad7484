//! Canonical `<message>` payload formatting.
//!
//! Downstream consumers parse this fragment, so attribute names, quoting
//! and the CDATA wrapping must stay exactly as they are.

use crate::pipeline::types::OutboundPayload;

/// Build the outbound payload.
///
/// `author` and `channels_csv` are entity-escaped for the single-quoted
/// attributes. `subject` and `body` go into the CDATA block untouched.
pub fn format_payload(author: &str, subject: &str, body: &str, channels_csv: &str) -> OutboundPayload {
    let mut out = String::with_capacity(
        64 + author.len() + subject.len() + body.len() + channels_csv.len(),
    );
    out.push_str("<message channels='");
    out.push_str(&escape_attr(channels_csv));
    out.push_str("' author='");
    out.push_str(&escape_attr(author));
    out.push_str("'><![CDATA[");
    out.push_str(subject);
    out.push('\n');
    out.push_str(body);
    out.push_str("]]></message>");
    OutboundPayload::new(out)
}

/// Escape `& < > " '` for embedding in a markup attribute.
pub(crate) fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
