//! Event normalization.
//!
//! [`normalize`] is a pure function from a decoded gateway event to a
//! canonical [`Record`], or `None` when the event carries nothing worth
//! indexing. It never touches the network or any shared state, so the same
//! input always produces the same output, independent of locale.

use crate::record::{document_id, EventKind, RawEvent, Record};
use deunicode::deunicode;

/// Normalize a raw event into a canonical record.
///
/// Returns `None` when the event should be dropped:
/// - create/update events with no recognizable payload
/// - events whose text is empty after normalization
///
/// Delete events always yield a tombstone record carrying no content.
pub fn normalize(event: &RawEvent) -> Option<Record> {
    let id = document_id(&event.channel_id, &event.message_id);

    if event.kind == EventKind::Delete {
        return Some(Record {
            id,
            channel_id: event.channel_id.clone(),
            content: String::new(),
            version: event.timestamp,
            tombstone: true,
        });
    }

    let text = extract_text(event)?;
    let content = normalize_text(text);
    if content.is_empty() {
        tracing::debug!(message_id = %event.message_id, "dropping event with empty content");
        return None;
    }

    Some(Record {
        id,
        channel_id: event.channel_id.clone(),
        content,
        version: event.timestamp,
        tombstone: false,
    })
}

/// Pull the message text out of an event payload.
///
/// The payload is either a bare JSON string or an object with a `text`
/// field. Anything else is unrecognized and dropped.
fn extract_text(event: &RawEvent) -> Option<&str> {
    match &event.payload {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => map.get("text").and_then(|v| v.as_str()),
        _ => {
            tracing::debug!(
                message_id = %event.message_id,
                "dropping event with unrecognized payload"
            );
            None
        }
    }
}

/// Transliterate text to an ASCII-safe representation and strip control
/// content.
///
/// Deterministic: same input, same output, locale-independent. Newlines
/// survive as spaces so word boundaries are preserved for the indexer.
pub fn normalize_text(text: &str) -> String {
    let ascii = deunicode(text);

    let mut out = String::with_capacity(ascii.len());
    let mut last_was_space = true; // leading whitespace is dropped
    for c in ascii.chars() {
        let c = if c.is_control() || c.is_whitespace() { ' ' } else { c };
        if c == ' ' {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }

    while out.ends_with(' ') {
        out.pop();
    }
    out
}
