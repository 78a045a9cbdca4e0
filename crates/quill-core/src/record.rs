//! Canonical event and record types.
//!
//! A [`RawEvent`] is the decoded form of a gateway notification: an opaque
//! payload plus routing identifiers and an event kind. It is ephemeral and
//! owned by the event consumer until it is handed to the normalizer.
//!
//! A [`Record`] is the canonical unit that flows through the dedup cache,
//! the batcher, and the index writer. It is immutable once constructed.
//!
//! # Document Identity
//!
//! The document id is derived deterministically from the source channel id
//! and source message id, so repeated delivery of the same logical message
//! always yields the same id regardless of arrival order or process restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of an upstream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A new message was created.
    Create,
    /// An existing message was edited.
    Update,
    /// A message was deleted.
    Delete,
}

/// A decoded upstream event, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Source channel identifier.
    pub channel_id: String,

    /// Source message identifier.
    pub message_id: String,

    /// Event kind.
    pub kind: EventKind,

    /// Source timestamp in milliseconds. Monotonic per message: an edit
    /// always carries a later timestamp than the create it supersedes.
    pub timestamp: u64,

    /// Opaque payload. For create/update events this carries the message
    /// text and metadata; delete events typically have no payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// 32-byte content hash used for duplicate suppression.
pub type ContentHash = [u8; 32];

/// Canonical record as committed to the search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable document id derived from (channel id, message id).
    pub id: String,

    /// Source channel identifier, carried into the index document.
    pub channel_id: String,

    /// Normalized, ASCII-safe message text. Empty for tombstones.
    pub content: String,

    /// Monotonic version (source timestamp).
    pub version: u64,

    /// Marks a deletion rather than content.
    pub tombstone: bool,
}

impl Record {
    /// Hash of this record's content, for the dedup cache.
    pub fn content_hash(&self) -> ContentHash {
        content_hash(&self.content)
    }
}

/// Derive the stable document id for a (channel id, message id) pair.
///
/// Hashing rather than concatenating avoids id collisions when source
/// identifiers contain the separator character. The first 16 bytes of the
/// digest are plenty for uniqueness and keep index keys short.
pub fn document_id(channel_id: &str, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(message_id.as_bytes());
    let digest = hasher.finalize();

    let mut id = String::with_capacity(32);
    for byte in &digest[..16] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Hash content text for duplicate suppression.
pub fn content_hash(content: &str) -> ContentHash {
    let digest = Sha256::digest(content.as_bytes());
    digest.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_deterministic() {
        let a = document_id("chan-1", "msg-42");
        let b = document_id("chan-1", "msg-42");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_document_id_distinguishes_sources() {
        assert_ne!(document_id("chan-1", "msg-1"), document_id("chan-1", "msg-2"));
        assert_ne!(document_id("chan-1", "msg-1"), document_id("chan-2", "msg-1"));
    }

    #[test]
    fn test_document_id_no_separator_collision() {
        // "a" + "b-c" must not collide with "a-b" + "c"
        assert_ne!(document_id("a", "b-c"), document_id("a-b", "c"));
    }

    #[test]
    fn test_content_hash_differs_by_content() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("world"));
    }

    #[test]
    fn test_raw_event_json_round_trip() {
        let json = r#"{
            "channel_id": "123",
            "message_id": "456",
            "kind": "update",
            "timestamp": 1700000000000,
            "payload": {"text": "hi"}
        }"#;
        let event: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.payload["text"], "hi");
    }

    #[test]
    fn test_raw_event_delete_without_payload() {
        let json = r#"{"channel_id":"1","message_id":"2","kind":"delete","timestamp":5}"#;
        let event: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert!(event.payload.is_null());
    }
}
