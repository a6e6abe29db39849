//! Core types for the document store.
//!
//! This module defines the data structures shared by the CRDT engine, the
//! storage adapters and the repo: opaque changes, change sets, plain-data
//! snapshots and the per-repo state maps.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;

/// Identifier of a document within a repo.
pub type DocumentId = String;

/// Plain JSON fields of a document.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Full in-memory state of a repo.
///
/// `None` marks a document id that is known but holds no data (a tombstone),
/// which is different from the id being absent altogether.
pub type RepoSnapshot = IndexMap<DocumentId, Option<Snapshot>>;

/// One batch of repo history, as exchanged with a peer.
pub type RepoHistory = IndexMap<DocumentId, Vec<Change>>;

/// An opaque CRDT change (a yrs v1 update).
///
/// Changes are only produced and consumed by [`Document`](super::Document);
/// everything else treats them as bytes. In JSON they travel as base64.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Change(#[serde(with = "base64_bytes")] Vec<u8>);

impl Change {
    /// Wrap raw update bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw update bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length change
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An ordered batch of changes for one document.
///
/// This is the unit of durable append and of peer transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Document the changes belong to
    pub document_id: DocumentId,

    /// Changes, in the order they must be applied
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Changes for one document
    pub fn new(document_id: impl Into<DocumentId>, changes: Vec<Change>) -> Self {
        Self {
            document_id: document_id.into(),
            changes,
        }
    }
}

/// Plain-data projection of a document's current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// User data
    #[serde(default)]
    pub fields: Fields,

    /// Soft deletion tombstone - if true, the document is considered deleted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl Snapshot {
    /// Create a live snapshot holding the given fields
    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            deleted: false,
        }
    }

    /// Build a snapshot from a JSON value, which must be an object.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(fields) => Some(Self::new(fields)),
            _ => None,
        }
    }

    /// Look up a field
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// The fields as a JSON object value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.fields.clone())
    }
}

/// A persisted snapshot together with the document clock it reflects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Document the snapshot belongs to
    pub document_id: DocumentId,

    /// Latest value of the document
    pub snapshot: Snapshot,

    /// Clock of the document when the snapshot was taken
    pub clock: VectorClock,
}

/// Serde helpers for raw bytes encoded as base64 text
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        use serde::de::Error;
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
