//! The CRDT engine boundary.
//!
//! This module provides [`Document`], a yrs [`Doc`] holding one repo
//! document. Everything the repo needs from the CRDT goes through here:
//! creating documents, applying local mutations, merging remote changes,
//! diffing two states and projecting a plain snapshot and clock.
//!
//! # Structure
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "fields"   user data, one JSON-encoded value per key
//! └── Y.Map "meta"     bookkeeping ("deleted" tombstone marker)
//! ```
//!
//! Each field is stored as a JSON string, so concurrent writes to the same
//! key resolve last-writer-wins while writes to different keys merge.
//!
//! # Clocks
//!
//! A document's clock is its yrs state vector. Removing a map entry only
//! adds to the delete set, which the state vector doesn't count, so a
//! transaction that removes anything also writes the `meta` "revision"
//! counter. Every non-empty local change therefore advances the writer's
//! entry in the clock.

use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, TransactionMut, Update};

use super::types::{Change, Fields, Snapshot};
use crate::clock::VectorClock;
use crate::error::{CevitxeError, Result};

/// The name of the Y.Map containing user fields.
const FIELDS_MAP_NAME: &str = "fields";

/// The name of the Y.Map containing bookkeeping values.
const META_MAP_NAME: &str = "meta";

/// Key of the tombstone marker in the meta map.
const DELETED_KEY: &str = "deleted";

/// Key of the counter bumped by transactions that remove entries.
const REVISION_KEY: &str = "revision";

/// Replica identifier used as the yrs client id.
///
/// The v1 update encoding carries client ids as 32-bit values, so wider ids
/// would be truncated on replay.
pub type ClientId = u32;

/// A CRDT document.
///
/// Values are treated as immutable: [`Document::change`] and
/// [`Document::apply_changes`] return a new document and leave `self` as is.
pub struct Document {
    client_id: ClientId,
    doc: Doc,
    fields: MapRef,
    meta: MapRef,
}

impl Document {
    /// Create an empty document owned by `client_id`.
    pub fn init(client_id: ClientId) -> Self {
        let doc = Doc::with_client_id(u64::from(client_id));
        let fields = doc.get_or_insert_map(FIELDS_MAP_NAME);
        let meta = doc.get_or_insert_map(META_MAP_NAME);
        Self {
            client_id,
            doc,
            fields,
            meta,
        }
    }

    /// Create a document whose initial value is `snapshot`.
    pub fn from_snapshot(client_id: ClientId, snapshot: &Snapshot) -> Self {
        let document = Self::init(client_id);
        {
            let mut edit = document.edit();
            edit.merge(&snapshot.fields);
            if snapshot.deleted {
                edit.mark_deleted();
            }
        }
        document
    }

    /// The replica id new changes are recorded under.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Apply a mutation, returning the resulting document.
    pub fn change<F>(&self, f: F) -> Result<Document>
    where
        F: FnOnce(&mut DocumentMut<'_>),
    {
        let next = self.fork()?;
        {
            let mut edit = next.edit();
            f(&mut edit);
        }
        Ok(next)
    }

    /// Merge changes (local or from a peer), returning the resulting document.
    ///
    /// Changes that were already applied are ignored by the CRDT, so this is
    /// idempotent.
    pub fn apply_changes(&self, changes: &[Change]) -> Result<Document> {
        let next = self.fork()?;
        next.merge_changes(changes)?;
        Ok(next)
    }

    /// True if `new` holds exactly the state of `old` and has no changes
    /// waiting on missing dependencies.
    pub fn is_unchanged(old: &Document, new: &Document) -> bool {
        let old_snapshot = old.doc.transact().snapshot();
        let txn = new.doc.transact();
        !txn.has_missing_updates() && txn.snapshot() == old_snapshot
    }

    /// Compute the changes that turn `old` into `new`.
    ///
    /// Returns an empty list when both documents hold the same state. Fails
    /// with [`CevitxeError::Diverged`] when `new` is not a descendant of
    /// `old`.
    pub fn get_changes(old: &Document, new: &Document) -> Result<Vec<Change>> {
        let (old_sv, old_snapshot) = {
            let txn = old.doc.transact();
            (txn.state_vector(), txn.snapshot())
        };
        let txn = new.doc.transact();

        if txn.snapshot() == old_snapshot {
            return Ok(Vec::new());
        }

        let old_clock = VectorClock::from_state_vector(&old_sv);
        let new_clock = VectorClock::from_state_vector(&txn.state_vector());
        if !new_clock.dominates(&old_clock) {
            return Err(CevitxeError::Diverged);
        }

        let update = txn.encode_state_as_update_v1(&old_sv);
        Ok(vec![Change::from_bytes(update)])
    }

    /// Encode the whole document as a single change.
    pub fn encode_state_as_change(&self) -> Change {
        let txn = self.doc.transact();
        Change::from_bytes(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// The document's clock.
    pub fn clock(&self) -> VectorClock {
        let txn = self.doc.transact();
        VectorClock::from_state_vector(&txn.state_vector())
    }

    /// Project the document to plain data.
    pub fn to_snapshot(&self) -> Snapshot {
        let txn = self.doc.transact();
        let fields = read_fields(&self.fields, &txn);
        let deleted = read_deleted(&self.meta, &txn);
        Snapshot { fields, deleted }
    }

    /// Whether the tombstone marker is set.
    pub fn is_deleted(&self) -> bool {
        let txn = self.doc.transact();
        read_deleted(&self.meta, &txn)
    }

    /// Read one field.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let txn = self.doc.transact();
        read_field(&self.fields, &txn, key)
    }

    /// Copy this document into a fresh yrs doc with the same client id.
    fn fork(&self) -> Result<Document> {
        let next = Document::init(self.client_id);
        let state = self.encode_state_as_change();
        next.merge_changes(std::slice::from_ref(&state))?;
        Ok(next)
    }

    fn merge_changes(&self, changes: &[Change]) -> Result<()> {
        let mut txn = self.doc.transact_mut();
        for change in changes {
            let update = Update::decode_v1(change.as_bytes())
                .map_err(|e| CevitxeError::Crdt(format!("Failed to decode change: {}", e)))?;
            txn.apply_update(update)
                .map_err(|e| CevitxeError::Crdt(format!("Failed to apply change: {}", e)))?;
        }
        Ok(())
    }

    fn edit(&self) -> DocumentMut<'_> {
        DocumentMut {
            txn: self.doc.transact_mut(),
            fields: self.fields.clone(),
            meta: self.meta.clone(),
            revised: false,
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("client_id", &self.client_id())
            .field("snapshot", &self.to_snapshot())
            .finish()
    }
}

/// Mutable view of a document inside a change.
///
/// All edits made through one `DocumentMut` form a single transaction,
/// committed when the view is dropped.
pub struct DocumentMut<'doc> {
    txn: TransactionMut<'doc>,
    fields: MapRef,
    meta: MapRef,
    /// Whether the revision counter was already bumped in this transaction
    revised: bool,
}

impl DocumentMut<'_> {
    /// Read a field
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        read_field(&self.fields, &self.txn, key)
    }

    /// Current fields
    pub fn fields(&self) -> Fields {
        read_fields(&self.fields, &self.txn)
    }

    /// Set a field. Writing a value equal to the current one is a no-op.
    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        let value = value.into();
        if self.get(key).as_ref() == Some(&value) {
            return;
        }
        self.fields.insert(&mut self.txn, key, value.to_string());
    }

    /// Remove a field
    pub fn remove(&mut self, key: &str) {
        if self.fields.remove(&mut self.txn, key).is_some() {
            self.bump_revision();
        }
    }

    /// Shallow-merge `fields` into the document (like `Object.assign`).
    pub fn merge(&mut self, fields: &Fields) {
        for (key, value) in fields {
            self.set(key, value.clone());
        }
    }

    /// Make the document hold exactly `snapshot`.
    pub fn replace(&mut self, snapshot: &Snapshot) {
        let stale: Vec<String> = self
            .fields
            .keys(&self.txn)
            .filter(|key| !snapshot.fields.contains_key(*key))
            .map(str::to_string)
            .collect();
        for key in stale {
            self.remove(&key);
        }
        self.merge(&snapshot.fields);
        if snapshot.deleted {
            self.mark_deleted();
        } else {
            self.restore();
        }
    }

    /// Set the tombstone marker
    pub fn mark_deleted(&mut self) {
        if !self.is_deleted() {
            self.meta
                .insert(&mut self.txn, DELETED_KEY, serde_json::Value::Bool(true).to_string());
        }
    }

    /// Clear the tombstone marker
    pub fn restore(&mut self) {
        if self.is_deleted() {
            self.meta
                .insert(&mut self.txn, DELETED_KEY, serde_json::Value::Bool(false).to_string());
        }
    }

    /// Whether the tombstone marker is set
    pub fn is_deleted(&self) -> bool {
        read_deleted(&self.meta, &self.txn)
    }

    /// Record an insertion so a removal shows up in the state vector.
    fn bump_revision(&mut self) {
        if self.revised {
            return;
        }
        let revision = read_field(&self.meta, &self.txn, REVISION_KEY)
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        self.meta.insert(
            &mut self.txn,
            REVISION_KEY,
            serde_json::Value::from(revision + 1).to_string(),
        );
        self.revised = true;
    }
}

fn read_field<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<serde_json::Value> {
    map.get(txn, key).and_then(|value| {
        let json = value.to_string(txn);
        serde_json::from_str(&json).ok()
    })
}

fn read_fields<T: ReadTxn>(map: &MapRef, txn: &T) -> Fields {
    map.iter(txn)
        .filter_map(|(key, value)| {
            let json = value.to_string(txn);
            let value: serde_json::Value = serde_json::from_str(&json).ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

fn read_deleted<T: ReadTxn>(meta: &MapRef, txn: &T) -> bool {
    matches!(
        read_field(meta, txn, DELETED_KEY),
        Some(serde_json::Value::Bool(true))
    )
}
