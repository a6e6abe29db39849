//! Storage abstraction for repo persistence.
//!
//! This module defines the [`StorageAdapter`] trait which abstracts over
//! different storage backends (SQLite, in-memory) for persisting document
//! change logs and snapshots.

use super::types::{ChangeSet, DocumentId, SnapshotRecord};
use crate::error::CevitxeError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, CevitxeError>;

/// Lazy sequence of change sets in append order.
pub type ChangeSetIter<'a> = Box<dyn Iterator<Item = StorageResult<ChangeSet>> + 'a>;

/// Lazy sequence of persisted snapshots.
pub type SnapshotIter<'a> = Box<dyn Iterator<Item = StorageResult<SnapshotRecord>> + 'a>;

/// Trait for repo storage backends.
///
/// Implementations of this trait persist the data of one repo (one discovery
/// key) to a backend (SQLite for native, memory for tests and short-lived
/// peers).
///
/// # Storage Model
///
/// The storage maintains two kinds of data:
/// 1. **Change log**: append-only change sets, in the order they were
///    appended, for every document. This is the source of truth.
/// 2. **Snapshots**: the latest plain-data value and clock of each document,
///    for fast cold starts. A snapshot can always be rebuilt from the log.
///
/// ```text
/// changes
///   1: { document_id: abc123, changes: [...] }
///   2: { document_id: abc123, changes: [...] }
///   3: { document_id: qrs567, changes: [...] }
/// snapshots
///   abc123: { snapshot: {...}, clock: {...} }
///   qrs567: { snapshot: {...}, clock: {...} }
/// ```
///
/// Every operation other than `open`/`close` fails with
/// [`CevitxeError::StorageClosed`] while the adapter is closed.
pub trait StorageAdapter: Send + Sync {
    /// Acquire the backend's resources. Calling it on an open adapter is a no-op.
    fn open(&self) -> StorageResult<()>;

    /// Release the backend's resources. Calling it on a closed adapter is a no-op.
    fn close(&self) -> StorageResult<()>;

    /// Returns true if any change sets or snapshots are persisted.
    fn has_data(&self) -> StorageResult<bool>;

    /// Append a change set to the log.
    ///
    /// Returns the ID of the newly created log record. Records are never
    /// rewritten.
    fn append_changes(&self, change_set: &ChangeSet) -> StorageResult<i64>;

    /// Iterate over the whole change log in append order.
    fn changes(&self) -> StorageResult<ChangeSetIter<'_>>;

    /// Get all change sets of one document, in append order.
    fn get_changes(&self, document_id: &str) -> StorageResult<Vec<ChangeSet>>;

    /// Ids of every document with at least one change set, ordered by their
    /// first append.
    fn document_ids(&self) -> StorageResult<Vec<DocumentId>>;

    /// Save a document snapshot, replacing any previous one.
    fn put_snapshot(&self, record: &SnapshotRecord) -> StorageResult<()>;

    /// Delete a document snapshot. The document's change log is kept.
    fn delete_snapshot(&self, document_id: &str) -> StorageResult<()>;

    /// Iterate over all persisted snapshots.
    fn snapshots(&self) -> StorageResult<SnapshotIter<'_>>;

    /// Discard all persisted data (change log and snapshots).
    fn clear(&self) -> StorageResult<()>;
}

