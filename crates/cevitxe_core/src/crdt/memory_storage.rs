//! In-memory storage implementation.
//!
//! This provides a simple in-memory implementation of [`StorageAdapter`]
//! for use in unit tests and for peers that don't need to persist anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::storage::{ChangeSetIter, SnapshotIter, StorageAdapter, StorageResult};
use indexmap::IndexSet;

use super::types::{ChangeSet, DocumentId, SnapshotRecord};
use crate::error::CevitxeError;

/// In-memory repo storage.
///
/// This implementation stores all data in memory using `Vec` and `HashMap`.
/// It's thread-safe via `RwLock` but data is lost when dropped. Clones share
/// the same underlying data, which lets tests "restart" a repo on top of the
/// storage of a previous one.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    /// Change log, in append order
    changes: Arc<RwLock<Vec<StoredChangeSet>>>,

    /// Snapshots (document id -> record)
    snapshots: Arc<RwLock<HashMap<String, SnapshotRecord>>>,

    open: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
struct StoredChangeSet {
    id: i64,
    change_set: ChangeSet,
    /// Unix timestamp when the change set was appended (milliseconds)
    #[allow(dead_code)]
    appended_at: i64,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `open` was called (and `close` wasn't since)
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of change sets in the log.
    pub fn change_set_count(&self) -> usize {
        self.changes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CevitxeError::StorageClosed)
        }
    }
}

impl StorageAdapter for MemoryStorage {
    fn open(&self) -> StorageResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn has_data(&self) -> StorageResult<bool> {
        self.ensure_open()?;
        let changes = self.changes.read().unwrap_or_else(PoisonError::into_inner);
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        Ok(!changes.is_empty() || !snapshots.is_empty())
    }

    fn append_changes(&self, change_set: &ChangeSet) -> StorageResult<i64> {
        self.ensure_open()?;
        let mut changes = self.changes.write().unwrap_or_else(PoisonError::into_inner);
        let id = changes.last().map(|c| c.id).unwrap_or(0) + 1;
        changes.push(StoredChangeSet {
            id,
            change_set: change_set.clone(),
            appended_at: chrono::Utc::now().timestamp_millis(),
        });
        Ok(id)
    }

    fn changes(&self) -> StorageResult<ChangeSetIter<'_>> {
        self.ensure_open()?;
        let changes = self.changes.read().unwrap_or_else(PoisonError::into_inner);
        let log: Vec<ChangeSet> = changes.iter().map(|c| c.change_set.clone()).collect();
        Ok(Box::new(log.into_iter().map(Ok)))
    }

    fn get_changes(&self, document_id: &str) -> StorageResult<Vec<ChangeSet>> {
        self.ensure_open()?;
        let changes = self.changes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(changes
            .iter()
            .filter(|c| c.change_set.document_id == document_id)
            .map(|c| c.change_set.clone())
            .collect())
    }

    fn document_ids(&self) -> StorageResult<Vec<DocumentId>> {
        self.ensure_open()?;
        let changes = self.changes.read().unwrap_or_else(PoisonError::into_inner);
        let ids: IndexSet<&DocumentId> = changes
            .iter()
            .map(|c| &c.change_set.document_id)
            .collect();
        Ok(ids.into_iter().cloned().collect())
    }

    fn put_snapshot(&self, record: &SnapshotRecord) -> StorageResult<()> {
        self.ensure_open()?;
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.insert(record.document_id.clone(), record.clone());
        Ok(())
    }

    fn delete_snapshot(&self, document_id: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.remove(document_id);
        Ok(())
    }

    fn snapshots(&self) -> StorageResult<SnapshotIter<'_>> {
        self.ensure_open()?;
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        let records: Vec<SnapshotRecord> = snapshots.values().cloned().collect();
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn clear(&self) -> StorageResult<()> {
        self.ensure_open()?;
        self.changes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
