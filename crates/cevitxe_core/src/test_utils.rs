//! Test utilities for cevitxe_core
//!
//! This module provides shared testing infrastructure: repo builders and a
//! storage adapter that can be told to fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::config::RepoOptions;
use crate::crdt::{
    ChangeSet, ChangeSetIter, DocumentId, MemoryStorage, RepoSnapshot, Snapshot, SnapshotIter,
    SnapshotRecord, StorageAdapter, StorageResult,
};
use crate::error::CevitxeError;
use crate::repo::Repo;

/// Build a snapshot from a JSON object literal.
pub fn snapshot(value: Value) -> Snapshot {
    Snapshot::from_json(value).expect("snapshot must be a JSON object")
}

/// A repo with a random client id on top of `storage` (not yet initialized).
pub fn new_repo<S: StorageAdapter + 'static>(storage: S) -> Repo {
    Repo::new(RepoOptions::new("test-key", "test"), Arc::new(storage))
}

/// A freshly created in-memory repo holding the given documents.
pub fn repo_from_snapshot(documents: &[(&str, Value)]) -> Repo {
    let state: RepoSnapshot = documents
        .iter()
        .map(|(id, value)| (id.to_string(), Some(snapshot(value.clone()))))
        .collect();

    let repo = new_repo(MemoryStorage::new());
    repo.init(&state, true).expect("init should succeed");
    repo
}

/// Storage whose `put_snapshot` can be made to fail, to simulate a crash
/// between the log append and the snapshot write.
#[derive(Debug, Clone, Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    fail_snapshots: Arc<AtomicBool>,
}

impl FailingStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            fail_snapshots: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            Err(CevitxeError::Io(std::io::Error::other(
                "snapshot write failed",
            )))
        } else {
            Ok(())
        }
    }
}

impl StorageAdapter for FailingStorage {
    fn open(&self) -> StorageResult<()> {
        self.inner.open()
    }

    fn close(&self) -> StorageResult<()> {
        self.inner.close()
    }

    fn has_data(&self) -> StorageResult<bool> {
        self.inner.has_data()
    }

    fn append_changes(&self, change_set: &ChangeSet) -> StorageResult<i64> {
        self.inner.append_changes(change_set)
    }

    fn changes(&self) -> StorageResult<ChangeSetIter<'_>> {
        self.inner.changes()
    }

    fn get_changes(&self, document_id: &str) -> StorageResult<Vec<ChangeSet>> {
        self.inner.get_changes(document_id)
    }

    fn document_ids(&self) -> StorageResult<Vec<DocumentId>> {
        self.inner.document_ids()
    }

    fn put_snapshot(&self, record: &SnapshotRecord) -> StorageResult<()> {
        self.check()?;
        self.inner.put_snapshot(record)
    }

    fn delete_snapshot(&self, document_id: &str) -> StorageResult<()> {
        self.inner.delete_snapshot(document_id)
    }

    fn snapshots(&self) -> StorageResult<SnapshotIter<'_>> {
        self.inner.snapshots()
    }

    fn clear(&self) -> StorageResult<()> {
        self.inner.clear()
    }
}
