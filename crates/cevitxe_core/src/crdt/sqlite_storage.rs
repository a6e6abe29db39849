//! SQLite-backed storage implementation for repo persistence.
//!
//! One database file holds one repo: the append-only change log of every
//! document and the latest snapshot of each.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{ChangeSetIter, SnapshotIter, StorageAdapter, StorageResult};
use super::types::{Change, ChangeSet, DocumentId, Snapshot, SnapshotRecord};
use crate::clock::VectorClock;
use crate::error::CevitxeError;

/// Number of log rows fetched per query while iterating the change log.
const CHANGES_PAGE_SIZE: i64 = 256;

/// SQLite-backed repo storage.
///
/// The connection is created by [`StorageAdapter::open`] and dropped by
/// [`StorageAdapter::close`]; a storage created with
/// [`SqliteStorage::in_memory`] therefore loses its data when closed.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
pub struct SqliteStorage {
    path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
    /// Create a storage backed by the database file at `path`.
    ///
    /// Nothing is touched on disk until the storage is opened.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            conn: Mutex::new(None),
        }
    }

    /// Create a storage backed by an in-memory SQLite database.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            conn: Mutex::new(None),
        }
    }

    /// Path of the database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the open connection.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(CevitxeError::StorageClosed)?;
        f(conn)
    }

    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Append-only change log
            CREATE TABLE IF NOT EXISTS changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                changes TEXT NOT NULL,
                appended_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_changes_document_id ON changes(document_id, id);

            -- Latest snapshot of each document
            CREATE TABLE IF NOT EXISTS snapshots (
                document_id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,
                clock TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Fetch up to one page of log rows with an id greater than `after_id`.
    fn changes_page(&self, after_id: i64) -> StorageResult<Vec<(i64, ChangeSet)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, document_id, changes FROM changes
                 WHERE id > ? ORDER BY id ASC LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![after_id, CHANGES_PAGE_SIZE], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, document_id, json)| -> StorageResult<(i64, ChangeSet)> {
                    let changes: Vec<Change> = serde_json::from_str(&json)?;
                    Ok((id, ChangeSet::new(document_id, changes)))
                })
                .collect()
        })
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StorageAdapter for SqliteStorage {
    fn open(&self) -> StorageResult<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }

        let conn = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        Self::init_schema(&conn)?;
        log::debug!("SqliteStorage: opened {:?}", self.path);
        *guard = Some(conn);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        if let Some(conn) = self.lock().take() {
            conn.close().map_err(|(_, e)| CevitxeError::Database(e))?;
            log::debug!("SqliteStorage: closed {:?}", self.path);
        }
        Ok(())
    }

    fn has_data(&self) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let has_data: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM changes) OR EXISTS(SELECT 1 FROM snapshots)",
                [],
                |row| row.get(0),
            )?;
            Ok(has_data)
        })
    }

    fn append_changes(&self, change_set: &ChangeSet) -> StorageResult<i64> {
        let json = serde_json::to_string(&change_set.changes)?;
        self.with_conn(|conn| {
            let now = chrono::Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO changes (document_id, changes, appended_at) VALUES (?, ?, ?)",
                params![change_set.document_id, json, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn changes(&self) -> StorageResult<ChangeSetIter<'_>> {
        // Fail fast when closed instead of on the first `next`.
        self.with_conn(|_| Ok(()))?;
        Ok(Box::new(ChangeLogPages {
            storage: self,
            after_id: 0,
            page: Vec::new().into_iter(),
            done: false,
        }))
    }

    fn get_changes(&self, document_id: &str) -> StorageResult<Vec<ChangeSet>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT changes FROM changes WHERE document_id = ? ORDER BY id ASC")?;
            let rows = stmt
                .query_map(params![document_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            rows.iter()
                .map(|json| -> StorageResult<ChangeSet> {
                    let changes: Vec<Change> = serde_json::from_str(json)?;
                    Ok(ChangeSet::new(document_id, changes))
                })
                .collect()
        })
    }

    fn document_ids(&self) -> StorageResult<Vec<DocumentId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT document_id FROM changes GROUP BY document_id ORDER BY MIN(id) ASC",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn put_snapshot(&self, record: &SnapshotRecord) -> StorageResult<()> {
        let snapshot = serde_json::to_string(&record.snapshot)?;
        let clock = serde_json::to_string(&record.clock)?;
        self.with_conn(|conn| {
            let now = chrono::Utc::now().timestamp_millis();
            conn.execute(
                "INSERT OR REPLACE INTO snapshots (document_id, snapshot, clock, updated_at)
                 VALUES (?, ?, ?, ?)",
                params![record.document_id, snapshot, clock, now],
            )?;
            Ok(())
        })
    }

    fn delete_snapshot(&self, document_id: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM snapshots WHERE document_id = ?",
                params![document_id],
            )?;
            Ok(())
        })
    }

    fn snapshots(&self) -> StorageResult<SnapshotIter<'_>> {
        let records = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT document_id, snapshot, clock FROM snapshots ORDER BY document_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        Ok(Box::new(records.into_iter().map(
            |(document_id, snapshot, clock)| -> StorageResult<SnapshotRecord> {
                let snapshot: Snapshot = serde_json::from_str(&snapshot)?;
                let clock: VectorClock = serde_json::from_str(&clock)?;
                Ok(SnapshotRecord {
                    document_id,
                    snapshot,
                    clock,
                })
            },
        )))
    }

    fn clear(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("DELETE FROM changes; DELETE FROM snapshots;")?;
            Ok(())
        })
    }
}

impl SqliteStorage {
    /// Latest snapshot record of one document, if any.
    pub fn get_snapshot(&self, document_id: &str) -> StorageResult<Option<SnapshotRecord>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT snapshot, clock FROM snapshots WHERE document_id = ?",
                    params![document_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(row)
        })?;

        match row {
            Some((snapshot, clock)) => Ok(Some(SnapshotRecord {
                document_id: document_id.to_string(),
                snapshot: serde_json::from_str(&snapshot)?,
                clock: serde_json::from_str(&clock)?,
            })),
            None => Ok(None),
        }
    }
}

/// Lazily pages through the change log by row id.
struct ChangeLogPages<'a> {
    storage: &'a SqliteStorage,
    after_id: i64,
    page: std::vec::IntoIter<(i64, ChangeSet)>,
    done: bool,
}

impl Iterator for ChangeLogPages<'_> {
    type Item = StorageResult<ChangeSet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((id, change_set)) = self.page.next() {
                self.after_id = id;
                return Some(Ok(change_set));
            }
            if self.done {
                return None;
            }

            match self.storage.changes_page(self.after_id) {
                Ok(rows) => {
                    if (rows.len() as i64) < CHANGES_PAGE_SIZE {
                        self.done = true;
                    }
                    self.page = rows.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
