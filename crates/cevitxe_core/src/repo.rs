//! Document repository.
//!
//! A [`Repo`] manages a set of CRDT documents belonging to one dataset (one
//! discovery key). For each document it persists:
//!
//! 1. the document history, as an append-only log of change sets, and
//! 2. a snapshot of the document's latest state together with its clock.
//!
//! In memory it keeps the snapshot of every known document (the
//! [`RepoSnapshot`]) and a vector clock per document. Documents themselves
//! are never cached: every read or write rebuilds the document by replaying
//! its change log, so the log is always the source of truth.
//!
//! # Write path
//!
//! ```text
//! change(id, f)
//!   ├── rebuild old doc from the log
//!   ├── apply f                      -> new doc
//!   ├── diff old..new                -> changes (empty: stop here)
//!   ├── drop the persisted snapshot
//!   ├── append ChangeSet to the log
//!   ├── merge clock, store snapshot (unless tombstoned)
//!   └── notify handlers
//! ```
//!
//! Writes to one document are serialized by a per-document lock; writes to
//! different documents run concurrently. Handlers run after the lock is
//! released, so they may write to the repo themselves.
//!
//! # Cold start
//!
//! A document that has change sets but no snapshot record is rebuilt from
//! its log when the repo is initialized. That covers tombstoned documents
//! (their record is deleted) and writes whose snapshot never made it to
//! storage.
//!
//! # Snapshot-only overlay
//!
//! [`Repo::change_snapshot`] and friends edit the in-memory state without
//! touching storage, so a UI can update synchronously. The overlay may
//! diverge from the log until the next durable write of the same document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::clock::{ClockMap, VectorClock, merge_clocks};
use crate::collection::Collection;
use crate::config::RepoOptions;
use crate::crdt::{
    Change, ChangeEntry, ChangeSet, ChangeSetIter, ClientId, Document, DocumentId, DocumentMut,
    Mutation, RepoHistory, RepoSnapshot, Snapshot, SnapshotRecord, StorageAdapter,
};
use crate::error::Result;

/// Result returned by a [`RepoEventHandler`].
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback invoked after every durable, non-empty write of a document.
pub type RepoEventHandler = Arc<dyn Fn(&str, &Document) -> HandlerResult + Send + Sync>;

/// Default number of change sets per history batch.
pub const DEFAULT_HISTORY_BATCH_SIZE: usize = 1000;

/// Handle returned by [`Repo::add_handler`], used to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A repository of CRDT documents.
///
/// # Example
///
/// ```ignore
/// use cevitxe_core::config::RepoOptions;
/// use cevitxe_core::crdt::MemoryStorage;
/// use cevitxe_core::repo::Repo;
/// use std::sync::Arc;
///
/// let repo = Repo::new(RepoOptions::new("golden-lizard", "grid"), Arc::new(MemoryStorage::new()));
/// repo.init(&RepoSnapshot::new(), true)?;
///
/// repo.change("abc123", |doc| doc.set("title", "hello"))?;
/// assert_eq!(repo.get_snapshot("abc123").unwrap().get("title"), Some(&json!("hello")));
/// ```
pub struct Repo {
    options: RepoOptions,
    client_id: ClientId,
    storage: Arc<dyn StorageAdapter>,

    /// In-memory map of document snapshots
    state: RwLock<RepoSnapshot>,

    /// In-memory map of document clocks
    clocks: RwLock<ClockMap>,

    /// Change listeners, in registration order
    handlers: RwLock<Vec<(HandlerId, RepoEventHandler)>>,
    next_handler_id: AtomicU64,

    /// Per-document write locks, created lazily
    document_locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl Repo {
    /// Create a repo on top of the given storage.
    pub fn new(options: RepoOptions, storage: Arc<dyn StorageAdapter>) -> Self {
        let client_id = options.resolve_client_id();
        log::debug!(
            "Repo: new {} for {} (client {})",
            options.database_name,
            options.discovery_key,
            client_id
        );
        Self {
            options,
            client_id,
            storage,
            state: RwLock::new(RepoSnapshot::new()),
            clocks: RwLock::new(ClockMap::new()),
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            document_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a repo with the platform's default storage.
    ///
    /// With the `sqlite` feature on native targets this is a SQLite database
    /// at [`RepoOptions::database_path`]; otherwise the repo lives in memory.
    pub fn with_default_storage(options: RepoOptions) -> Result<Self> {
        #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
        let storage: Arc<dyn StorageAdapter> = Arc::new(crate::crdt::SqliteStorage::new(
            options.database_path()?,
        ));
        #[cfg(not(all(not(target_arch = "wasm32"), feature = "sqlite")))]
        let storage: Arc<dyn StorageAdapter> = Arc::new(crate::crdt::MemoryStorage::new());

        Ok(Self::new(options, storage))
    }

    /// Options the repo was created with
    pub fn options(&self) -> &RepoOptions {
        &self.options
    }

    /// Actor id this repo records its own changes under.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The underlying storage adapter
    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the storage adapter.
    pub fn open(&self) -> Result<()> {
        self.storage.open()
    }

    /// Close the storage adapter.
    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }

    /// Initialize the repo and return a copy of its state.
    ///
    /// `creating = true` starts a new dataset from `initial_state`, discarding
    /// anything persisted before. `creating = false` joins an existing
    /// dataset: an empty repo if nothing is persisted (the history will come
    /// from a peer), or the persisted snapshots and clocks otherwise.
    pub fn init(&self, initial_state: &RepoSnapshot, creating: bool) -> Result<RepoSnapshot> {
        self.open()?;
        self.write_state().clear();
        self.write_clocks().clear();

        let has_data = self.storage.has_data()?;
        if creating {
            log::info!("Repo: creating a new repo");
            if has_data {
                self.storage.clear()?;
            }
            self.create_from_snapshot(initial_state)?;
        } else if !has_data {
            log::info!("Repo: joining a peer's repo for the first time");
        } else {
            log::info!("Repo: recovering an existing repo from persisted state");
            self.load_snapshots_from_storage()?;
        }
        Ok(self.get_state())
    }

    /// Persist every non-empty entry of `state` as a document.
    pub fn create_from_snapshot(&self, state: &RepoSnapshot) -> Result<()> {
        for (document_id, snapshot) in state {
            let Some(snapshot) = snapshot else {
                continue;
            };
            let (new, saved) = {
                let lock = self.document_lock(document_id);
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

                let old = self.rebuild(document_id)?;
                let new = if old.clock().is_empty() {
                    Document::from_snapshot(self.client_id, snapshot)
                } else {
                    old.change(|doc| doc.replace(snapshot))?
                };
                let changes = self.diff(document_id, &old, &new);
                let saved = self.save(document_id, &new, changes)?;
                (new, saved)
            };
            if saved {
                self.notify(document_id, &new);
            }
        }
        Ok(())
    }

    fn load_snapshots_from_storage(&self) -> Result<()> {
        let mut loaded = 0usize;
        for record in self.storage.snapshots()? {
            let SnapshotRecord {
                document_id,
                snapshot,
                clock,
            } = record?;
            self.write_state().insert(document_id.clone(), Some(snapshot));
            self.write_clocks().insert(document_id, clock);
            loaded += 1;
        }
        log::debug!("Repo: loaded {} snapshots", loaded);

        let mut rebuilt = 0usize;
        for document_id in self.storage.document_ids()? {
            if self.has(&document_id) {
                continue;
            }
            let lock = self.document_lock(&document_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let doc = self.rebuild(&document_id)?;
            self.save_snapshot(&document_id, &doc)?;
            rebuilt += 1;
        }
        if rebuilt > 0 {
            log::info!("Repo: rebuilt {} documents without a snapshot from their log", rebuilt);
        }
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Ids of every document known in memory, including tombstoned ones.
    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.read_state().keys().cloned().collect()
    }

    /// True if this repo knows the document, even if it has been deleted.
    pub fn has(&self, document_id: &str) -> bool {
        self.read_state().contains_key(document_id)
    }

    /// Number of known documents, including deleted ones.
    pub fn count(&self) -> usize {
        self.read_state().len()
    }

    /// Reconstitute a document from its change history.
    pub fn get(&self, document_id: &str) -> Result<Option<Document>> {
        log::debug!("Repo: get {}", document_id);
        if !self.has(document_id) {
            return Ok(None);
        }
        self.rebuild(document_id).map(Some)
    }

    /// Save a new version of a document.
    ///
    /// When `changes` is `None` they are computed by diffing against the
    /// document rebuilt from the log. A version that changes nothing is
    /// ignored: nothing is written and no handler runs.
    pub fn set(
        &self,
        document_id: &str,
        doc: &Document,
        changes: Option<Vec<Change>>,
    ) -> Result<()> {
        let saved = {
            let lock = self.document_lock(document_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let changes = match changes {
                Some(changes) => changes,
                None => {
                    let old = self.rebuild(document_id)?;
                    self.diff(document_id, &old, doc)
                }
            };
            self.save(document_id, doc, changes)?
        };
        if saved {
            self.notify(document_id, doc);
        }
        Ok(())
    }

    /// Update a document with a change function and return the new version.
    pub fn change<F>(&self, document_id: &str, f: F) -> Result<Document>
    where
        F: FnOnce(&mut DocumentMut<'_>),
    {
        log::debug!("Repo: change {}", document_id);
        let (new, saved) = {
            let lock = self.document_lock(document_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let old = self.rebuild(document_id)?;
            let new = old.change(f)?;
            let changes = self.diff(document_id, &old, &new);
            let saved = self.save(document_id, &new, changes)?;
            (new, saved)
        };
        if saved {
            self.notify(document_id, &new);
        }
        Ok(new)
    }

    /// Update a document with a typed mutation.
    pub fn apply_mutation(&self, document_id: &str, mutation: &Mutation) -> Result<Document> {
        self.change(document_id, |doc| mutation.run(doc))
    }

    /// Merge changes (typically received from a peer) into a document.
    pub fn apply_changes(&self, document_id: &str, changes: &[Change]) -> Result<Document> {
        log::debug!(
            "Repo: apply {} changes to {}",
            changes.len(),
            document_id
        );
        let (new, saved) = {
            let lock = self.document_lock(document_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let old = self.rebuild(document_id)?;
            let new = old.apply_changes(changes)?;
            if Document::is_unchanged(&old, &new) {
                log::debug!("Repo: {} already has these changes", document_id);
                return Ok(new);
            }
            let saved = self.save(document_id, &new, changes.to_vec())?;
            (new, saved)
        };
        if saved {
            self.notify(document_id, &new);
        }
        Ok(new)
    }

    /// Durably apply every entry of a change map, in order.
    pub fn apply_change_map(&self, change_map: &[ChangeEntry]) -> Result<()> {
        for entry in change_map {
            match entry {
                ChangeEntry::Mutate {
                    document_id,
                    mutation,
                } => {
                    self.apply_mutation(document_id, mutation)?;
                }
                ChangeEntry::DropCollection(name) => {
                    let dropped = Collection::new(name).mark_all_deleted(self)?;
                    log::debug!("Repo: dropped collection {} ({} items)", name, dropped);
                }
            }
        }
        Ok(())
    }

    /// Apply a change map to the in-memory snapshots only.
    pub fn change_snapshots(&self, change_map: &[ChangeEntry]) {
        for entry in change_map {
            match entry {
                ChangeEntry::Mutate {
                    document_id,
                    mutation,
                } => self.change_snapshot(document_id, |doc| mutation.run(doc)),
                ChangeEntry::DropCollection(name) => {
                    Collection::new(name).remove_all_from_snapshot(self);
                }
            }
        }
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Stream the whole change log in batches, for sending to a new peer.
    ///
    /// A batch is emitted once it holds more than `batch_size` change sets;
    /// the last (possibly empty) batch is always emitted.
    pub fn get_history(&self, batch_size: usize) -> Result<HistoryBatches<'_>> {
        Ok(HistoryBatches {
            changes: self.storage.changes()?,
            batch_size,
            done: false,
        })
    }

    /// Apply a history batch received from a peer.
    pub fn load_history(&self, history: &RepoHistory) -> Result<()> {
        for (document_id, changes) in history {
            self.apply_changes(document_id, changes)?;
        }
        Ok(())
    }

    // ========================================================================
    // Clocks
    // ========================================================================

    /// A document's clock, or the empty clock if none is known.
    pub fn get_clock(&self, document_id: &str) -> VectorClock {
        self.read_clocks()
            .get(document_id)
            .cloned()
            .unwrap_or_default()
    }

    /// True if a clock is known for the document.
    pub fn has_clock(&self, document_id: &str) -> bool {
        self.read_clocks().contains_key(document_id)
    }

    /// Copy of every known clock.
    pub fn get_clocks(&self) -> ClockMap {
        self.read_clocks().clone()
    }

    /// Merge `clock` into the document's clock (pointwise max).
    pub fn update_clock(&self, document_id: &str, clock: &VectorClock) {
        let mut clocks = self.write_clocks();
        let merged = merge_clocks(clocks.get(document_id), clock);
        clocks.insert(document_id.to_string(), merged);
    }

    // ========================================================================
    // Snapshot-only overlay
    // ========================================================================

    /// In-memory snapshot of a document (`None` if unknown or deleted).
    pub fn get_snapshot(&self, document_id: &str) -> Option<Snapshot> {
        self.read_state().get(document_id).cloned().flatten()
    }

    /// Change a document's in-memory snapshot without recording any change.
    pub fn change_snapshot<F>(&self, document_id: &str, f: F)
    where
        F: FnOnce(&mut DocumentMut<'_>),
    {
        let old = self.get_snapshot(document_id).unwrap_or_default();
        match Document::from_snapshot(self.client_id, &old).change(f) {
            Ok(doc) => {
                log::debug!("Repo: changed snapshot {}", document_id);
                self.set_snapshot(document_id, doc.to_snapshot());
            }
            Err(e) => log::warn!("Repo: could not change snapshot {}: {}", document_id, e),
        }
    }

    /// Set a document's in-memory snapshot. A deleted snapshot is removed.
    pub fn set_snapshot(&self, document_id: &str, snapshot: Snapshot) {
        if snapshot.deleted {
            self.remove_snapshot(document_id);
        } else {
            self.write_state()
                .insert(document_id.to_string(), Some(snapshot));
        }
    }

    /// Forget a document's snapshot but remember that the document exists.
    pub fn remove_snapshot(&self, document_id: &str) {
        log::debug!("Repo: remove snapshot {}", document_id);
        self.write_state().insert(document_id.to_string(), None);
    }

    /// Copy of the whole in-memory state.
    pub fn get_state(&self) -> RepoSnapshot {
        self.read_state().clone()
    }

    /// Merge entries into the in-memory state.
    pub fn load_state(&self, state: RepoSnapshot) {
        self.write_state().extend(state);
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Register a change listener.
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str, &Document) -> HandlerResult + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a change listener. Returns false if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    fn notify(&self, document_id: &str, doc: &Document) {
        // Handlers may register or remove handlers, so don't hold the lock.
        let handlers: Vec<RepoEventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if let Err(e) = handler(document_id, doc) {
                log::warn!("Repo: handler failed for {}: {}", document_id, e);
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Recreate a document from its change history (empty if it has none).
    fn rebuild(&self, document_id: &str) -> Result<Document> {
        let doc = Document::init(self.client_id);
        let changes: Vec<Change> = self
            .storage
            .get_changes(document_id)?
            .into_iter()
            .flat_map(|change_set| change_set.changes)
            .collect();
        if changes.is_empty() {
            return Ok(doc);
        }
        doc.apply_changes(&changes)
    }

    /// Changes from `old` to `new`. A failed diff counts as no changes.
    fn diff(&self, document_id: &str, old: &Document, new: &Document) -> Vec<Change> {
        match Document::get_changes(old, new) {
            Ok(changes) => changes,
            Err(e) => {
                log::warn!("Repo: ignoring update of {}: {}", document_id, e);
                Vec::new()
            }
        }
    }

    /// Persist `changes` and the resulting snapshot. Returns whether anything
    /// was written, in which case the caller notifies handlers once it has
    /// released the document lock.
    ///
    /// The old snapshot record is dropped before the append, so a snapshot
    /// write that fails (or never happens) leaves no stale record behind and
    /// the next cold start rebuilds the document from its log.
    fn save(&self, document_id: &str, doc: &Document, changes: Vec<Change>) -> Result<bool> {
        if changes.is_empty() {
            log::debug!("Repo: no changes to {}", document_id);
            return Ok(false);
        }

        log::debug!(
            "Repo: appending {} changes to {}",
            changes.len(),
            document_id
        );
        self.storage.delete_snapshot(document_id)?;
        self.storage
            .append_changes(&ChangeSet::new(document_id, changes))?;
        self.save_snapshot(document_id, doc)?;
        Ok(true)
    }

    fn save_snapshot(&self, document_id: &str, doc: &Document) -> Result<()> {
        let snapshot = doc.to_snapshot();
        let clock = doc.clock();
        self.update_clock(document_id, &clock);

        if snapshot.deleted {
            self.remove_snapshot(document_id);
            Ok(())
        } else {
            self.set_snapshot(document_id, snapshot.clone());
            self.storage.put_snapshot(&SnapshotRecord {
                document_id: document_id.to_string(),
                snapshot,
                clock,
            })
        }
    }

    fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .document_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(document_id.to_string()).or_default())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RepoSnapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RepoSnapshot> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_clocks(&self) -> std::sync::RwLockReadGuard<'_, ClockMap> {
        self.clocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_clocks(&self) -> std::sync::RwLockWriteGuard<'_, ClockMap> {
        self.clocks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("options", &self.options)
            .field("client_id", &self.client_id)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

/// Batches of repo history, produced by [`Repo::get_history`].
pub struct HistoryBatches<'a> {
    changes: ChangeSetIter<'a>,
    batch_size: usize,
    done: bool,
}

impl Iterator for HistoryBatches<'_> {
    type Item = Result<RepoHistory>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut batch = RepoHistory::new();
        let mut entries = 0usize;
        loop {
            match self.changes.next() {
                Some(Ok(ChangeSet {
                    document_id,
                    changes,
                })) => {
                    batch.entry(document_id).or_default().extend(changes);
                    entries += 1;
                    if entries > self.batch_size {
                        return Some(Ok(batch));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return Some(Ok(batch));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryStorage;
    use crate::error::CevitxeError;
    use crate::test_utils::{FailingStorage, new_repo, repo_from_snapshot, snapshot};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn title(repo: &Repo, id: &str) -> Option<serde_json::Value> {
        repo.get_snapshot(id).and_then(|s| s.get("title").cloned())
    }

    #[test]
    fn test_init_creating_persists_initial_state() {
        let repo = repo_from_snapshot(&[
            ("abc", json!({"title": "a"})),
            ("def", json!({"title": "b"})),
        ]);

        assert_eq!(repo.count(), 2);
        assert!(repo.has("abc"));
        assert_eq!(title(&repo, "def"), Some(json!("b")));
        assert!(repo.has_clock("abc"));

        let doc = repo.get("abc").unwrap().unwrap();
        assert_eq!(doc.get("title"), Some(json!("a")));
    }

    #[test]
    fn test_init_creating_skips_empty_entries() {
        let repo = new_repo(MemoryStorage::new());
        let mut state = RepoSnapshot::new();
        state.insert("gone".into(), None);
        state.insert("here".into(), Some(snapshot(json!({"n": 1}))));

        let result = repo.init(&state, true).unwrap();
        assert_eq!(result.len(), 1);
        assert!(!repo.has("gone"));
    }

    #[test]
    fn test_init_creating_discards_previous_data() {
        let storage = MemoryStorage::new();
        let repo = new_repo(storage.clone());
        let mut state = RepoSnapshot::new();
        state.insert("old".into(), Some(snapshot(json!({"n": 1}))));
        repo.init(&state, true).unwrap();

        let repo = new_repo(storage.clone());
        let result = repo.init(&RepoSnapshot::new(), true).unwrap();
        assert!(result.is_empty());
        assert!(!storage.has_data().unwrap());
    }

    #[test]
    fn test_init_joining_empty_storage() {
        let repo = new_repo(MemoryStorage::new());
        let mut state = RepoSnapshot::new();
        state.insert("ignored".into(), Some(snapshot(json!({"n": 1}))));

        let result = repo.init(&state, false).unwrap();
        assert!(result.is_empty());
        assert_eq!(repo.count(), 0);
    }

    #[test]
    fn test_cold_start_restores_snapshots_and_clocks() {
        let storage = MemoryStorage::new();
        let repo = new_repo(storage.clone());
        repo.init(&RepoSnapshot::new(), true).unwrap();
        repo.change("abc", |d| d.set("title", "hello")).unwrap();
        repo.change("del", |d| d.set("title", "bye")).unwrap();
        repo.change("del", |d| d.mark_deleted()).unwrap();
        let clock = repo.get_clock("abc");

        let deleted_clock = repo.get_clock("del");

        let restarted = new_repo(storage);
        let state = restarted.init(&RepoSnapshot::new(), false).unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(title(&restarted, "abc"), Some(json!("hello")));
        assert_eq!(restarted.get_clock("abc"), clock);

        // Tombstones come back from the log
        assert!(restarted.has("del"));
        assert_eq!(state.get("del"), Some(&None));
        assert_eq!(restarted.get_clock("del"), deleted_clock);
    }

    #[test]
    fn test_get_unknown_document() {
        let repo = repo_from_snapshot(&[]);
        assert!(repo.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_replay_matches_snapshot() {
        let repo = repo_from_snapshot(&[("abc", json!({"n": 0}))]);
        for i in 1..5 {
            repo.change("abc", |d| d.set("n", i)).unwrap();
        }
        repo.change("abc", |d| d.set("extra", true)).unwrap();
        repo.change("abc", |d| d.remove("extra")).unwrap();

        let replayed = repo.get("abc").unwrap().unwrap();
        assert_eq!(Some(replayed.to_snapshot()), repo.get_snapshot("abc"));
        assert_eq!(replayed.clock(), repo.get_clock("abc"));
    }

    #[test]
    fn test_set_equal_document_is_noop() {
        let storage = MemoryStorage::new();
        let repo = new_repo(storage.clone());
        repo.init(&RepoSnapshot::new(), true).unwrap();
        repo.change("abc", |d| d.set("n", 1)).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        repo.add_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let before = storage.change_set_count();

        let doc = repo.get("abc").unwrap().unwrap();
        repo.set("abc", &doc, None).unwrap();
        repo.change("abc", |d| d.set("n", 1)).unwrap();

        assert_eq!(storage.change_set_count(), before);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_set_with_diverged_document_is_noop() {
        let storage = MemoryStorage::new();
        let repo = new_repo(storage.clone());
        repo.init(&RepoSnapshot::new(), true).unwrap();
        repo.change("abc", |d| d.set("n", 1)).unwrap();
        let before = storage.change_set_count();

        let stranger = Document::init(999_999)
            .change(|d| d.set("n", 2))
            .unwrap();
        repo.set("abc", &stranger, None).unwrap();

        assert_eq!(storage.change_set_count(), before);
        assert_eq!(
            repo.get_snapshot("abc").unwrap().get("n"),
            Some(&json!(1))
        );
    }

    #[test]
    fn test_set_with_explicit_changes() {
        let repo = repo_from_snapshot(&[]);
        let source = Document::init(77)
            .change(|d| d.set("title", "remote"))
            .unwrap();
        let changes = vec![source.encode_state_as_change()];

        repo.set("abc", &source, Some(changes)).unwrap();
        assert_eq!(title(&repo, "abc"), Some(json!("remote")));
        assert_eq!(repo.get_clock("abc").get("77"), 1);
    }

    #[test]
    fn test_apply_changes_is_idempotent() {
        let repo = repo_from_snapshot(&[]);
        let source = Document::init(5)
            .change(|d| {
                d.set("a", 1);
                d.set("b", 2);
            })
            .unwrap();
        let changes = vec![source.encode_state_as_change()];

        repo.apply_changes("abc", &changes).unwrap();
        let once = repo.get_snapshot("abc");
        let clock = repo.get_clock("abc");

        repo.apply_changes("abc", &changes).unwrap();
        assert_eq!(repo.get_snapshot("abc"), once);
        assert_eq!(repo.get_clock("abc"), clock);
    }

    #[test]
    fn test_reapplying_changes_writes_nothing() {
        let storage = MemoryStorage::new();
        let repo = new_repo(storage.clone());
        repo.init(&RepoSnapshot::new(), true).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        repo.add_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let source = Document::init(5).change(|d| d.set("a", 1)).unwrap();
        let changes = vec![source.encode_state_as_change()];
        repo.apply_changes("abc", &changes).unwrap();
        assert_eq!(storage.change_set_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            repo.apply_changes("abc", &changes).unwrap();
        }
        assert_eq!(storage.change_set_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_apply_empty_changes_is_noop() {
        let repo = repo_from_snapshot(&[]);
        repo.apply_changes("abc", &[]).unwrap();
        assert!(!repo.has("abc"));
    }

    #[test]
    fn test_corrupt_change_is_rejected() {
        let repo = repo_from_snapshot(&[]);
        let result = repo.apply_changes("abc", &[Change::from_bytes(vec![0xff, 0x01])]);
        assert!(matches!(result, Err(CevitxeError::Crdt(_))));
        assert!(!repo.has("abc"));
    }

    #[test]
    fn test_tombstone_keeps_id_and_can_be_undeleted() {
        let repo = repo_from_snapshot(&[("abc", json!({"title": "a"}))]);

        repo.apply_mutation("abc", &Mutation::MarkDeleted).unwrap();
        assert!(repo.has("abc"));
        assert_eq!(repo.get_snapshot("abc"), None);
        assert_eq!(repo.get_state().get("abc"), Some(&None));

        repo.apply_mutation("abc", &Mutation::Restore).unwrap();
        assert_eq!(title(&repo, "abc"), Some(json!("a")));
    }

    #[test]
    fn test_handlers_run_in_order_and_are_isolated() {
        let repo = repo_from_snapshot(&[]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        repo.add_handler(move |id, _| {
            sink.lock().unwrap().push(format!("first:{}", id));
            Err("boom".into())
        });
        let sink = Arc::clone(&seen);
        let second = repo.add_handler(move |id, doc| {
            sink.lock()
                .unwrap()
                .push(format!("second:{}:{}", id, doc.get("n").unwrap()));
            Ok(())
        });

        repo.change("abc", |d| d.set("n", 1)).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:abc".to_string(), "second:abc:1".to_string()]
        );

        assert!(repo.remove_handler(second));
        assert!(!repo.remove_handler(second));
        repo.change("abc", |d| d.set("n", 2)).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_closed_storage_error_propagates() {
        let repo = repo_from_snapshot(&[("abc", json!({"n": 1}))]);
        repo.close().unwrap();

        let result = repo.change("abc", |d| d.set("n", 2));
        assert!(matches!(result, Err(CevitxeError::StorageClosed)));
        assert!(matches!(
            repo.get("abc"),
            Err(CevitxeError::StorageClosed)
        ));
        assert!(repo.get_history(10).is_err());
    }

    #[test]
    fn test_failed_snapshot_write_is_recovered_from_log() {
        let storage = FailingStorage::new(MemoryStorage::new());
        let repo = new_repo(storage.clone());
        repo.init(&RepoSnapshot::new(), true).unwrap();
        repo.change("abc", |d| d.set("n", 1)).unwrap();

        let clock = repo.get_clock("abc");

        storage.fail_snapshots(true);
        let result = repo.change("abc", |d| d.set("n", 2));
        assert!(result.is_err_and(|e| e.is_storage()));

        // The change made it to the log before the snapshot write failed.
        let replayed = repo.get("abc").unwrap().unwrap();
        assert_eq!(replayed.get("n"), Some(json!(2)));

        // A restart serves the logged value, not the one before it
        storage.fail_snapshots(false);
        let restarted = new_repo(storage.clone());
        restarted.init(&RepoSnapshot::new(), false).unwrap();
        assert_eq!(
            restarted.get_snapshot("abc").unwrap().get("n"),
            Some(&json!(2))
        );
        assert!(restarted.get_clock("abc").dominates(&clock));
        assert_ne!(restarted.get_clock("abc"), clock);

        // ...and repairs the record, so the next cold start reads it directly
        let record = storage
            .snapshots()
            .unwrap()
            .map(|r| r.unwrap())
            .find(|r| r.document_id == "abc")
            .unwrap();
        assert_eq!(record.snapshot.get("n"), Some(&json!(2)));
    }

    #[test]
    fn test_handler_can_write_to_the_same_document() {
        let repo = Arc::new(repo_from_snapshot(&[]));
        let weak = Arc::downgrade(&repo);
        repo.add_handler(move |id, doc| {
            let Some(repo) = weak.upgrade() else {
                return Ok(());
            };
            if doc.get("n") == Some(json!(1)) {
                repo.change(id, |d| d.set("n", 2))?;
            }
            Ok(())
        });

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer = Arc::clone(&repo);
        std::thread::spawn(move || {
            let result = writer.change("abc", |d| d.set("n", 1)).map(|_| ());
            let _ = done_tx.send(result);
        });

        let result = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("write with a re-entrant handler should finish");
        assert!(result.is_ok());
        assert_eq!(repo.get_snapshot("abc").unwrap().get("n"), Some(&json!(2)));
        assert_eq!(repo.get("abc").unwrap().unwrap().get("n"), Some(json!(2)));
    }

    #[test]
    fn test_replay_with_generated_client_id() {
        let repo = repo_from_snapshot(&[("abc", json!({"n": 0}))]);
        assert!(repo.options().client_id.is_none());

        repo.change("abc", |d| d.set("n", 1)).unwrap();
        repo.change("abc", |d| d.set("n", 2)).unwrap();
        repo.change("abc", |d| d.remove("n")).unwrap();
        repo.change("abc", |d| d.set("m", 3)).unwrap();

        let replayed = repo.get("abc").unwrap().unwrap();
        assert_eq!(replayed.to_snapshot().to_json(), json!({"m": 3}));
        assert_eq!(replayed.clock(), repo.get_clock("abc"));
        assert_eq!(repo.get_clock("abc").actors().count(), 1);
    }

    #[test]
    fn test_clock_updates_never_regress() {
        let repo = repo_from_snapshot(&[]);
        let high: VectorClock = [("A".to_string(), 5), ("B".to_string(), 1)]
            .into_iter()
            .collect();
        let low: VectorClock = [("A".to_string(), 2), ("C".to_string(), 3)]
            .into_iter()
            .collect();

        repo.update_clock("abc", &high);
        repo.update_clock("abc", &low);

        let clock = repo.get_clock("abc");
        assert_eq!(clock.get("A"), 5);
        assert_eq!(clock.get("B"), 1);
        assert_eq!(clock.get("C"), 3);
        assert!(repo.get_clock("missing").is_empty());
        assert_eq!(repo.get_clocks().len(), 1);
    }

    #[test]
    fn test_snapshot_overlay_diverges_until_durable_write() {
        let repo = repo_from_snapshot(&[("abc", json!({"n": 1}))]);

        repo.change_snapshot("abc", |d| d.set("n", 10));
        assert_eq!(repo.get_snapshot("abc").unwrap().get("n"), Some(&json!(10)));
        let durable = repo.get("abc").unwrap().unwrap();
        assert_eq!(durable.get("n"), Some(json!(1)));

        repo.change("abc", |d| d.set("m", 2)).unwrap();
        assert_eq!(
            repo.get_snapshot("abc").unwrap().to_json(),
            json!({"n": 1, "m": 2})
        );
    }

    #[test]
    fn test_set_snapshot_and_load_state() {
        let repo = repo_from_snapshot(&[]);
        repo.set_snapshot("a", snapshot(json!({"x": 1})));

        let mut deleted = snapshot(json!({"x": 2}));
        deleted.deleted = true;
        repo.set_snapshot("b", deleted);
        assert_eq!(repo.get_state().get("b"), Some(&None));

        let mut more = RepoSnapshot::new();
        more.insert("c".into(), Some(snapshot(json!({"x": 3}))));
        more.insert("a".into(), None);
        repo.load_state(more);

        assert_eq!(repo.count(), 3);
        assert_eq!(repo.get_snapshot("a"), None);
        assert!(repo.get_snapshot("c").is_some());
    }

    #[test]
    fn test_history_batches_reconstruct_log() {
        let repo = repo_from_snapshot(&[]);
        for i in 0..7 {
            let id = format!("doc{}", i % 3);
            repo.change(&id, |d| d.set("n", i)).unwrap();
        }

        let unbatched: RepoHistory = repo.get_history(usize::MAX).unwrap().next().unwrap().unwrap();
        assert_eq!(unbatched.len(), 3);

        for batch_size in [0, 1, 2, 100] {
            let mut merged = RepoHistory::new();
            let mut batches = 0;
            for batch in repo.get_history(batch_size).unwrap() {
                for (id, changes) in batch.unwrap() {
                    merged.entry(id).or_default().extend(changes);
                }
                batches += 1;
            }
            assert!(batches >= 1);
            for (id, changes) in &unbatched {
                assert_eq!(merged.get(id), Some(changes), "batch size {}", batch_size);
            }
        }
    }

    #[test]
    fn test_history_of_empty_repo_is_one_empty_batch() {
        let repo = repo_from_snapshot(&[]);
        let batches: Vec<RepoHistory> = repo
            .get_history(DEFAULT_HISTORY_BATCH_SIZE)
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(batches, vec![RepoHistory::new()]);
    }

    #[test]
    fn test_load_history_into_new_peer() {
        let local = repo_from_snapshot(&[("abc", json!({"title": "a"}))]);
        local.change("abc", |d| d.set("size", 3)).unwrap();
        local.change("def", |d| d.set("title", "d")).unwrap();

        let remote = repo_from_snapshot(&[]);
        for batch in local.get_history(1).unwrap() {
            remote.load_history(&batch.unwrap()).unwrap();
        }

        assert_eq!(remote.get_state(), local.get_state());
        assert_eq!(remote.get_clocks(), local.get_clocks());
    }

    #[test]
    fn test_change_map_sentinel_drops_collection() {
        let repo = repo_from_snapshot(&[
            ("__rows__1", json!({"id": 1})),
            ("__rows__2", json!({"id": 2})),
            ("__cols__1", json!({"id": 1})),
        ]);

        repo.apply_change_map(&[ChangeEntry::DropCollection("rows".into())])
            .unwrap();
        assert_eq!(repo.get_snapshot("__rows__1"), None);
        assert_eq!(repo.get_snapshot("__rows__2"), None);
        assert!(repo.get_snapshot("__cols__1").is_some());
        assert_eq!(repo.count(), 3);
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let repo = Arc::new(repo_from_snapshot(&[("counter", json!({"n": 0}))]));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let repo = Arc::clone(&repo);
                std::thread::spawn(move || {
                    for i in 0..5 {
                        repo.change("counter", |d| {
                            let n = d.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                            d.set("n", n + 1);
                        })
                        .unwrap();
                        repo.change(&format!("t{}", t), |d| d.set("i", i)).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(
            repo.get_snapshot("counter").unwrap().get("n"),
            Some(&json!(20))
        );
        let replayed = repo.get("counter").unwrap().unwrap();
        assert_eq!(replayed.get("n"), Some(json!(20)));
        assert_eq!(repo.count(), 5);
    }
}
