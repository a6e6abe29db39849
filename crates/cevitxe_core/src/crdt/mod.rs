#![doc = include_str!(concat!(env!("OUT_DIR"), "/crdt_README.md"))]

mod document;
mod memory_storage;
mod mutation;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_storage;
mod storage;
mod types;

pub use document::{ClientId, Document, DocumentMut};
pub use memory_storage::MemoryStorage;
pub use mutation::{ChangeEntry, ChangeFn, ChangeMap, Mutation};
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_storage::SqliteStorage;
pub use storage::{ChangeSetIter, SnapshotIter, StorageAdapter, StorageResult};
pub use types::{
    Change, ChangeSet, DocumentId, Fields, RepoHistory, RepoSnapshot, Snapshot, SnapshotRecord,
};
