//! Collections of documents.
//!
//! A collection stores each item as its own root-level document, so items
//! replicate independently. There is no index document: membership is a key
//! convention. Items of the collection `people` live under
//! `__people__<id>`:
//!
//! ```text
//! __people__abcdef1234   { id: "abcdef1234", first: "Herb" }
//! __people__qrs7890xyz   { id: "qrs7890xyz", first: "Diego" }
//! __students__lmnopqrs12   { id: "lmnopqrs12", first: "Steve" }
//! ```
//!
//! Underscores in a collection name are escaped in keys (`my_rows` becomes
//! `__my_.rows__<id>`), so the key prefix of one collection is never a
//! prefix of another's: items of `a__b` are not members of `a`.
//!
//! # Deleting items
//!
//! Without an index, deleting takes two steps:
//!
//! 1. The item's document is marked deleted. The marker is an ordinary
//!    change, so it is persisted and replicated.
//! 2. The repo sees the marker and drops the item's snapshot (keeping the
//!    id). The change history is never deleted, so an item can come back.
//!
//! Dropping a whole collection marks every member deleted, either expanded
//! up front from a state ([`Collection::drop`]) or as a
//! [`ChangeEntry::DropCollection`] entry the repo expands when applying it
//! ([`Collection::drop_all`]).
//!
//! # Example
//!
//! ```ignore
//! let rows = Collection::new("rows");
//! repo.apply_change_map(&rows.add([item])?)?;
//!
//! let all = rows.get_all(&repo.get_state());
//! ```

use indexmap::IndexMap;
use serde_json::Value;

use crate::crdt::{
    ChangeEntry, ChangeMap, DocumentId, DocumentMut, Fields, Mutation, RepoSnapshot, Snapshot,
};
use crate::error::{CevitxeError, Result};
use crate::repo::Repo;

/// Default property holding an item's unique id.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Helpers for CRUD over many documents that share a key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    name: String,
    id_field: String,
    /// `__<escaped name>__`, the prefix of every member key
    prefix: String,
}

impl Collection {
    /// Collection whose items carry their id in `"id"`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id_field(name, DEFAULT_ID_FIELD)
    }

    /// Collection whose items carry their id in `id_field`.
    pub fn with_id_field(name: impl Into<String>, id_field: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = format!("{}__", Self::key_name(&name));
        Self {
            name,
            id_field: id_field.into(),
            prefix,
        }
    }

    /// Key name used internally for a collection (`people` -> `__people`,
    /// `my_rows` -> `__my_.rows`).
    pub fn key_name(collection_name: &str) -> String {
        format!("__{}", collection_name.replace('_', "_."))
    }

    /// Collection name from its key name (`__people` -> `people`).
    pub fn collection_name(key_name: &str) -> String {
        key_name
            .strip_prefix("__")
            .unwrap_or(key_name)
            .replace("_.", "_")
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Property holding each item's id
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Document id of the item `id`.
    pub fn id_to_key(&self, id: &str) -> DocumentId {
        format!("{}{}", self.prefix, id)
    }

    /// Item id of a member key, or `None` for keys of other collections.
    pub fn key_to_id<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.prefix.as_str())
    }

    /// True if `key` is a member key of this collection.
    pub fn is_collection_key(&self, key: &str) -> bool {
        key.starts_with(self.prefix.as_str())
    }

    // ========================================================================
    // Selectors
    // ========================================================================

    /// Keys of the live (present and not deleted) members of `state`.
    pub fn keys<'s>(&'s self, state: &'s RepoSnapshot) -> impl Iterator<Item = &'s str> + 's {
        self.members(state).map(|(key, _)| key)
    }

    /// Item ids of the live members of `state`.
    pub fn ids<'s>(&'s self, state: &'s RepoSnapshot) -> impl Iterator<Item = &'s str> + 's {
        self.members(state)
            .filter_map(move |(key, _)| self.key_to_id(key))
    }

    /// All live items.
    pub fn get_all<'s>(&self, state: &'s RepoSnapshot) -> Vec<&'s Snapshot> {
        self.members(state).map(|(_, item)| item).collect()
    }

    /// All live items, keyed by item id.
    pub fn get_map<'s>(&self, state: &'s RepoSnapshot) -> IndexMap<String, &'s Snapshot> {
        self.members(state)
            .filter_map(|(key, item)| Some((self.key_to_id(key)?.to_string(), item)))
            .collect()
    }

    /// Number of live items.
    pub fn count(&self, state: &RepoSnapshot) -> usize {
        self.members(state).count()
    }

    fn members<'s>(
        &self,
        state: &'s RepoSnapshot,
    ) -> impl Iterator<Item = (&'s str, &'s Snapshot)> {
        state.iter().filter_map(move |(key, item)| match item {
            Some(item) if !item.deleted && self.is_collection_key(key) => {
                Some((key.as_str(), item))
            }
            _ => None,
        })
    }

    // ========================================================================
    // Reducers
    // ========================================================================

    /// Add items. Every item must carry its id field.
    pub fn add<I>(&self, items: I) -> Result<ChangeMap>
    where
        I: IntoIterator<Item = Fields>,
    {
        items
            .into_iter()
            .map(|item| -> Result<ChangeEntry> {
                let key = self.id_to_key(&self.item_id(&item)?);
                Ok(ChangeEntry::mutate(key, Mutation::Merge(item)))
            })
            .collect()
    }

    /// Merge a (possibly partial) item into the stored one with the same id.
    pub fn update(&self, item: Fields) -> Result<ChangeMap> {
        self.add([item])
    }

    /// Run a change function on one item.
    pub fn change<F>(&self, id: &str, f: F) -> ChangeMap
    where
        F: Fn(&mut DocumentMut<'_>) + Send + Sync + 'static,
    {
        vec![ChangeEntry::mutate(self.id_to_key(id), Mutation::apply(f))]
    }

    /// Mark one item deleted.
    pub fn remove(&self, id: &str) -> ChangeMap {
        vec![ChangeEntry::mutate(self.id_to_key(id), Mutation::MarkDeleted)]
    }

    /// Mark every live member of `state` deleted.
    pub fn drop(&self, state: &RepoSnapshot) -> ChangeMap {
        self.keys(state)
            .map(|key| ChangeEntry::mutate(key, Mutation::MarkDeleted))
            .collect()
    }

    /// Drop the whole collection, letting the repo find the members.
    pub fn drop_all(&self) -> ChangeMap {
        vec![ChangeEntry::DropCollection(self.name.clone())]
    }

    fn item_id(&self, item: &Fields) -> Result<String> {
        match item.get(&self.id_field) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            Some(_) => Err(CevitxeError::InvalidIdField {
                field: self.id_field.clone(),
            }),
            None => Err(CevitxeError::MissingIdField {
                field: self.id_field.clone(),
            }),
        }
    }

    // ========================================================================
    // Repo helpers
    // ========================================================================

    /// Durably mark every known member deleted. Returns how many ids matched.
    pub fn mark_all_deleted(&self, repo: &Repo) -> Result<usize> {
        let mut matched = 0;
        for document_id in repo.document_ids() {
            if self.is_collection_key(&document_id) {
                repo.apply_mutation(&document_id, &Mutation::MarkDeleted)?;
                matched += 1;
            }
        }
        Ok(matched)
    }

    /// Drop every member from the repo's in-memory snapshots only.
    pub fn remove_all_from_snapshot(&self, repo: &Repo) -> usize {
        let mut matched = 0;
        for document_id in repo.document_ids() {
            if self.is_collection_key(&document_id) {
                repo.remove_snapshot(&document_id);
                matched += 1;
            }
        }
        matched
    }
}
