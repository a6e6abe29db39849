//! Typed change functions.
//!
//! Reducers describe what should happen to documents as a [`ChangeMap`]: a
//! list of entries that either mutate one document or drop a whole
//! collection. The repo applies a change map either durably
//! ([`Repo::apply_change_map`](crate::repo::Repo::apply_change_map)) or to its
//! in-memory snapshots only
//! ([`Repo::change_snapshots`](crate::repo::Repo::change_snapshots)).

use std::sync::Arc;

use super::document::DocumentMut;
use super::types::{DocumentId, Fields};

/// An arbitrary change function.
///
/// Shared so the same map can drive both the optimistic snapshot update and
/// the durable write.
pub type ChangeFn = Arc<dyn Fn(&mut DocumentMut<'_>) + Send + Sync>;

/// A single edit to one document.
#[derive(Clone)]
pub enum Mutation {
    /// Shallow-merge fields into the document
    Merge(Fields),

    /// Set one field
    Set(String, serde_json::Value),

    /// Remove one field
    Remove(String),

    /// Soft-delete the document
    MarkDeleted,

    /// Clear the soft-delete marker
    Restore,

    /// Run a custom change function
    Apply(ChangeFn),
}

impl Mutation {
    /// Wrap a closure as a mutation
    pub fn apply<F>(f: F) -> Self
    where
        F: Fn(&mut DocumentMut<'_>) + Send + Sync + 'static,
    {
        Mutation::Apply(Arc::new(f))
    }

    /// Run this mutation against a document.
    pub fn run(&self, doc: &mut DocumentMut<'_>) {
        match self {
            Mutation::Merge(fields) => doc.merge(fields),
            Mutation::Set(key, value) => doc.set(key, value.clone()),
            Mutation::Remove(key) => doc.remove(key),
            Mutation::MarkDeleted => doc.mark_deleted(),
            Mutation::Restore => doc.restore(),
            Mutation::Apply(f) => f(doc),
        }
    }
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mutation::Merge(fields) => f.debug_tuple("Merge").field(fields).finish(),
            Mutation::Set(key, value) => f.debug_tuple("Set").field(key).field(value).finish(),
            Mutation::Remove(key) => f.debug_tuple("Remove").field(key).finish(),
            Mutation::MarkDeleted => write!(f, "MarkDeleted"),
            Mutation::Restore => write!(f, "Restore"),
            Mutation::Apply(_) => write!(f, "Apply(..)"),
        }
    }
}

/// One entry of a [`ChangeMap`].
#[derive(Clone, Debug)]
pub enum ChangeEntry {
    /// Apply `mutation` to the document `document_id`
    Mutate {
        /// Target document
        document_id: DocumentId,
        /// Edit to apply
        mutation: Mutation,
    },

    /// Soft-delete every member of the named collection
    DropCollection(String),
}

impl ChangeEntry {
    /// Shorthand for [`ChangeEntry::Mutate`].
    pub fn mutate(document_id: impl Into<DocumentId>, mutation: Mutation) -> Self {
        ChangeEntry::Mutate {
            document_id: document_id.into(),
            mutation,
        }
    }
}

/// Ordered list of edits produced by a reducer.
pub type ChangeMap = Vec<ChangeEntry>;
