#![doc = include_str!(concat!(env!("OUT_DIR"), "/README.md"))]
#![warn(missing_docs)]

/// Vector clocks (per-document causal progress)
pub mod clock;

/// Collections (CRUD over many documents sharing a key prefix)
pub mod collection;

/// Configuration options
pub mod config;

/// CRDT documents, mutations and storage adapters
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Document repository (persistence, replay, history and handlers)
pub mod repo;

#[cfg(test)]
pub mod test_utils;

pub use collection::Collection;
pub use config::RepoOptions;
pub use crdt::{Document, Mutation, StorageAdapter};
pub use error::{CevitxeError, Result};
pub use repo::Repo;
