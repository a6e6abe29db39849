//! Configuration types for a repo.
//!
//! This module provides [`RepoOptions`], the construction parameters of a
//! [`Repo`](crate::repo::Repo). Options are plain serde data and can be
//! persisted as TOML, which is how an application keeps its client id stable
//! across restarts.
//!
//! # Example
//!
//! ```ignore
//! use cevitxe_core::config::RepoOptions;
//!
//! let mut options = RepoOptions::new("golden-lizard", "grid");
//! options.ensure_client_id();
//! options.save_to(&path)?;
//!
//! // Native only: <data_dir>/cevitxe/grid_golden-lizard.db
//! let db = options.database_path()?;
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crdt::ClientId;
use crate::error::Result;

/// `RepoOptions` identifies one repo and the replica that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOptions {
    /// Unique id of this dataset, used to find peers to synchronize with
    /// (e.g. `golden-lizard`, or a UUID).
    pub discovery_key: String,

    /// Distinguishes this application's data from other applications on the
    /// same machine (e.g. `grid` or `todos`).
    pub database_name: String,

    /// Actor id of this replica. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

impl RepoOptions {
    /// Options with no fixed client id.
    pub fn new(discovery_key: impl Into<String>, database_name: impl Into<String>) -> Self {
        Self {
            discovery_key: discovery_key.into(),
            database_name: database_name.into(),
            client_id: None,
        }
    }

    /// Builder: set an explicit client id.
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// The configured client id, or a freshly generated one.
    ///
    /// A generated id is not stored; use [`RepoOptions::ensure_client_id`]
    /// when it has to survive a restart.
    pub fn resolve_client_id(&self) -> ClientId {
        self.client_id.unwrap_or_else(generate_client_id)
    }

    /// Fill in a generated client id if none is configured, and return it.
    pub fn ensure_client_id(&mut self) -> ClientId {
        *self.client_id.get_or_insert_with(generate_client_id)
    }

    /// File name of this repo's database (`<database_name>_<discovery_key>.db`).
    pub fn database_file_name(&self) -> String {
        format!("{}_{}.db", self.database_name, self.discovery_key)
    }

    /// Load options from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let options: RepoOptions = toml::from_str(&contents)?;
        Ok(options)
    }

    /// Save options to a TOML file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if needed
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

// ============================================================================
// Native-only implementation (not available in WASM)
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
impl RepoOptions {
    /// Default database location (`<data_dir>/cevitxe/<database_file_name>`).
    /// Only available on native platforms
    pub fn database_path(&self) -> Result<PathBuf> {
        let dir = dirs::data_dir().ok_or(crate::error::CevitxeError::NoDataDir)?;
        Ok(self.database_path_in(&dir))
    }
}

impl RepoOptions {
    /// Database location under an explicit base directory.
    pub fn database_path_in(&self, base_dir: &Path) -> PathBuf {
        base_dir.join("cevitxe").join(self.database_file_name())
    }
}

/// Generate a random, non-zero client id.
pub fn generate_client_id() -> ClientId {
    let id = uuid::Uuid::new_v4().as_u128() as ClientId;
    id.max(1)
}
