use thiserror::Error;

/// Unified error type for cevitxe operations
#[derive(Debug, Error)]
pub enum CevitxeError {
    // IO errors
    /// Filesystem or storage I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Storage errors
    /// SQLite failure
    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The storage adapter was used before `open` or after `close`
    #[error("Storage is not open")]
    StorageClosed,

    // CRDT errors
    /// A change could not be decoded or applied
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// The new document is not a descendant of the old one
    #[error("Cannot diff documents: the new state does not contain the old one")]
    Diverged,

    // Collection errors
    /// An item lacks its collection's id property
    #[error("Item doesn't have a property called '{field}'")]
    MissingIdField {
        /// Name of the id property
        field: String,
    },

    /// An item's id property is neither a string nor a number
    #[error("Property '{field}' must be a string or a number to be used as an id")]
    InvalidIdField {
        /// Name of the id property
        field: String,
    },

    // Config errors
    /// Malformed TOML options
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Options could not be written as TOML
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// The platform has no data directory
    #[error("Could not determine data directory")]
    NoDataDir,
}

/// Result type alias for cevitxe operations
pub type Result<T> = std::result::Result<T, CevitxeError>;

impl CevitxeError {
    /// Whether this error came from the persistence layer.
    ///
    /// Storage failures are never swallowed by the repo, so callers can use
    /// this to decide whether a retry of the whole operation makes sense.
    pub fn is_storage(&self) -> bool {
        match self {
            CevitxeError::Io(_) | CevitxeError::StorageClosed => true,
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            CevitxeError::Database(_) => true,
            _ => false,
        }
    }
}
