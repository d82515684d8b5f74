//! Error types for loam-core

use thiserror::Error;

use crate::storage::StorageError;

/// Result type alias using loam-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in loam-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Item not found
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A remote object could not be parsed as an item
    #[error("Invalid item payload: {0}")]
    InvalidPayload(String),

    /// Remote storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Another session holds the remote lock
    #[error("Sync already in progress: {0}")]
    LockContention(String),

    /// The conflict resolver could not produce a safe outcome for an item
    #[error("Conflict for item {item_id} could not be resolved: {reason}")]
    ConflictUnresolvable { item_id: String, reason: String },

    /// The remote target was written by an incompatible sync format
    #[error("Unsupported sync target: {0}")]
    UnsupportedTarget(String),
}

impl Error {
    /// Errors that end the whole session instead of skipping one item.
    pub const fn is_session_fatal(&self) -> bool {
        match self {
            Self::Storage(error) => error.is_session_fatal(),
            Self::LockContention(_)
            | Self::UnsupportedTarget(_)
            | Self::Database(_)
            | Self::Sqlite(_) => true,
            _ => false,
        }
    }
}
