//! Remote storage drivers and the scoped file store built on top of them.
//!
//! A driver exposes a small file-like capability set. Sync semantics live in
//! [`crate::sync`]; drivers only move bytes and report typed failures.

mod any;
mod file_api;
mod local;
mod memory;
mod s3;
mod webdav;

use std::time::Duration;

use thiserror::Error;

pub use any::AnyDriver;
pub use file_api::FileApi;
pub use local::LocalDriver;
pub use memory::{MemoryDriver, MemoryOp};
pub use s3::{S3Config, S3Driver};
pub use webdav::{WebDavConfig, WebDavDriver};

/// Result type for driver calls
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Typed driver failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Network blip, 5xx, throttling
    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Payload too large for {path}: {size} bytes")]
    PayloadTooLarge { path: String, size: u64 },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The object vanished between listing and access
    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Operation not supported by this driver: {0}")]
    Unsupported(&'static str),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }

    /// Failures that end the session rather than one item
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Metadata of one remote object or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    /// Modification time (Unix ms), when the backend reports one
    pub updated_time: Option<i64>,
    pub is_dir: bool,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Slash-separated path relative to the driver (or file store) root
    pub path: String,
    pub size: u64,
    pub updated_time: Option<i64>,
    pub is_dir: bool,
}

impl RemoteEntry {
    pub const fn stat(&self) -> RemoteStat {
        RemoteStat {
            size: self.size,
            updated_time: self.updated_time,
            is_dir: self.is_dir,
        }
    }
}

/// Capability contract every backend implements.
///
/// Paths are slash-separated and relative to the driver root. `get` and `stat`
/// return `None` for missing paths; `delete` of a missing path and `mkdir` of
/// an existing directory succeed.
#[allow(async_fn_in_trait)]
pub trait StorageDriver {
    /// Direct children of a directory; a missing directory lists as empty
    async fn list(&self, path: &str) -> StorageResult<Vec<RemoteEntry>>;

    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    async fn delete(&self, path: &str) -> StorageResult<()>;

    async fn move_to(&self, from: &str, to: &str) -> StorageResult<()>;

    async fn mkdir(&self, path: &str) -> StorageResult<()>;

    async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>>;

    /// Set an object's modification time (Unix ms)
    async fn set_timestamp(&self, path: &str, time_ms: i64) -> StorageResult<()>;

    /// Delete everything under the driver root
    async fn format(&self) -> StorageResult<()>;

    /// Human-readable location for logs
    fn description(&self) -> String;
}
