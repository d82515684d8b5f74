#![allow(dead_code)]

use std::time::Duration;

use loam_core::config::SyncOptions;
use loam_core::db::SqliteItemStore;
use loam_core::storage::{FileApi, StorageDriver};
use loam_core::sync::{RetryPolicy, SessionResult, Synchronizer};
use loam_core::Result;
use tokio_util::sync::CancellationToken;

pub const TARGET: &str = "memory://shared";

pub fn options() -> SyncOptions {
    SyncOptions::default().with_retry(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    })
}

pub fn device() -> SqliteItemStore {
    SqliteItemStore::open_in_memory().unwrap()
}

pub async fn sync<D: StorageDriver>(
    store: &SqliteItemStore,
    files: &FileApi<D>,
) -> Result<SessionResult> {
    sync_with(store, files, options()).await
}

pub async fn sync_with<D: StorageDriver>(
    store: &SqliteItemStore,
    files: &FileApi<D>,
    options: SyncOptions,
) -> Result<SessionResult> {
    Synchronizer::new(files, store, TARGET, options)
        .run_session(&CancellationToken::new())
        .await
}

/// Paths of lock objects on the target
pub fn lock_paths(paths: &[String]) -> Vec<&String> {
    paths.iter().filter(|path| path.contains(".locks/")).collect()
}
