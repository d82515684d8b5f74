//! Database layer for Loam

mod connection;
mod item_repository;
mod migrations;
mod sync_repository;

pub use connection::Database;
pub use item_repository::{LocalItemStore, PruneStats, SqliteItemStore};
pub use sync_repository::SyncStateStore;
