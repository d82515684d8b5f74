//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Migration to version 1: items, change log and tombstones
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            item_type INTEGER NOT NULL,
            parent_id TEXT,
            title TEXT NOT NULL,
            body TEXT NOT NULL DEFAULT '',
            created_time INTEGER NOT NULL,
            updated_time INTEGER NOT NULL,
            encryption_applied INTEGER NOT NULL DEFAULT 0,
            is_conflict INTEGER NOT NULL DEFAULT 0,
            revision INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_items_parent ON items(parent_id);
        CREATE INDEX IF NOT EXISTS idx_items_updated ON items(updated_time DESC);
        CREATE TABLE IF NOT EXISTS resource_blobs (
            item_id TEXT PRIMARY KEY REFERENCES items(id) ON DELETE CASCADE,
            data BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL,
            item_type INTEGER NOT NULL,
            change_type INTEGER NOT NULL,
            updated_time INTEGER NOT NULL,
            before_state TEXT,
            created_time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_changes_item ON changes(item_id);
        CREATE TABLE IF NOT EXISTS deleted_items (
            item_id TEXT PRIMARY KEY,
            item_type INTEGER NOT NULL,
            deleted_time INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: per-target sync bookkeeping
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_items (
            target_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            item_type INTEGER NOT NULL,
            sync_time INTEGER NOT NULL,
            remote_time INTEGER,
            remote_size INTEGER,
            PRIMARY KEY (target_id, item_id)
        );
        CREATE TABLE IF NOT EXISTS change_flushes (
            target_id TEXT NOT NULL,
            change_id INTEGER NOT NULL,
            PRIMARY KEY (target_id, change_id)
        );
        CREATE TABLE IF NOT EXISTS tombstone_acks (
            target_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            acked_time INTEGER NOT NULL,
            PRIMARY KEY (target_id, item_id)
        );
        CREATE TABLE IF NOT EXISTS sync_state (
            device_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            last_marker INTEGER NOT NULL DEFAULT 0,
            remote_marker INTEGER NOT NULL DEFAULT 0,
            last_synced_time INTEGER,
            PRIMARY KEY (device_id, target_id)
        );
        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: conflict log
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            conflict_item_id TEXT,
            local_updated_time INTEGER NOT NULL,
            remote_updated_time INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            strategy TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_item_id ON sync_conflicts(item_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC);
        INSERT INTO schema_version (version) VALUES (3);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
