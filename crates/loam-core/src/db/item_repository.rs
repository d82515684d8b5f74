//! Item store implementation: items, change log, tombstones and sync records

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Database;
use crate::error::{Error, Result};
use crate::models::{
    normalize_title, serialize_item, ChangeRecord, ChangeType, ConflictStrategy, Item, ItemId,
    ItemType, SyncConflict, SyncRecord, Tombstone,
};
use crate::util::unix_millis_now;

const ITEM_COLUMNS: &str = "id, item_type, parent_id, title, body, created_time, updated_time, \
                            encryption_applied, is_conflict, revision";

/// Operations the synchronizer needs from the on-device item store
pub trait LocalItemStore {
    /// Stable identifier of this device
    fn device_id(&self) -> Result<String>;

    /// Get an item by ID
    fn get_item(&self, id: &ItemId) -> Result<Option<Item>>;

    /// Raw bytes of a resource item
    fn resource_blob(&self, id: &ItemId) -> Result<Option<Vec<u8>>>;

    /// Persist a local edit, bumping `updated_time` and revision and logging a change
    fn save_local_item(&self, item: &Item, blob: Option<&[u8]>) -> Result<Item>;

    /// Change records after `since_marker` that are not yet flushed to `target_id`
    fn pending_changes(&self, target_id: &str, since_marker: i64) -> Result<Vec<ChangeRecord>>;

    /// Highest change sequence number ever assigned
    fn latest_change_id(&self) -> Result<i64>;

    /// Write a downloaded item without logging a local change
    fn apply_remote_create_or_update(&self, item: &Item, blob: Option<&[u8]>) -> Result<()>;

    /// Remove an item deleted remotely without logging a local change.
    ///
    /// Returns whether the item existed.
    fn apply_remote_delete(&self, item_id: &ItemId) -> Result<bool>;

    /// Mark change records as propagated to `target_id`, together with the item's sync record
    fn mark_flushed(
        &self,
        target_id: &str,
        change_ids: &[i64],
        record: Option<&SyncRecord>,
    ) -> Result<()>;

    /// Record that an item was deleted locally
    fn record_tombstone(&self, item_id: &ItemId, item_type: ItemType) -> Result<()>;

    /// Local tombstone for an item, if any
    fn tombstone(&self, item_id: &ItemId) -> Result<Option<Tombstone>>;

    /// Record that `target_id` has seen a local deletion
    fn acknowledge_tombstone(&self, target_id: &str, item_id: &ItemId) -> Result<()>;

    /// Forget a local deletion that was overridden by a remote edit
    fn clear_tombstone(&self, item_id: &ItemId) -> Result<()>;

    fn sync_record(&self, target_id: &str, item_id: &ItemId) -> Result<Option<SyncRecord>>;

    fn sync_records(&self, target_id: &str) -> Result<Vec<SyncRecord>>;

    fn save_sync_record(&self, target_id: &str, record: &SyncRecord) -> Result<()>;

    fn delete_sync_record(&self, target_id: &str, item_id: &ItemId) -> Result<()>;

    /// Append a resolver decision to the conflict log
    fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64>;

    /// Drop bookkeeping no target needs anymore
    fn prune(&self, target_id: &str, marker: i64, retention: Duration) -> Result<PruneStats>;

    /// Log an update for every item whose history was truncated from the change log.
    ///
    /// A target that has never been synced needs a change record per item.
    fn requeue_unlogged_items(&self) -> Result<usize>;

    /// Forget everything known about `target_id` and queue every item for upload
    fn reset_target(&self, target_id: &str) -> Result<usize>;
}

/// Rows removed by [`LocalItemStore::prune`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub changes_removed: usize,
    pub tombstones_removed: usize,
}

/// `SQLite` implementation of `LocalItemStore`
pub struct SqliteItemStore {
    db: Database,
}

impl SqliteItemStore {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Create a note under an optional parent folder
    pub fn create_note(&self, parent_id: Option<ItemId>, title: &str, body: &str) -> Result<Item> {
        self.ensure_parent(parent_id.as_ref())?;
        let item = Item::note(title, body).with_parent(parent_id);
        self.save_local_item(&item, None)
    }

    pub fn create_folder(&self, parent_id: Option<ItemId>, title: &str) -> Result<Item> {
        self.ensure_parent(parent_id.as_ref())?;
        if normalize_title(title).is_empty() {
            return Err(Error::InvalidInput("Folder title cannot be empty".to_string()));
        }
        let item = Item::folder(title).with_parent(parent_id);
        self.save_local_item(&item, None)
    }

    /// Create a resource item holding `data`
    pub fn create_resource(
        &self,
        parent_id: Option<ItemId>,
        title: &str,
        data: &[u8],
    ) -> Result<Item> {
        self.ensure_parent(parent_id.as_ref())?;
        let item = Item::resource(title).with_parent(parent_id);
        self.save_local_item(&item, Some(data))
    }

    /// Update an item's title and/or body
    pub fn update_item(
        &self,
        id: &ItemId,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<Item> {
        let mut item = self
            .get_item(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(title) = title {
            item.title = normalize_title(title);
        }
        if let Some(body) = body {
            if item.item_type == ItemType::Folder {
                return Err(Error::InvalidInput("Folders have no body".to_string()));
            }
            item.body = body.to_string();
        }
        self.save_local_item(&item, None)
    }

    /// Move an item under another folder, or to the root
    pub fn move_item(&self, id: &ItemId, parent_id: Option<ItemId>) -> Result<Item> {
        self.ensure_parent(parent_id.as_ref())?;
        if parent_id.as_ref() == Some(id) {
            return Err(Error::InvalidInput("An item cannot contain itself".to_string()));
        }
        let item = self
            .get_item(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.save_local_item(&item.with_parent(parent_id), None)
    }

    /// Delete an item, logging the deletion and leaving a tombstone
    pub fn delete_item(&self, id: &ItemId) -> Result<()> {
        self.db.with_transaction(|tx| {
            let existing = fetch_item(tx, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;

            let children: i64 = tx.query_row(
                "SELECT COUNT(*) FROM items WHERE parent_id = ?",
                params![id.as_str()],
                |row| row.get(0),
            )?;
            if children > 0 {
                return Err(Error::InvalidInput(format!(
                    "Folder {id} is not empty ({children} items)"
                )));
            }

            let now = unix_millis_now();
            tx.execute("DELETE FROM items WHERE id = ?", params![id.as_str()])?;
            insert_change(
                tx,
                &existing.id,
                existing.item_type,
                ChangeType::Delete,
                now,
                Some(&serialize_item(&existing)),
            )?;
            insert_tombstone(tx, &existing.id, existing.item_type, now)?;
            Ok(())
        })
    }

    /// List items, most recently updated first
    pub fn list_items(&self, limit: usize) -> Result<Vec<Item>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM items ORDER BY updated_time DESC, id DESC LIMIT ?"
            ))?;
            let items = stmt
                .query_map(params![limit as i64], parse_item)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    /// Resolve a full ID or unique ID prefix
    pub fn resolve_item_id(&self, prefix: &str) -> Result<ItemId> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() {
            return Err(Error::InvalidInput("Item ID cannot be empty".to_string()));
        }
        if let Ok(id) = prefix.parse::<ItemId>() {
            return Ok(id);
        }

        let matches = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM items WHERE id LIKE ? || '%' LIMIT 2")?;
            let ids = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;

        match matches.as_slice() {
            [] => Err(Error::NotFound(prefix)),
            [only] => only
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid item ID: {only}"))),
            _ => Err(Error::InvalidInput(format!("Ambiguous item ID prefix: {prefix}"))),
        }
    }

    /// Conflict log, newest first
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_id, item_id, conflict_item_id, local_updated_time,
                        remote_updated_time, resolved_at, strategy
                 FROM sync_conflicts
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    let strategy: String = row.get(7)?;
                    Ok(SyncConflict {
                        id: row.get(0)?,
                        target_id: row.get(1)?,
                        item_id: row.get(2)?,
                        conflict_item_id: row.get(3)?,
                        local_updated_time: row.get(4)?,
                        remote_updated_time: row.get(5)?,
                        resolved_at: row.get(6)?,
                        strategy: strategy.parse::<ConflictStrategy>().map_err(|error| {
                            conversion_error(7, Type::Text, error)
                        })?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of local changes not yet propagated to `target_id`
    pub fn pending_change_count(&self, target_id: &str, since_marker: i64) -> Result<usize> {
        Ok(self.pending_changes(target_id, since_marker)?.len())
    }

    fn ensure_parent(&self, parent_id: Option<&ItemId>) -> Result<()> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        match self.get_item(parent_id)? {
            Some(parent) if parent.item_type == ItemType::Folder => Ok(()),
            Some(_) => Err(Error::InvalidInput(format!(
                "Parent {parent_id} is not a folder"
            ))),
            None => Err(Error::NotFound(parent_id.to_string())),
        }
    }
}

impl LocalItemStore for SqliteItemStore {
    fn device_id(&self) -> Result<String> {
        self.db.with_transaction(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT value FROM settings WHERE key = 'device_id'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(device_id) = existing {
                return Ok(device_id);
            }

            let device_id = uuid::Uuid::now_v7().simple().to_string();
            tx.execute(
                "INSERT INTO settings (key, value) VALUES ('device_id', ?)",
                params![device_id],
            )?;
            tracing::info!(device_id = %device_id, "Generated device id");
            Ok(device_id)
        })
    }

    fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        self.db.with_connection(|conn| fetch_item(conn, id))
    }

    fn resource_blob(&self, id: &ItemId) -> Result<Option<Vec<u8>>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT data FROM resource_blobs WHERE item_id = ?",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn save_local_item(&self, item: &Item, blob: Option<&[u8]>) -> Result<Item> {
        if item.item_type == ItemType::ResourceBlob {
            return Err(Error::InvalidInput(
                "Resource blobs are stored with their resource".to_string(),
            ));
        }

        self.db.with_transaction(|tx| {
            let existing = fetch_item(tx, &item.id)?;
            let now = unix_millis_now().max(item.updated_time);

            let mut saved = item.clone();
            saved.title = normalize_title(&saved.title);
            saved.updated_time = existing
                .as_ref()
                .map_or(now, |previous| now.max(previous.updated_time + 1));
            saved.revision = existing.as_ref().map_or(1, |previous| previous.revision + 1);

            upsert_item(tx, &saved)?;
            if let Some(data) = blob {
                upsert_blob(tx, &saved.id, data)?;
            }

            let (change_type, before) = match &existing {
                Some(previous) => (ChangeType::Update, Some(serialize_item(previous))),
                None => (ChangeType::Create, None),
            };
            insert_change(
                tx,
                &saved.id,
                saved.item_type,
                change_type,
                saved.updated_time,
                before.as_deref(),
            )?;
            Ok(saved)
        })
    }

    fn pending_changes(&self, target_id: &str, since_marker: i64) -> Result<Vec<ChangeRecord>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.item_id, c.item_type, c.change_type, c.updated_time, c.before_state
                 FROM changes c
                 WHERE c.id > ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM change_flushes f
                       WHERE f.target_id = ?1 AND f.change_id = c.id
                   )
                 ORDER BY c.id",
            )?;
            let records = stmt
                .query_map(params![target_id, since_marker], |row| {
                    let change_code: i64 = row.get(3)?;
                    Ok(ChangeRecord {
                        id: row.get(0)?,
                        item_id: parse_id(row, 1)?,
                        item_type: parse_type(row, 2)?,
                        change_type: ChangeType::from_code(change_code).map_err(|error| {
                            conversion_error(3, Type::Integer, error)
                        })?,
                        updated_time: row.get(4)?,
                        before: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    fn latest_change_id(&self) -> Result<i64> {
        self.db.with_connection(|conn| {
            let sequence: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM sqlite_sequence WHERE name = 'changes'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(sequence.unwrap_or(0))
        })
    }

    fn apply_remote_create_or_update(&self, item: &Item, blob: Option<&[u8]>) -> Result<()> {
        self.db.with_transaction(|tx| {
            let revision = fetch_item(tx, &item.id)?.map_or(1, |previous| previous.revision + 1);
            let mut applied = item.clone();
            applied.revision = revision;
            upsert_item(tx, &applied)?;
            if let Some(data) = blob {
                upsert_blob(tx, &applied.id, data)?;
            }
            Ok(())
        })
    }

    fn apply_remote_delete(&self, item_id: &ItemId) -> Result<bool> {
        self.db.with_connection(|conn| {
            let removed =
                conn.execute("DELETE FROM items WHERE id = ?", params![item_id.as_str()])?;
            Ok(removed > 0)
        })
    }

    fn mark_flushed(
        &self,
        target_id: &str,
        change_ids: &[i64],
        record: Option<&SyncRecord>,
    ) -> Result<()> {
        self.db.with_transaction(|tx| {
            for change_id in change_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO change_flushes (target_id, change_id) VALUES (?, ?)",
                    params![target_id, change_id],
                )?;
            }
            if let Some(record) = record {
                upsert_sync_record(tx, target_id, record)?;
            }
            Ok(())
        })
    }

    fn record_tombstone(&self, item_id: &ItemId, item_type: ItemType) -> Result<()> {
        self.db.with_transaction(|tx| {
            insert_tombstone(tx, item_id, item_type, unix_millis_now())
        })
    }

    fn tombstone(&self, item_id: &ItemId) -> Result<Option<Tombstone>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT item_id, item_type, deleted_time FROM deleted_items WHERE item_id = ?",
                    params![item_id.as_str()],
                    |row| {
                        Ok(Tombstone {
                            item_id: parse_id(row, 0)?,
                            item_type: parse_type(row, 1)?,
                            deleted_time: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn acknowledge_tombstone(&self, target_id: &str, item_id: &ItemId) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tombstone_acks (target_id, item_id, acked_time) VALUES (?, ?, ?)",
                params![target_id, item_id.as_str(), unix_millis_now()],
            )?;
            Ok(())
        })
    }

    fn clear_tombstone(&self, item_id: &ItemId) -> Result<()> {
        self.db.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM deleted_items WHERE item_id = ?",
                params![item_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM tombstone_acks WHERE item_id = ?",
                params![item_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn sync_record(&self, target_id: &str, item_id: &ItemId) -> Result<Option<SyncRecord>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT item_id, item_type, sync_time, remote_time, remote_size
                     FROM sync_items WHERE target_id = ? AND item_id = ?",
                    params![target_id, item_id.as_str()],
                    parse_sync_record,
                )
                .optional()?)
        })
    }

    fn sync_records(&self, target_id: &str) -> Result<Vec<SyncRecord>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, item_type, sync_time, remote_time, remote_size
                 FROM sync_items WHERE target_id = ? ORDER BY item_id",
            )?;
            let records = stmt
                .query_map(params![target_id], parse_sync_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    fn save_sync_record(&self, target_id: &str, record: &SyncRecord) -> Result<()> {
        self.db
            .with_connection(|conn| upsert_sync_record(conn, target_id, record))
    }

    fn delete_sync_record(&self, target_id: &str, item_id: &ItemId) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM sync_items WHERE target_id = ? AND item_id = ?",
                params![target_id, item_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sync_conflicts (
                    target_id, item_id, conflict_item_id, local_updated_time,
                    remote_updated_time, resolved_at, strategy
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    conflict.target_id,
                    conflict.item_id,
                    conflict.conflict_item_id,
                    conflict.local_updated_time,
                    conflict.remote_updated_time,
                    conflict.resolved_at,
                    conflict.strategy.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn prune(&self, target_id: &str, marker: i64, retention: Duration) -> Result<PruneStats> {
        self.db.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM change_flushes WHERE target_id = ? AND change_id <= ?",
                params![target_id, marker],
            )?;

            // Changes every known target has moved past are never read again
            let min_marker: Option<i64> =
                tx.query_row("SELECT MIN(last_marker) FROM sync_state", [], |row| row.get(0))?;
            let changes_removed = match min_marker {
                Some(min_marker) => tx.execute(
                    "DELETE FROM changes WHERE id <= ?",
                    params![min_marker],
                )?,
                None => 0,
            };

            let horizon = unix_millis_now()
                - i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
            let tombstones_removed = tx.execute(
                "DELETE FROM deleted_items
                 WHERE deleted_time < ?1
                    OR (
                        (SELECT COUNT(*) FROM tombstone_acks a WHERE a.item_id = deleted_items.item_id)
                        >= (SELECT COUNT(DISTINCT target_id) FROM sync_state)
                        AND (SELECT COUNT(*) FROM sync_state) > 0
                    )",
                params![horizon],
            )?;
            tx.execute(
                "DELETE FROM tombstone_acks
                 WHERE item_id NOT IN (SELECT item_id FROM deleted_items)",
                [],
            )?;

            Ok(PruneStats {
                changes_removed,
                tombstones_removed,
            })
        })
    }

    fn requeue_unlogged_items(&self) -> Result<usize> {
        self.db.with_transaction(|tx| {
            let now = unix_millis_now();
            let inserted = tx.execute(
                "INSERT INTO changes (item_id, item_type, change_type, updated_time, before_state, created_time)
                 SELECT i.id, i.item_type, ?1, i.updated_time, NULL, ?2
                 FROM items i
                 WHERE NOT EXISTS (SELECT 1 FROM changes c WHERE c.item_id = i.id)
                 ORDER BY i.item_type DESC, i.updated_time",
                params![ChangeType::Update.code(), now],
            )?;
            Ok(inserted)
        })
    }

    fn reset_target(&self, target_id: &str) -> Result<usize> {
        self.db.with_transaction(|tx| {
            for table in ["sync_items", "change_flushes", "tombstone_acks", "sync_state"] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE target_id = ?"),
                    params![target_id],
                )?;
            }
            let now = unix_millis_now();
            let queued = tx.execute(
                "INSERT INTO changes (item_id, item_type, change_type, updated_time, before_state, created_time)
                 SELECT id, item_type, ?1, updated_time, NULL, ?2 FROM items
                 ORDER BY item_type DESC, updated_time",
                params![ChangeType::Update.code(), now],
            )?;
            Ok(queued)
        })
    }
}

fn fetch_item(conn: &Connection, id: &ItemId) -> Result<Option<Item>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"),
            params![id.as_str()],
            parse_item,
        )
        .optional()?)
}

fn upsert_item(conn: &Connection, item: &Item) -> Result<()> {
    conn.execute(
        "INSERT INTO items (
            id, item_type, parent_id, title, body, created_time, updated_time,
            encryption_applied, is_conflict, revision
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            item_type = excluded.item_type,
            parent_id = excluded.parent_id,
            title = excluded.title,
            body = excluded.body,
            created_time = excluded.created_time,
            updated_time = excluded.updated_time,
            encryption_applied = excluded.encryption_applied,
            is_conflict = excluded.is_conflict,
            revision = excluded.revision",
        params![
            item.id.as_str(),
            item.item_type.code(),
            item.parent_id.map(|id| id.to_string()),
            item.title,
            item.body,
            item.created_time,
            item.updated_time,
            i32::from(item.encryption_applied),
            i32::from(item.is_conflict),
            item.revision,
        ],
    )?;
    Ok(())
}

fn upsert_blob(conn: &Connection, item_id: &ItemId, data: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO resource_blobs (item_id, data) VALUES (?, ?)",
        params![item_id.as_str(), data],
    )?;
    Ok(())
}

fn insert_change(
    conn: &Connection,
    item_id: &ItemId,
    item_type: ItemType,
    change_type: ChangeType,
    updated_time: i64,
    before: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO changes (item_id, item_type, change_type, updated_time, before_state, created_time)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            item_id.as_str(),
            item_type.code(),
            change_type.code(),
            updated_time,
            before,
            unix_millis_now(),
        ],
    )?;
    Ok(())
}

fn insert_tombstone(
    conn: &Connection,
    item_id: &ItemId,
    item_type: ItemType,
    deleted_time: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO deleted_items (item_id, item_type, deleted_time) VALUES (?, ?, ?)",
        params![item_id.as_str(), item_type.code(), deleted_time],
    )?;
    // A new deletion has not been seen by any target yet
    conn.execute(
        "DELETE FROM tombstone_acks WHERE item_id = ?",
        params![item_id.as_str()],
    )?;
    Ok(())
}

fn upsert_sync_record(conn: &Connection, target_id: &str, record: &SyncRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_items (
            target_id, item_id, item_type, sync_time, remote_time, remote_size
        ) VALUES (?, ?, ?, ?, ?, ?)",
        params![
            target_id,
            record.item_id.as_str(),
            record.item_type.code(),
            record.sync_time,
            record.remote_time,
            record.remote_size.and_then(|size| i64::try_from(size).ok()),
        ],
    )?;
    Ok(())
}

fn parse_id(row: &Row<'_>, index: usize) -> rusqlite::Result<ItemId> {
    let value: String = row.get(index)?;
    value
        .parse()
        .map_err(|error| conversion_error(index, Type::Text, error))
}

fn parse_type(row: &Row<'_>, index: usize) -> rusqlite::Result<ItemType> {
    let code: i64 = row.get(index)?;
    ItemType::from_code(code).map_err(|error| conversion_error(index, Type::Integer, error))
}

fn conversion_error(
    index: usize,
    column_type: Type,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, column_type, Box::new(error))
}

/// Parse an item from a database row selected with `ITEM_COLUMNS`
fn parse_item(row: &Row<'_>) -> rusqlite::Result<Item> {
    let parent_id = match row.get::<_, Option<String>>(2)? {
        Some(value) => Some(value.parse().map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(error))
        })?),
        None => None,
    };
    Ok(Item {
        id: parse_id(row, 0)?,
        item_type: parse_type(row, 1)?,
        parent_id,
        title: row.get(3)?,
        body: row.get(4)?,
        created_time: row.get(5)?,
        updated_time: row.get(6)?,
        encryption_applied: row.get::<_, i32>(7)? != 0,
        is_conflict: row.get::<_, i32>(8)? != 0,
        revision: row.get(9)?,
    })
}

fn parse_sync_record(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    Ok(SyncRecord {
        item_id: parse_id(row, 0)?,
        item_type: parse_type(row, 1)?,
        sync_time: row.get(2)?,
        remote_time: row.get(3)?,
        remote_size: row
            .get::<_, Option<i64>>(4)?
            .and_then(|size| u64::try_from(size).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SyncStateStore;
    use crate::models::SyncState;
    use pretty_assertions::assert_eq;

    const TARGET: &str = "file:/tmp/target";

    fn setup() -> SqliteItemStore {
        SqliteItemStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get_note() {
        let store = setup();
        let note = store.create_note(None, "Groceries", "milk").unwrap();

        let fetched = store.get_item(&note.id).unwrap().unwrap();
        assert_eq!(fetched, note);
        assert_eq!(fetched.revision, 1);
    }

    #[test]
    fn test_create_logs_change() {
        let store = setup();
        let note = store.create_note(None, "a", "b").unwrap();

        let changes = store.pending_changes(TARGET, 0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].item_id, note.id);
        assert_eq!(changes[0].change_type, ChangeType::Create);
        assert!(changes[0].before.is_none());
    }

    #[test]
    fn test_update_bumps_time_and_revision() {
        let store = setup();
        let note = store.create_note(None, "a", "b").unwrap();

        let updated = store.update_item(&note.id, None, Some("c")).unwrap();
        assert!(updated.updated_time > note.updated_time);
        assert_eq!(updated.revision, 2);

        let changes = store.pending_changes(TARGET, 0).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].change_type, ChangeType::Update);
        assert!(changes[1].before.as_deref().unwrap().contains("\n\nb\n\n"));
    }

    #[test]
    fn test_create_rejects_missing_parent() {
        let store = setup();
        let err = store.create_note(Some(ItemId::new()), "a", "b").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let note = store.create_note(None, "a", "b").unwrap();
        let err = store.create_note(Some(note.id), "child", "").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_delete_records_tombstone_and_change() {
        let store = setup();
        let note = store.create_note(None, "a", "b").unwrap();

        store.delete_item(&note.id).unwrap();
        assert!(store.get_item(&note.id).unwrap().is_none());

        let tombstone = store.tombstone(&note.id).unwrap().unwrap();
        assert_eq!(tombstone.item_type, ItemType::Note);

        let changes = store.pending_changes(TARGET, 0).unwrap();
        assert_eq!(changes.last().unwrap().change_type, ChangeType::Delete);
    }

    #[test]
    fn test_delete_rejects_non_empty_folder() {
        let store = setup();
        let folder = store.create_folder(None, "Work").unwrap();
        store.create_note(Some(folder.id), "a", "b").unwrap();

        assert!(store.delete_item(&folder.id).is_err());
        assert!(store.get_item(&folder.id).unwrap().is_some());
    }

    #[test]
    fn test_resource_blob_stored() {
        let store = setup();
        let resource = store.create_resource(None, "photo.png", &[1, 2, 3]).unwrap();

        assert_eq!(store.resource_blob(&resource.id).unwrap(), Some(vec![1, 2, 3]));
        store.delete_item(&resource.id).unwrap();
        assert_eq!(store.resource_blob(&resource.id).unwrap(), None);
    }

    #[test]
    fn test_mark_flushed_is_per_target() {
        let store = setup();
        let note = store.create_note(None, "a", "b").unwrap();
        let change = store.pending_changes(TARGET, 0).unwrap().remove(0);

        let record = SyncRecord {
            item_id: note.id,
            item_type: note.item_type,
            sync_time: note.updated_time,
            remote_time: Some(10),
            remote_size: Some(42),
        };
        store.mark_flushed(TARGET, &[change.id], Some(&record)).unwrap();

        assert!(store.pending_changes(TARGET, 0).unwrap().is_empty());
        assert_eq!(store.pending_changes("other", 0).unwrap().len(), 1);
        assert_eq!(store.sync_record(TARGET, &note.id).unwrap(), Some(record));
    }

    #[test]
    fn test_remote_apply_does_not_log_changes() {
        let store = setup();
        let remote = Item::note("from elsewhere", "text");

        store.apply_remote_create_or_update(&remote, None).unwrap();
        assert!(store.pending_changes(TARGET, 0).unwrap().is_empty());
        assert!(store.get_item(&remote.id).unwrap().is_some());

        assert!(store.apply_remote_delete(&remote.id).unwrap());
        assert!(!store.apply_remote_delete(&remote.id).unwrap());
        assert!(store.pending_changes(TARGET, 0).unwrap().is_empty());
        assert!(store.tombstone(&remote.id).unwrap().is_none());
    }

    #[test]
    fn test_device_id_is_stable() {
        let store = setup();
        let first = store.device_id().unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(store.device_id().unwrap(), first);
    }

    #[test]
    fn test_resolve_item_id_prefix() {
        let store = setup();
        let note = store.create_note(None, "a", "b").unwrap();
        let full = note.id.to_string();

        assert_eq!(store.resolve_item_id(&full).unwrap(), note.id);
        assert!(store.resolve_item_id("zz").is_err());
    }

    #[test]
    fn test_prune_drops_acknowledged_tombstones_and_old_changes() {
        let store = setup();
        let device = store.device_id().unwrap();
        let note = store.create_note(None, "a", "b").unwrap();
        store.delete_item(&note.id).unwrap();

        let latest = store.latest_change_id().unwrap();
        assert_eq!(latest, 2);

        let mut state = SyncState::initial(&device, TARGET);
        state.last_marker = latest;
        store.save_sync_state(&state).unwrap();

        // Not acknowledged yet: tombstone survives
        let stats = store.prune(TARGET, latest, Duration::from_secs(3600)).unwrap();
        assert_eq!(stats.changes_removed, 2);
        assert_eq!(stats.tombstones_removed, 0);

        store.acknowledge_tombstone(TARGET, &note.id).unwrap();
        let stats = store.prune(TARGET, latest, Duration::from_secs(3600)).unwrap();
        assert_eq!(stats.tombstones_removed, 1);
        assert!(store.tombstone(&note.id).unwrap().is_none());

        // Sequence numbers keep growing after truncation
        store.create_note(None, "c", "d").unwrap();
        assert_eq!(store.latest_change_id().unwrap(), 3);
    }

    fn queue_for_fresh_target<S: LocalItemStore>(store: &S, target_id: &str) -> usize {
        store.requeue_unlogged_items().unwrap() + store.reset_target(target_id).unwrap()
    }

    #[test]
    fn test_reset_target_through_store_trait() {
        let store = setup();
        store.create_folder(None, "f").unwrap();
        store.create_note(None, "a", "b").unwrap();
        let marker = store.latest_change_id().unwrap();

        assert_eq!(queue_for_fresh_target(&store, TARGET), 2);
        assert_eq!(store.pending_changes(TARGET, marker).unwrap().len(), 2);
    }

    #[test]
    fn test_requeue_unlogged_items() {
        let store = setup();
        let device = store.device_id().unwrap();
        let note = store.create_note(None, "a", "b").unwrap();

        let mut state = SyncState::initial(&device, TARGET);
        state.last_marker = store.latest_change_id().unwrap();
        store.save_sync_state(&state).unwrap();
        store.prune(TARGET, state.last_marker, Duration::from_secs(60)).unwrap();

        assert_eq!(store.requeue_unlogged_items().unwrap(), 1);
        assert_eq!(store.requeue_unlogged_items().unwrap(), 0);
        let changes = store.pending_changes("new-target", 0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].item_id, note.id);
    }

    #[test]
    fn test_conflict_log() {
        let store = setup();
        let conflict = SyncConflict {
            id: 0,
            target_id: TARGET.to_string(),
            item_id: ItemId::new().to_string(),
            conflict_item_id: Some(ItemId::new().to_string()),
            local_updated_time: 10,
            remote_updated_time: 20,
            resolved_at: 30,
            strategy: ConflictStrategy::CopyAside,
        };

        let id = store.record_conflict(&conflict).unwrap();
        let listed = store.list_conflicts(10).unwrap();
        assert_eq!(listed, vec![SyncConflict { id, ..conflict }]);
    }
}
