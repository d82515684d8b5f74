//! Sync state persistence

use rusqlite::{params, OptionalExtension};

use super::SqliteItemStore;
use crate::error::Result;
use crate::models::SyncState;

/// Trait for per-(device, target) checkpoint storage
pub trait SyncStateStore {
    /// Load the state for a pair, or the initial state if it never synced
    fn load_sync_state(&self, device_id: &str, target_id: &str) -> Result<SyncState>;

    /// Whether the pair has a persisted state
    fn has_sync_state(&self, device_id: &str, target_id: &str) -> Result<bool>;

    fn save_sync_state(&self, state: &SyncState) -> Result<()>;

    /// Every persisted state, ordered by target
    fn sync_states(&self) -> Result<Vec<SyncState>>;
}

fn parse_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncState> {
    Ok(SyncState {
        device_id: row.get(0)?,
        target_id: row.get(1)?,
        last_marker: row.get(2)?,
        remote_marker: row.get(3)?,
        last_synced_time: row.get(4)?,
    })
}

impl SyncStateStore for SqliteItemStore {
    fn load_sync_state(&self, device_id: &str, target_id: &str) -> Result<SyncState> {
        let state = self.database().with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT device_id, target_id, last_marker, remote_marker, last_synced_time
                     FROM sync_state WHERE device_id = ? AND target_id = ?",
                    params![device_id, target_id],
                    parse_state,
                )
                .optional()?)
        })?;
        Ok(state.unwrap_or_else(|| SyncState::initial(device_id, target_id)))
    }

    fn has_sync_state(&self, device_id: &str, target_id: &str) -> Result<bool> {
        self.database().with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sync_state WHERE device_id = ? AND target_id = ?)",
                params![device_id, target_id],
                |row| row.get(0),
            )?)
        })
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.database().with_connection(|conn| {
            conn.execute(
                "INSERT INTO sync_state (device_id, target_id, last_marker, remote_marker, last_synced_time)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(device_id, target_id) DO UPDATE SET
                    last_marker = excluded.last_marker,
                    remote_marker = excluded.remote_marker,
                    last_synced_time = COALESCE(excluded.last_synced_time, sync_state.last_synced_time)",
                params![
                    state.device_id,
                    state.target_id,
                    state.last_marker,
                    state.remote_marker,
                    state.last_synced_time,
                ],
            )?;
            Ok(())
        })
    }

    fn sync_states(&self) -> Result<Vec<SyncState>> {
        self.database().with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, target_id, last_marker, remote_marker, last_synced_time
                 FROM sync_state ORDER BY target_id",
            )?;
            let states = stmt
                .query_map([], parse_state)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(states)
        })
    }
}
