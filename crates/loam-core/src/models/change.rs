//! Change log, tombstone and sync bookkeeping models

use serde::{Deserialize, Serialize};

use super::{ItemId, ItemType};
use crate::error::{Error, Result};

/// Kind of local mutation recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub const fn code(self) -> i64 {
        match self {
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::Create),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("Unknown change type code: {other}"))),
        }
    }
}

/// Append-only record of one local mutation awaiting propagation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Log sequence number; also the sync marker unit
    pub id: i64,
    pub item_id: ItemId,
    pub item_type: ItemType,
    pub change_type: ChangeType,
    /// Item `updated_time` at the moment of the change (Unix ms)
    pub updated_time: i64,
    /// Serialized item as it was before the change, if it existed
    pub before: Option<String>,
}

/// Local record of a deleted item, kept until every target has seen it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub item_id: ItemId,
    pub item_type: ItemType,
    /// Deletion timestamp (Unix ms)
    pub deleted_time: i64,
}

/// Per-item, per-target snapshot of the last successful exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub item_id: ItemId,
    pub item_type: ItemType,
    /// Item `updated_time` that was last uploaded or downloaded
    pub sync_time: i64,
    /// Remote modification time observed right after that exchange
    pub remote_time: Option<i64>,
    /// Remote object size observed right after that exchange
    pub remote_size: Option<u64>,
}

/// Durable checkpoint for one (device, target) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub device_id: String,
    pub target_id: String,
    /// Highest change-log sequence number known to be fully propagated
    pub last_marker: i64,
    /// Highest remote modification time applied locally (Unix ms)
    pub remote_marker: i64,
    /// Completion time of the last session without errors (Unix ms)
    pub last_synced_time: Option<i64>,
}

impl SyncState {
    /// Initial state for a pair that has never synced.
    pub fn initial(device_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            target_id: target_id.into(),
            last_marker: 0,
            remote_marker: 0,
            last_synced_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_codes_round_trip() {
        for change_type in [ChangeType::Create, ChangeType::Update, ChangeType::Delete] {
            assert_eq!(
                ChangeType::from_code(change_type.code()).unwrap(),
                change_type
            );
        }
        assert!(ChangeType::from_code(0).is_err());
    }

    #[test]
    fn initial_sync_state_starts_at_zero() {
        let state = SyncState::initial("device", "file:/tmp/target");
        assert_eq!(state.last_marker, 0);
        assert_eq!(state.remote_marker, 0);
        assert!(state.last_synced_time.is_none());
    }
}
