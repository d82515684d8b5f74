//! Sync conflict model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a collision between local and remote state was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Remote version kept as a new conflict item, local version uploaded
    CopyAside,
    /// Folder conflict won by the local side
    LocalWins,
    /// Folder conflict won by the remote side
    RemoteWins,
    /// Local edit restored over a remote deletion
    EditBeatsDelete,
    /// Remote edit restored over a local deletion
    RemoteEditRestored,
}

impl ConflictStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CopyAside => "copy_aside",
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::EditBeatsDelete => "edit_beats_delete",
            Self::RemoteEditRestored => "remote_edit_restored",
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "copy_aside" => Ok(Self::CopyAside),
            "local_wins" => Ok(Self::LocalWins),
            "remote_wins" => Ok(Self::RemoteWins),
            "edit_beats_delete" => Ok(Self::EditBeatsDelete),
            "remote_edit_restored" => Ok(Self::RemoteEditRestored),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict strategy: {other}"
            ))),
        }
    }
}

/// Recorded sync conflict and how it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Target the conflict happened against
    pub target_id: String,
    /// Item involved in the conflict
    pub item_id: String,
    /// Copy created to preserve the remote version, if any
    pub conflict_item_id: Option<String>,
    /// Local item's timestamp when the conflict occurred
    pub local_updated_time: i64,
    /// Remote item's timestamp when the conflict occurred
    pub remote_updated_time: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy
    pub strategy: ConflictStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_parse_back() {
        for strategy in [
            ConflictStrategy::CopyAside,
            ConflictStrategy::LocalWins,
            ConflictStrategy::RemoteWins,
            ConflictStrategy::EditBeatsDelete,
            ConflictStrategy::RemoteEditRestored,
        ] {
            assert_eq!(
                strategy.as_str().parse::<ConflictStrategy>().unwrap(),
                strategy
            );
        }
    }
}
