//! Outcome of one sync session.

use std::time::Duration;

use serde::Serialize;

use crate::error::Error;
use crate::models::ItemId;
use crate::storage::StorageError;

/// How a session ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    #[default]
    Completed,
    /// Finished, but some items were skipped
    CompletedWithErrors,
    Cancelled,
    /// Stopped scheduling work after the session deadline
    TimedOut,
}

impl SessionOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed with errors",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed out",
        }
    }
}

/// Category of a per-item failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    Transient,
    QuotaExceeded,
    PayloadTooLarge,
    AccessDenied,
    ConflictUnresolvable,
    InvalidPayload,
    Other,
}

impl ItemErrorKind {
    pub const fn from_error(error: &Error) -> Self {
        match error {
            Error::Storage(StorageError::Transient(_) | StorageError::Timeout { .. }) => {
                Self::Transient
            }
            Error::Storage(StorageError::QuotaExceeded(_)) => Self::QuotaExceeded,
            Error::Storage(StorageError::PayloadTooLarge { .. }) => Self::PayloadTooLarge,
            Error::Storage(StorageError::AccessDenied(_)) => Self::AccessDenied,
            Error::ConflictUnresolvable { .. } => Self::ConflictUnresolvable,
            Error::InvalidPayload(_) => Self::InvalidPayload,
            _ => Self::Other,
        }
    }
}

/// An item that was skipped during a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub item_id: ItemId,
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(item_id: ItemId, error: &Error) -> Self {
        Self {
            item_id,
            kind: ItemErrorKind::from_error(error),
            message: error.to_string(),
        }
    }
}

/// Counters and diagnostics reported by `Synchronizer::run_session`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionResult {
    pub items_uploaded: usize,
    pub items_downloaded: usize,
    pub items_deleted_remote: usize,
    pub items_deleted_local: usize,
    pub conflicts_created: usize,
    pub errors: Vec<ItemError>,
    pub outcome: SessionOutcome,
    pub duration_ms: u64,
}

impl SessionResult {
    /// Whether nothing was transferred or deleted
    pub fn is_noop(&self) -> bool {
        self.items_uploaded == 0
            && self.items_downloaded == 0
            && self.items_deleted_remote == 0
            && self.items_deleted_local == 0
            && self.conflicts_created == 0
    }

    /// One-line human-readable summary
    pub fn status_line(&self) -> String {
        let mut parts = Vec::new();
        let counters = [
            (self.items_uploaded, "uploaded"),
            (self.items_downloaded, "downloaded"),
            (self.items_deleted_remote, "deleted remotely"),
            (self.items_deleted_local, "deleted locally"),
        ];
        for (count, label) in counters {
            if count > 0 {
                parts.push(format!("{count} {label}"));
            }
        }
        match self.conflicts_created {
            0 => {}
            1 => parts.push("1 conflict".to_string()),
            count => parts.push(format!("{count} conflicts")),
        }
        match self.errors.len() {
            0 => {}
            1 => parts.push("1 error".to_string()),
            count => parts.push(format!("{count} errors")),
        }

        let summary = if parts.is_empty() {
            "nothing to do".to_string()
        } else {
            parts.join(", ")
        };
        format!(
            "Sync {}: {summary} ({:.1}s)",
            self.outcome.as_str(),
            Duration::from_millis(self.duration_ms).as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_for_idle_session() {
        let result = SessionResult {
            duration_ms: 1200,
            ..SessionResult::default()
        };
        assert!(result.is_noop());
        assert_eq!(result.status_line(), "Sync completed: nothing to do (1.2s)");
    }

    #[test]
    fn status_line_lists_non_zero_counters() {
        let result = SessionResult {
            items_uploaded: 3,
            items_deleted_local: 1,
            conflicts_created: 2,
            errors: vec![ItemError::new(
                ItemId::new(),
                &Error::Storage(StorageError::PayloadTooLarge {
                    path: "a.md".to_string(),
                    size: 10,
                }),
            )],
            outcome: SessionOutcome::CompletedWithErrors,
            duration_ms: 50,
            ..SessionResult::default()
        };
        assert_eq!(
            result.status_line(),
            "Sync completed with errors: 3 uploaded, 1 deleted locally, 2 conflicts, 1 error (0.1s)"
        );
        assert_eq!(result.errors[0].kind, ItemErrorKind::PayloadTooLarge);
    }
}
