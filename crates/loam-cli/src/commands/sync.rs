use std::path::Path;

use loam_core::config::{SyncOptions, TargetUri};
use loam_core::db::{LocalItemStore, SqliteItemStore, SyncStateStore};
use loam_core::storage::{FileApi, StorageDriver};
use loam_core::sync::{SessionOutcome, SessionResult, Synchronizer};
use loam_core::Error;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{
    format_sync_conflict_lines, format_sync_timestamp, open_store, sync_conflict_to_item,
    SyncConflictItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub target_id: String,
    pub device_id: String,
    pub last_synced_time: Option<i64>,
    pub pending_changes: usize,
    pub conflicts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<Vec<String>>,
}

pub async fn run_sync(target: &TargetUri, db_path: &Path) -> Result<SessionResult, CliError> {
    let store = open_store(db_path)?;
    let files = target.open()?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight transfers");
            on_interrupt.cancel();
        }
    });

    let result = sync_store(&store, &files, &target.target_id(), &cancel).await;
    interrupt.abort();
    let result = result?;

    println!("{}", result.status_line());
    for error in &result.errors {
        eprintln!("  skipped {}: {}", error.item_id, error.message);
    }
    if result.outcome == SessionOutcome::TimedOut {
        eprintln!("Session time limit reached; run `loam sync` again to continue.");
    }
    Ok(result)
}

pub async fn sync_store<D: StorageDriver>(
    store: &SqliteItemStore,
    files: &FileApi<D>,
    target_id: &str,
    cancel: &CancellationToken,
) -> Result<SessionResult, CliError> {
    Synchronizer::new(files, store, target_id, SyncOptions::default())
        .run_session(cancel)
        .await
        .map_err(|error| match error {
            Error::LockContention(holder) => CliError::SyncInProgress(holder),
            other => CliError::Core(other),
        })
}

pub async fn run_status(
    target: &TargetUri,
    remote: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let target_id = target.target_id();
    let device_id = store.device_id()?;
    let state = store.load_sync_state(&device_id, &target_id)?;

    let locks = if remote {
        let files = target.open()?;
        let locks = Synchronizer::new(&files, &store, target_id.as_str(), SyncOptions::default())
            .target_locks()
            .await?;
        Some(
            locks
                .iter()
                .map(|lock| {
                    format!(
                        "{} lock by device {} since {}",
                        lock.lock_type,
                        lock.device_id,
                        format_sync_timestamp(lock.started_time)
                    )
                })
                .collect(),
        )
    } else {
        None
    };

    let report = StatusReport {
        pending_changes: store.pending_change_count(&target_id, state.last_marker)?,
        conflicts: store.list_conflicts(usize::MAX)?.len(),
        last_synced_time: state.last_synced_time,
        target_id,
        device_id,
        locks,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for line in format_status_lines(&report) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(report: &StatusReport) -> Vec<String> {
    let mut lines = vec![
        format!("Target:          {}", report.target_id),
        format!("Device:          {}", report.device_id),
        format!(
            "Last synced:     {}",
            report
                .last_synced_time
                .map_or_else(|| "never".to_string(), format_sync_timestamp)
        ),
        format!("Pending changes: {}", report.pending_changes),
        format!("Conflicts:       {}", report.conflicts),
    ];
    match report.locks.as_deref() {
        Some([]) => lines.push("Locks:           none".to_string()),
        Some(locks) => {
            lines.push("Locks:".to_string());
            lines.extend(locks.iter().map(|lock| format!("  {lock}")));
        }
        None => {}
    }
    lines
}

pub fn run_conflicts(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let conflicts = open_store(db_path)?.list_conflicts(limit)?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
