use std::path::Path;

use loam_core::config::{SyncOptions, TargetUri};
use loam_core::sync::Synchronizer;

use crate::cli::TargetCommands;
use crate::commands::common::{format_sync_timestamp, open_store};
use crate::error::CliError;

pub async fn run_target(
    command: TargetCommands,
    target: &TargetUri,
    db_path: &Path,
) -> Result<(), CliError> {
    match command {
        TargetCommands::Format { yes } => run_format(target, yes, db_path).await,
        TargetCommands::Locks => run_locks(target, db_path).await,
    }
}

async fn run_format(target: &TargetUri, confirmed: bool, db_path: &Path) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::FormatNotConfirmed);
    }
    let store = open_store(db_path)?;
    let files = target.open()?;
    let queued = Synchronizer::new(&files, &store, target.target_id(), SyncOptions::default())
        .format_target()
        .await
        .map_err(|error| match error {
            loam_core::Error::LockContention(holder) => CliError::SyncInProgress(holder),
            other => CliError::Core(other),
        })?;

    println!("Formatted {target}; {queued} items queued for upload");
    Ok(())
}

async fn run_locks(target: &TargetUri, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let files = target.open()?;
    let locks = Synchronizer::new(&files, &store, target.target_id(), SyncOptions::default())
        .target_locks()
        .await?;

    if locks.is_empty() {
        println!("No locks held on {target}");
        return Ok(());
    }
    for lock in locks {
        println!(
            "{:<9}  device={}  session={}  started={}  updated={}",
            lock.lock_type.as_str(),
            lock.device_id,
            lock.session_id,
            format_sync_timestamp(lock.started_time),
            format_sync_timestamp(lock.updated_time)
        );
    }
    Ok(())
}
