//! Decides what happens when local and remote versions of an item collide.
//!
//! Nothing is silently discarded. Conflicting note and resource edits keep
//! the remote version as a separate conflict copy. Folders carry no content,
//! so the newer one wins. An edit always beats a deletion.

use chrono::{DateTime, Utc};

use crate::db::LocalItemStore;
use crate::error::{Error, Result};
use crate::models::{ConflictStrategy, Item, ItemId, ItemType, SyncConflict};
use crate::util::unix_millis_now;

/// Outcome of [`ConflictResolver::resolve_edit_conflict`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The remote version was saved as `conflict_item`; the local version should be uploaded
    CopyAside { conflict_item: Item },
    /// The local version should be uploaded
    LocalWins,
    /// The remote version was applied locally
    RemoteWins,
}

pub struct ConflictResolver<'a, S> {
    store: &'a S,
    target_id: &'a str,
}

impl<'a, S: LocalItemStore> ConflictResolver<'a, S> {
    pub const fn new(store: &'a S, target_id: &'a str) -> Self {
        Self { store, target_id }
    }

    /// Settle an item edited both locally and remotely since the last sync
    pub fn resolve_edit_conflict(
        &self,
        local: &Item,
        remote: &Item,
        remote_blob: Option<&[u8]>,
    ) -> Result<Resolution> {
        if local.item_type != remote.item_type {
            return Err(Error::ConflictUnresolvable {
                item_id: local.id.to_string(),
                reason: format!(
                    "local {} collides with remote {}",
                    local.item_type, remote.item_type
                ),
            });
        }

        match local.item_type {
            ItemType::Folder => self.resolve_folder(local, remote),
            ItemType::Note | ItemType::Resource => self.copy_aside(local, remote, remote_blob),
            ItemType::ResourceBlob => Err(Error::ConflictUnresolvable {
                item_id: local.id.to_string(),
                reason: "resource blobs are synced with their resource".to_string(),
            }),
        }
    }

    fn resolve_folder(&self, local: &Item, remote: &Item) -> Result<Resolution> {
        if remote.updated_time > local.updated_time {
            self.store.apply_remote_create_or_update(remote, None)?;
            self.log(local, remote, None, ConflictStrategy::RemoteWins)?;
            tracing::info!(item_id = %local.id, "Folder conflict: remote version is newer");
            Ok(Resolution::RemoteWins)
        } else {
            self.log(local, remote, None, ConflictStrategy::LocalWins)?;
            tracing::info!(item_id = %local.id, "Folder conflict: local version kept");
            Ok(Resolution::LocalWins)
        }
    }

    fn copy_aside(
        &self,
        local: &Item,
        remote: &Item,
        remote_blob: Option<&[u8]>,
    ) -> Result<Resolution> {
        if remote.item_type == ItemType::Resource && remote_blob.is_none() {
            return Err(Error::ConflictUnresolvable {
                item_id: local.id.to_string(),
                reason: "remote resource data is missing".to_string(),
            });
        }

        let now = unix_millis_now();
        let parent_id = match local.parent_id {
            Some(parent_id) if self.store.get_item(&parent_id)?.is_some() => Some(parent_id),
            _ => None,
        };
        let copy = Item {
            id: ItemId::new(),
            parent_id,
            title: conflict_title(&remote.title, now),
            created_time: now,
            is_conflict: true,
            revision: 0,
            ..remote.clone()
        };
        let conflict_item = self.store.save_local_item(&copy, remote_blob)?;
        self.log(local, remote, Some(&conflict_item.id), ConflictStrategy::CopyAside)?;

        tracing::info!(
            item_id = %local.id,
            conflict_item_id = %conflict_item.id,
            "Conflicting edit kept as a copy"
        );
        Ok(Resolution::CopyAside { conflict_item })
    }

    /// A local deletion met a remote edit: bring the remote version back
    pub fn restore_remote(
        &self,
        remote: &Item,
        remote_blob: Option<&[u8]>,
        deleted_time: i64,
    ) -> Result<()> {
        if remote.item_type == ItemType::Resource && remote_blob.is_none() {
            return Err(Error::ConflictUnresolvable {
                item_id: remote.id.to_string(),
                reason: "remote resource data is missing".to_string(),
            });
        }
        self.store.apply_remote_create_or_update(remote, remote_blob)?;
        self.store.clear_tombstone(&remote.id)?;
        self.record(
            &remote.id,
            None,
            deleted_time,
            remote.updated_time,
            ConflictStrategy::RemoteEditRestored,
        )?;
        tracing::info!(item_id = %remote.id, "Remote edit restored over local deletion");
        Ok(())
    }

    /// A remote deletion met a local edit: the local version will be re-uploaded
    pub fn record_edit_beats_delete(&self, local: &Item, deleted_time: i64) -> Result<()> {
        self.record(
            &local.id,
            None,
            local.updated_time,
            deleted_time,
            ConflictStrategy::EditBeatsDelete,
        )?;
        tracing::info!(item_id = %local.id, "Local edit restored over remote deletion");
        Ok(())
    }

    fn log(
        &self,
        local: &Item,
        remote: &Item,
        conflict_item_id: Option<&ItemId>,
        strategy: ConflictStrategy,
    ) -> Result<i64> {
        self.record(
            &local.id,
            conflict_item_id,
            local.updated_time,
            remote.updated_time,
            strategy,
        )
    }

    fn record(
        &self,
        item_id: &ItemId,
        conflict_item_id: Option<&ItemId>,
        local_updated_time: i64,
        remote_updated_time: i64,
        strategy: ConflictStrategy,
    ) -> Result<i64> {
        self.store.record_conflict(&SyncConflict {
            id: 0,
            target_id: self.target_id.to_string(),
            item_id: item_id.to_string(),
            conflict_item_id: conflict_item_id.map(ToString::to_string),
            local_updated_time,
            remote_updated_time,
            resolved_at: unix_millis_now(),
            strategy,
        })
    }
}

/// `"<title> (conflict YYYY-MM-DD HH:MM)"`, in UTC
pub fn conflict_title(title: &str, time_ms: i64) -> String {
    let stamp = DateTime::<Utc>::from_timestamp_millis(time_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d %H:%M");
    if title.is_empty() {
        format!("(conflict {stamp})")
    } else {
        format!("{title} (conflict {stamp})")
    }
}
