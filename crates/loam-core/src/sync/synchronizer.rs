//! One sync session between the local item store and a remote target.
//!
//! A session runs under the target's sync lock:
//!
//! 1. list the remote items and deletion markers
//! 2. push pending local changes, resolving collisions with remote edits
//! 3. pull remote changes for items without pending local changes
//! 4. push the conflict copies created on the way
//! 5. advance the change-log marker over the contiguous flushed prefix
//!
//! Every step is idempotent per item, so an interrupted session is finished
//! by the next one.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::lock::{Lock, LockGuard, LockManager, LockType};
use super::naming::{
    item_path, parse_item_path, parse_tombstone_path, resource_blob_path, tombstone_path,
    TombstoneMarker, SYNC_DIR, SYNC_TARGET_VERSION, TOMBSTONE_DIR, VERSION_FILE,
};
use super::resolver::{ConflictResolver, Resolution};
use super::result::{ItemError, SessionOutcome, SessionResult};
use super::retry::with_retry;
use crate::config::SyncOptions;
use crate::db::{LocalItemStore, SyncStateStore};
use crate::error::{Error, Result};
use crate::models::{
    deserialize_item, serialize_item, ChangeRecord, ChangeType, Item, ItemId, ItemType,
    SyncRecord,
};
use crate::storage::{FileApi, RemoteEntry, RemoteStat, StorageDriver, StorageError, StorageResult};
use crate::util::unix_millis_now;

/// Remote objects found at the start of a session, keyed by item id
#[derive(Debug, Default)]
struct RemoteListing {
    items: HashMap<ItemId, RemoteEntry>,
    tombstones: HashMap<ItemId, RemoteEntry>,
}

/// Pending changes of one item, collapsed
#[derive(Debug, Clone)]
struct PendingItem {
    item_id: ItemId,
    item_type: ItemType,
    /// Type of the latest change
    change_type: ChangeType,
    change_ids: Vec<i64>,
    /// Serialized state before the latest change
    before: Option<String>,
}

fn group_changes(changes: Vec<ChangeRecord>) -> Vec<PendingItem> {
    let mut index: HashMap<ItemId, usize> = HashMap::new();
    let mut groups: Vec<PendingItem> = Vec::new();
    for change in changes {
        if let Some(&position) = index.get(&change.item_id) {
            let group = &mut groups[position];
            group.change_type = change.change_type;
            group.change_ids.push(change.id);
            group.before = change.before;
        } else {
            index.insert(change.item_id, groups.len());
            groups.push(PendingItem {
                item_id: change.item_id,
                item_type: change.item_type,
                change_type: change.change_type,
                change_ids: vec![change.id],
                before: change.before,
            });
        }
    }
    groups
}

/// Whether the remote object differs from what was recorded at the last
/// sync. `None` when the driver metadata cannot tell.
fn changed_since(record: &SyncRecord, entry: &RemoteEntry) -> Option<bool> {
    let size_differs = record.remote_size.is_some_and(|size| size != entry.size);
    match (record.remote_time, entry.updated_time) {
        (Some(seen), Some(current)) => Some(seen != current || size_differs),
        _ if size_differs => Some(true),
        _ => None,
    }
}

enum RemoteCheck {
    Unchanged,
    Changed(Item),
    /// Deleted between listing and reading
    Gone,
}

/// Shared state of the per-item tasks of one session
struct SessionContext<'s> {
    cancel: &'s CancellationToken,
    deadline: Instant,
    listing: RemoteListing,
    result: Mutex<SessionResult>,
    fatal: Mutex<Option<Error>>,
    aborted: AtomicBool,
    interrupted: AtomicBool,
    uploads_blocked: AtomicBool,
    remote_marker: AtomicI64,
}

impl<'s> SessionContext<'s> {
    fn new(
        cancel: &'s CancellationToken,
        deadline: Instant,
        listing: RemoteListing,
        remote_marker: i64,
    ) -> Self {
        Self {
            cancel,
            deadline,
            listing,
            result: Mutex::new(SessionResult::default()),
            fatal: Mutex::new(None),
            aborted: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            uploads_blocked: AtomicBool::new(false),
            remote_marker: AtomicI64::new(remote_marker),
        }
    }

    /// Whether new item work must not start
    fn should_stop(&self) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            return true;
        }
        if self.cancel.is_cancelled() || Instant::now() >= self.deadline {
            self.interrupted.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn result(&self) -> MutexGuard<'_, SessionResult> {
        self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, update: impl FnOnce(&mut SessionResult)) {
        update(&mut self.result());
    }

    fn observe_remote_time(&self, entry: &RemoteEntry) {
        if let Some(time) = entry.updated_time {
            self.remote_marker.fetch_max(time, Ordering::SeqCst);
        }
    }

    fn item_failed(&self, item_id: ItemId, error: Error) {
        if error.is_session_fatal() {
            tracing::error!(item_id = %item_id, error = %error, "Aborting sync session");
            self.aborted.store(true, Ordering::SeqCst);
            let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
            if fatal.is_none() {
                *fatal = Some(error);
            }
            return;
        }

        if matches!(error, Error::Storage(StorageError::QuotaExceeded(_))) {
            tracing::warn!(item_id = %item_id, "Storage quota exceeded, suspending uploads");
            self.uploads_blocked.store(true, Ordering::SeqCst);
        } else {
            tracing::warn!(item_id = %item_id, error = %error, "Skipping item");
        }
        self.result().errors.push(ItemError::new(item_id, &error));
    }

    fn take_fatal(&self) -> Option<Error> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Runs sync sessions and maintenance for one (local store, target) pair
pub struct Synchronizer<'a, D, S> {
    files: &'a FileApi<D>,
    store: &'a S,
    target_id: String,
    options: SyncOptions,
}

impl<'a, D, S> Synchronizer<'a, D, S>
where
    D: StorageDriver,
    S: LocalItemStore + SyncStateStore,
{
    pub fn new(
        files: &'a FileApi<D>,
        store: &'a S,
        target_id: impl Into<String>,
        options: SyncOptions,
    ) -> Self {
        Self {
            files,
            store,
            target_id: target_id.into(),
            options,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub const fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run one full session.
    ///
    /// Returns `Err` when the session could not start (lock contention,
    /// incompatible target) or was aborted by a session-fatal error. Per-item
    /// failures are reported in [`SessionResult::errors`].
    pub async fn run_session(&self, cancel: &CancellationToken) -> Result<SessionResult> {
        self.options.validate()?;
        let started = Instant::now();
        let device_id = self.store.device_id()?;

        self.check_target_version().await?;

        let locks = LockManager::new(self.files, device_id.as_str(), &self.options);
        let guard = locks.acquire(LockType::Sync).await?;
        tracing::info!(
            target_id = %self.target_id,
            target = %self.files.description(),
            "Sync session started"
        );

        let outcome = locks
            .hold(&guard, self.run_locked(&device_id, cancel, started))
            .await;
        locks.release(guard).await;

        let mut result = outcome?;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            target_id = %self.target_id,
            uploaded = result.items_uploaded,
            downloaded = result.items_downloaded,
            deleted_remote = result.items_deleted_remote,
            deleted_local = result.items_deleted_local,
            conflicts = result.conflicts_created,
            errors = result.errors.len(),
            outcome = result.outcome.as_str(),
            "Sync session finished"
        );
        Ok(result)
    }

    async fn run_locked(
        &self,
        device_id: &str,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<SessionResult> {
        let mut state = self.store.load_sync_state(device_id, &self.target_id)?;
        if !self.store.has_sync_state(device_id, &self.target_id)? {
            let queued = self.store.requeue_unlogged_items()?;
            if queued > 0 {
                tracing::info!(queued, "Queued existing items for a new target");
            }
        }

        let listing = self.fetch_listing().await?;
        tracing::debug!(
            items = listing.items.len(),
            tombstones = listing.tombstones.len(),
            "Fetched remote listing"
        );

        let ctx = SessionContext::new(
            cancel,
            started + self.options.max_session_duration,
            listing,
            state.remote_marker,
        );
        let phases = self.run_phases(&ctx, device_id, state.last_marker).await;

        // Persist progress on every path out of the session
        let latest = self.store.latest_change_id()?;
        let pending = self.store.pending_changes(&self.target_id, state.last_marker)?;
        let marker = pending
            .first()
            .map_or(latest, |first| (first.id - 1).min(latest));
        state.last_marker = state.last_marker.max(marker);
        state.remote_marker = ctx.remote_marker.load(Ordering::SeqCst);

        let mut result = std::mem::take(&mut *ctx.result());
        result.outcome = if ctx.interrupted.load(Ordering::SeqCst) {
            if cancel.is_cancelled() {
                SessionOutcome::Cancelled
            } else {
                SessionOutcome::TimedOut
            }
        } else if result.errors.is_empty() {
            SessionOutcome::Completed
        } else {
            SessionOutcome::CompletedWithErrors
        };
        let fatal = ctx.take_fatal();
        if matches!(
            result.outcome,
            SessionOutcome::Completed | SessionOutcome::CompletedWithErrors
        ) && fatal.is_none()
            && phases.is_ok()
        {
            state.last_synced_time = Some(unix_millis_now());
        }
        self.store.save_sync_state(&state)?;

        if let Some(error) = fatal {
            return Err(error);
        }
        phases?;

        let pruned = self.store.prune(
            &self.target_id,
            state.last_marker,
            self.options.tombstone_retention,
        )?;
        if pruned.changes_removed > 0 || pruned.tombstones_removed > 0 {
            tracing::debug!(
                changes = pruned.changes_removed,
                tombstones = pruned.tombstones_removed,
                "Pruned sync bookkeeping"
            );
        }
        Ok(result)
    }

    async fn run_phases(
        &self,
        ctx: &SessionContext<'_>,
        device_id: &str,
        marker: i64,
    ) -> Result<()> {
        let groups = group_changes(self.store.pending_changes(&self.target_id, marker)?);
        let attempted = groups
            .iter()
            .map(|group| group.item_id)
            .collect::<HashSet<_>>();
        tracing::debug!(pending = groups.len(), "Pushing local changes");
        self.push_phase(ctx, device_id, groups).await;

        if !ctx.should_stop() {
            self.pull_phase(ctx, &attempted, marker).await?;
        }

        if !ctx.should_stop() {
            let follow_up = group_changes(self.store.pending_changes(&self.target_id, marker)?)
                .into_iter()
                .filter(|group| !attempted.contains(&group.item_id))
                .collect::<Vec<_>>();
            if !follow_up.is_empty() {
                tracing::debug!(pending = follow_up.len(), "Pushing conflict copies");
                self.push_phase(ctx, device_id, follow_up).await;
            }
        }
        Ok(())
    }

    // Push

    async fn push_phase(
        &self,
        ctx: &SessionContext<'_>,
        device_id: &str,
        groups: Vec<PendingItem>,
    ) {
        let mut results = stream::iter(groups)
            .map(|group| self.push_item(ctx, device_id, group))
            .buffer_unordered(self.options.max_parallel_transfers);
        while let Some((item_id, result)) = results.next().await {
            if let Err(error) = result {
                ctx.item_failed(item_id, error);
            }
        }
    }

    async fn push_item(
        &self,
        ctx: &SessionContext<'_>,
        device_id: &str,
        group: PendingItem,
    ) -> (ItemId, Result<()>) {
        let item_id = group.item_id;
        if ctx.should_stop() {
            return (item_id, Ok(()));
        }
        let result = match group.change_type {
            ChangeType::Delete => self.push_delete(ctx, device_id, &group).await,
            ChangeType::Create | ChangeType::Update => self.push_upsert(ctx, &group).await,
        };
        (item_id, result)
    }

    async fn push_upsert(&self, ctx: &SessionContext<'_>, group: &PendingItem) -> Result<()> {
        let id = group.item_id;
        let Some(local) = self.store.get_item(&id)? else {
            // Removed by an earlier remote deletion
            self.store.mark_flushed(&self.target_id, &group.change_ids, None)?;
            return Ok(());
        };
        if ctx.uploads_blocked.load(Ordering::SeqCst) {
            return Ok(());
        }

        let record = self.store.sync_record(&self.target_id, &id)?;
        let marker = ctx.listing.tombstones.get(&id);
        let resolver = ConflictResolver::new(self.store, &self.target_id);

        let Some(entry) = ctx.listing.items.get(&id) else {
            if marker.is_some() || record.is_some() {
                let deleted_time = match marker {
                    Some(entry) => self.marker_time(&id, entry).await?,
                    None => unix_millis_now(),
                };
                resolver.record_edit_beats_delete(&local, deleted_time)?;
                ctx.count(|result| result.conflicts_created += 1);
            }
            self.upload(&local, &group.change_ids).await?;
            if marker.is_some() {
                self.delete(&tombstone_path(&id)).await?;
            }
            ctx.count(|result| result.items_uploaded += 1);
            tracing::debug!(item_id = %id, "Uploaded item");
            return Ok(());
        };

        match self.check_remote(&id, record.as_ref(), entry).await? {
            RemoteCheck::Unchanged | RemoteCheck::Gone => {
                self.upload(&local, &group.change_ids).await?;
                ctx.count(|result| result.items_uploaded += 1);
                tracing::debug!(item_id = %id, "Uploaded item");
            }
            RemoteCheck::Changed(remote) if remote.same_content(&local) => {
                // Our own earlier write whose bookkeeping was lost
                let record = synced_record(&local, entry);
                self.store
                    .mark_flushed(&self.target_id, &group.change_ids, Some(&record))?;
                tracing::debug!(item_id = %id, "Remote already up to date");
            }
            RemoteCheck::Changed(remote) => {
                let blob = self.fetch_blob_for(&remote).await?;
                match resolver.resolve_edit_conflict(&local, &remote, blob.as_deref())? {
                    Resolution::CopyAside { .. } | Resolution::LocalWins => {
                        self.upload(&local, &group.change_ids).await?;
                        ctx.count(|result| {
                            result.conflicts_created += 1;
                            result.items_uploaded += 1;
                        });
                    }
                    Resolution::RemoteWins => {
                        let record = synced_record(&remote, entry);
                        self.store
                            .mark_flushed(&self.target_id, &group.change_ids, Some(&record))?;
                        ctx.observe_remote_time(entry);
                        ctx.count(|result| {
                            result.conflicts_created += 1;
                            result.items_downloaded += 1;
                        });
                    }
                }
            }
        }
        if marker.is_some() {
            self.delete(&tombstone_path(&id)).await?;
        }
        Ok(())
    }

    async fn push_delete(
        &self,
        ctx: &SessionContext<'_>,
        device_id: &str,
        group: &PendingItem,
    ) -> Result<()> {
        let id = group.item_id;
        let record = self.store.sync_record(&self.target_id, &id)?;
        let deleted_time = self
            .store
            .tombstone(&id)?
            .map_or_else(unix_millis_now, |tombstone| tombstone.deleted_time);

        match (ctx.listing.items.get(&id), &record) {
            (None, None) => {
                // Never reached this target
                self.store.acknowledge_tombstone(&self.target_id, &id)?;
                self.store
                    .mark_flushed(&self.target_id, &group.change_ids, None)?;
                return Ok(());
            }
            (Some(entry), _) => {
                if let RemoteCheck::Changed(remote) =
                    self.check_remote(&id, record.as_ref(), entry).await?
                {
                    let before = group
                        .before
                        .as_deref()
                        .map(deserialize_item)
                        .transpose()
                        .ok()
                        .flatten();
                    if !before.is_some_and(|before| before.same_content(&remote)) {
                        let blob = self.fetch_blob_for(&remote).await?;
                        ConflictResolver::new(self.store, &self.target_id).restore_remote(
                            &remote,
                            blob.as_deref(),
                            deleted_time,
                        )?;
                        let record = synced_record(&remote, entry);
                        self.store
                            .mark_flushed(&self.target_id, &group.change_ids, Some(&record))?;
                        ctx.observe_remote_time(entry);
                        ctx.count(|result| {
                            result.conflicts_created += 1;
                            result.items_downloaded += 1;
                        });
                        return Ok(());
                    }
                }
            }
            (None, Some(_)) => {}
        }

        self.delete(&item_path(&id)).await?;
        if group.item_type == ItemType::Resource {
            self.delete(&resource_blob_path(&id)).await?;
        }
        let marker = TombstoneMarker {
            item_id: id,
            item_type: group.item_type,
            deleted_time,
            device_id: device_id.to_string(),
        };
        self.put(&tombstone_path(&id), &serde_json::to_vec(&marker)?)
            .await?;

        self.store.acknowledge_tombstone(&self.target_id, &id)?;
        self.store.delete_sync_record(&self.target_id, &id)?;
        self.store
            .mark_flushed(&self.target_id, &group.change_ids, None)?;
        ctx.count(|result| result.items_deleted_remote += 1);
        tracing::debug!(item_id = %id, "Deleted remote item");
        Ok(())
    }

    async fn upload(&self, local: &Item, change_ids: &[i64]) -> Result<()> {
        let path = item_path(&local.id);
        if local.item_type == ItemType::Resource {
            let blob = self.store.resource_blob(&local.id)?.ok_or_else(|| {
                Error::InvalidPayload(format!("resource {} has no data", local.id))
            })?;
            self.put(&resource_blob_path(&local.id), &blob).await?;
        }
        self.put(&path, serialize_item(local).as_bytes()).await?;

        match self.set_timestamp(&path, local.updated_time).await {
            Ok(()) | Err(StorageError::Unsupported(_)) => {}
            Err(error) => return Err(error.into()),
        }
        let stat = self.stat(&path).await?;

        let record = SyncRecord {
            item_id: local.id,
            item_type: local.item_type,
            sync_time: local.updated_time,
            remote_time: stat.as_ref().and_then(|stat| stat.updated_time),
            remote_size: stat.map(|stat| stat.size),
        };
        self.store
            .mark_flushed(&self.target_id, change_ids, Some(&record))
    }

    // Pull

    async fn pull_phase(
        &self,
        ctx: &SessionContext<'_>,
        pushed: &HashSet<ItemId>,
        marker: i64,
    ) -> Result<()> {
        // Changes still pending were deferred or failed; leave those items alone
        let pending = self
            .store
            .pending_changes(&self.target_id, marker)?
            .into_iter()
            .map(|change| change.item_id)
            .collect::<HashSet<_>>();
        let skip = |id: &ItemId| pushed.contains(id) || pending.contains(id);

        let records = self
            .store
            .sync_records(&self.target_id)?
            .into_iter()
            .map(|record| (record.item_id, record))
            .collect::<HashMap<_, _>>();

        let downloads = ctx
            .listing
            .items
            .iter()
            .filter(|(id, _)| !skip(*id) && !ctx.listing.tombstones.contains_key(*id))
            .map(|(id, entry)| (*id, entry, records.get(id)))
            .collect::<Vec<_>>();
        tracing::debug!(candidates = downloads.len(), "Pulling remote changes");

        let mut results = stream::iter(downloads)
            .map(|(id, entry, record)| async move {
                if ctx.should_stop() {
                    return (id, Ok(()));
                }
                (id, self.pull_item(ctx, id, entry, record).await)
            })
            .buffer_unordered(self.options.max_parallel_transfers);
        while let Some((item_id, result)) = results.next().await {
            if let Err(error) = result {
                ctx.item_failed(item_id, error);
            }
        }

        // Deletion markers: never let an older copy come back
        let horizon = unix_millis_now()
            - i64::try_from(self.options.tombstone_retention.as_millis()).unwrap_or(i64::MAX);
        for (id, entry) in &ctx.listing.tombstones {
            if ctx.should_stop() {
                return Ok(());
            }
            if skip(id) {
                continue;
            }
            let result = match ctx.listing.items.get(id) {
                Some(object) => self.pull_marked_item(ctx, id, object, entry, &records).await,
                None => self
                    .apply_remote_deletion(ctx, id, records.contains_key(id))
                    .map(|()| false),
            };
            let result = match result {
                Ok(false) => self.prune_marker(id, entry, horizon).await,
                Ok(true) => Ok(()),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                ctx.item_failed(*id, error);
            }
        }

        // Synced before, now gone without a marker
        for id in records.keys() {
            if ctx.should_stop() {
                return Ok(());
            }
            if ctx.listing.items.contains_key(id)
                || ctx.listing.tombstones.contains_key(id)
                || skip(id)
            {
                continue;
            }
            if let Err(error) = self.apply_remote_deletion(ctx, id, true) {
                ctx.item_failed(*id, error);
            }
        }
        Ok(())
    }

    async fn pull_item(
        &self,
        ctx: &SessionContext<'_>,
        id: ItemId,
        entry: &RemoteEntry,
        record: Option<&SyncRecord>,
    ) -> Result<()> {
        let remote = match self.check_remote(&id, record, entry).await? {
            RemoteCheck::Unchanged | RemoteCheck::Gone => return Ok(()),
            RemoteCheck::Changed(remote) => remote,
        };
        let record = synced_record(&remote, entry);

        let local = self.store.get_item(&id)?;
        if local.as_ref().is_some_and(|local| local.same_content(&remote)) {
            self.store.save_sync_record(&self.target_id, &record)?;
            ctx.observe_remote_time(entry);
            return Ok(());
        }

        let blob = self.fetch_blob_for(&remote).await?;
        if remote.item_type == ItemType::Resource && blob.is_none() {
            return Err(Error::InvalidPayload(format!(
                "resource {id} has no data on the target"
            )));
        }
        self.store
            .apply_remote_create_or_update(&remote, blob.as_deref())?;
        if self.store.tombstone(&id)?.is_some() {
            self.store.clear_tombstone(&id)?;
        }
        self.store.save_sync_record(&self.target_id, &record)?;
        ctx.observe_remote_time(entry);
        ctx.count(|result| result.items_downloaded += 1);
        tracing::debug!(item_id = %id, "Downloaded item");
        Ok(())
    }

    /// An object listed next to its deletion marker.
    ///
    /// Only a copy written after the deletion survives; it is downloaded and the marker
    /// removed. An older copy came back from a lagging replica and is deleted again.
    /// Returns whether the object survived.
    async fn pull_marked_item(
        &self,
        ctx: &SessionContext<'_>,
        id: &ItemId,
        object: &RemoteEntry,
        marker: &RemoteEntry,
        records: &HashMap<ItemId, SyncRecord>,
    ) -> Result<bool> {
        let deleted_time = self.marker_deleted_time(id, marker).await?;
        let remote = self.fetch_item(id).await?;
        if remote
            .as_ref()
            .is_some_and(|remote| remote.updated_time > deleted_time)
        {
            self.pull_item(ctx, *id, object, records.get(id)).await?;
            self.delete(&marker.path).await?;
            tracing::debug!(item_id = %id, "Edit made after deletion kept");
            return Ok(true);
        }

        self.apply_remote_deletion(ctx, id, records.contains_key(id))?;
        if let Some(remote) = remote {
            self.delete(&item_path(id)).await?;
            if remote.item_type == ItemType::Resource {
                self.delete(&resource_blob_path(id)).await?;
            }
            tracing::debug!(item_id = %id, "Removed copy restored after its deletion");
        }
        Ok(false)
    }

    fn apply_remote_deletion(
        &self,
        ctx: &SessionContext<'_>,
        id: &ItemId,
        known: bool,
    ) -> Result<()> {
        if !known && self.store.get_item(id)?.is_none() {
            return Ok(());
        }
        let existed = self.store.apply_remote_delete(id)?;
        self.store.delete_sync_record(&self.target_id, id)?;
        if existed {
            ctx.count(|result| result.items_deleted_local += 1);
            tracing::debug!(item_id = %id, "Deleted item removed remotely");
        }
        Ok(())
    }

    async fn prune_marker(&self, id: &ItemId, entry: &RemoteEntry, horizon: i64) -> Result<()> {
        if self.marker_time(id, entry).await? < horizon {
            self.delete(&entry.path).await?;
            tracing::debug!(item_id = %id, "Removed expired deletion marker");
        }
        Ok(())
    }

    async fn marker_time(&self, id: &ItemId, entry: &RemoteEntry) -> Result<i64> {
        if let Some(time) = entry.updated_time {
            return Ok(time);
        }
        let raw = self.get(&tombstone_path(id)).await?;
        Ok(raw
            .and_then(|raw| serde_json::from_slice::<TombstoneMarker>(&raw).ok())
            .map_or_else(unix_millis_now, |marker| marker.deleted_time))
    }

    /// Deletion time recorded in the marker, falling back to the marker's timestamp
    async fn marker_deleted_time(&self, id: &ItemId, entry: &RemoteEntry) -> Result<i64> {
        let raw = self.get(&tombstone_path(id)).await?;
        Ok(raw
            .and_then(|raw| serde_json::from_slice::<TombstoneMarker>(&raw).ok())
            .map(|marker| marker.deleted_time)
            .or(entry.updated_time)
            .unwrap_or_else(unix_millis_now))
    }

    // Remote reads

    async fn fetch_listing(&self) -> Result<RemoteListing> {
        let mut listing = RemoteListing::default();
        for entry in self.list("").await? {
            if entry.is_dir {
                continue;
            }
            if let Some(id) = parse_item_path(&entry.path) {
                listing.items.insert(id, entry);
            }
        }
        for entry in self.list(TOMBSTONE_DIR).await? {
            if let Some(id) = parse_tombstone_path(&entry.path) {
                listing.tombstones.insert(id, entry);
            }
        }
        Ok(listing)
    }

    async fn check_remote(
        &self,
        id: &ItemId,
        record: Option<&SyncRecord>,
        entry: &RemoteEntry,
    ) -> Result<RemoteCheck> {
        let known = record.and_then(|record| changed_since(record, entry));
        if known == Some(false) {
            return Ok(RemoteCheck::Unchanged);
        }
        let Some(remote) = self.fetch_item(id).await? else {
            return Ok(RemoteCheck::Gone);
        };
        if let (Some(record), None) = (record, known) {
            if remote.updated_time == record.sync_time {
                return Ok(RemoteCheck::Unchanged);
            }
        }
        Ok(RemoteCheck::Changed(remote))
    }

    async fn fetch_item(&self, id: &ItemId) -> Result<Option<Item>> {
        let raw = match self.get(&item_path(id)).await {
            Ok(Some(raw)) => raw,
            // Deleted between listing and reading
            Ok(None) | Err(StorageError::NotFound(_)) => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let text = String::from_utf8(raw)
            .map_err(|error| Error::InvalidPayload(format!("{}: {error}", item_path(id))))?;
        let item = deserialize_item(&text)?;
        if item.id != *id {
            return Err(Error::InvalidPayload(format!(
                "{} contains item {}",
                item_path(id),
                item.id
            )));
        }
        Ok(Some(item))
    }

    async fn fetch_blob_for(&self, item: &Item) -> Result<Option<Vec<u8>>> {
        if item.item_type != ItemType::Resource {
            return Ok(None);
        }
        Ok(self.get(&resource_blob_path(&item.id)).await?)
    }

    // Target maintenance

    async fn check_target_version(&self) -> Result<()> {
        let Some(raw) = self.get(VERSION_FILE).await? else {
            return self.write_target_version().await;
        };
        let text = String::from_utf8_lossy(&raw);
        let version = text.trim().parse::<u32>().map_err(|_| {
            Error::UnsupportedTarget(format!("unreadable version marker {:?}", text.trim()))
        })?;
        if version > SYNC_TARGET_VERSION {
            return Err(Error::UnsupportedTarget(format!(
                "target uses sync format {version}, this client supports up to {SYNC_TARGET_VERSION}"
            )));
        }
        Ok(())
    }

    async fn write_target_version(&self) -> Result<()> {
        self.mkdir(SYNC_DIR).await?;
        self.put(VERSION_FILE, SYNC_TARGET_VERSION.to_string().as_bytes())
            .await?;
        tracing::info!(version = SYNC_TARGET_VERSION, "Initialized sync target");
        Ok(())
    }

    /// Delete everything on the target and queue every local item for upload.
    ///
    /// Runs under the exclusive lock. Returns the number of queued items.
    pub async fn format_target(&self) -> Result<usize> {
        self.options.validate()?;
        let device_id = self.store.device_id()?;
        let locks = LockManager::new(self.files, device_id, &self.options);
        let guard = locks.acquire(LockType::Exclusive).await?;
        let result = self.format_locked(&locks, &guard).await;
        locks.release(guard).await;
        result
    }

    async fn format_locked(&self, locks: &LockManager<'_, D>, guard: &LockGuard) -> Result<usize> {
        tracing::warn!(target = %self.files.description(), "Formatting sync target");
        let files = self.files;
        self.retry("format", move || files.format()).await?;
        // Formatting removed our own lock object too
        locks.refresh(guard).await?;
        self.write_target_version().await?;
        let queued = self.store.reset_target(&self.target_id)?;
        tracing::info!(queued, "Sync target formatted");
        Ok(queued)
    }

    /// Locks currently present on the target
    pub async fn target_locks(&self) -> Result<Vec<Lock>> {
        let device_id = self.store.device_id()?;
        LockManager::new(self.files, device_id, &self.options)
            .current_locks()
            .await
    }

    // Driver calls with timeout and retry

    async fn retry<T, F, Fut>(&self, operation: &str, call: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        with_retry(&self.options.retry, self.options.call_timeout, operation, call).await
    }

    async fn list(&self, dir: &str) -> StorageResult<Vec<RemoteEntry>> {
        let files = self.files;
        self.retry("list", move || files.list(dir)).await
    }

    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let files = self.files;
        self.retry("get", move || files.get(path)).await
    }

    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let files = self.files;
        self.retry("put", move || files.put(path, data)).await
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let files = self.files;
        self.retry("delete", move || files.delete(path)).await
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let files = self.files;
        self.retry("mkdir", move || files.mkdir(path)).await
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>> {
        let files = self.files;
        self.retry("stat", move || files.stat(path)).await
    }

    async fn set_timestamp(&self, path: &str, time_ms: i64) -> StorageResult<()> {
        let files = self.files;
        self.retry("set_timestamp", move || files.set_timestamp(path, time_ms))
            .await
    }
}

/// Sync record for an item whose current remote object is `entry`
fn synced_record(item: &Item, entry: &RemoteEntry) -> SyncRecord {
    SyncRecord {
        item_id: item.id,
        item_type: item.item_type,
        sync_time: item.updated_time,
        remote_time: entry.updated_time,
        remote_size: Some(entry.size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change(id: i64, item_id: ItemId, change_type: ChangeType) -> ChangeRecord {
        ChangeRecord {
            id,
            item_id,
            item_type: ItemType::Note,
            change_type,
            updated_time: id,
            before: Some(format!("state {id}")),
        }
    }

    #[test]
    fn changes_collapse_per_item() {
        let a = ItemId::new();
        let b = ItemId::new();
        let groups = group_changes(vec![
            change(1, a, ChangeType::Create),
            change(2, b, ChangeType::Create),
            change(3, a, ChangeType::Update),
            change(4, a, ChangeType::Delete),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].item_id, a);
        assert_eq!(groups[0].change_type, ChangeType::Delete);
        assert_eq!(groups[0].change_ids, vec![1, 3, 4]);
        assert_eq!(groups[0].before.as_deref(), Some("state 4"));
        assert_eq!(groups[1].change_ids, vec![2]);
    }

    fn record(remote_time: Option<i64>, remote_size: Option<u64>) -> SyncRecord {
        SyncRecord {
            item_id: ItemId::new(),
            item_type: ItemType::Note,
            sync_time: 10,
            remote_time,
            remote_size,
        }
    }

    fn entry(updated_time: Option<i64>, size: u64) -> RemoteEntry {
        RemoteEntry {
            path: "x.md".to_string(),
            size,
            updated_time,
            is_dir: false,
        }
    }

    #[test]
    fn change_detection_uses_mtime_and_size() {
        assert_eq!(changed_since(&record(Some(5), Some(3)), &entry(Some(5), 3)), Some(false));
        assert_eq!(changed_since(&record(Some(5), Some(3)), &entry(Some(6), 3)), Some(true));
        assert_eq!(changed_since(&record(Some(5), Some(3)), &entry(Some(5), 4)), Some(true));
        assert_eq!(changed_since(&record(None, Some(3)), &entry(None, 4)), Some(true));
        assert_eq!(changed_since(&record(None, Some(3)), &entry(Some(5), 3)), None);
    }
}
