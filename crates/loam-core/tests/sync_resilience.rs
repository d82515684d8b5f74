mod common;

use std::time::Duration;

use common::{device, options, sync, sync_with, TARGET};
use loam_core::db::{LocalItemStore, SqliteItemStore};
use loam_core::storage::{FileApi, MemoryDriver, MemoryOp, StorageDriver, StorageError};
use loam_core::sync::{ItemErrorKind, Lock, LockType, SessionOutcome, Synchronizer};
use loam_core::util::unix_millis_now;
use loam_core::Error;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn shared_target() -> (MemoryDriver, FileApi<MemoryDriver>) {
    let driver = MemoryDriver::new();
    (driver.clone(), FileApi::new(driver, ""))
}

fn foreign_lock(updated_time: i64) -> Lock {
    Lock {
        session_id: "0190c0e5b1e87b3c9b9f3a7c2d1e4f57".to_string(),
        device_id: "0190c0e5b1e87b3c9b9f3a7c2d1e4f99".to_string(),
        lock_type: LockType::Sync,
        started_time: updated_time,
        updated_time,
    }
}

async fn plant_lock(files: &FileApi<MemoryDriver>, lock: &Lock) {
    files
        .put(&lock.path(), &serde_json::to_vec(lock).unwrap())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sessions_have_one_winner() {
    let (driver, files) = shared_target();
    let alice = device();
    let bob = device();
    alice.create_note(None, "a", "from alice").unwrap();
    bob.create_note(None, "b", "from bob").unwrap();

    let (first, second) = tokio::join!(sync(&alice, &files), sync(&bob, &files));

    let outcomes = [&first, &second];
    let winners = outcomes.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1, "{first:?} / {second:?}");
    let loser = outcomes
        .iter()
        .find_map(|result| result.as_ref().err())
        .unwrap();
    assert!(matches!(loser, Error::LockContention(_)));
    assert!(common::lock_paths(&driver.paths()).is_empty());

    // The loser changed nothing; both catch up whoever won
    for store in [&alice, &bob, &alice] {
        sync(store, &files).await.unwrap();
    }
    assert_eq!(alice.list_items(10).unwrap().len(), 2);
    assert_eq!(bob.list_items(10).unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn live_lock_blocks_session_without_mutation() {
    let (driver, files) = shared_target();
    let lock = foreign_lock(unix_millis_now());
    plant_lock(&files, &lock).await;

    let alice = device();
    let note = alice.create_note(None, "a", "b").unwrap();
    let err = sync(&alice, &files).await.unwrap_err();
    assert!(matches!(err, Error::LockContention(_)));

    assert!(!driver.paths().contains(&format!("{}.md", note.id)));
    assert_eq!(common::lock_paths(&driver.paths()).len(), 1);
    assert_eq!(alice.pending_change_count(TARGET, 0).unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_lock_is_reclaimed() {
    let (driver, files) = shared_target();
    let ttl = Duration::from_secs(180);
    let old = unix_millis_now() - i64::try_from(ttl.as_millis()).unwrap() - 1_000;
    plant_lock(&files, &foreign_lock(old)).await;

    let alice = device();
    alice.create_note(None, "a", "b").unwrap();
    let result = sync_with(&alice, &files, options().with_lock_ttl(ttl))
        .await
        .unwrap();

    assert_eq!(result.items_uploaded, 1);
    assert!(common::lock_paths(&driver.paths()).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn young_lock_is_kept() {
    let (driver, files) = shared_target();
    let ttl = Duration::from_secs(180);
    let young = unix_millis_now() - 10_000;
    let lock = foreign_lock(young);
    plant_lock(&files, &lock).await;

    let alice = device();
    let err = sync_with(&alice, &files, options().with_lock_ttl(ttl))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockContention(_)));
    assert_eq!(common::lock_paths(&driver.paths()), vec![&lock.path()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_upload_is_not_repeated() {
    let (driver, files) = shared_target();
    let alice = device();
    let note = alice.create_note(None, "Plan", "text").unwrap();
    let path = format!("{}.md", note.id);

    // The object lands, but the session loses track of it before recording
    driver.inject_failure(
        MemoryOp::Stat,
        &path,
        StorageError::AccessDenied("stat".to_string()),
        1,
    );
    let first = sync(&alice, &files).await.unwrap();
    assert_eq!(first.outcome, SessionOutcome::CompletedWithErrors);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(driver.put_count(&path), 1);
    assert_eq!(alice.pending_change_count(TARGET, 0).unwrap(), 1);

    // Queued behind the interrupted item
    let later = alice.create_note(None, "Later", "more").unwrap();
    let later_path = format!("{}.md", later.id);

    let second = sync(&alice, &files).await.unwrap();
    assert_eq!(second.outcome, SessionOutcome::Completed);
    assert_eq!(second.conflicts_created, 0);
    assert_eq!(second.items_uploaded, 1);
    assert_eq!(driver.put_count(&path), 1);
    assert_eq!(driver.put_count(&later_path), 1);
    assert_eq!(alice.pending_change_count(TARGET, 0).unwrap(), 0);

    assert!(sync(&alice, &files).await.unwrap().is_noop());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried() {
    let (driver, files) = shared_target();
    let alice = device();
    let note = alice.create_note(None, "a", "b").unwrap();
    driver.inject_failure(
        MemoryOp::Put,
        &note.id.to_string(),
        StorageError::Transient("503".to_string()),
        1,
    );

    let result = sync(&alice, &files).await.unwrap();
    assert_eq!(result.items_uploaded, 1);
    assert!(result.errors.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_stops_uploads_but_not_downloads() {
    let (driver, files) = shared_target();
    let alice = device();
    let shared = alice.create_note(None, "shared", "from alice").unwrap();
    sync(&alice, &files).await.unwrap();

    let bob = device();
    for title in ["one", "two", "three"] {
        bob.create_note(None, title, "body").unwrap();
    }
    driver.inject_failure(
        MemoryOp::Put,
        ".md",
        StorageError::QuotaExceeded("full".to_string()),
        1,
    );

    let options = options().with_max_parallel_transfers(1);
    let result = sync_with(&bob, &files, options.clone()).await.unwrap();
    assert_eq!(result.outcome, SessionOutcome::CompletedWithErrors);
    assert_eq!(result.items_uploaded, 0);
    assert_eq!(result.items_downloaded, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ItemErrorKind::QuotaExceeded);
    assert!(bob.get_item(&shared.id).unwrap().is_some());
    assert_eq!(bob.pending_change_count(TARGET, 0).unwrap(), 3);

    let retried = sync_with(&bob, &files, options).await.unwrap();
    assert_eq!(retried.items_uploaded, 3);
    assert_eq!(retried.outcome, SessionOutcome::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_item_is_skipped() {
    let driver = MemoryDriver::new().with_max_object_size(1024);
    let files = FileApi::new(driver.clone(), "");
    let alice = device();
    let big = alice.create_note(None, "big", &"x".repeat(4096)).unwrap();
    let small = alice.create_note(None, "small", "ok").unwrap();

    let result = sync(&alice, &files).await.unwrap();
    assert_eq!(result.items_uploaded, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].item_id, big.id);
    assert_eq!(result.errors[0].kind, ItemErrorKind::PayloadTooLarge);
    assert!(driver.paths().contains(&format!("{}.md", small.id)));
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_failure_aborts_session() {
    let (driver, files) = shared_target();
    let alice = device();
    alice.create_note(None, "a", "b").unwrap();
    driver.inject_failure(
        MemoryOp::Put,
        ".md",
        StorageError::Authentication("token expired".to_string()),
        1,
    );

    let err = sync(&alice, &files).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Storage(StorageError::Authentication(_))
    ));
    assert!(common::lock_paths(&driver.paths()).is_empty());

    let result = sync(&alice, &files).await.unwrap();
    assert_eq!(result.items_uploaded, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_session_leaves_work_pending() {
    let (driver, files) = shared_target();
    let alice = device();
    alice.create_note(None, "a", "b").unwrap();
    alice.create_note(None, "c", "d").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = Synchronizer::new(&files, &alice, TARGET, options())
        .run_session(&cancel)
        .await
        .unwrap();
    assert_eq!(result.outcome, SessionOutcome::Cancelled);
    assert_eq!(result.items_uploaded, 0);
    assert_eq!(alice.pending_change_count(TARGET, 0).unwrap(), 2);
    assert!(common::lock_paths(&driver.paths()).is_empty());

    assert_eq!(sync(&alice, &files).await.unwrap().items_uploaded, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn session_deadline_keeps_partial_progress() {
    let (driver, files) = shared_target();
    let alice = device();
    alice.create_note(None, "a", "b").unwrap();
    alice.create_note(None, "c", "d").unwrap();

    let expired = options().with_max_session_duration(Duration::from_nanos(1));
    let result = sync_with(&alice, &files, expired).await.unwrap();
    assert_eq!(result.outcome, SessionOutcome::TimedOut);
    assert_eq!(result.items_uploaded, 0);
    assert_eq!(alice.pending_change_count(TARGET, 0).unwrap(), 2);
    assert!(common::lock_paths(&driver.paths()).is_empty());

    let resumed = sync(&alice, &files).await.unwrap();
    assert_eq!(resumed.items_uploaded, 2);
    assert_eq!(resumed.outcome, SessionOutcome::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_target_format_is_refused() {
    let (driver, files) = shared_target();
    driver.put(".sync/version.txt", b"2").await.unwrap();

    let alice = device();
    alice.create_note(None, "a", "b").unwrap();
    let err = sync(&alice, &files).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedTarget(_)));
    assert_eq!(driver.paths(), vec![".sync/version.txt".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn format_clears_target_and_requeues_items() {
    let (driver, files) = shared_target();
    let alice: SqliteItemStore = device();
    alice.create_note(None, "a", "b").unwrap();
    alice.create_folder(None, "f").unwrap();
    sync(&alice, &files).await.unwrap();

    let synchronizer = Synchronizer::new(&files, &alice, TARGET, options());
    let queued = synchronizer.format_target().await.unwrap();
    assert_eq!(queued, 2);
    assert_eq!(driver.paths(), vec![".sync/version.txt".to_string()]);
    assert!(synchronizer.target_locks().await.unwrap().is_empty());

    let result = sync(&alice, &files).await.unwrap();
    assert_eq!(result.items_uploaded, 2);
    assert!(sync(&alice, &files).await.unwrap().is_noop());
}
