use std::collections::BTreeMap;

use loam_core::config::TargetUri;
use loam_core::models::{ConflictStrategy, SyncConflict};
use loam_core::storage::{FileApi, LocalDriver};
use loam_core::sync::{Lock, LockType, SessionOutcome};
use loam_core::util::unix_millis_now;
use loam_core::Item;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use crate::cli::CompletionShell;
use crate::commands::add::{run_add, run_mkdir};
use crate::commands::common::{
    default_editor, format_item_lines, format_relative_time, format_sync_conflict_lines,
    format_sync_timestamp, normalize_item_identifier, open_store, resolve_item, resolve_target,
    short_id, truncate,
};
use crate::commands::completions::render_completions;
use crate::commands::config::set_target;
use crate::commands::delete::run_delete;
use crate::commands::edit::{run_edit, run_move};
use crate::commands::sync::{format_status_lines, sync_store, StatusReport};
use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

#[test]
fn default_editor_is_defined() {
    assert!(!default_editor().is_empty());
}

#[test]
fn normalize_item_identifier_rejects_blank() {
    assert_eq!(normalize_item_identifier(" 0190ab ").unwrap(), "0190ab");
    assert!(matches!(
        normalize_item_identifier("  "),
        Err(CliError::EmptyItemId)
    ));
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn truncate_collapses_whitespace_and_adds_ellipsis() {
    assert_eq!(truncate("short  title", 40), "short title");
    assert_eq!(
        truncate("This is a very long sentence that should be shortened", 20),
        "This is a very lo..."
    );
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn item_lines_show_type_and_conflict_marker() {
    let mut copy = Item::note("Plan (conflict 2024-03-05 14:07)", "body");
    copy.is_conflict = true;
    let folder = Item::folder("Work");

    let lines = format_item_lines(&[copy.clone(), folder.clone()]);
    assert!(lines[0].starts_with(&short_id(&copy.id)));
    assert!(lines[0].contains("note"));
    assert!(lines[0].ends_with("[conflict]"));
    assert!(lines[1].contains("folder"));
    assert!(lines[1].contains("Work"));
    assert!(!lines[1].contains("[conflict]"));
}

#[test]
fn format_sync_conflict_lines_include_key_fields() {
    let conflicts = vec![SyncConflict {
        id: 1,
        target_id: "file:///mnt/notes".to_string(),
        item_id: "0190c0e5b1e87b3c9b9f3a7c2d1e4f57".to_string(),
        conflict_item_id: Some("0190c0e5b1e87b3c9b9f3a7c2d1e4f99".to_string()),
        local_updated_time: 200,
        remote_updated_time: 100,
        resolved_at: 300,
        strategy: ConflictStrategy::CopyAside,
    }];

    let rendered = format_sync_conflict_lines(&conflicts);
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].contains("copy_aside"));
    assert!(rendered[0].contains("item=0190c0e5b1e87b3c9b9f3a7c2d1e4f57"));
    assert!(rendered[0].contains("local=200"));
    assert!(rendered[0].contains("remote=100"));
    assert!(rendered[0].contains("copy=0190c0e5b1e87b3c9b9f3a7c2d1e4f99"));
}

#[test]
fn status_lines_report_never_synced() {
    let report = StatusReport {
        target_id: "s3://notes".to_string(),
        device_id: "device".to_string(),
        last_synced_time: None,
        pending_changes: 3,
        conflicts: 0,
        locks: Some(Vec::new()),
    };
    let lines = format_status_lines(&report);
    assert!(lines.contains(&"Last synced:     never".to_string()));
    assert!(lines.contains(&"Pending changes: 3".to_string()));
    assert!(lines.contains(&"Locks:           none".to_string()));
}

#[test]
fn set_target_normalizes_and_activates_profile() {
    let mut config = CliProfilesConfig {
        version: 1,
        active_profile: Some("default".to_string()),
        profiles: BTreeMap::new(),
    };

    let name = set_target(&mut config, Some("laptop"), " s3://bucket/notes/ ", false).unwrap();
    assert_eq!(name, "laptop");
    assert_eq!(config.active_profile.as_deref(), Some("laptop"));
    assert_eq!(
        config.profile("laptop").unwrap().target(),
        Some("s3://bucket/notes".to_string())
    );

    set_target(&mut config, Some("phone"), "/srv/notes", true).unwrap();
    assert_eq!(config.active_profile.as_deref(), Some("laptop"));

    assert!(set_target(&mut config, Some("bad"), "ftp://example.com", false).is_err());
    assert!(config.profile("bad").is_none());
}

#[test]
fn explicit_target_wins() {
    let target = resolve_target(Some("file:///srv/notes"), None).unwrap();
    assert_eq!(
        target,
        TargetUri::File {
            path: "/srv/notes".into()
        }
    );
}

#[test]
fn completions_mention_binary_name() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("loam"));
}

#[test]
fn contention_has_its_own_exit_code() {
    assert_eq!(CliError::SyncInProgress("busy".to_string()).exit_code(), 2);
    assert_eq!(CliError::TargetNotConfigured.exit_code(), 1);
}

#[test]
fn item_commands_edit_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("loam.db");

    run_mkdir("Trips", None, &db_path).unwrap();
    let store = open_store(&db_path).unwrap();
    let folder = store.list_items(1).unwrap().remove(0);

    let parent = short_id(&folder.id);
    run_add("Packing", &["socks".to_string()], Some(parent.as_str()), &db_path).unwrap();
    let note = store
        .list_items(10)
        .unwrap()
        .into_iter()
        .find(|item| item.title == "Packing")
        .unwrap();
    assert_eq!(note.parent_id, Some(folder.id));
    assert_eq!(note.body, "socks");

    run_edit(&note.id.to_string(), Some("Packing list"), None, &db_path).unwrap();
    run_move(&note.id.to_string(), None, &db_path).unwrap();
    let id = resolve_item(&store, &note.id.to_string()).unwrap();
    let updated = store.list_items(10).unwrap();
    let updated = updated.iter().find(|item| item.id == id).unwrap();
    assert_eq!(updated.title, "Packing list");
    assert_eq!(updated.body, "socks");
    assert_eq!(updated.parent_id, None);

    run_delete(&note.id.to_string(), &db_path).unwrap();
    assert_eq!(store.list_items(10).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_store_round_trips_through_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    std::fs::create_dir_all(&remote).unwrap();
    let files = FileApi::new(LocalDriver::new(remote.clone()), "");
    let target_id = TargetUri::File {
        path: remote.clone(),
    }
    .target_id();
    let cancel = CancellationToken::new();

    let laptop = open_store(&dir.path().join("laptop.db")).unwrap();
    let phone = open_store(&dir.path().join("phone.db")).unwrap();
    laptop.create_note(None, "Plan", "ship it").unwrap();

    let pushed = sync_store(&laptop, &files, &target_id, &cancel).await.unwrap();
    assert_eq!(pushed.items_uploaded, 1);
    assert_eq!(pushed.outcome, SessionOutcome::Completed);

    let pulled = sync_store(&phone, &files, &target_id, &cancel).await.unwrap();
    assert_eq!(pulled.items_downloaded, 1);
    assert_eq!(phone.list_items(10).unwrap()[0].body, "ship it");
}

#[tokio::test(flavor = "multi_thread")]
async fn held_lock_reports_sync_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let files = FileApi::new(LocalDriver::new(dir.path()), "");
    let now = unix_millis_now();
    let lock = Lock {
        session_id: "0190c0e5b1e87b3c9b9f3a7c2d1e4f57".to_string(),
        device_id: "0190c0e5b1e87b3c9b9f3a7c2d1e4f99".to_string(),
        lock_type: LockType::Sync,
        started_time: now,
        updated_time: now,
    };
    files
        .put(&lock.path(), &serde_json::to_vec(&lock).unwrap())
        .await
        .unwrap();

    let store = open_store(&dir.path().join("db").join("loam.db")).unwrap();
    let error = sync_store(&store, &files, "file:///locked", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, CliError::SyncInProgress(_)));
    assert!(error.to_string().starts_with("sync already in progress"));
}
