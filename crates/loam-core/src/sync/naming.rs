//! Deterministic remote names for items, blobs, markers and locks.
//!
//! ```text
//! <id>.md                                   serialized note, folder or resource
//! .resource/<id>                            resource bytes
//! .tombstones/<id>.json                     deletion marker
//! .locks/<type>_<device>_<session>.json     session lock
//! .sync/version.txt                         target format version
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::lock::LockType;
use crate::models::{ItemId, ItemType};
use crate::util::base_name;

pub const RESOURCE_DIR: &str = ".resource";
pub const TOMBSTONE_DIR: &str = ".tombstones";
pub const LOCK_DIR: &str = ".locks";
pub const SYNC_DIR: &str = ".sync";
pub const VERSION_FILE: &str = ".sync/version.txt";

/// Format version written to new targets; newer targets are refused
pub const SYNC_TARGET_VERSION: u32 = 1;

pub fn item_path(id: &ItemId) -> String {
    format!("{id}.md")
}

pub fn resource_blob_path(id: &ItemId) -> String {
    format!("{RESOURCE_DIR}/{id}")
}

pub fn tombstone_path(id: &ItemId) -> String {
    format!("{TOMBSTONE_DIR}/{id}.json")
}

pub fn lock_path(lock_type: LockType, device_id: &str, session_id: &str) -> String {
    format!("{LOCK_DIR}/{}_{device_id}_{session_id}.json", lock_type.as_str())
}

fn item_name_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([0-9a-f]{32})\.md$").expect("Invalid regex"))
}

fn tombstone_name_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([0-9a-f]{32})\.json$").expect("Invalid regex"))
}

fn lock_name_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(sync|exclusive)_([0-9a-zA-Z-]+)_([0-9a-f]{32})\.json$")
            .expect("Invalid regex")
    })
}

/// Item id of a serialized item object, by file name
pub fn parse_item_path(path: &str) -> Option<ItemId> {
    item_name_regex()
        .captures(base_name(path))
        .and_then(|captures| captures[1].parse().ok())
}

/// Item id of a deletion marker, by file name
pub fn parse_tombstone_path(path: &str) -> Option<ItemId> {
    tombstone_name_regex()
        .captures(base_name(path))
        .and_then(|captures| captures[1].parse().ok())
}

/// Lock type, device id and session id encoded in a lock file name
pub fn parse_lock_path(path: &str) -> Option<(LockType, String, String)> {
    let captures = lock_name_regex().captures(base_name(path))?;
    let lock_type = captures[1].parse().ok()?;
    Some((lock_type, captures[2].to_string(), captures[3].to_string()))
}

/// Remote deletion marker, kept so lagging replicas never resurrect the item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneMarker {
    pub item_id: ItemId,
    pub item_type: ItemType,
    pub deleted_time: i64,
    pub device_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_names_are_deterministic() {
        let id: ItemId = "0190c0e5b1e87b3c9b9f3a7c2d1e4f56".parse().unwrap();
        assert_eq!(item_path(&id), "0190c0e5b1e87b3c9b9f3a7c2d1e4f56.md");
        assert_eq!(
            resource_blob_path(&id),
            ".resource/0190c0e5b1e87b3c9b9f3a7c2d1e4f56"
        );
        assert_eq!(
            tombstone_path(&id),
            ".tombstones/0190c0e5b1e87b3c9b9f3a7c2d1e4f56.json"
        );
        assert_eq!(parse_item_path(&item_path(&id)), Some(id));
        assert_eq!(parse_tombstone_path(&tombstone_path(&id)), Some(id));
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert_eq!(parse_item_path("README.md"), None);
        assert_eq!(parse_item_path("0190c0e5b1e87b3c9b9f3a7c2d1e4f56.txt"), None);
        assert_eq!(parse_tombstone_path("notes.json"), None);
    }

    #[test]
    fn lock_names_parse_back() {
        let path = lock_path(
            LockType::Exclusive,
            "0190c0e5b1e87b3c9b9f3a7c2d1e4f56",
            "0190c0e5b1e87b3c9b9f3a7c2d1e4f57",
        );
        assert_eq!(
            parse_lock_path(&path),
            Some((
                LockType::Exclusive,
                "0190c0e5b1e87b3c9b9f3a7c2d1e4f56".to_string(),
                "0190c0e5b1e87b3c9b9f3a7c2d1e4f57".to_string()
            ))
        );
        assert_eq!(parse_lock_path(".locks/other.json"), None);
    }
}
