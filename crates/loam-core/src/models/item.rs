//! Item model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for an item.
///
/// Rendered as 32 lowercase hex characters so remote names stay short and
/// identical on every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Create a new unique item ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.to_string()
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Kind of item stored locally or remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Note,
    Folder,
    Resource,
    /// Raw bytes of a resource, stored as its own remote object
    ResourceBlob,
}

impl ItemType {
    /// Stable numeric code used in the database and in serialized items.
    pub const fn code(self) -> i64 {
        match self {
            Self::Note => 1,
            Self::Folder => 2,
            Self::Resource => 4,
            Self::ResourceBlob => 5,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::Note),
            2 => Ok(Self::Folder),
            4 => Ok(Self::Resource),
            5 => Ok(Self::ResourceBlob),
            other => Err(Error::InvalidInput(format!("Unknown item type code: {other}"))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Folder => "folder",
            Self::Resource => "resource",
            Self::ResourceBlob => "resource_blob",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A note, folder or resource in the local hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier, immutable for the item's lifetime
    pub id: ItemId,
    /// Item kind
    pub item_type: ItemType,
    /// Parent folder, `None` for root items
    pub parent_id: Option<ItemId>,
    /// Title (single line)
    pub title: String,
    /// Content payload; empty for folders
    pub body: String,
    /// Creation timestamp (Unix ms)
    pub created_time: i64,
    /// Last update timestamp (Unix ms)
    pub updated_time: i64,
    /// Whether the payload is encrypted
    pub encryption_applied: bool,
    /// Set on copies produced by the conflict resolver
    pub is_conflict: bool,
    /// Local revision counter, bumped on every local mutation
    pub revision: i64,
}

impl Item {
    /// Create a new item of the given type
    #[must_use]
    pub fn new(item_type: ItemType, title: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: ItemId::new(),
            item_type,
            parent_id: None,
            title: normalize_title(&title.into()),
            body: String::new(),
            created_time: now,
            updated_time: now,
            encryption_applied: false,
            is_conflict: false,
            revision: 0,
        }
    }

    #[must_use]
    pub fn note(title: impl Into<String>, body: impl Into<String>) -> Self {
        let mut item = Self::new(ItemType::Note, title);
        item.body = body.into();
        item
    }

    #[must_use]
    pub fn folder(title: impl Into<String>) -> Self {
        Self::new(ItemType::Folder, title)
    }

    #[must_use]
    pub fn resource(title: impl Into<String>) -> Self {
        Self::new(ItemType::Resource, title)
    }

    #[must_use]
    pub const fn with_parent(mut self, parent_id: Option<ItemId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Whether two items carry the same synced state, ignoring local-only fields.
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.item_type == other.item_type
            && self.parent_id == other.parent_id
            && self.title == other.title
            && self.body == other.body
            && self.updated_time == other.updated_time
            && self.encryption_applied == other.encryption_applied
            && self.is_conflict == other.is_conflict
    }

    /// Get first line of the body as a preview, truncated to `max_len` characters
    #[must_use]
    pub fn body_preview(&self, max_len: usize) -> String {
        self.body
            .lines()
            .next()
            .unwrap_or("")
            .chars()
            .take(max_len)
            .collect()
    }
}

/// Titles are stored on one line.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_unique() {
        let id1 = ItemId::new();
        let id2 = ItemId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_item_id_parse() {
        let id = ItemId::new();
        let rendered = id.as_str();
        assert_eq!(rendered.len(), 32);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));

        let parsed: ItemId = rendered.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_item_type_codes() {
        for item_type in [
            ItemType::Note,
            ItemType::Folder,
            ItemType::Resource,
            ItemType::ResourceBlob,
        ] {
            assert_eq!(ItemType::from_code(item_type.code()).unwrap(), item_type);
        }
        assert!(ItemType::from_code(3).is_err());
    }

    #[test]
    fn test_note_new() {
        let note = Item::note("Groceries", "milk\neggs");
        assert_eq!(note.item_type, ItemType::Note);
        assert_eq!(note.body_preview(10), "milk");
        assert!(!note.is_conflict);
        assert_eq!(note.created_time, note.updated_time);
    }

    #[test]
    fn test_title_is_single_line() {
        let folder = Item::folder("  Work\n  projects ");
        assert_eq!(folder.title, "Work projects");
    }

    #[test]
    fn test_same_content_ignores_revision() {
        let note = Item::note("a", "b");
        let mut other = note.clone();
        other.revision = 7;
        assert!(note.same_content(&other));

        other.body = "changed".to_string();
        assert!(!note.same_content(&other));
    }
}
