//! Data models for Loam

mod change;
mod item;
mod serialize;
mod sync_conflict;

pub use change::{ChangeRecord, ChangeType, SyncRecord, SyncState, Tombstone};
pub use item::{normalize_title, Item, ItemId, ItemType};
pub use serialize::{deserialize_item, serialize_item};
pub use sync_conflict::{ConflictStrategy, SyncConflict};
