//! Synchronization engine: remote locks, conflict resolution and sessions.

mod lock;
pub mod naming;
mod resolver;
mod result;
mod retry;
mod synchronizer;

pub use lock::{Lock, LockGuard, LockManager, LockState, LockType};
pub use naming::{TombstoneMarker, SYNC_TARGET_VERSION};
pub use resolver::{conflict_title, ConflictResolver, Resolution};
pub use result::{ItemError, ItemErrorKind, SessionOutcome, SessionResult};
pub use retry::{with_retry, RetryPolicy};
pub use synchronizer::Synchronizer;
