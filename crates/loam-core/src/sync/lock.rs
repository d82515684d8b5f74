//! Advisory locks stored as objects on the sync target.
//!
//! A session writes `.locks/<type>_<device>_<session>.json`, then lists the
//! directory again to confirm it won. Any two live locks on one target exclude
//! each other; when two sessions race, the lock with the smallest
//! `(started_time, session_id)` wins and the other backs off. Locks whose
//! heartbeat is older than the TTL are treated as left behind by a crashed
//! session and removed.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};

use super::naming::{lock_path, parse_lock_path, LOCK_DIR};
use super::retry::with_retry;
use crate::config::SyncOptions;
use crate::error::{Error, Result};
use crate::storage::{FileApi, RemoteEntry, StorageDriver};
use crate::util::unix_millis_now;

/// Kind of session holding a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// A regular sync session
    Sync,
    /// Whole-target maintenance such as formatting
    Exclusive,
}

impl LockType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "sync" => Ok(Self::Sync),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(Error::InvalidInput(format!("Unknown lock type: {other}"))),
        }
    }
}

/// Contents of a lock object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub session_id: String,
    pub device_id: String,
    pub lock_type: LockType,
    /// Unix ms when the session wrote the lock
    pub started_time: i64,
    /// Heartbeat, Unix ms
    pub updated_time: i64,
}

impl Lock {
    pub const fn is_stale(&self, now: i64, ttl_ms: i64) -> bool {
        now - self.updated_time > ttl_ms
    }

    pub fn path(&self) -> String {
        lock_path(self.lock_type, &self.device_id, &self.session_id)
    }

    /// Rebuild a lock from its file name when the contents are unreadable
    fn from_entry(entry: &RemoteEntry) -> Option<Self> {
        let (lock_type, device_id, session_id) = parse_lock_path(&entry.path)?;
        let time = entry.updated_time.unwrap_or(0);
        Some(Self {
            session_id,
            device_id,
            lock_type,
            started_time: time,
            updated_time: time,
        })
    }
}

/// Lifecycle of a [`LockManager`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockState {
    #[default]
    Idle,
    Acquiring,
    StaleDetected,
    Reclaiming,
    Held,
    Releasing,
}

/// Proof that this session holds a lock. Pass it back to
/// [`LockManager::release`].
#[must_use = "a lock guard must be released"]
#[derive(Debug)]
pub struct LockGuard {
    lock: Lock,
    released: bool,
}

impl LockGuard {
    pub const fn lock(&self) -> &Lock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                session_id = %self.lock.session_id,
                lock_type = %self.lock.lock_type,
                "Lock guard dropped without release; lock will expire after its TTL"
            );
        }
    }
}

/// Acquires, refreshes and releases locks on one target
pub struct LockManager<'a, D> {
    files: &'a FileApi<D>,
    device_id: String,
    options: &'a SyncOptions,
    state: Mutex<LockState>,
}

impl<'a, D: StorageDriver> LockManager<'a, D> {
    pub fn new(
        files: &'a FileApi<D>,
        device_id: impl Into<String>,
        options: &'a SyncOptions,
    ) -> Self {
        Self {
            files,
            device_id: device_id.into(),
            options,
            state: Mutex::new(LockState::Idle),
        }
    }

    pub fn state(&self) -> LockState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LockState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.options.lock_ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Take a lock of `lock_type`, failing fast with `LockContention` if any
    /// live lock exists
    pub async fn acquire(&self, lock_type: LockType) -> Result<LockGuard> {
        self.set_state(LockState::Acquiring);
        match self.try_acquire(lock_type).await {
            Ok(guard) => {
                self.set_state(LockState::Held);
                tracing::info!(
                    session_id = %guard.lock.session_id,
                    lock_type = %lock_type,
                    "Acquired lock"
                );
                Ok(guard)
            }
            Err(error) => {
                self.set_state(LockState::Idle);
                Err(error)
            }
        }
    }

    async fn try_acquire(&self, lock_type: LockType) -> Result<LockGuard> {
        let live = self.reclaim_stale().await?;
        if let Some(holder) = live.first() {
            return Err(contention(holder));
        }

        let now = unix_millis_now();
        let lock = Lock {
            session_id: uuid::Uuid::now_v7().simple().to_string(),
            device_id: self.device_id.clone(),
            lock_type,
            started_time: now,
            updated_time: now,
        };
        self.write_lock(&lock).await?;

        // Someone may have written a lock between our listing and our write
        let live = self.reclaim_stale().await?;
        let ours_visible = live.iter().any(|other| other.session_id == lock.session_id);
        let winner = live
            .iter()
            .min_by(|a, b| (a.started_time, &a.session_id).cmp(&(b.started_time, &b.session_id)));

        match winner {
            Some(winner) if ours_visible && winner.session_id == lock.session_id => {
                Ok(LockGuard {
                    lock,
                    released: false,
                })
            }
            other => {
                let error = other.map_or_else(
                    || Error::LockContention("lock could not be verified".to_string()),
                    contention,
                );
                tracing::info!(session_id = %lock.session_id, "Lost lock race, backing off");
                if let Err(delete_error) = self.delete_lock(&lock).await {
                    tracing::warn!(error = %delete_error, "Could not remove losing lock");
                }
                Err(error)
            }
        }
    }

    /// Delete stale locks and return the live ones
    async fn reclaim_stale(&self) -> Result<Vec<Lock>> {
        let now = unix_millis_now();
        let ttl = self.ttl_ms();
        let mut live = Vec::new();
        for lock in self.current_locks().await? {
            if lock.is_stale(now, ttl) {
                self.set_state(LockState::StaleDetected);
                tracing::warn!(
                    session_id = %lock.session_id,
                    device_id = %lock.device_id,
                    age_ms = now - lock.updated_time,
                    "Removing stale lock"
                );
                self.set_state(LockState::Reclaiming);
                self.delete_lock(&lock).await?;
            } else {
                live.push(lock);
            }
        }
        Ok(live)
    }

    /// Every lock currently present on the target, stale ones included
    pub async fn current_locks(&self) -> Result<Vec<Lock>> {
        let files = self.files;
        let options = self.options;
        let entries = with_retry(&options.retry, options.call_timeout, "list locks", move || {
            files.list(LOCK_DIR)
        })
        .await?;

        let mut locks = Vec::new();
        for entry in entries.iter().filter(|entry| !entry.is_dir) {
            if parse_lock_path(&entry.path).is_none() {
                continue;
            }
            let path = entry.path.as_str();
            let raw = with_retry(&options.retry, options.call_timeout, "read lock", move || {
                files.get(path)
            })
            .await?;
            // Released between listing and reading
            let Some(raw) = raw else {
                continue;
            };
            match serde_json::from_slice::<Lock>(&raw) {
                Ok(lock) => locks.push(lock),
                Err(error) => {
                    tracing::warn!(
                        path = %entry.path,
                        error = %error,
                        "Unreadable lock, using its name"
                    );
                    locks.extend(Lock::from_entry(entry));
                }
            }
        }
        Ok(locks)
    }

    async fn write_lock(&self, lock: &Lock) -> Result<()> {
        let body = serde_json::to_vec(lock)?;
        let path = lock.path();
        let (files, options) = (self.files, self.options);
        let (body, path) = (body.as_slice(), path.as_str());
        with_retry(&options.retry, options.call_timeout, "write lock", move || {
            files.put(path, body)
        })
        .await?;
        Ok(())
    }

    async fn delete_lock(&self, lock: &Lock) -> Result<()> {
        let path = lock.path();
        let (files, options) = (self.files, self.options);
        let path = path.as_str();
        with_retry(&options.retry, options.call_timeout, "delete lock", move || {
            files.delete(path)
        })
        .await?;
        Ok(())
    }

    /// Rewrite the held lock with a fresh heartbeat
    pub async fn refresh(&self, guard: &LockGuard) -> Result<()> {
        let lock = Lock {
            updated_time: unix_millis_now(),
            ..guard.lock.clone()
        };
        self.write_lock(&lock).await?;
        tracing::debug!(session_id = %lock.session_id, "Refreshed lock");
        Ok(())
    }

    /// Drive `work` to completion while refreshing the lock periodically
    pub async fn hold<F: Future>(&self, guard: &LockGuard, work: F) -> F::Output {
        tokio::pin!(work);
        let period = self.options.lock_refresh_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    if let Err(error) = self.refresh(guard).await {
                        tracing::warn!(error = %error, "Failed to refresh lock");
                    }
                }
            }
        }
    }

    /// Delete the session's lock. Failures are logged; the lock then expires.
    pub async fn release(&self, mut guard: LockGuard) {
        self.set_state(LockState::Releasing);
        guard.released = true;
        match self.delete_lock(&guard.lock).await {
            Ok(()) => tracing::info!(session_id = %guard.lock.session_id, "Released lock"),
            Err(error) => tracing::warn!(
                session_id = %guard.lock.session_id,
                error = %error,
                "Failed to release lock"
            ),
        }
        self.set_state(LockState::Idle);
    }
}

fn contention(holder: &Lock) -> Error {
    Error::LockContention(format!(
        "{} lock held by device {} since {}",
        holder.lock_type, holder.device_id, holder.started_time
    ))
}
