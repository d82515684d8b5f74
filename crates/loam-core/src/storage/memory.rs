//! In-memory driver used by tests and for dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{RemoteEntry, RemoteStat, StorageDriver, StorageError, StorageResult};
use crate::util::unix_millis_now;

/// Driver operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    List,
    Get,
    Put,
    Delete,
    Move,
    Mkdir,
    Stat,
    SetTimestamp,
}

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    updated_time: i64,
}

#[derive(Debug)]
struct InjectedFailure {
    op: MemoryOp,
    path_contains: String,
    error: StorageError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryObject>,
    dirs: BTreeSet<String>,
    clock: i64,
    failures: Vec<InjectedFailure>,
    put_counts: HashMap<String, usize>,
    max_object_size: Option<usize>,
    timestamps_unsupported: bool,
}

impl MemoryState {
    /// Strictly increasing modification times, even within one millisecond
    fn next_time(&mut self) -> i64 {
        self.clock = unix_millis_now().max(self.clock + 1);
        self.clock
    }

    fn take_failure(&mut self, op: MemoryOp, path: &str) -> Option<StorageError> {
        let index = self
            .failures
            .iter()
            .position(|failure| failure.op == op && path.contains(&failure.path_contains))?;
        let failure = &mut self.failures[index];
        failure.remaining -= 1;
        let error = failure.error.clone();
        if failure.remaining == 0 {
            self.failures.remove(index);
        }
        Some(error)
    }

    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{path}/");
        self.files.keys().any(|key| key.starts_with(&prefix))
            || self.dirs.iter().any(|dir| dir.starts_with(&prefix))
    }
}

/// Driver keeping every object in process memory.
///
/// Clones share the same contents, so two sessions can sync against one
/// "remote". Each call yields to the scheduler first so concurrent sessions
/// interleave.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject objects larger than `max_bytes` with `PayloadTooLarge`
    #[must_use]
    pub fn with_max_object_size(self, max_bytes: usize) -> Self {
        self.state().max_object_size = Some(max_bytes);
        self
    }

    /// Report `set_timestamp` as unsupported, like object stores do
    #[must_use]
    pub fn without_timestamps(self) -> Self {
        self.state().timestamps_unsupported = true;
        self
    }

    /// Fail the next `times` calls of `op` on paths containing `path_contains`
    pub fn inject_failure(
        &self,
        op: MemoryOp,
        path_contains: &str,
        error: StorageError,
        times: usize,
    ) {
        if times == 0 {
            return;
        }
        self.state().failures.push(InjectedFailure {
            op,
            path_contains: path_contains.to_string(),
            error,
            remaining: times,
        });
    }

    /// Overwrite an object's modification time
    pub fn set_mtime(&self, path: &str, time_ms: i64) {
        if let Some(object) = self.state().files.get_mut(&normalize(path)) {
            object.updated_time = time_ms;
        }
    }

    /// Number of successful `put` calls for a path
    pub fn put_count(&self, path: &str) -> usize {
        self.state()
            .put_counts
            .get(&normalize(path))
            .copied()
            .unwrap_or(0)
    }

    /// Every stored object path, sorted
    pub fn paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn begin(&self, op: MemoryOp, path: &str) -> StorageResult<MutexGuard<'_, MemoryState>> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        match state.take_failure(op, path) {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl StorageDriver for MemoryDriver {
    async fn list(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
        let path = normalize(path);
        let state = self.begin(MemoryOp::List, &path).await?;
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };

        let mut entries = BTreeMap::new();
        for (key, object) in &state.files {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    let dir_path = format!("{prefix}{dir}");
                    entries.entry(dir_path.clone()).or_insert(RemoteEntry {
                        path: dir_path,
                        size: 0,
                        updated_time: None,
                        is_dir: true,
                    });
                }
                None => {
                    entries.insert(
                        key.clone(),
                        RemoteEntry {
                            path: key.clone(),
                            size: object.data.len() as u64,
                            updated_time: Some(object.updated_time),
                            is_dir: false,
                        },
                    );
                }
            }
        }
        for dir in &state.dirs {
            let Some(rest) = dir.strip_prefix(&prefix) else {
                continue;
            };
            let name = rest.split('/').next().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let dir_path = format!("{prefix}{name}");
            entries.entry(dir_path.clone()).or_insert(RemoteEntry {
                path: dir_path,
                size: 0,
                updated_time: None,
                is_dir: true,
            });
        }

        Ok(entries.into_values().collect())
    }

    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = normalize(path);
        let state = self.begin(MemoryOp::Get, &path).await?;
        Ok(state.files.get(&path).map(|object| object.data.clone()))
    }

    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let path = normalize(path);
        let mut state = self.begin(MemoryOp::Put, &path).await?;
        if let Some(max) = state.max_object_size {
            if data.len() > max {
                return Err(StorageError::PayloadTooLarge {
                    path,
                    size: data.len() as u64,
                });
            }
        }
        if state.dirs.contains(&path) {
            return Err(StorageError::Backend(format!("{path} is a directory")));
        }

        let updated_time = state.next_time();
        state.files.insert(
            path.clone(),
            MemoryObject {
                data: data.to_vec(),
                updated_time,
            },
        );
        *state.put_counts.entry(path).or_default() += 1;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let path = normalize(path);
        let mut state = self.begin(MemoryOp::Delete, &path).await?;
        let prefix = format!("{path}/");
        state.files.remove(&path);
        state.files.retain(|key, _| !key.starts_with(&prefix));
        state
            .dirs
            .retain(|dir| dir != &path && !dir.starts_with(&prefix));
        Ok(())
    }

    async fn move_to(&self, from: &str, to: &str) -> StorageResult<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut state = self.begin(MemoryOp::Move, &from).await?;
        let mut object = state
            .files
            .remove(&from)
            .ok_or_else(|| StorageError::NotFound(from.clone()))?;
        object.updated_time = state.next_time();
        state.files.insert(to, object);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let path = normalize(path);
        let mut state = self.begin(MemoryOp::Mkdir, &path).await?;
        if state.files.contains_key(&path) {
            return Err(StorageError::Backend(format!("{path} is a file")));
        }
        if !path.is_empty() {
            state.dirs.insert(path);
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>> {
        let path = normalize(path);
        let state = self.begin(MemoryOp::Stat, &path).await?;
        if let Some(object) = state.files.get(&path) {
            return Ok(Some(RemoteStat {
                size: object.data.len() as u64,
                updated_time: Some(object.updated_time),
                is_dir: false,
            }));
        }
        Ok(state.is_dir(&path).then_some(RemoteStat {
            size: 0,
            updated_time: None,
            is_dir: true,
        }))
    }

    async fn set_timestamp(&self, path: &str, time_ms: i64) -> StorageResult<()> {
        let path = normalize(path);
        let mut state = self.begin(MemoryOp::SetTimestamp, &path).await?;
        if state.timestamps_unsupported {
            return Err(StorageError::Unsupported("set_timestamp"));
        }
        let object = state
            .files
            .get_mut(&path)
            .ok_or_else(|| StorageError::NotFound(path.clone()))?;
        object.updated_time = time_ms;
        Ok(())
    }

    async fn format(&self) -> StorageResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.files.clear();
        state.dirs.clear();
        Ok(())
    }

    fn description(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_paths_read_as_none() {
        let driver = MemoryDriver::new();
        assert_eq!(driver.get("nope.md").await.unwrap(), None);
        assert_eq!(driver.stat("nope.md").await.unwrap(), None);
        driver.delete("nope.md").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listing_includes_implied_directories() {
        let driver = MemoryDriver::new();
        driver.put("a.md", b"a").await.unwrap();
        driver.put(".resource/abc", b"bytes").await.unwrap();
        driver.mkdir(".locks").await.unwrap();

        let entries = driver.list("").await.unwrap();
        let dirs = entries
            .iter()
            .filter(|entry| entry.is_dir)
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(dirs, vec![".locks", ".resource"]);

        let file = entries.iter().find(|entry| entry.path == "a.md").unwrap();
        assert_eq!(file.size, 1);
        assert!(file.updated_time.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_get_increasing_mtimes() {
        let driver = MemoryDriver::new();
        driver.put("a.md", b"1").await.unwrap();
        let first = driver.stat("a.md").await.unwrap().unwrap();
        driver.put("a.md", b"2").await.unwrap();
        let second = driver.stat("a.md").await.unwrap().unwrap();

        assert!(second.updated_time > first.updated_time);
        assert_eq!(driver.put_count("a.md"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_are_consumed() {
        let driver = MemoryDriver::new();
        driver.inject_failure(
            MemoryOp::Put,
            "a.md",
            StorageError::Transient("503".to_string()),
            1,
        );

        assert!(driver.put("a.md", b"1").await.is_err());
        driver.put("a.md", b"1").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_payload_is_rejected() {
        let driver = MemoryDriver::new().with_max_object_size(4);
        let err = driver.put("big", b"12345").await.unwrap_err();
        assert_eq!(
            err,
            StorageError::PayloadTooLarge {
                path: "big".to_string(),
                size: 5,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_removes_directory_contents() {
        let driver = MemoryDriver::new();
        driver.put("dir/a", b"a").await.unwrap();
        driver.put("dir/b", b"b").await.unwrap();
        driver.put("other", b"o").await.unwrap();

        driver.delete("dir").await.unwrap();
        assert_eq!(driver.paths(), vec!["other".to_string()]);
    }
}
