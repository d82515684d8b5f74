//! Driver for a directory on the local filesystem (also covers mounted shares).

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs;

use super::{RemoteEntry, RemoteStat, StorageDriver, StorageError, StorageResult};

/// ENOSPC
const NO_SPACE_LEFT: i32 = 28;

/// Filesystem-backed driver rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path.trim_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(StorageError::AccessDenied(format!(
                "path escapes the target root: {path}"
            )));
        }
        Ok(self.root.join(relative))
    }

    fn relative(&self, full: &Path) -> String {
        full.strip_prefix(&self.root)
            .unwrap_or(full)
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn map_io_error(path: &str, error: &io::Error) -> StorageError {
    if error.raw_os_error() == Some(NO_SPACE_LEFT) {
        return StorageError::QuotaExceeded(format!("{path}: {error}"));
    }
    match error.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => StorageError::AccessDenied(format!("{path}: {error}")),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StorageError::Transient(format!("{path}: {error}"))
        }
        _ => StorageError::Backend(format!("{path}: {error}")),
    }
}

fn to_millis(time: io::Result<SystemTime>) -> Option<i64> {
    let since_epoch = time.ok()?.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

fn stat_from_metadata(metadata: &std::fs::Metadata) -> RemoteStat {
    RemoteStat {
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        updated_time: to_millis(metadata.modified()),
        is_dir: metadata.is_dir(),
    }
}

impl StorageDriver for LocalDriver {
    async fn list(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
        let dir = self.resolve(path)?;
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(map_io_error(path, &error)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|error| map_io_error(path, &error))?
        {
            let name = entry.file_name();
            // Leftovers of interrupted atomic writes
            if name.to_string_lossy().ends_with(".loamtmp") {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Deleted between read_dir and stat
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => return Err(map_io_error(path, &error)),
            };
            let stat = stat_from_metadata(&metadata);
            entries.push(RemoteEntry {
                path: self.relative(&entry.path()),
                size: stat.size,
                updated_time: stat.updated_time,
                is_dir: stat.is_dir,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(data)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(map_io_error(path, &error)),
        }
    }

    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| map_io_error(path, &error))?;
        }

        // Write next to the destination, then rename over it
        let file_name = full
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::Backend(format!("invalid object path: {path}")))?;
        let temp = full.with_file_name(format!(
            ".{file_name}.{}.loamtmp",
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(error) = fs::write(&temp, data).await {
            fs::remove_file(&temp).await.ok();
            return Err(map_io_error(path, &error));
        }
        fs::rename(&temp, &full)
            .await
            .map_err(|error| map_io_error(path, &error))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let full = self.resolve(path)?;
        let result = match fs::metadata(&full).await {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&full).await,
            Ok(_) => fs::remove_file(&full).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(map_io_error(path, &error)),
        }
    }

    async fn move_to(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self.resolve(from)?;
        let destination = self.resolve(to)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| map_io_error(to, &error))?;
        }
        fs::rename(&source, &destination)
            .await
            .map_err(|error| map_io_error(from, &error))
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        fs::create_dir_all(self.resolve(path)?)
            .await
            .map_err(|error| map_io_error(path, &error))
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>> {
        match fs::metadata(self.resolve(path)?).await {
            Ok(metadata) => Ok(Some(stat_from_metadata(&metadata))),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(map_io_error(path, &error)),
        }
    }

    async fn set_timestamp(&self, path: &str, time_ms: i64) -> StorageResult<()> {
        let full = self.resolve(path)?;
        let millis = u64::try_from(time_ms)
            .map_err(|_| StorageError::Backend(format!("invalid timestamp {time_ms}")))?;
        let modified = UNIX_EPOCH + Duration::from_millis(millis);
        let owned_path = path.to_string();

        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::options().write(true).open(&full)?;
            file.set_modified(modified)
        })
        .await
        .map_err(|error| StorageError::Backend(format!("set_timestamp task failed: {error}")))?
        .map_err(|error| map_io_error(&owned_path, &error))
    }

    async fn format(&self) -> StorageResult<()> {
        for entry in self.list("").await? {
            self.delete(&entry.path).await?;
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("file:{}", self.root.display())
    }
}
