//! Driver wrapper that scopes every path under a base directory.

use super::{RemoteEntry, RemoteStat, StorageDriver, StorageResult};
use crate::util::join_path;

/// Base-directory scoped view over a [`StorageDriver`]
#[derive(Debug, Clone)]
pub struct FileApi<D> {
    driver: D,
    base_dir: String,
}

impl<D: StorageDriver> FileApi<D> {
    pub fn new(driver: D, base_dir: impl Into<String>) -> Self {
        Self {
            driver,
            base_dir: base_dir.into().trim_matches('/').to_string(),
        }
    }

    pub const fn driver(&self) -> &D {
        &self.driver
    }

    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    fn full_path(&self, path: &str) -> String {
        join_path(&self.base_dir, path)
    }

    fn relative_path<'a>(&self, path: &'a str) -> &'a str {
        let path = path.trim_matches('/');
        if self.base_dir.is_empty() {
            return path;
        }
        if path == self.base_dir {
            return "";
        }
        path.strip_prefix(self.base_dir.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(path)
    }

    /// Entries under `dir`, with paths relative to the base directory
    pub async fn list(&self, dir: &str) -> StorageResult<Vec<RemoteEntry>> {
        let entries = self.driver.list(&self.full_path(dir)).await?;
        Ok(entries
            .into_iter()
            .map(|entry| RemoteEntry {
                path: self.relative_path(&entry.path).to_string(),
                ..entry
            })
            .filter(|entry| !entry.path.is_empty())
            .collect())
    }

    /// Directories directly under the base directory
    pub async fn list_directories(&self) -> StorageResult<Vec<RemoteEntry>> {
        Ok(self
            .list("")
            .await?
            .into_iter()
            .filter(|entry| entry.is_dir)
            .collect())
    }

    pub async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        self.driver.get(&self.full_path(path)).await
    }

    pub async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        self.driver.put(&self.full_path(path), data).await
    }

    pub async fn delete(&self, path: &str) -> StorageResult<()> {
        self.driver.delete(&self.full_path(path)).await
    }

    pub async fn move_to(&self, from: &str, to: &str) -> StorageResult<()> {
        self.driver
            .move_to(&self.full_path(from), &self.full_path(to))
            .await
    }

    pub async fn mkdir(&self, path: &str) -> StorageResult<()> {
        self.driver.mkdir(&self.full_path(path)).await
    }

    pub async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>> {
        self.driver.stat(&self.full_path(path)).await
    }

    pub async fn set_timestamp(&self, path: &str, time_ms: i64) -> StorageResult<()> {
        self.driver
            .set_timestamp(&self.full_path(path), time_ms)
            .await
    }

    /// Delete everything under the base directory
    pub async fn format(&self) -> StorageResult<()> {
        if self.base_dir.is_empty() {
            return self.driver.format().await;
        }
        self.driver.delete(&self.base_dir).await?;
        self.driver.mkdir(&self.base_dir).await
    }

    pub fn description(&self) -> String {
        if self.base_dir.is_empty() {
            self.driver.description()
        } else {
            format!("{} ({})", self.driver.description(), self.base_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDriver;

    #[tokio::test(flavor = "multi_thread")]
    async fn paths_are_scoped_under_base_dir() {
        let driver = MemoryDriver::new();
        let api = FileApi::new(driver.clone(), "/notes/");

        api.put("a.md", b"hello").await.unwrap();
        assert_eq!(driver.get("notes/a.md").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(api.get("a.md").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listing_strips_base_prefix() {
        let driver = MemoryDriver::new();
        let api = FileApi::new(driver.clone(), "notes");
        api.put("a.md", b"a").await.unwrap();
        api.put(".locks/sync_x_y.json", b"{}").await.unwrap();
        driver.put("elsewhere.md", b"x").await.unwrap();

        let mut paths = api
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.path)
            .collect::<Vec<_>>();
        paths.sort();
        assert_eq!(paths, vec![".locks".to_string(), "a.md".to_string()]);

        let locks = api.list(".locks").await.unwrap();
        assert_eq!(locks[0].path, ".locks/sync_x_y.json");

        let dirs = api.list_directories().await.unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].path, ".locks");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn format_only_clears_base_dir() {
        let driver = MemoryDriver::new();
        let api = FileApi::new(driver.clone(), "notes");
        api.put("a.md", b"a").await.unwrap();
        driver.put("keep.md", b"k").await.unwrap();

        api.format().await.unwrap();
        assert!(api.list("").await.unwrap().is_empty());
        assert!(driver.get("keep.md").await.unwrap().is_some());
    }
}
