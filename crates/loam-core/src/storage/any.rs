//! Runtime-selected driver.

use super::{
    LocalDriver, RemoteEntry, RemoteStat, S3Driver, StorageDriver, StorageResult, WebDavDriver,
};

/// One of the concrete drivers, chosen from a target URI at runtime
#[derive(Debug, Clone)]
pub enum AnyDriver {
    Local(LocalDriver),
    WebDav(WebDavDriver),
    S3(S3Driver),
}

macro_rules! dispatch {
    ($self:ident, $driver:ident => $call:expr) => {
        match $self {
            Self::Local($driver) => $call,
            Self::WebDav($driver) => $call,
            Self::S3($driver) => $call,
        }
    };
}

impl StorageDriver for AnyDriver {
    async fn list(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
        dispatch!(self, driver => driver.list(path).await)
    }

    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        dispatch!(self, driver => driver.get(path).await)
    }

    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        dispatch!(self, driver => driver.put(path, data).await)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        dispatch!(self, driver => driver.delete(path).await)
    }

    async fn move_to(&self, from: &str, to: &str) -> StorageResult<()> {
        dispatch!(self, driver => driver.move_to(from, to).await)
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        dispatch!(self, driver => driver.mkdir(path).await)
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>> {
        dispatch!(self, driver => driver.stat(path).await)
    }

    async fn set_timestamp(&self, path: &str, time_ms: i64) -> StorageResult<()> {
        dispatch!(self, driver => driver.set_timestamp(path, time_ms).await)
    }

    async fn format(&self) -> StorageResult<()> {
        dispatch!(self, driver => driver.format().await)
    }

    fn description(&self) -> String {
        dispatch!(self, driver => driver.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatches_to_local_driver() {
        let tmp = tempdir().unwrap();
        let driver = AnyDriver::Local(LocalDriver::new(tmp.path()));

        driver.put("a.md", b"x").await.unwrap();
        assert_eq!(driver.get("a.md").await.unwrap(), Some(b"x".to_vec()));
        assert!(driver.description().starts_with("file:"));
    }
}
