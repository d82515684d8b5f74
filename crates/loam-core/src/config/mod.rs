//! Sync session tuning and sync target addresses.
//!
//! `SyncOptions` carries the timing knobs of a session. `TargetUri` names a
//! remote target and builds the driver for it; credentials never appear in the
//! URI and are looked up from the environment when the driver is opened.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::{
    AnyDriver, FileApi, LocalDriver, S3Config, S3Driver, WebDavConfig, WebDavDriver,
};
use crate::sync::RetryPolicy;
use crate::util::{is_http_url, normalize_text_option};

pub const ENV_WEBDAV_USERNAME: &str = "LOAM_WEBDAV_USERNAME";
pub const ENV_WEBDAV_PASSWORD: &str = "LOAM_WEBDAV_PASSWORD";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing and concurrency settings for one sync session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// A lock whose heartbeat is older than this is considered abandoned
    pub lock_ttl: Duration,
    pub lock_refresh_interval: Duration,
    pub retry: RetryPolicy,
    /// Upper bound for a single driver call
    pub call_timeout: Duration,
    /// No new item work is scheduled after this
    pub max_session_duration: Duration,
    pub max_parallel_transfers: usize,
    /// Deletion markers and unacknowledged tombstones older than this are dropped
    pub tombstone_retention: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(3 * 60),
            lock_refresh_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            max_session_duration: Duration::from_secs(30 * 60),
            max_parallel_transfers: 4,
            tombstone_retention: DAY * 90,
        }
    }
}

impl SyncOptions {
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_lock_refresh_interval(mut self, interval: Duration) -> Self {
        self.lock_refresh_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_session_duration(mut self, duration: Duration) -> Self {
        self.max_session_duration = duration;
        self
    }

    #[must_use]
    pub const fn with_max_parallel_transfers(mut self, parallel: usize) -> Self {
        self.max_parallel_transfers = parallel;
        self
    }

    #[must_use]
    pub const fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_transfers == 0 {
            return Err(Error::InvalidInput(
                "max_parallel_transfers must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() || self.max_session_duration.is_zero() {
            return Err(Error::InvalidInput("timeouts must be non-zero".to_string()));
        }
        if self.lock_refresh_interval.is_zero() || self.lock_refresh_interval >= self.lock_ttl {
            return Err(Error::InvalidInput(format!(
                "lock_refresh_interval ({:?}) must be non-zero and shorter than lock_ttl ({:?})",
                self.lock_refresh_interval, self.lock_ttl
            )));
        }
        Ok(())
    }
}

/// Address of a sync target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetUri {
    /// Directory on a local or mounted filesystem
    File { path: PathBuf },
    /// Plain WebDAV collection URL (http or https)
    WebDav { url: String },
    Nextcloud {
        server: String,
        user: String,
        path: String,
    },
    /// S3-compatible bucket, optionally under a key prefix
    S3 { bucket: String, prefix: String },
}

impl TargetUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidInput("sync target cannot be empty".to_string()));
        }

        if let Some(rest) = raw.strip_prefix("s3://") {
            let rest = rest.trim_matches('/');
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::InvalidInput("s3 target is missing a bucket".to_string()));
            }
            return Ok(Self::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }

        if let Some(path) = raw.strip_prefix("file://") {
            if path.is_empty() {
                return Err(Error::InvalidInput("file target is missing a path".to_string()));
            }
            return Ok(Self::File {
                path: PathBuf::from(path),
            });
        }

        if let Some(url) = raw.strip_prefix("webdav+") {
            if !is_http_url(url) {
                return Err(Error::InvalidInput(format!(
                    "webdav target must be webdav+http:// or webdav+https://: {raw}"
                )));
            }
            return Ok(Self::WebDav {
                url: url.trim_end_matches('/').to_string(),
            });
        }

        if let Some(url) = raw.strip_prefix("nextcloud+") {
            return parse_nextcloud(url);
        }

        if raw.contains("://") {
            return Err(Error::InvalidInput(format!(
                "unsupported sync target scheme: {raw}"
            )));
        }

        Ok(Self::File {
            path: PathBuf::from(raw),
        })
    }

    /// Stable identifier keying per-target state in the local store
    pub fn target_id(&self) -> String {
        self.to_string()
    }

    /// Open the target with credentials from the process environment
    pub fn open(&self) -> Result<FileApi<AnyDriver>> {
        self.open_with(|key| env::var(key).ok())
    }

    /// Open the target with credentials from `lookup`
    pub fn open_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<FileApi<AnyDriver>> {
        let credential = |key: &str| normalize_text_option(lookup(key));
        let driver = match self {
            Self::File { path } => AnyDriver::Local(LocalDriver::new(path.clone())),
            Self::WebDav { url } => {
                let config = WebDavConfig::new(url)?.with_credentials(
                    credential(ENV_WEBDAV_USERNAME),
                    credential(ENV_WEBDAV_PASSWORD),
                );
                AnyDriver::WebDav(WebDavDriver::new(config)?)
            }
            Self::Nextcloud { server, user, path } => {
                let config = WebDavConfig::nextcloud(server, user, path)?
                    .with_credentials(None, credential(ENV_WEBDAV_PASSWORD));
                AnyDriver::WebDav(WebDavDriver::new(config)?)
            }
            Self::S3 { bucket, prefix } => {
                let config = S3Config::from_lookup(bucket, prefix, &lookup)?.ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "S3 credentials missing for {self}: set LOAM_S3_ACCESS_KEY_ID and LOAM_S3_SECRET_ACCESS_KEY"
                    ))
                })?;
                AnyDriver::S3(S3Driver::new(config))
            }
        };
        tracing::debug!(target_id = %self, "Opened sync target");
        Ok(FileApi::new(driver, ""))
    }
}

fn parse_nextcloud(url: &str) -> Result<TargetUri> {
    let invalid = || {
        Error::InvalidInput(format!(
            "nextcloud target must look like nextcloud+https://host/user/path: {url}"
        ))
    };
    if !is_http_url(url) {
        return Err(invalid());
    }
    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    let mut segments = rest.split('/').filter(|segment| !segment.is_empty());
    let host = segments.next().ok_or_else(invalid)?;
    let user = segments.next().ok_or_else(invalid)?;
    let path = segments.collect::<Vec<_>>().join("/");
    Ok(TargetUri::Nextcloud {
        server: format!("{scheme}://{host}"),
        user: user.to_string(),
        path,
    })
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => write!(f, "file://{}", path.display()),
            Self::WebDav { url } => write!(f, "webdav+{url}"),
            Self::Nextcloud { server, user, path } if path.is_empty() => {
                write!(f, "nextcloud+{server}/{user}")
            }
            Self::Nextcloud { server, user, path } => write!(f, "nextcloud+{server}/{user}/{path}"),
            Self::S3 { bucket, prefix } if prefix.is_empty() => write!(f, "s3://{bucket}"),
            Self::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
        }
    }
}

impl FromStr for TargetUri {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_options_are_valid() {
        let options = SyncOptions::default();
        options.validate().unwrap();
        assert_eq!(options.lock_ttl, Duration::from_secs(180));
        assert_eq!(options.max_parallel_transfers, 4);
    }

    #[test]
    fn refresh_must_be_shorter_than_ttl() {
        let options = SyncOptions::default()
            .with_lock_ttl(Duration::from_secs(10))
            .with_lock_refresh_interval(Duration::from_secs(10));
        assert!(options.validate().is_err());

        let options = SyncOptions::default().with_max_parallel_transfers(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn parses_file_targets() {
        assert_eq!(
            TargetUri::parse("/srv/notes").unwrap(),
            TargetUri::File {
                path: PathBuf::from("/srv/notes")
            }
        );
        let uri = TargetUri::parse("file:///srv/notes").unwrap();
        assert_eq!(uri.target_id(), "file:///srv/notes");
    }

    #[test]
    fn parses_s3_targets() {
        let uri = TargetUri::parse("s3://bucket/team/notes/").unwrap();
        assert_eq!(
            uri,
            TargetUri::S3 {
                bucket: "bucket".to_string(),
                prefix: "team/notes".to_string()
            }
        );
        assert_eq!(uri.to_string(), "s3://bucket/team/notes");
        assert!(TargetUri::parse("s3://").is_err());
    }

    #[test]
    fn parses_dav_targets() {
        let uri = TargetUri::parse("webdav+https://dav.example.com/notes/").unwrap();
        assert_eq!(
            uri,
            TargetUri::WebDav {
                url: "https://dav.example.com/notes".to_string()
            }
        );

        let uri: TargetUri = "nextcloud+https://cloud.example.com/alice/Notes/loam"
            .parse()
            .unwrap();
        assert_eq!(
            uri,
            TargetUri::Nextcloud {
                server: "https://cloud.example.com".to_string(),
                user: "alice".to_string(),
                path: "Notes/loam".to_string()
            }
        );
        assert_eq!(uri.target_id(), "nextcloud+https://cloud.example.com/alice/Notes/loam");
        assert!(TargetUri::parse("nextcloud+https://cloud.example.com").is_err());
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(TargetUri::parse("ftp://example.com/notes").is_err());
        assert!(TargetUri::parse("webdav+ftp://example.com").is_err());
        assert!(TargetUri::parse("  ").is_err());
    }

    #[test]
    fn open_s3_requires_credentials() {
        let uri = TargetUri::parse("s3://bucket/notes").unwrap();
        assert!(uri.open_with(|_| None).is_err());

        let files = uri
            .open_with(|key| match key {
                "LOAM_S3_ACCESS_KEY_ID" => Some("id".to_string()),
                "LOAM_S3_SECRET_ACCESS_KEY" => Some("secret".to_string()),
                _ => None,
            })
            .unwrap();
        assert!(matches!(files.driver(), AnyDriver::S3(_)));
    }

    #[test]
    fn open_file_target() {
        let tmp = tempfile::tempdir().unwrap();
        let uri = TargetUri::File {
            path: tmp.path().to_path_buf(),
        };
        let files = uri.open_with(|_| None).unwrap();
        assert!(matches!(files.driver(), AnyDriver::Local(_)));
    }
}
