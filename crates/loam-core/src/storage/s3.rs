//! S3-compatible object storage driver (AWS S3, Cloudflare R2, MinIO).

use std::env;

use aws_credential_types::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::Client;
use aws_types::region::Region;

use super::{RemoteEntry, RemoteStat, StorageDriver, StorageError, StorageResult};
use crate::util::{is_http_url, join_path};
use crate::{Error, Result};

const ENV_ENDPOINT: &str = "LOAM_S3_ENDPOINT";
const ENV_REGION: &str = "LOAM_S3_REGION";
const ENV_ACCESS_KEY_ID: &str = "LOAM_S3_ACCESS_KEY_ID";
const ENV_SECRET_ACCESS_KEY: &str = "LOAM_S3_SECRET_ACCESS_KEY";

const DEFAULT_REGION: &str = "auto";

/// S3 bucket location and credentials
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix every path is placed under
    pub prefix: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Config {
    /// Load credentials for `bucket`/`prefix` from environment variables.
    ///
    /// Returns `Ok(None)` when no S3 variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env(bucket: &str, prefix: &str) -> Result<Option<Self>> {
        Self::from_lookup(bucket, prefix, |key| env::var(key).ok())
    }

    /// Same as [`S3Config::from_env`] with a custom variable source
    pub fn from_lookup(
        bucket: &str,
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>> {
        parse_config(bucket, prefix, lookup)
    }
}

fn parse_config(
    bucket: &str,
    prefix: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<S3Config>> {
    let endpoint = lookup(ENV_ENDPOINT).map(|value| value.trim().to_string());
    let region = lookup(ENV_REGION).map(|value| value.trim().to_string());
    let access_key_id = lookup(ENV_ACCESS_KEY_ID).map(|value| value.trim().to_string());
    let secret_access_key = lookup(ENV_SECRET_ACCESS_KEY).map(|value| value.trim().to_string());

    let any_present = endpoint.is_some()
        || region.is_some()
        || access_key_id.is_some()
        || secret_access_key.is_some();

    if !any_present {
        return Ok(None);
    }

    let bucket = bucket.trim();
    let mut missing = Vec::new();
    if bucket.is_empty() {
        missing.push("bucket");
    }
    let Some(access_key_id) = access_key_id.filter(|value| !value.is_empty()) else {
        missing.push(ENV_ACCESS_KEY_ID);
        if secret_access_key.as_ref().map_or(true, String::is_empty) {
            missing.push(ENV_SECRET_ACCESS_KEY);
        }
        return Err(incomplete(&missing));
    };
    let Some(secret_access_key) = secret_access_key.filter(|value| !value.is_empty()) else {
        missing.push(ENV_SECRET_ACCESS_KEY);
        return Err(incomplete(&missing));
    };
    if !missing.is_empty() {
        return Err(incomplete(&missing));
    }

    let endpoint = match endpoint.filter(|value| !value.is_empty()) {
        Some(value) if !is_http_url(&value) => {
            return Err(Error::InvalidInput(format!(
                "{ENV_ENDPOINT} must start with http:// or https://"
            )));
        }
        Some(value) => Some(value.trim_end_matches('/').to_string()),
        None => None,
    };

    Ok(Some(S3Config {
        bucket: bucket.to_string(),
        prefix: prefix.trim_matches('/').to_string(),
        endpoint,
        region: region
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        access_key_id,
        secret_access_key,
    }))
}

fn incomplete(missing: &[&str]) -> Error {
    Error::InvalidInput(format!(
        "S3 configuration is incomplete. Missing: {}",
        missing.join(", ")
    ))
}

fn build_s3_client(config: &S3Config) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "loam-core-s3-driver",
    );

    let mut builder = aws_sdk_s3::config::Builder::new()
        .region(Region::new(config.region.clone()))
        .credentials_provider(credentials)
        .force_path_style(true);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    Client::from_conf(builder.build())
}

/// Map an SDK failure onto the driver error taxonomy
fn storage_error<E, R>(operation: &str, key: &str, error: &SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("S3 {operation} failed for {key}: {}", DisplayErrorContext(error));
    match error {
        SdkError::TimeoutError(_) => StorageError::Timeout {
            operation: format!("S3 {operation} {key}"),
            after: std::time::Duration::ZERO,
        },
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(message)
        }
        SdkError::ServiceError(_) => match error.code() {
            Some("NoSuchKey" | "NotFound") => StorageError::NotFound(key.to_string()),
            Some(
                "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
                | "InvalidToken",
            ) => StorageError::Authentication(message),
            Some("AccessDenied" | "AllAccessDisabled") => StorageError::AccessDenied(message),
            Some("EntityTooLarge") => StorageError::PayloadTooLarge {
                path: key.to_string(),
                size: 0,
            },
            Some("QuotaExceeded" | "ServiceQuotaExceeded") => StorageError::QuotaExceeded(message),
            Some("SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout") => {
                StorageError::Transient(message)
            }
            _ => StorageError::Backend(message),
        },
        _ => StorageError::Backend(message),
    }
}

fn to_millis(time: Option<&DateTime>) -> Option<i64> {
    time.and_then(|time| time.to_millis().ok())
}

fn to_size(size: Option<i64>) -> u64 {
    size.and_then(|size| u64::try_from(size).ok()).unwrap_or(0)
}

/// S3-backed driver
#[derive(Clone, Debug)]
pub struct S3Driver {
    config: S3Config,
    client: Client,
}

impl S3Driver {
    pub fn new(config: S3Config) -> Self {
        let client = build_s3_client(&config);
        Self { config, client }
    }

    pub const fn config(&self) -> &S3Config {
        &self.config
    }

    fn key(&self, path: &str) -> String {
        join_path(&self.config.prefix, path)
    }

    fn path_of<'a>(&self, key: &'a str) -> &'a str {
        if self.config.prefix.is_empty() {
            return key.trim_matches('/');
        }
        key.strip_prefix(self.config.prefix.as_str())
            .map_or(key, |rest| rest.trim_start_matches('/'))
            .trim_end_matches('/')
    }

    /// Every key under `key_prefix`, following continuation tokens
    async fn all_keys(&self, key_prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(key_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|error| storage_error("list_objects_v2", key_prefix, &error))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(ToOwned::to_owned)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => return Ok(keys),
            }
        }
    }

    /// Check that the configured bucket is reachable with current credentials.
    pub async fn bucket_is_reachable(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|error| storage_error("head_bucket", &self.config.bucket, &error))?;
        Ok(())
    }
}

impl StorageDriver for S3Driver {
    async fn list(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
        let dir_key = self.key(path);
        let key_prefix = if dir_key.is_empty() {
            String::new()
        } else {
            format!("{dir_key}/")
        };

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&key_prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|error| storage_error("list_objects_v2", &key_prefix, &error))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if key == key_prefix {
                    continue;
                }
                entries.push(RemoteEntry {
                    path: self.path_of(key).to_string(),
                    size: to_size(object.size()),
                    updated_time: to_millis(object.last_modified()),
                    is_dir: false,
                });
            }
            for common in response.common_prefixes() {
                let Some(prefix) = common.prefix() else { continue };
                entries.push(RemoteEntry {
                    path: self.path_of(prefix).to_string(),
                    size: 0,
                    updated_time: None,
                    is_dir: true,
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let key = self.key(path);
        let response = match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                return match storage_error("get_object", &key, &error) {
                    StorageError::NotFound(_) => Ok(None),
                    other => Err(other),
                };
            }
        };

        let payload = response
            .body
            .collect()
            .await
            .map_err(|error| {
                StorageError::Transient(format!("S3 get_object body for {key}: {error}"))
            })?;
        Ok(Some(payload.into_bytes().to_vec()))
    }

    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let key = self.key(path);
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|error| match storage_error("put_object", &key, &error) {
                StorageError::PayloadTooLarge { path, .. } => StorageError::PayloadTooLarge {
                    path,
                    size: data.len() as u64,
                },
                other => other,
            })?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let key = self.key(path);
        // Directory-like prefixes are removed key by key
        for child in self.all_keys(&format!("{key}/")).await? {
            self.client
                .delete_object()
                .bucket(&self.config.bucket)
                .key(&child)
                .send()
                .await
                .map_err(|error| storage_error("delete_object", &child, &error))?;
        }
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| storage_error("delete_object", &key, &error))?;
        Ok(())
    }

    async fn move_to(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self.key(from);
        let destination = self.key(to);
        let copy_source = format!(
            "{}/{}",
            self.config.bucket,
            urlencoding::encode(&source).replace("%2F", "/")
        );
        self.client
            .copy_object()
            .bucket(&self.config.bucket)
            .copy_source(copy_source)
            .key(&destination)
            .send()
            .await
            .map_err(|error| storage_error("copy_object", &source, &error))?;
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&source)
            .send()
            .await
            .map_err(|error| storage_error("delete_object", &source, &error))?;
        Ok(())
    }

    async fn mkdir(&self, _path: &str) -> StorageResult<()> {
        // Prefixes exist implicitly
        Ok(())
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>> {
        let key = self.key(path);
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(RemoteStat {
                size: to_size(response.content_length()),
                updated_time: to_millis(response.last_modified()),
                is_dir: false,
            })),
            Err(error) => match storage_error("head_object", &key, &error) {
                StorageError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn set_timestamp(&self, _path: &str, _time_ms: i64) -> StorageResult<()> {
        Err(StorageError::Unsupported("set_timestamp"))
    }

    async fn format(&self) -> StorageResult<()> {
        let root = if self.config.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.config.prefix)
        };
        for key in self.all_keys(&root).await? {
            self.client
                .delete_object()
                .bucket(&self.config.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|error| storage_error("delete_object", &key, &error))?;
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("s3://{}/{}", self.config.bucket, self.config.prefix)
    }
}
