//! WebDAV driver (Nextcloud and other generic WebDAV servers).

use std::time::Duration;

use chrono::DateTime;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};

use super::{RemoteEntry, RemoteStat, StorageDriver, StorageError, StorageResult};
use crate::util::{compact_text, is_http_url};
use crate::{Error, Result};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:getlastmodified/>
    <d:getcontentlength/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

/// WebDAV connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebDavConfig {
    /// Collection URL every path is resolved against
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

impl WebDavConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(format!(
                "WebDAV URL must start with http:// or https://: {base_url}"
            )));
        }
        Ok(Self {
            base_url,
            username: None,
            password: None,
            request_timeout: Duration::from_secs(60),
        })
    }

    /// Nextcloud exposes each user's files under `/remote.php/dav/files/<user>`
    pub fn nextcloud(server_url: &str, username: &str, path: &str) -> Result<Self> {
        let server_url = server_url.trim().trim_end_matches('/');
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::InvalidInput(
                "Nextcloud username cannot be empty".to_string(),
            ));
        }
        let mut base = format!(
            "{server_url}/remote.php/dav/files/{}",
            urlencoding::encode(username)
        );
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            base.push('/');
            base.push_str(&urlencoding::encode(segment));
        }
        let mut config = Self::new(&base)?;
        config.username = Some(username.to_string());
        Ok(config)
    }

    #[must_use]
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        if username.is_some() {
            self.username = username;
        }
        self.password = password;
        self
    }

    /// Path component of the base URL, used to relativize listing hrefs
    fn base_path(&self) -> String {
        let without_scheme = self
            .base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, rest)| rest);
        without_scheme
            .split_once('/')
            .map_or(String::new(), |(_, path)| {
                urlencoding::decode(path)
                    .map_or_else(|_| path.to_string(), |value| value.into_owned())
            })
            .trim_matches('/')
            .to_string()
    }
}

/// WebDAV-backed driver
#[derive(Clone, Debug)]
pub struct WebDavDriver {
    config: WebDavConfig,
    client: Client,
}

impl WebDavDriver {
    pub fn new(config: WebDavConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| Error::InvalidInput(format!("Failed to build HTTP client: {error}")))?;
        Ok(Self { config, client })
    }

    pub const fn config(&self) -> &WebDavConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        let mut url = self.config.base_url.clone();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, self.url(path));
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_deref()),
            None => request,
        }
    }

    async fn send(
        &self,
        operation: &str,
        path: &str,
        request: RequestBuilder,
    ) -> StorageResult<Response> {
        let started = std::time::Instant::now();
        let response = request
            .send()
            .await
            .map_err(|error| map_transport_error(operation, path, &error, started.elapsed()))?;
        tracing::trace!(operation, path, status = %response.status(), "WebDAV request");
        Ok(response)
    }

    async fn propfind(&self, path: &str, depth: &str) -> StorageResult<Option<Vec<RemoteEntry>>> {
        let request = self
            .request(webdav_method(b"PROPFIND")?, path)
            .header("Depth", depth)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let response = self.send("propfind", path, request).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error("propfind", path, status, response).await);
        }
        let body = response
            .text()
            .await
            .map_err(|error| StorageError::Transient(format!("propfind {path}: {error}")))?;
        let entries = parse_multistatus(&body, &self.config.base_path())
            .map_err(|error| StorageError::Backend(format!("propfind {path}: {error}")))?;
        Ok(Some(entries))
    }

    async fn mkcol(&self, path: &str) -> StorageResult<StatusCode> {
        let request = self.request(webdav_method(b"MKCOL")?, path);
        let response = self.send("mkcol", path, request).await?;
        Ok(response.status())
    }
}

fn webdav_method(name: &[u8]) -> StorageResult<Method> {
    Method::from_bytes(name).map_err(|error| StorageError::Backend(error.to_string()))
}

fn map_transport_error(
    operation: &str,
    path: &str,
    error: &reqwest::Error,
    elapsed: Duration,
) -> StorageError {
    if error.is_timeout() {
        StorageError::Timeout {
            operation: format!("WebDAV {operation} {path}"),
            after: elapsed,
        }
    } else if error.is_connect() || error.is_request() || error.is_body() {
        StorageError::Transient(format!("WebDAV {operation} {path}: {error}"))
    } else {
        StorageError::Backend(format!("WebDAV {operation} {path}: {error}"))
    }
}

async fn status_error(
    operation: &str,
    path: &str,
    status: StatusCode,
    response: Response,
) -> StorageError {
    let body = response.text().await.unwrap_or_default();
    map_status(operation, path, status, &compact_text(&body))
}

fn map_status(operation: &str, path: &str, status: StatusCode, detail: &str) -> StorageError {
    let message = format!("WebDAV {operation} {path} returned {status}: {detail}");
    match status.as_u16() {
        401 => StorageError::Authentication(message),
        403 => StorageError::AccessDenied(message),
        404 => StorageError::NotFound(path.to_string()),
        413 => StorageError::PayloadTooLarge {
            path: path.to_string(),
            size: 0,
        },
        507 => StorageError::QuotaExceeded(message),
        408 | 423 | 429 => StorageError::Transient(message),
        code if code >= 500 => StorageError::Transient(message),
        _ => StorageError::Backend(message),
    }
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date_time| date_time.timestamp_millis())
}

/// Parse a `207 Multi-Status` PROPFIND body into entries relative to `base_path`
fn parse_multistatus(xml: &str, base_path: &str) -> std::result::Result<Vec<RemoteEntry>, String> {
    #[derive(Default)]
    struct Pending {
        href: String,
        size: u64,
        updated_time: Option<i64>,
        is_dir: bool,
    }

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<Pending> = None;
    let mut element = Vec::new();

    loop {
        match reader.read_event().map_err(|error| error.to_string())? {
            Event::Start(start) => {
                let name = start.local_name().as_ref().to_vec();
                if name == b"response" {
                    current = Some(Pending::default());
                } else if name == b"collection" {
                    if let Some(pending) = current.as_mut() {
                        pending.is_dir = true;
                    }
                }
                element = name;
            }
            Event::Empty(empty) => {
                if empty.local_name().as_ref() == b"collection" {
                    if let Some(pending) = current.as_mut() {
                        pending.is_dir = true;
                    }
                }
            }
            Event::Text(text) => {
                let Some(pending) = current.as_mut() else {
                    continue;
                };
                let value = text.unescape().map_err(|error| error.to_string())?;
                match element.as_slice() {
                    b"href" => pending.href = value.into_owned(),
                    b"getcontentlength" => pending.size = value.trim().parse().unwrap_or(0),
                    b"getlastmodified" => pending.updated_time = parse_http_date(&value),
                    _ => {}
                }
            }
            Event::End(end) => {
                if end.local_name().as_ref() == b"response" {
                    if let Some(pending) = current.take() {
                        let path = relative_href(&pending.href, base_path);
                        entries.push(RemoteEntry {
                            path,
                            size: if pending.is_dir { 0 } else { pending.size },
                            updated_time: pending.updated_time,
                            is_dir: pending.is_dir,
                        });
                    }
                }
                element.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

/// Turn an href (absolute URL or absolute path) into a path under `base_path`
fn relative_href(href: &str, base_path: &str) -> String {
    let path = href
        .split_once("://")
        .and_then(|(_, rest)| rest.split_once('/').map(|(_, path)| path))
        .unwrap_or(href);
    let decoded = urlencoding::decode(path)
        .map_or_else(|_| path.to_string(), |value| value.into_owned());
    let decoded = decoded.trim_matches('/');
    if decoded == base_path {
        return String::new();
    }
    decoded
        .strip_prefix(base_path)
        .map_or(decoded, |rest| rest.trim_start_matches('/'))
        .to_string()
}

impl StorageDriver for WebDavDriver {
    async fn list(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
        let listed = path.trim_matches('/');
        let entries = self.propfind(listed, "1").await?.unwrap_or_default();
        // The collection itself is part of its own listing
        Ok(entries
            .into_iter()
            .filter(|entry| entry.path != listed)
            .collect())
    }

    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let request = self.request(Method::GET, path);
        let response = self.send("get", path, request).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error("get", path, status, response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|error| StorageError::Transient(format!("get {path}: {error}")))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let request = self.request(Method::PUT, path).body(data.to_vec());
        let response = self.send("put", path, request).await?;
        let status = response.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(StorageError::PayloadTooLarge {
                path: path.to_string(),
                size: data.len() as u64,
            });
        }
        if status == StatusCode::CONFLICT {
            // Parent collection missing
            if let Some((parent, _)) = path.trim_matches('/').rsplit_once('/') {
                self.mkdir(parent).await?;
                let retry = self.request(Method::PUT, path).body(data.to_vec());
                let response = self.send("put", path, retry).await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                return Err(status_error("put", path, status, response).await);
            }
        }
        if !status.is_success() {
            return Err(status_error("put", path, status, response).await);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let request = self.request(Method::DELETE, path);
        let response = self.send("delete", path, request).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error("delete", path, status, response).await)
    }

    async fn move_to(&self, from: &str, to: &str) -> StorageResult<()> {
        let request = self
            .request(webdav_method(b"MOVE")?, from)
            .header("Destination", self.url(to))
            .header("Overwrite", "T");
        let response = self.send("move", from, request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(status_error("move", from, status, response).await)
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(());
        }

        let mut status = self.mkcol(path).await?;
        if status == StatusCode::CONFLICT {
            // Create missing ancestors first
            let segments = path.split('/').collect::<Vec<_>>();
            for depth in 1..segments.len() {
                let ancestor = segments[..depth].join("/");
                let ancestor_status = self.mkcol(&ancestor).await?;
                if !ancestor_status.is_success()
                    && ancestor_status != StatusCode::METHOD_NOT_ALLOWED
                {
                    return Err(map_status("mkcol", &ancestor, ancestor_status, ""));
                }
            }
            status = self.mkcol(path).await?;
        }

        // 405: the collection already exists
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            Ok(())
        } else {
            Err(map_status("mkcol", path, status, ""))
        }
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<RemoteStat>> {
        let wanted = path.trim_matches('/');
        let entries = self.propfind(wanted, "0").await?;
        Ok(entries.and_then(|entries| {
            entries
                .into_iter()
                .find(|entry| entry.path == wanted)
                .map(|entry| entry.stat())
        }))
    }

    async fn set_timestamp(&self, _path: &str, _time_ms: i64) -> StorageResult<()> {
        Err(StorageError::Unsupported("set_timestamp"))
    }

    async fn format(&self) -> StorageResult<()> {
        for entry in self.list("").await? {
            self.delete(&entry.path).await?;
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("webdav:{}", self.config.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/remote.php/dav/files/alice/Loam/</d:href>
    <d:propstat>
      <d:prop>
        <d:getlastmodified>Sat, 01 Jun 2024 10:00:00 GMT</d:getlastmodified>
        <d:resourcetype><d:collection/></d:resourcetype>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/Loam/0190c0e5b1e87b3c9b9f3a7c2d1e4f56.md</d:href>
    <d:propstat>
      <d:prop>
        <d:getlastmodified>Sat, 01 Jun 2024 10:05:00 GMT</d:getlastmodified>
        <d:getcontentlength>123</d:getcontentlength>
        <d:resourcetype/>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>https://cloud.example.com/remote.php/dav/files/alice/Loam/.locks/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn parses_multistatus_listing() {
        let entries = parse_multistatus(MULTISTATUS, "remote.php/dav/files/alice/Loam").unwrap();

        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    path: String::new(),
                    size: 0,
                    updated_time: Some(1_717_236_000_000),
                    is_dir: true,
                },
                RemoteEntry {
                    path: "0190c0e5b1e87b3c9b9f3a7c2d1e4f56.md".to_string(),
                    size: 123,
                    updated_time: Some(1_717_236_300_000),
                    is_dir: false,
                },
                RemoteEntry {
                    path: ".locks".to_string(),
                    size: 0,
                    updated_time: None,
                    is_dir: true,
                },
            ]
        );
    }

    #[test]
    fn nextcloud_config_builds_files_url() {
        let config =
            WebDavConfig::nextcloud("https://cloud.example.com/", "alice smith", "Apps/Loam")
                .unwrap();
        assert_eq!(
            config.base_url,
            "https://cloud.example.com/remote.php/dav/files/alice%20smith/Apps/Loam"
        );
        assert_eq!(config.username.as_deref(), Some("alice smith"));
        assert_eq!(config.base_path(), "remote.php/dav/files/alice smith/Apps/Loam");
    }

    #[test]
    fn config_rejects_non_http_urls() {
        assert!(WebDavConfig::new("ftp://example.com").is_err());
    }

    #[test]
    fn urls_encode_each_segment() {
        let config = WebDavConfig::new("https://dav.example.com/base/").unwrap();
        let driver = WebDavDriver::new(config).unwrap();
        assert_eq!(
            driver.url("/.locks/sync a.json"),
            "https://dav.example.com/base/.locks/sync%20a.json"
        );
    }

    #[test]
    fn status_codes_map_to_typed_errors() {
        let err = map_status("get", "a.md", StatusCode::UNAUTHORIZED, "");
        assert!(err.is_session_fatal());
        assert!(matches!(
            map_status("put", "a.md", StatusCode::INSUFFICIENT_STORAGE, ""),
            StorageError::QuotaExceeded(_)
        ));
        assert!(map_status("get", "a.md", StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(matches!(
            map_status("get", "a.md", StatusCode::FORBIDDEN, ""),
            StorageError::AccessDenied(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "Requires LOAM_WEBDAV_URL, LOAM_WEBDAV_USERNAME and LOAM_WEBDAV_PASSWORD plus network access"]
    async fn webdav_object_roundtrip() {
        let _ = dotenvy::dotenv();

        let url = std::env::var("LOAM_WEBDAV_URL").expect("LOAM_WEBDAV_URL should be set");
        let config = WebDavConfig::new(&url).unwrap().with_credentials(
            std::env::var("LOAM_WEBDAV_USERNAME").ok(),
            std::env::var("LOAM_WEBDAV_PASSWORD").ok(),
        );
        let driver = WebDavDriver::new(config).unwrap();

        driver.mkdir("loam-live-test").await.unwrap();
        driver.put("loam-live-test/a.md", b"hello").await.unwrap();
        assert_eq!(
            driver.get("loam-live-test/a.md").await.unwrap(),
            Some(b"hello".to_vec())
        );
        let listed = driver.list("loam-live-test").await.unwrap();
        assert!(listed.iter().any(|entry| entry.path == "loam-live-test/a.md"));

        driver.delete("loam-live-test").await.unwrap();
        assert_eq!(driver.get("loam-live-test/a.md").await.unwrap(), None);
    }
}
