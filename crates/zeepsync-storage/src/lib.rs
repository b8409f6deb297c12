//! Per-item staging directories, payload archives and HTTP plumbing for zeepsync.

use std::borrow::Cow;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const CRATE_NAME: &str = "zeepsync-storage";

pub const PAYLOAD_EXTENSION: &str = "zeeplevel";
const THUMBNAIL_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// One payload file read out of a staging directory, plus its sibling thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPayload {
    pub path: PathBuf,
    /// File stem; the level name used for lineage matching.
    pub name: String,
    pub bytes: Vec<u8>,
    pub thumbnail: Option<Thumbnail>,
}

/// Image found next to a payload, with the extension it was staged under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub extension: String,
}

impl Thumbnail {
    pub fn content_type(&self) -> &'static str {
        if self.extension.eq_ignore_ascii_case("png") {
            "image/png"
        } else {
            "image/jpeg"
        }
    }
}

impl StagedPayload {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, PAYLOAD_EXTENSION)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Filesystem area where one workshop item is materialised while it is processed.
#[async_trait]
pub trait Staging: Send + Sync {
    /// Create a fresh, empty directory for the item.
    async fn prepare(&self, item_id: &str) -> anyhow::Result<PathBuf>;

    /// Read every payload file below `dir`, recursively, in path order.
    async fn list_payloads(&self, dir: &Path) -> anyhow::Result<Vec<StagedPayload>>;

    async fn destroy(&self, dir: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalStaging {
    root: PathBuf,
}

impl LocalStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn item_dir(&self, item_id: &str) -> PathBuf {
        let safe: String = item_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }
}

#[async_trait]
impl Staging for LocalStaging {
    async fn prepare(&self, item_id: &str) -> anyhow::Result<PathBuf> {
        let dir = self.item_dir(item_id);
        remove_dir_if_exists(&dir).await?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating staging directory {}", dir.display()))?;
        Ok(dir)
    }

    async fn list_payloads(&self, dir: &Path) -> anyhow::Result<Vec<StagedPayload>> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || collect_payloads(&dir))
            .await
            .context("joining payload scan")?
    }

    async fn destroy(&self, dir: &Path) -> anyhow::Result<()> {
        remove_dir_if_exists(dir).await
    }
}

async fn remove_dir_if_exists(dir: &Path) -> anyhow::Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", dir.display())),
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn collect_payloads(dir: &Path) -> anyhow::Result<Vec<StagedPayload>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if entry.file_type().is_file() && has_extension(entry.path(), PAYLOAD_EXTENSION) {
            paths.push(entry.into_path());
        }
    }

    let mut payloads = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes =
            std::fs::read(&path).with_context(|| format!("reading payload {}", path.display()))?;
        let thumbnail = find_thumbnail(&path)?;
        debug!(payload = %path.display(), thumbnail = thumbnail.is_some(), "staged payload");
        payloads.push(StagedPayload {
            path,
            name,
            bytes,
            thumbnail,
        });
    }
    Ok(payloads)
}

fn find_thumbnail(payload: &Path) -> anyhow::Result<Option<Thumbnail>> {
    for ext in THUMBNAIL_EXTENSIONS {
        for candidate in [ext.to_string(), ext.to_ascii_uppercase()] {
            let path = payload.with_extension(candidate);
            if path.is_file() {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("reading thumbnail {}", path.display()))?;
                return Ok(Some(Thumbnail {
                    bytes,
                    extension: ext.to_string(),
                }));
            }
        }
    }
    Ok(None)
}

/// Pack a single payload file into a deflated zip archive held in memory.
pub fn package_archive(file_name: &str, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer
        .start_file(file_name, options)
        .with_context(|| format!("starting archive entry {file_name}"))?;
    writer
        .write_all(bytes)
        .with_context(|| format!("writing archive entry {file_name}"))?;
    let cursor = writer.finish().context("finishing archive")?;
    Ok(cursor.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Per-request retry schedule of the HTTP collaborators.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Thin `reqwest` wrapper that retries transient failures.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// Send the request produced by `build`, rebuilding it for each retry.
    pub async fn send<F>(&self, build: F) -> Result<HttpResponse, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.send_with(self.retry.max_retries, build).await
    }

    /// Send exactly one attempt. For requests that must not be repeated,
    /// such as POSTs that create server-side state.
    pub async fn send_once<F>(&self, build: F) -> Result<HttpResponse, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.send_with(0, build).await
    }

    async fn send_with<F>(&self, max_retries: usize, build: F) -> Result<HttpResponse, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0usize;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(HttpResponse { status, url, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}
