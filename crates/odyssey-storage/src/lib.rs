//! Store collaborator, retry policy, HTTP fetch and artifact archive for Odyssey.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odyssey_core::{
    CommentRow, ExistingComment, ExistingVersion, InsertedVersion, LatestPointer, NewVersion,
    RunLogEntry, VersionId,
};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, StoreOp, StoredVersion};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "odyssey-storage";

/// Failure classes shared by every store implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Transient(String),
    #[error("store rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("store failure: {0}")]
    Unrecoverable(String),
}

/// Batched primitives over comments, versions and run logs.
///
/// Every list argument is a single batch; paging is the caller's job. Reads
/// return only the rows that exist.
#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn get_comments(
        &self,
        comment_ids: &[String],
    ) -> Result<HashMap<String, ExistingComment>, StoreError>;

    async fn get_versions(
        &self,
        version_ids: &[VersionId],
    ) -> Result<HashMap<VersionId, ExistingVersion>, StoreError>;

    /// Every version still flagged latest for the given comments.
    async fn get_latest_versions_by_comment(
        &self,
        comment_ids: &[String],
    ) -> Result<Vec<ExistingVersion>, StoreError>;

    /// Insert or refresh metadata. Must never touch the latest-version pointer.
    async fn upsert_comments(&self, rows: &[CommentRow]) -> Result<(), StoreError>;

    async fn set_versions_not_latest(&self, version_ids: &[VersionId]) -> Result<(), StoreError>;

    async fn insert_versions(&self, rows: &[NewVersion]) -> Result<Vec<InsertedVersion>, StoreError>;

    /// Set pointers for a whole batch at once. Fails with
    /// [`StoreError::ConstraintViolation`] and applies nothing if any comment row
    /// is missing.
    async fn upsert_latest_pointers(&self, pointers: &[LatestPointer]) -> Result<(), StoreError>;

    /// Point update of one pointer. Returns `false` when no comment row exists;
    /// never creates one.
    async fn update_latest_pointer(&self, pointer: &LatestPointer) -> Result<bool, StoreError>;

    async fn append_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError>;
}

/// Lets the retry wrapper treat every collaborator error the same way.
pub trait RetryHint {
    fn is_retryable(&self) -> bool {
        true
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryHint for StoreError {
    fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::ConstraintViolation(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Uniform retry policy for source and store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Duration::from_secs(2),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn with_backoff(backoff: Duration) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    /// Server-suggested wait when present, otherwise the fixed backoff.
    pub fn delay_for<E: RetryHint>(&self, err: &E) -> Duration {
        err.retry_after().unwrap_or(self.backoff).min(self.max_delay)
    }
}

/// Run `call`, retrying per `policy` while the error allows it.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryHint + fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && err.is_retryable() => {
                let delay = policy.delay_for(&err);
                warn!(
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw run captures.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYmmdd_HHMMSS>/<source_id>/<sha256>.<ext>`
    pub fn relative_path_for(
        captured_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(captured_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_json<T: Serialize>(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing artifact")?;
        self.store_bytes(captured_at, source_id, "json", &bytes).await
    }

    /// Write once; a second write of identical bytes is reported as deduplicated.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(captured_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        write_new_file(&temp_path, bytes).await?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Ok(artifact(true));
                }
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl RetryHint for FetchError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Wait suggested by a 429 response: `Retry-After`, then `x-ratelimit-reset`.
/// Values that do not fit a `Duration` are skipped.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.trim().parse::<f64>().ok())
        .find_map(|secs| Duration::try_from_secs_f64(secs).ok())
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacing shared by every call through one fetcher.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let refill_ms = self.refill_every.as_millis();
            if refill_ms > 0 {
                let refills = state.last_refill.elapsed().as_millis() / refill_ms;
                if refills > 0 {
                    let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill = Instant::now();
                }
            } else {
                state.tokens = self.capacity;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            // Reddit allows 100 OAuth requests per minute.
            token_bucket: Some(TokenBucketConfig {
                capacity: 10,
                refill_every: Duration::from_millis(600),
            }),
        }
    }
}

/// Thin JSON-over-HTTP client. It classifies failures but does not retry;
/// callers wrap it in [`with_retry`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
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
            token_bucket: config.token_bucket.map(|c| Arc::new(SimpleTokenBucket::new(c))),
        })
    }

    pub async fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<JsonValue, FetchError> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send_json(url, request).await
    }

    pub async fn post_form_json(
        &self,
        url: &str,
        basic_auth: (&str, &str),
        form: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let request = self
            .client
            .post(url)
            .basic_auth(basic_auth.0, Some(basic_auth.1))
            .form(form);
        self.send_json(url, request).await
    }

    async fn send_json(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<JsonValue, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", url);
        async move {
            let resp = request.send().await.map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
            let status = resp.status();
            debug!(status = status.as_u16(), "response received");

            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(FetchError::RateLimited {
                    url: url.to_string(),
                    retry_after: retry_after_from_headers(resp.headers()),
                });
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            resp.json::<JsonValue>()
                .await
                .map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                })
        }
        .instrument(span)
        .await
    }
}
