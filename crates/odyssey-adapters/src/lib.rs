//! Comment source contracts, the Reddit source and fixture replay.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odyssey_core::{CommentSnapshot, ThreadRef};
use odyssey_storage::{FetchError, RetryHint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

pub mod reddit;

pub use reddit::{RedditConfig, RedditCredentials, RedditSource};

pub const CRATE_NAME: &str = "odyssey-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl RetryHint for SourceError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::Fetch(err) => err.retry_after(),
            _ => None,
        }
    }
}

/// Producer of comment snapshots for one forum community.
///
/// Implementations hand back fully normalized, flat snapshots; nothing they
/// return may reference client state.
#[async_trait]
pub trait CommentSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Every thread the source can see, deduplicated by thread id.
    async fn list_threads(&self) -> Result<Vec<ThreadRef>, SourceError>;

    /// The whole comment tree of one thread, flattened. Continuation markers
    /// are resolved before this returns.
    async fn fetch_comments(&self, thread: &ThreadRef) -> Result<Vec<CommentSnapshot>, SourceError>;
}

/// Serialized capture of one run's observations, used for archive and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub threads: Vec<ThreadRef>,
    pub comments: Vec<CommentSnapshot>,
}

impl SnapshotBundle {
    /// Threads listed in the bundle, or the distinct thread ids of its
    /// comments when the bundle carries no listing.
    pub fn thread_refs(&self) -> Vec<ThreadRef> {
        if !self.threads.is_empty() {
            return self.threads.clone();
        }
        self.comments
            .iter()
            .map(|c| c.thread_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|thread_id| ThreadRef {
                thread_id,
                title: String::new(),
            })
            .collect()
    }
}

pub fn load_snapshot_bundle(path: impl AsRef<Path>) -> Result<SnapshotBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a previously captured bundle as if it were live.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle: SnapshotBundle,
}

impl FixtureSource {
    pub fn new(bundle: SnapshotBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_snapshot_bundle(path)?))
    }

    pub fn bundle(&self) -> &SnapshotBundle {
        &self.bundle
    }
}

#[async_trait]
impl CommentSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    async fn list_threads(&self) -> Result<Vec<ThreadRef>, SourceError> {
        let mut seen = HashSet::new();
        Ok(self
            .bundle
            .thread_refs()
            .into_iter()
            .filter(|t| seen.insert(t.thread_id.clone()))
            .collect())
    }

    async fn fetch_comments(&self, thread: &ThreadRef) -> Result<Vec<CommentSnapshot>, SourceError> {
        Ok(self
            .bundle
            .comments
            .iter()
            .filter(|c| c.thread_id == thread.thread_id)
            .cloned()
            .collect())
    }
}

/// Background progress reporter for long source calls.
///
/// Only logs; it shares nothing but a tick counter with the caller and must be
/// stopped before the guarded call returns.
pub struct Heartbeat {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    ticks: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn start(label: impl Into<String>, every: Duration) -> Self {
        let label = label.into();
        let ticks = Arc::new(AtomicU64::new(0));
        let (stop, mut stopped) = oneshot::channel::<()>();
        let counter = Arc::clone(&ticks);
        let started = tokio::time::Instant::now();
        let period = every.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(started + period, period);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = interval.tick() => {
                        counter.fetch_add(1, Ordering::Relaxed);
                        info!(
                            label = %label,
                            elapsed_secs = started.elapsed().as_secs(),
                            "still working"
                        );
                    }
                }
            }
        });

        Self {
            stop: Some(stop),
            handle,
            ticks,
        }
    }

    /// Stop the reporter and wait for it; returns how many beats were emitted.
    pub async fn stop(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.handle).await;
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.handle.abort();
        }
    }
}
