//! Run pipeline: source -> existing-state loader -> reconciler -> write
//! applier -> run logger.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use odyssey_adapters::{CommentSource, RedditConfig, RedditCredentials, RedditSource, SnapshotBundle, SourceError};
use odyssey_core::{CommentSnapshot, RunLogEntry, RunStatus, RunType, ThreadRef};
use odyssey_storage::{
    with_retry, ArtifactStore, CommentStore, HttpClientConfig, HttpFetcher, PgStore, RetryPolicy, StoredArtifact,
};
use serde::Serialize;
use tracing::{error, info, warn};

pub mod apply;
pub mod loader;
pub mod reconcile;

pub use apply::{ApplySummary, WriteApplier};
pub use loader::{ExistingState, StateLoader};
pub use reconcile::{decide, reconcile, VersionDecision, WritePlan};

pub const CRATE_NAME: &str = "odyssey-sync";

pub const DEFAULT_SUBREDDIT: &str = "churningmarketplace";
pub const DEFAULT_USER_AGENT: &str = "odyssey-scraper/1.0";

/// Store page sizes: reads and writes are chunked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizes {
    pub read: usize,
    pub write: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self { read: 500, write: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub subreddit: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub credentials: RedditCredentials,
    pub user_agent: String,
    pub database_url: Option<String>,
    pub archive_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub retry_backoff_secs: u64,
    pub thread_limit: Option<usize>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let credentials = match (var("REDDIT_REFRESH_TOKEN"), var("REDDIT_USERNAME"), var("REDDIT_PASSWORD")) {
            (Some(token), _, _) => RedditCredentials::RefreshToken(token),
            (None, Some(username), Some(password)) => RedditCredentials::Password { username, password },
            _ => RedditCredentials::ClientCredentials,
        };

        Self {
            subreddit: var("SUBREDDIT").unwrap_or_else(|| DEFAULT_SUBREDDIT.to_string()),
            client_id: var("REDDIT_CLIENT_ID"),
            client_secret: var("REDDIT_CLIENT_SECRET"),
            credentials,
            user_agent: var("REDDIT_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            database_url: var("DATABASE_URL"),
            archive_dir: var("ODYSSEY_ARCHIVE_DIR").map(PathBuf::from),
            http_timeout_secs: var("ODYSSEY_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            retry_backoff_secs: var("ODYSSEY_RETRY_BACKOFF_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            thread_limit: var("ODYSSEY_THREAD_LIMIT").and_then(|v| v.parse().ok()),
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL is not set"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_backoff(Duration::from_secs(self.retry_backoff_secs))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }

    pub fn reddit_config(&self) -> Result<RedditConfig> {
        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| anyhow!("REDDIT_CLIENT_ID is not set"))?;
        let client_secret = self
            .client_secret
            .clone()
            .ok_or_else(|| anyhow!("REDDIT_CLIENT_SECRET is not set"))?;
        let mut config = RedditConfig::new(&self.subreddit, client_id, client_secret);
        config.credentials = self.credentials.clone();
        Ok(config)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            batch_sizes: BatchSizes::default(),
            retry: self.retry_policy(),
            thread_limit: self.thread_limit,
            archive: self.archive_dir.clone().map(ArtifactStore::new),
        }
    }
}

pub fn live_source(config: &SyncConfig) -> Result<RedditSource> {
    let http = HttpFetcher::new(config.http_client_config())?;
    Ok(RedditSource::new(config.reddit_config()?, http))
}

pub async fn connect_store(config: &SyncConfig) -> Result<PgStore> {
    let url = config.database_url()?;
    PgStore::connect(url).await.context("connecting to the comment store")
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub batch_sizes: BatchSizes,
    pub retry: RetryPolicy,
    pub thread_limit: Option<usize>,
    /// Where to archive the run's snapshot bundle, if anywhere.
    pub archive: Option<ArtifactStore>,
}

/// Everything observed from the source in one run. Filled incrementally so the
/// counts survive a failure part way through.
#[derive(Debug, Default)]
pub struct Collected {
    pub threads: Vec<ThreadRef>,
    pub threads_with_comments: usize,
    pub snapshots: Vec<CommentSnapshot>,
    pub comment_ids: HashSet<String>,
}

/// List threads and fetch every thread's comments, retrying each source call
/// per `retry`.
pub async fn collect_snapshots<S: CommentSource + ?Sized>(
    source: &S,
    thread_limit: Option<usize>,
    retry: &RetryPolicy,
    out: &mut Collected,
) -> std::result::Result<(), SourceError> {
    let mut threads = with_retry(retry, "list_threads", || source.list_threads()).await?;
    if let Some(limit) = thread_limit {
        threads.truncate(limit);
    }
    info!(source = source.source_id(), threads = threads.len(), "threads to fetch");
    out.threads = threads.clone();

    let total = threads.len();
    for (index, thread) in threads.iter().enumerate() {
        let comments = with_retry(retry, "fetch_comments", || source.fetch_comments(thread)).await?;
        info!(
            thread = index + 1,
            total,
            thread_id = %thread.thread_id,
            comments = comments.len(),
            "thread fetched"
        );
        if !comments.is_empty() {
            out.threads_with_comments += 1;
        }
        for comment in comments {
            out.comment_ids.insert(comment.comment_id.clone());
            out.snapshots.push(comment);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub threads_found: usize,
    pub threads_with_comments: usize,
    pub comments_found: usize,
}

/// Exercise the whole source path and count what it returns. Never touches a
/// store.
pub async fn dry_run<S: CommentSource + ?Sized>(
    source: &S,
    thread_limit: Option<usize>,
    retry: &RetryPolicy,
) -> Result<DryRunReport> {
    let mut collected = Collected::default();
    collect_snapshots(source, thread_limit, retry, &mut collected)
        .await
        .context("reading from source")?;
    let report = DryRunReport {
        threads_found: collected.threads.len(),
        threads_with_comments: collected.threads_with_comments,
        comments_found: collected.comment_ids.len(),
    };
    info!(
        threads_found = report.threads_found,
        threads_with_comments = report.threads_with_comments,
        comments_found = report.comments_found,
        "dry run complete"
    );
    Ok(report)
}

/// Appends run log rows without ever failing the caller.
pub struct RunLogger<'a, S: CommentStore + ?Sized> {
    store: &'a S,
    retry: RetryPolicy,
}

impl<'a, S: CommentStore + ?Sized> RunLogger<'a, S> {
    pub fn new(store: &'a S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Returns whether the row was written.
    pub async fn record(&self, entry: &RunLogEntry) -> bool {
        match with_retry(&self.retry, "append_run_log", || self.store.append_run_log(entry)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    run_type = %entry.run_type,
                    status = entry.status.as_str(),
                    error = %err,
                    "could not write run log"
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub run_type: RunType,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub number_of_comments_processed: u64,
    pub threads_found: usize,
    pub apply: Option<ApplySummary>,
    pub archived_to: Option<PathBuf>,
    pub run_logged: bool,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Turn a failed run into an error carrying its message.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            RunStatus::Success => Ok(self),
            RunStatus::Failure => Err(anyhow!(self
                .error_message
                .unwrap_or_else(|| "run failed".to_string()))),
        }
    }
}

struct RunReport {
    apply: ApplySummary,
    archived: Option<StoredArtifact>,
}

/// One full reconciliation pass. Never returns early on failure: the outcome,
/// success or not, is logged (best-effort) and described in the result.
pub async fn run_once<Src, St>(source: &Src, store: &St, run_type: RunType, options: &RunOptions) -> RunResult
where
    Src: CommentSource + ?Sized,
    St: CommentStore + ?Sized,
{
    let started = Utc::now();
    info!(run_type = %run_type, source = source.source_id(), "run started");

    let mut collected = Collected::default();
    let outcome = execute(source, store, options, &mut collected).await;
    let processed = collected.comment_ids.len() as u64;
    let logger = RunLogger::new(store, options.retry);

    match outcome {
        Ok(report) => {
            let logged = logger
                .record(&RunLogEntry::success(run_type, processed, Utc::now()))
                .await;
            info!(
                run_type = %run_type,
                comments = processed,
                elapsed_ms = (Utc::now() - started).num_milliseconds(),
                "run succeeded"
            );
            RunResult {
                run_type,
                status: RunStatus::Success,
                error_message: None,
                number_of_comments_processed: processed,
                threads_found: collected.threads.len(),
                apply: Some(report.apply),
                archived_to: report.archived.map(|a| a.absolute_path),
                run_logged: logged,
            }
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(run_type = %run_type, comments = processed, error = %message, "run failed");
            let entry = RunLogEntry::failure(run_type, &message, processed, Utc::now());
            let logged = logger.record(&entry).await;
            RunResult {
                run_type,
                status: RunStatus::Failure,
                error_message: Some(message),
                number_of_comments_processed: processed,
                threads_found: collected.threads.len(),
                apply: None,
                archived_to: None,
                run_logged: logged,
            }
        }
    }
}

async fn execute<Src, St>(
    source: &Src,
    store: &St,
    options: &RunOptions,
    collected: &mut Collected,
) -> Result<RunReport>
where
    Src: CommentSource + ?Sized,
    St: CommentStore + ?Sized,
{
    collect_snapshots(source, options.thread_limit, &options.retry, collected)
        .await
        .context("reading from source")?;

    let archived = match &options.archive {
        Some(archive) => archive_snapshots(archive, source.source_id(), collected).await,
        None => None,
    };

    let mut ids: Vec<String> = collected.comment_ids.iter().cloned().collect();
    ids.sort();
    let existing = StateLoader::new(store, options.batch_sizes.read, options.retry)
        .load(&ids)
        .await
        .context("loading existing comment state")?;

    let plan = reconcile(&collected.snapshots, &existing, Utc::now());
    info!(
        comments = plan.comment_rows.len(),
        inserts = plan.version_inserts.len(),
        demotions = plan.version_ids_to_demote.len(),
        pointer_repairs = plan.pointer_repairs.len(),
        edits = plan.decision_count(VersionDecision::Edit),
        kept_deleted = plan.decision_count(VersionDecision::KeepDeleted),
        "write plan built"
    );

    let apply = WriteApplier::new(store, options.batch_sizes.write, options.retry)
        .apply(&plan)
        .await
        .context("applying write plan")?;

    Ok(RunReport { apply, archived })
}

/// Archive failures are reported and otherwise ignored.
async fn archive_snapshots(archive: &ArtifactStore, source_id: &str, collected: &Collected) -> Option<StoredArtifact> {
    let captured_at = Utc::now();
    let bundle = SnapshotBundle {
        source_id: source_id.to_string(),
        captured_at,
        threads: collected.threads.clone(),
        comments: collected.snapshots.clone(),
    };
    match archive.store_json(captured_at, source_id, &bundle).await {
        Ok(artifact) => {
            info!(
                path = %artifact.relative_path.display(),
                bytes = artifact.byte_size,
                deduplicated = artifact.deduplicated,
                "snapshot bundle archived"
            );
            Some(artifact)
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(error = %message, "could not archive snapshot bundle");
            None
        }
    }
}
