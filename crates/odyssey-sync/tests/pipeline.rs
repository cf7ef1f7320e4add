use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use odyssey_adapters::{load_snapshot_bundle, CommentSource, FixtureSource, SnapshotBundle, SourceError};
use odyssey_core::{CommentSnapshot, RunStatus, RunType, ThreadRef};
use odyssey_storage::{ArtifactStore, MemoryStore, RetryPolicy, StoreError, StoreOp};
use odyssey_sync::{dry_run, run_once, BatchSizes, RunOptions};
use serde_json::json;
use tempfile::tempdir;

fn options() -> RunOptions {
    RunOptions {
        retry: RetryPolicy::with_backoff(Duration::from_millis(1)),
        ..RunOptions::default()
    }
}

fn snapshot(id: &str, thread: &str, body: &str) -> CommentSnapshot {
    CommentSnapshot {
        comment_id: id.into(),
        thread_id: thread.into(),
        parent_comment_id: None,
        author_username: Some("erin".into()),
        created_utc: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().unwrap(),
        body_text: body.into(),
        edited_utc: None,
        score: Some(1),
        permalink: None,
        is_deleted: false,
        raw_payload: json!({"id": id, "body": body}),
    }
}

fn removed(id: &str, thread: &str) -> CommentSnapshot {
    CommentSnapshot {
        author_username: None,
        is_deleted: true,
        ..snapshot(id, thread, "[removed]")
    }
}

fn source(comments: Vec<CommentSnapshot>) -> FixtureSource {
    FixtureSource::new(SnapshotBundle {
        source_id: "r/test".into(),
        captured_at: Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).single().unwrap(),
        threads: Vec::new(),
        comments,
    })
}

fn sample_bundle_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/reddit/sample/bundle.json")
}

async fn latest_body(store: &MemoryStore, id: &str) -> Option<String> {
    let pointer = store.comment(id).await?.latest_version_id?;
    store
        .versions_for(id)
        .await
        .into_iter()
        .find(|v| v.version_id == pointer && v.is_latest)
        .map(|v| v.body_text)
}

#[tokio::test]
async fn first_run_versions_every_comment() {
    let store = MemoryStore::new();
    let src = source(vec![snapshot("c1", "t1", "hello"), snapshot("c2", "t1", "hi"), removed("c3", "t2")]);

    let result = run_once(&src, &store, RunType::Initial, &options()).await;

    assert_eq!(result.status, RunStatus::Success, "{:?}", result.error_message);
    assert_eq!(result.number_of_comments_processed, 3);
    assert_eq!(store.version_count().await, 3);
    assert_eq!(latest_body(&store, "c1").await.as_deref(), Some("hello"));
    assert_eq!(latest_body(&store, "c3").await.as_deref(), Some("[removed]"));
    assert!(store.comment("c3").await.unwrap().row.is_deleted);
    assert!(!store.comment("c1").await.unwrap().row.is_deleted);
    assert!(store.comments_without_single_latest().await.is_empty());

    let logs = store.run_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].run_type, RunType::Initial);
    assert_eq!(logs[0].status, RunStatus::Success);
    assert_eq!(logs[0].number_of_comments_processed, 3);
    assert!(result.run_logged);
}

#[tokio::test]
async fn rerun_over_unchanged_data_writes_no_versions() {
    let store = MemoryStore::new();
    let src = source(vec![snapshot("c1", "t1", "hello"), snapshot("c2", "t1", "hi")]);
    run_once(&src, &store, RunType::Initial, &options()).await;
    store.clear_calls().await;

    let result = run_once(&src, &store, RunType::Scheduled, &options()).await;

    assert!(result.is_success());
    assert_eq!(store.version_count().await, 2);
    assert_eq!(store.call_count(StoreOp::InsertVersions).await, 0);
    assert_eq!(store.call_count(StoreOp::SetVersionsNotLatest).await, 0);
    assert_eq!(store.call_count(StoreOp::UpsertLatestPointers).await, 0);
    assert_eq!(store.call_count(StoreOp::UpsertComments).await, 1);
    let apply = result.apply.unwrap();
    assert_eq!(apply.versions_inserted, 0);
    assert_eq!(apply.comments_upserted, 2);
}

#[tokio::test]
async fn edit_adds_a_version_and_keeps_history() {
    let store = MemoryStore::new();
    run_once(&source(vec![snapshot("c1", "t1", "hello")]), &store, RunType::Initial, &options()).await;

    let mut edited = snapshot("c1", "t1", "hello world");
    edited.edited_utc = Some(Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).single().unwrap());
    run_once(&source(vec![edited]), &store, RunType::Scheduled, &options()).await;

    let versions = store.versions_for("c1").await;
    let bodies: Vec<_> = versions.iter().map(|v| (v.body_text.as_str(), v.is_latest)).collect();
    assert_eq!(bodies, vec![("hello", false), ("hello world", true)]);
    assert!(versions[1].edited_utc.is_some());
    assert_eq!(latest_body(&store, "c1").await.as_deref(), Some("hello world"));
    assert!(store.comments_without_single_latest().await.is_empty());
}

#[tokio::test]
async fn deletion_is_recorded_once_and_never_reverted() {
    let store = MemoryStore::new();
    run_once(&source(vec![snapshot("c1", "t1", "hello")]), &store, RunType::Initial, &options()).await;

    let mut stale = snapshot("c1", "t1", "cached text");
    stale.is_deleted = true;
    run_once(&source(vec![stale]), &store, RunType::Scheduled, &options()).await;
    assert!(store.comment("c1").await.unwrap().row.is_deleted);
    assert_eq!(store.version_count().await, 1);

    // The source stops reporting the deletion and even shows new text.
    run_once(&source(vec![snapshot("c1", "t1", "back again")]), &store, RunType::Scheduled, &options()).await;
    assert!(store.comment("c1").await.unwrap().row.is_deleted);
    assert_eq!(store.version_count().await, 1);
    assert_eq!(latest_body(&store, "c1").await.as_deref(), Some("hello"));
}

#[tokio::test]
async fn crash_before_pointer_update_converges_on_rerun() {
    let store = MemoryStore::new();
    let src = source(vec![snapshot("c1", "t1", "hello"), snapshot("c2", "t1", "hi")]);
    store
        .inject_failure(
            StoreOp::UpsertLatestPointers,
            StoreError::Transient("connection reset".into()),
            usize::MAX,
        )
        .await;

    let failed = run_once(&src, &store, RunType::Initial, &options()).await;
    assert_eq!(failed.status, RunStatus::Failure);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("applying write plan"));
    assert_eq!(store.version_count().await, 2);
    assert_eq!(store.comment("c1").await.unwrap().latest_version_id, None);

    store.clear_failures().await;
    let recovered = run_once(&src, &store, RunType::Scheduled, &options()).await;

    assert!(recovered.is_success());
    assert_eq!(store.version_count().await, 2);
    assert_eq!(latest_body(&store, "c1").await.as_deref(), Some("hello"));
    assert_eq!(latest_body(&store, "c2").await.as_deref(), Some("hi"));
    assert!(store.comments_without_single_latest().await.is_empty());

    let statuses: Vec<_> = store.run_logs().await.iter().map(|l| l.status).collect();
    assert_eq!(statuses, vec![RunStatus::Failure, RunStatus::Success]);
}

#[tokio::test]
async fn crash_recovery_with_an_edit_demotes_the_orphaned_latest() {
    let store = MemoryStore::new();
    store
        .inject_failure(
            StoreOp::UpsertLatestPointers,
            StoreError::Transient("connection reset".into()),
            usize::MAX,
        )
        .await;
    run_once(&source(vec![snapshot("c1", "t1", "hello")]), &store, RunType::Initial, &options()).await;
    store.clear_failures().await;

    run_once(&source(vec![snapshot("c1", "t1", "edited")]), &store, RunType::Scheduled, &options()).await;

    let bodies: Vec<_> = store
        .versions_for("c1")
        .await
        .into_iter()
        .map(|v| (v.body_text, v.is_latest))
        .collect();
    assert_eq!(bodies, vec![("hello".to_string(), false), ("edited".to_string(), true)]);
    assert_eq!(latest_body(&store, "c1").await.as_deref(), Some("edited"));
}

#[tokio::test]
async fn crash_between_demotion_and_insert_still_converges() {
    let store = MemoryStore::new();
    run_once(&source(vec![snapshot("c1", "t1", "v1")]), &store, RunType::Initial, &options()).await;
    store
        .inject_failure(StoreOp::InsertVersions, StoreError::Transient("timeout".into()), usize::MAX)
        .await;

    let edited = source(vec![snapshot("c1", "t1", "v2")]);
    let failed = run_once(&edited, &store, RunType::Scheduled, &options()).await;
    assert!(!failed.is_success());
    // The old version was demoted but nothing replaced it yet.
    assert_eq!(store.comments_without_single_latest().await, vec!["c1".to_string()]);

    store.clear_failures().await;
    assert!(run_once(&edited, &store, RunType::Scheduled, &options()).await.is_success());
    assert!(store.comments_without_single_latest().await.is_empty());
    assert_eq!(latest_body(&store, "c1").await.as_deref(), Some("v2"));
    assert_eq!(store.version_count().await, 2);
}

#[tokio::test]
async fn duplicate_latest_row_behind_a_valid_pointer_is_demoted() {
    let store = MemoryStore::new();
    let src = source(vec![snapshot("c1", "t1", "hello")]);
    run_once(&src, &store, RunType::Initial, &options()).await;
    let pointer = store.comment("c1").await.unwrap().latest_version_id.unwrap();
    // A retried insert whose first attempt had already committed.
    let duplicate = store
        .seed_version("c1", "hello", Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).single().unwrap(), true)
        .await;
    assert_eq!(store.comments_without_single_latest().await, vec!["c1".to_string()]);

    let first = run_once(&src, &store, RunType::Scheduled, &options()).await;
    let second = run_once(&src, &store, RunType::Scheduled, &options()).await;

    assert!(first.is_success() && second.is_success());
    assert_eq!(first.apply.unwrap().versions_demoted, 1);
    assert_eq!(second.apply.unwrap().versions_demoted, 0);
    assert!(store.comments_without_single_latest().await.is_empty());
    assert_eq!(store.comment("c1").await.unwrap().latest_version_id, Some(pointer));
    let stale = store
        .versions_for("c1")
        .await
        .into_iter()
        .find(|v| v.version_id == duplicate)
        .unwrap();
    assert!(!stale.is_latest);
    assert_eq!(store.version_count().await, 2);
}

#[tokio::test]
async fn transient_store_failure_is_retried_once() {
    let store = MemoryStore::new();
    store
        .inject_failure(StoreOp::UpsertComments, StoreError::RateLimited { retry_after: None }, 1)
        .await;

    let result = run_once(&source(vec![snapshot("c1", "t1", "hello")]), &store, RunType::Initial, &options()).await;

    assert!(result.is_success());
    assert_eq!(store.call_count(StoreOp::UpsertComments).await, 2);
}

#[tokio::test]
async fn run_log_failure_never_masks_the_run_error() {
    let store = MemoryStore::new();
    store
        .inject_failure(StoreOp::GetComments, StoreError::Transient("store down".into()), usize::MAX)
        .await;
    store
        .inject_failure(StoreOp::AppendRunLog, StoreError::Transient("store down".into()), usize::MAX)
        .await;

    let result = run_once(&source(vec![snapshot("c1", "t1", "hello")]), &store, RunType::Scheduled, &options()).await;

    assert_eq!(result.status, RunStatus::Failure);
    let message = result.error_message.clone().unwrap_or_default();
    assert!(message.contains("loading existing comment state"), "{message}");
    assert!(message.contains("store down"), "{message}");
    assert!(!result.run_logged);
    assert_eq!(result.number_of_comments_processed, 1);
    assert_eq!(store.call_count(StoreOp::GetComments).await, 2);
    assert_eq!(store.call_count(StoreOp::AppendRunLog).await, 2);
    assert!(result.into_result().is_err());
}

#[tokio::test]
async fn writes_are_paged_by_batch_size() {
    let store = MemoryStore::new();
    let comments = (0..5).map(|i| snapshot(&format!("c{i}"), "t1", "body")).collect();
    let opts = RunOptions {
        batch_sizes: BatchSizes { read: 3, write: 2 },
        ..options()
    };

    run_once(&source(comments), &store, RunType::Initial, &opts).await;

    fn batches(op: StoreOp, calls: &[(StoreOp, usize)]) -> Vec<usize> {
        calls.iter().filter(|(o, _)| *o == op).map(|(_, n)| *n).collect()
    }
    let calls = store.calls().await;
    assert_eq!(batches(StoreOp::GetComments, &calls), vec![3, 2]);
    assert_eq!(batches(StoreOp::UpsertComments, &calls), vec![2, 2, 1]);
    assert_eq!(batches(StoreOp::InsertVersions, &calls), vec![2, 2, 1]);
    assert_eq!(batches(StoreOp::UpsertLatestPointers, &calls), vec![2, 2, 1]);
}

/// Fails `list_threads` a fixed number of times and one thread forever.
struct FlakySource {
    inner: FixtureSource,
    list_failures: AtomicUsize,
    broken_thread: Option<String>,
}

#[async_trait]
impl CommentSource for FlakySource {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    async fn list_threads(&self) -> Result<Vec<ThreadRef>, SourceError> {
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Malformed("listing hiccup".into()));
        }
        self.inner.list_threads().await
    }

    async fn fetch_comments(&self, thread: &ThreadRef) -> Result<Vec<CommentSnapshot>, SourceError> {
        if self.broken_thread.as_deref() == Some(thread.thread_id.as_str()) {
            return Err(SourceError::Auth("token revoked".into()));
        }
        self.inner.fetch_comments(thread).await
    }
}

#[tokio::test]
async fn source_failures_are_retried_once_then_fail_the_run() {
    let store = MemoryStore::new();
    let flaky = FlakySource {
        inner: source(vec![snapshot("c1", "t1", "hello")]),
        list_failures: AtomicUsize::new(1),
        broken_thread: None,
    };
    assert!(run_once(&flaky, &store, RunType::Initial, &options()).await.is_success());

    let store = MemoryStore::new();
    let broken = FlakySource {
        inner: source(vec![snapshot("a1", "a", "first"), snapshot("b1", "b", "second")]),
        list_failures: AtomicUsize::new(2),
        broken_thread: None,
    };
    let result = run_once(&broken, &store, RunType::Initial, &options()).await;
    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(result.number_of_comments_processed, 0);
    assert_eq!(store.comment_count().await, 0);
    let logs = store.run_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Failure);
    assert!(logs[0].error_message.as_deref().unwrap_or_default().contains("listing hiccup"));
}

#[tokio::test]
async fn processed_count_reflects_progress_before_failure() {
    let store = MemoryStore::new();
    let src = FlakySource {
        inner: source(vec![snapshot("a1", "a", "x"), snapshot("a2", "a", "y"), snapshot("b1", "b", "z")]),
        list_failures: AtomicUsize::new(0),
        broken_thread: Some("b".into()),
    };

    let result = run_once(&src, &store, RunType::Scheduled, &options()).await;

    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(result.number_of_comments_processed, 2);
    assert_eq!(store.run_logs().await[0].number_of_comments_processed, 2);
    assert_eq!(store.comment_count().await, 0);
}

#[tokio::test]
async fn dry_run_counts_without_a_store() {
    let src = FixtureSource::from_path(sample_bundle_path()).unwrap();
    let retry = RetryPolicy::with_backoff(Duration::from_millis(1));

    let report = dry_run(&src, None, &retry).await.unwrap();
    assert_eq!(report.threads_found, 3);
    assert_eq!(report.threads_with_comments, 2);
    assert_eq!(report.comments_found, 4);

    let limited = dry_run(&src, Some(1), &retry).await.unwrap();
    assert_eq!(limited.threads_found, 1);
    assert_eq!(limited.comments_found, 3);
}

#[tokio::test]
async fn archived_bundle_replays_into_an_identical_store() {
    let dir = tempdir().expect("tempdir");
    let live = MemoryStore::new();
    let src = FixtureSource::from_path(sample_bundle_path()).unwrap();
    let opts = RunOptions {
        archive: Some(ArtifactStore::new(dir.path())),
        ..options()
    };

    let result = run_once(&src, &live, RunType::Initial, &opts).await;
    assert!(result.is_success());
    let archived = result.archived_to.expect("bundle archived");
    assert!(archived.starts_with(dir.path()));

    let bundle = load_snapshot_bundle(&archived).unwrap();
    assert_eq!(bundle.comments.len(), 4);
    assert_eq!(bundle.threads.len(), 3);

    let replayed = MemoryStore::new();
    let outcome = run_once(&FixtureSource::new(bundle), &replayed, RunType::Initial, &options()).await;
    assert!(outcome.is_success());
    assert_eq!(replayed.version_count().await, live.version_count().await);
    assert_eq!(replayed.comment_count().await, 4);
    assert!(replayed.comment("kt1aa03").await.unwrap().row.is_deleted);
    assert_eq!(
        replayed.comment("kt1aa02").await.unwrap().row.parent_comment_id.as_deref(),
        Some("kt1aa01")
    );
}
