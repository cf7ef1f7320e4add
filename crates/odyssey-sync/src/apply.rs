//! Write applier: plays a [`WritePlan`] against the store in a fixed order.

use odyssey_core::LatestPointer;
use odyssey_storage::{with_retry, CommentStore, RetryPolicy, StoreError};
use serde::Serialize;
use tracing::{info, warn};

use crate::reconcile::WritePlan;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub comments_upserted: usize,
    pub versions_demoted: usize,
    pub versions_inserted: usize,
    pub pointers_bulk: usize,
    pub pointers_fallback: usize,
    /// Fallback rows whose comment row does not exist.
    pub pointers_skipped: usize,
}

pub struct WriteApplier<'a, S: CommentStore + ?Sized> {
    store: &'a S,
    page_size: usize,
    retry: RetryPolicy,
}

impl<'a, S: CommentStore + ?Sized> WriteApplier<'a, S> {
    pub fn new(store: &'a S, page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            retry,
        }
    }

    /// Metadata, then demotions, then inserts, then pointers. Each batch is
    /// atomic on its own; a failure leaves earlier batches applied.
    pub async fn apply(&self, plan: &WritePlan) -> Result<ApplySummary, StoreError> {
        let mut summary = ApplySummary::default();

        for chunk in plan.comment_rows.chunks(self.page_size) {
            with_retry(&self.retry, "upsert_comments", || self.store.upsert_comments(chunk)).await?;
            summary.comments_upserted += chunk.len();
        }

        for chunk in plan.version_ids_to_demote.chunks(self.page_size) {
            with_retry(&self.retry, "set_versions_not_latest", || {
                self.store.set_versions_not_latest(chunk)
            })
            .await?;
            summary.versions_demoted += chunk.len();
        }

        let mut pointers: Vec<LatestPointer> = Vec::with_capacity(plan.version_inserts.len() + plan.pointer_repairs.len());
        for chunk in plan.version_inserts.chunks(self.page_size) {
            let inserted = with_retry(&self.retry, "insert_versions", || self.store.insert_versions(chunk)).await?;
            summary.versions_inserted += inserted.len();
            pointers.extend(inserted.iter().map(LatestPointer::from));
        }
        pointers.extend(plan.pointer_repairs.iter().cloned());

        for chunk in pointers.chunks(self.page_size) {
            self.write_pointers(chunk, &mut summary).await?;
        }

        info!(
            comments = summary.comments_upserted,
            demoted = summary.versions_demoted,
            inserted = summary.versions_inserted,
            pointers_bulk = summary.pointers_bulk,
            pointers_fallback = summary.pointers_fallback,
            "write plan applied"
        );
        Ok(summary)
    }

    /// Bulk pointer write, replaying rows one by one only when the batch is
    /// rejected as a constraint violation. The per-row path never inserts.
    async fn write_pointers(&self, chunk: &[LatestPointer], summary: &mut ApplySummary) -> Result<(), StoreError> {
        match with_retry(&self.retry, "upsert_latest_pointers", || {
            self.store.upsert_latest_pointers(chunk)
        })
        .await
        {
            Ok(()) => {
                summary.pointers_bulk += chunk.len();
                Ok(())
            }
            Err(StoreError::ConstraintViolation(reason)) => {
                warn!(rows = chunk.len(), %reason, "bulk pointer update rejected; updating row by row");
                for pointer in chunk {
                    let updated = with_retry(&self.retry, "update_latest_pointer", || {
                        self.store.update_latest_pointer(pointer)
                    })
                    .await?;
                    if updated {
                        summary.pointers_fallback += 1;
                    } else {
                        warn!(comment_id = %pointer.comment_id, "no comment row for latest pointer");
                        summary.pointers_skipped += 1;
                    }
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use odyssey_core::{CommentRow, NewVersion};
    use odyssey_storage::{MemoryStore, StoreOp};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, hour, 0, 0).single().unwrap()
    }

    fn row(id: &str) -> CommentRow {
        CommentRow {
            comment_id: id.into(),
            thread_id: "t".into(),
            parent_comment_id: None,
            author_username: Some("dan".into()),
            created_utc: at(0),
            score: None,
            permalink: None,
            is_deleted: false,
            raw_payload: json!({}),
            last_seen_utc: at(1),
        }
    }

    fn insert(id: &str, body: &str) -> NewVersion {
        NewVersion {
            comment_id: id.into(),
            body_text: body.into(),
            edited_utc: None,
            retrieved_utc: at(1),
            is_latest: true,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn steps_run_in_order_with_fixed_page_size() {
        let store = MemoryStore::new();
        let old = store.seed_version("a", "old", at(0), true).await;
        store.seed_comment(row("a"), Some(old)).await;

        let plan = WritePlan {
            comment_rows: vec![row("a"), row("b"), row("c")],
            version_inserts: vec![insert("a", "new"), insert("b", "b1"), insert("c", "c1")],
            version_ids_to_demote: vec![old],
            ..WritePlan::default()
        };
        let summary = WriteApplier::new(&store, 2, policy()).apply(&plan).await.unwrap();

        assert_eq!(summary.comments_upserted, 3);
        assert_eq!(summary.versions_demoted, 1);
        assert_eq!(summary.versions_inserted, 3);
        assert_eq!(summary.pointers_bulk, 3);
        assert_eq!(
            store.calls().await,
            vec![
                (StoreOp::UpsertComments, 2),
                (StoreOp::UpsertComments, 1),
                (StoreOp::SetVersionsNotLatest, 1),
                (StoreOp::InsertVersions, 2),
                (StoreOp::InsertVersions, 1),
                (StoreOp::UpsertLatestPointers, 2),
                (StoreOp::UpsertLatestPointers, 1),
            ]
        );
        assert!(store.comments_without_single_latest().await.is_empty());
        let a = store.comment("a").await.unwrap();
        let latest: Vec<_> = store
            .versions_for("a")
            .await
            .into_iter()
            .filter(|v| v.is_latest)
            .collect();
        assert_eq!(a.latest_version_id, Some(latest[0].version_id));
        assert_eq!(latest[0].body_text, "new");
    }

    #[tokio::test]
    async fn constraint_violation_falls_back_to_row_updates() {
        let store = MemoryStore::new();
        store.seed_comment(row("a"), None).await;
        let known = store.seed_version("a", "body", at(1), true).await;
        let plan = WritePlan {
            pointer_repairs: vec![
                LatestPointer {
                    comment_id: "a".into(),
                    version_id: known,
                },
                LatestPointer {
                    comment_id: "ghost".into(),
                    version_id: Uuid::new_v4(),
                },
            ],
            ..WritePlan::default()
        };

        let summary = WriteApplier::new(&store, 200, policy()).apply(&plan).await.unwrap();

        assert_eq!(summary.pointers_bulk, 0);
        assert_eq!(summary.pointers_fallback, 1);
        assert_eq!(summary.pointers_skipped, 1);
        assert_eq!(store.call_count(StoreOp::UpsertLatestPointers).await, 1);
        assert_eq!(store.call_count(StoreOp::UpdateLatestPointer).await, 2);
        assert_eq!(store.comment("a").await.unwrap().latest_version_id, Some(known));
        assert!(store.comment("ghost").await.is_none());
    }

    #[tokio::test]
    async fn non_constraint_pointer_failure_is_fatal_after_retry() {
        let store = MemoryStore::new();
        store.seed_comment(row("a"), None).await;
        store
            .inject_failure(
                StoreOp::UpsertLatestPointers,
                StoreError::Transient("connection reset".into()),
                usize::MAX,
            )
            .await;
        let plan = WritePlan {
            comment_rows: vec![row("a")],
            version_inserts: vec![insert("a", "body")],
            ..WritePlan::default()
        };

        let err = WriteApplier::new(&store, 200, policy()).apply(&plan).await.unwrap_err();

        assert_eq!(err, StoreError::Transient("connection reset".into()));
        assert_eq!(store.call_count(StoreOp::UpsertLatestPointers).await, 2);
        assert_eq!(store.call_count(StoreOp::UpdateLatestPointer).await, 0);
        assert_eq!(store.version_count().await, 1);
    }

    #[tokio::test]
    async fn empty_plan_touches_nothing() {
        let store = MemoryStore::new();
        let summary = WriteApplier::new(&store, 200, policy())
            .apply(&WritePlan::default())
            .await
            .unwrap();
        assert_eq!(summary, ApplySummary::default());
        assert!(store.calls().await.is_empty());
    }
}
