//! In-process store with the same contract as [`crate::PgStore`].
//!
//! Used for replaying archived bundles without a database and as the store
//! behind the pipeline tests. Failures can be injected per operation to model
//! an unreachable store or a crash between write steps.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odyssey_core::{
    CommentRow, ExistingComment, ExistingVersion, InsertedVersion, LatestPointer, NewVersion,
    RunLogEntry, VersionId,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{CommentStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetComments,
    GetVersions,
    GetLatestVersions,
    UpsertComments,
    SetVersionsNotLatest,
    InsertVersions,
    UpsertLatestPointers,
    UpdateLatestPointer,
    AppendRunLog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredComment {
    pub row: CommentRow,
    pub latest_version_id: Option<VersionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub version_id: VersionId,
    pub comment_id: String,
    pub body_text: String,
    pub edited_utc: Option<DateTime<Utc>>,
    pub retrieved_utc: DateTime<Utc>,
    pub is_latest: bool,
}

impl StoredVersion {
    fn existing(&self) -> ExistingVersion {
        ExistingVersion {
            version_id: self.version_id,
            comment_id: self.comment_id.clone(),
            body_text: self.body_text.clone(),
            retrieved_utc: self.retrieved_utc,
            is_latest: self.is_latest,
        }
    }
}

#[derive(Debug)]
struct Fault {
    error: StoreError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    comments: BTreeMap<String, StoredComment>,
    versions: Vec<StoredVersion>,
    run_logs: Vec<RunLogEntry>,
    calls: Vec<(StoreOp, usize)>,
    faults: HashMap<StoreOp, Fault>,
}

impl MemoryState {
    /// Record the call and surface an injected failure, if one is armed.
    fn enter(&mut self, op: StoreOp, batch_len: usize) -> Result<(), StoreError> {
        self.calls.push((op, batch_len));
        let Some(fault) = self.faults.get_mut(&op) else {
            return Ok(());
        };
        let error = fault.error.clone();
        fault.remaining = fault.remaining.saturating_sub(1);
        if fault.remaining == 0 {
            self.faults.remove(&op);
        }
        Err(error)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `error` (`usize::MAX` for always).
    pub async fn inject_failure(&self, op: StoreOp, error: StoreError, times: usize) {
        let mut state = self.state.lock().await;
        if times == 0 {
            state.faults.remove(&op);
        } else {
            state.faults.insert(op, Fault { error, remaining: times });
        }
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.faults.clear();
    }

    pub async fn seed_comment(&self, row: CommentRow, latest_version_id: Option<VersionId>) {
        let mut state = self.state.lock().await;
        state.comments.insert(
            row.comment_id.clone(),
            StoredComment {
                row,
                latest_version_id,
            },
        );
    }

    pub async fn seed_version(
        &self,
        comment_id: &str,
        body_text: &str,
        retrieved_utc: DateTime<Utc>,
        is_latest: bool,
    ) -> VersionId {
        let version_id = Uuid::new_v4();
        self.state.lock().await.versions.push(StoredVersion {
            version_id,
            comment_id: comment_id.to_string(),
            body_text: body_text.to_string(),
            edited_utc: None,
            retrieved_utc,
            is_latest,
        });
        version_id
    }

    pub async fn comment(&self, comment_id: &str) -> Option<StoredComment> {
        self.state.lock().await.comments.get(comment_id).cloned()
    }

    pub async fn comment_count(&self) -> usize {
        self.state.lock().await.comments.len()
    }

    /// Versions of one comment in insertion order.
    pub async fn versions_for(&self, comment_id: &str) -> Vec<StoredVersion> {
        self.state
            .lock()
            .await
            .versions
            .iter()
            .filter(|v| v.comment_id == comment_id)
            .cloned()
            .collect()
    }

    pub async fn version_count(&self) -> usize {
        self.state.lock().await.versions.len()
    }

    pub async fn run_logs(&self) -> Vec<RunLogEntry> {
        self.state.lock().await.run_logs.clone()
    }

    /// `(operation, batch length)` for every call so far.
    pub async fn calls(&self) -> Vec<(StoreOp, usize)> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, op: StoreOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(called, _)| *called == op)
            .count()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Comments that have versions but not exactly one flagged latest.
    pub async fn comments_without_single_latest(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut latest_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for version in &state.versions {
            let count = latest_counts.entry(version.comment_id.as_str()).or_default();
            if version.is_latest {
                *count += 1;
            }
        }
        latest_counts
            .into_iter()
            .filter(|(_, count)| *count != 1)
            .map(|(comment_id, _)| comment_id.to_string())
            .collect()
    }
}

#[async_trait]
impl CommentStore for MemoryStore {
    async fn get_comments(
        &self,
        comment_ids: &[String],
    ) -> Result<HashMap<String, ExistingComment>, StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::GetComments, comment_ids.len())?;
        Ok(comment_ids
            .iter()
            .filter_map(|id| state.comments.get(id))
            .map(|stored| {
                (
                    stored.row.comment_id.clone(),
                    ExistingComment {
                        comment_id: stored.row.comment_id.clone(),
                        latest_version_id: stored.latest_version_id,
                        is_deleted: stored.row.is_deleted,
                    },
                )
            })
            .collect())
    }

    async fn get_versions(
        &self,
        version_ids: &[VersionId],
    ) -> Result<HashMap<VersionId, ExistingVersion>, StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::GetVersions, version_ids.len())?;
        Ok(state
            .versions
            .iter()
            .filter(|v| version_ids.contains(&v.version_id))
            .map(|v| (v.version_id, v.existing()))
            .collect())
    }

    async fn get_latest_versions_by_comment(
        &self,
        comment_ids: &[String],
    ) -> Result<Vec<ExistingVersion>, StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::GetLatestVersions, comment_ids.len())?;
        Ok(state
            .versions
            .iter()
            .filter(|v| v.is_latest && comment_ids.contains(&v.comment_id))
            .map(StoredVersion::existing)
            .collect())
    }

    async fn upsert_comments(&self, rows: &[CommentRow]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::UpsertComments, rows.len())?;
        for row in rows {
            match state.comments.get_mut(&row.comment_id) {
                Some(stored) => {
                    let was_deleted = stored.row.is_deleted;
                    stored.row = row.clone();
                    stored.row.is_deleted |= was_deleted;
                }
                None => {
                    state.comments.insert(
                        row.comment_id.clone(),
                        StoredComment {
                            row: row.clone(),
                            latest_version_id: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn set_versions_not_latest(&self, version_ids: &[VersionId]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::SetVersionsNotLatest, version_ids.len())?;
        for version in state
            .versions
            .iter_mut()
            .filter(|v| version_ids.contains(&v.version_id))
        {
            version.is_latest = false;
        }
        Ok(())
    }

    async fn insert_versions(&self, rows: &[NewVersion]) -> Result<Vec<InsertedVersion>, StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::InsertVersions, rows.len())?;
        if let Some(orphan) = rows.iter().find(|r| !state.comments.contains_key(&r.comment_id)) {
            return Err(StoreError::ConstraintViolation(format!(
                "version references missing comment {}",
                orphan.comment_id
            )));
        }
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let version_id = Uuid::new_v4();
            state.versions.push(StoredVersion {
                version_id,
                comment_id: row.comment_id.clone(),
                body_text: row.body_text.clone(),
                edited_utc: row.edited_utc,
                retrieved_utc: row.retrieved_utc,
                is_latest: row.is_latest,
            });
            inserted.push(InsertedVersion {
                version_id,
                comment_id: row.comment_id.clone(),
            });
        }
        Ok(inserted)
    }

    async fn upsert_latest_pointers(&self, pointers: &[LatestPointer]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::UpsertLatestPointers, pointers.len())?;
        let missing = pointers
            .iter()
            .filter(|p| !state.comments.contains_key(&p.comment_id))
            .count();
        if missing > 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "{missing} of {} pointer rows have no comment row",
                pointers.len()
            )));
        }
        for pointer in pointers {
            if let Some(stored) = state.comments.get_mut(&pointer.comment_id) {
                stored.latest_version_id = Some(pointer.version_id);
            }
        }
        Ok(())
    }

    async fn update_latest_pointer(&self, pointer: &LatestPointer) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::UpdateLatestPointer, 1)?;
        Ok(match state.comments.get_mut(&pointer.comment_id) {
            Some(stored) => {
                stored.latest_version_id = Some(pointer.version_id);
                true
            }
            None => false,
        })
    }

    async fn append_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOp::AppendRunLog, 1)?;
        state.run_logs.push(entry.clone());
        Ok(())
    }
}
