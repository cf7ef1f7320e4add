//! Existing-state loader: the "before" view the reconciler compares against.

use std::collections::{HashMap, HashSet};

use odyssey_core::{ExistingComment, ExistingVersion, VersionId};
use odyssey_storage::{with_retry, CommentStore, RetryPolicy, StoreError};
use tracing::{debug, info, warn};

/// Prior state for the comments of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingState {
    pub comments: HashMap<String, ExistingComment>,
    /// Effective latest version per comment: the stored pointer when it still
    /// names a version flagged latest, otherwise whatever the repair lookup found.
    pub latest: HashMap<String, ExistingVersion>,
    /// Versions still flagged latest besides the effective latest one.
    pub stray_latest: HashMap<String, Vec<VersionId>>,
}

impl ExistingState {
    pub fn comment(&self, comment_id: &str) -> Option<&ExistingComment> {
        self.comments.get(comment_id)
    }

    pub fn latest_version(&self, comment_id: &str) -> Option<&ExistingVersion> {
        self.latest.get(comment_id)
    }

    pub fn latest_body(&self, comment_id: &str) -> Option<&str> {
        self.latest.get(comment_id).map(|v| v.body_text.as_str())
    }

    pub fn stray_latest(&self, comment_id: &str) -> &[VersionId] {
        self.stray_latest
            .get(comment_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn repaired_count(&self) -> usize {
        self.latest
            .iter()
            .filter(|(id, version)| {
                self.comments
                    .get(*id)
                    .map(|c| c.latest_version_id != Some(version.version_id))
                    .unwrap_or(false)
            })
            .count()
    }
}

/// Batched reader over a [`CommentStore`].
pub struct StateLoader<'a, S: CommentStore + ?Sized> {
    store: &'a S,
    page_size: usize,
    retry: RetryPolicy,
}

impl<'a, S: CommentStore + ?Sized> StateLoader<'a, S> {
    pub fn new(store: &'a S, page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            retry,
        }
    }

    pub async fn load(&self, comment_ids: &[String]) -> Result<ExistingState, StoreError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = comment_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        let mut state = ExistingState::default();
        if ids.is_empty() {
            return Ok(state);
        }

        for chunk in ids.chunks(self.page_size) {
            let found = with_retry(&self.retry, "get_comments", || self.store.get_comments(chunk)).await?;
            state.comments.extend(found);
        }

        let mut pointer_ids: Vec<VersionId> = state
            .comments
            .values()
            .filter_map(|c| c.latest_version_id)
            .collect();
        pointer_ids.sort_unstable();
        pointer_ids.dedup();

        let mut pointed: HashMap<VersionId, ExistingVersion> = HashMap::new();
        for chunk in pointer_ids.chunks(self.page_size) {
            let found = with_retry(&self.retry, "get_versions", || self.store.get_versions(chunk)).await?;
            pointed.extend(found);
        }

        let known: Vec<String> = ids
            .iter()
            .filter(|id| state.comments.contains_key(*id))
            .cloned()
            .collect();
        let mut flagged = self.flagged_latest(&known).await?;

        for id in &known {
            let pointer = state.comments.get(id).and_then(|c| c.latest_version_id);
            let trusted = pointer
                .and_then(|vid| pointed.get(&vid))
                .filter(|v| v.is_latest && v.comment_id == *id)
                .cloned();
            let mut candidates = flagged.remove(id).unwrap_or_default();

            let winner = match trusted {
                Some(version) => version,
                None => {
                    if let Some(vid) = pointer {
                        debug!(comment_id = %id, version_id = %vid, "stored pointer is stale");
                    }
                    candidates.sort_by(|a, b| {
                        b.retrieved_utc
                            .cmp(&a.retrieved_utc)
                            .then_with(|| b.version_id.cmp(&a.version_id))
                    });
                    if candidates.is_empty() {
                        continue;
                    }
                    candidates.remove(0)
                }
            };

            let strays: Vec<VersionId> = candidates
                .iter()
                .map(|v| v.version_id)
                .filter(|vid| *vid != winner.version_id)
                .collect();
            if !strays.is_empty() {
                warn!(
                    comment_id = %id,
                    extra = strays.len(),
                    "several versions flagged latest; keeping one"
                );
                state.stray_latest.insert(id.clone(), strays);
            }
            state.latest.insert(id.clone(), winner);
        }

        info!(
            requested = ids.len(),
            known = state.comments.len(),
            baselines = state.latest.len(),
            repaired = state.repaired_count(),
            "existing state loaded"
        );
        Ok(state)
    }

    /// Every version flagged latest for `comment_ids`, grouped by comment. A
    /// trusted pointer does not rule out a second flagged row.
    async fn flagged_latest(&self, comment_ids: &[String]) -> Result<HashMap<String, Vec<ExistingVersion>>, StoreError> {
        let mut flagged: HashMap<String, Vec<ExistingVersion>> = HashMap::new();
        for chunk in comment_ids.chunks(self.page_size) {
            let found = with_retry(&self.retry, "get_latest_versions_by_comment", || {
                self.store.get_latest_versions_by_comment(chunk)
            })
            .await?;
            for version in found {
                flagged.entry(version.comment_id.clone()).or_default().push(version);
            }
        }
        Ok(flagged)
    }
}
