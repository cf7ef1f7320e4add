//! Pure reconciliation: (snapshots, existing state) -> write plan.
//!
//! Nothing here touches the store. The plan is order-independent per comment;
//! the write applier alone decides the order in which it reaches the store.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use odyssey_core::{
    CommentRow, CommentSnapshot, ExistingComment, ExistingVersion, LatestPointer, NewVersion, VersionId,
};
use serde::Serialize;

use crate::loader::ExistingState;

/// What happens to the version history of one observed comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionDecision {
    /// No version on file yet; history starts now, deleted or not.
    InsertFirst,
    /// Deleted now or before; the last known body stays as it is.
    KeepDeleted,
    /// A pointer exists but its body could not be found.
    InsertWithoutBaseline,
    /// Body differs from the latest version.
    Edit,
    Unchanged,
}

impl VersionDecision {
    pub fn inserts(self) -> bool {
        matches!(
            self,
            VersionDecision::InsertFirst | VersionDecision::InsertWithoutBaseline | VersionDecision::Edit
        )
    }
}

/// Decide the version outcome for one snapshot.
pub fn decide(
    snapshot: &CommentSnapshot,
    existing: Option<&ExistingComment>,
    latest: Option<&ExistingVersion>,
) -> VersionDecision {
    let Some(existing) = existing else {
        return VersionDecision::InsertFirst;
    };
    if existing.latest_version_id.is_none() && latest.is_none() {
        return VersionDecision::InsertFirst;
    }
    if snapshot.observed_deleted() || existing.is_deleted {
        return VersionDecision::KeepDeleted;
    }
    match latest {
        None => VersionDecision::InsertWithoutBaseline,
        Some(version) if version.body_text != snapshot.body_text => VersionDecision::Edit,
        Some(_) => VersionDecision::Unchanged,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WritePlan {
    pub comment_rows: Vec<CommentRow>,
    pub version_inserts: Vec<NewVersion>,
    pub version_ids_to_demote: Vec<VersionId>,
    /// Pointers to re-point at an existing version (no insert involved).
    pub pointer_repairs: Vec<LatestPointer>,
    #[serde(skip)]
    pub decisions: HashMap<VersionDecision, usize>,
}

impl WritePlan {
    /// True when the plan would change no version row and no pointer.
    /// Metadata rows are refreshed on every run and do not count.
    pub fn is_empty(&self) -> bool {
        self.version_inserts.is_empty() && self.version_ids_to_demote.is_empty() && self.pointer_repairs.is_empty()
    }

    pub fn decision_count(&self, decision: VersionDecision) -> usize {
        self.decisions.get(&decision).copied().unwrap_or(0)
    }
}

/// Build the write plan for one run. Duplicate snapshots of the same comment
/// collapse to the last one observed.
pub fn reconcile(snapshots: &[CommentSnapshot], existing: &ExistingState, now: DateTime<Utc>) -> WritePlan {
    let mut plan = WritePlan::default();
    let mut demoted: HashSet<VersionId> = HashSet::new();

    for snapshot in latest_observations(snapshots) {
        let id = snapshot.comment_id.as_str();
        let comment = existing.comment(id);
        let latest = existing.latest_version(id);
        let decision = decide(snapshot, comment, latest);
        *plan.decisions.entry(decision).or_default() += 1;

        plan.comment_rows.push(CommentRow {
            comment_id: snapshot.comment_id.clone(),
            thread_id: snapshot.thread_id.clone(),
            parent_comment_id: snapshot.parent_comment_id.clone(),
            author_username: snapshot.author_username.clone(),
            created_utc: snapshot.created_utc,
            score: snapshot.score,
            permalink: snapshot.permalink.clone(),
            is_deleted: snapshot.observed_deleted() || comment.map(|c| c.is_deleted).unwrap_or(false),
            raw_payload: snapshot.raw_payload.clone(),
            last_seen_utc: now,
        });

        let mut demote = |vid: VersionId, plan: &mut WritePlan| {
            if demoted.insert(vid) {
                plan.version_ids_to_demote.push(vid);
            }
        };
        for vid in existing.stray_latest(id) {
            demote(*vid, &mut plan);
        }

        if decision.inserts() {
            if let Some(version) = latest {
                demote(version.version_id, &mut plan);
            }
            // Without a baseline the stored pointer may still name a latest row.
            if let Some(vid) = comment.and_then(|c| c.latest_version_id) {
                if latest.map(|v| v.version_id) != Some(vid) {
                    demote(vid, &mut plan);
                }
            }
            plan.version_inserts.push(NewVersion {
                comment_id: snapshot.comment_id.clone(),
                body_text: snapshot.body_text.clone(),
                edited_utc: snapshot.edited_utc,
                retrieved_utc: now,
                is_latest: true,
            });
        } else if let (Some(version), Some(comment)) = (latest, comment) {
            if comment.latest_version_id != Some(version.version_id) {
                plan.pointer_repairs.push(LatestPointer {
                    comment_id: snapshot.comment_id.clone(),
                    version_id: version.version_id,
                });
            }
        }
    }

    plan
}

/// Snapshots deduplicated by comment id, keeping the first position and the
/// last payload.
fn latest_observations(snapshots: &[CommentSnapshot]) -> Vec<&CommentSnapshot> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut unique: Vec<&CommentSnapshot> = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        match index.get(snapshot.comment_id.as_str()) {
            Some(&slot) => unique[slot] = snapshot,
            None => {
                index.insert(snapshot.comment_id.as_str(), unique.len());
                unique.push(snapshot);
            }
        }
    }
    unique
}
