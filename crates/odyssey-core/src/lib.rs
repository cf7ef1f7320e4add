//! Core data model for the Odyssey comment mirror.
//!
//! Everything here is plain data: snapshots handed over by a source, the
//! read-only projections of stored state, and the rows the write applier sends
//! to a store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "odyssey-core";

/// Bodies the forum substitutes once a comment is gone.
pub const DELETED_MARKERS: [&str; 2] = ["[deleted]", "[removed]"];

/// Upper bound on the error text stored in a run log row.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 8000;

/// Store-assigned identity of a version row.
pub type VersionId = Uuid;

pub fn is_deleted_marker(body: &str) -> bool {
    DELETED_MARKERS.contains(&body)
}

/// Reference to a thread (submission) produced by a source listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub thread_id: String,
    #[serde(default)]
    pub title: String,
}

/// Flat, fully normalized view of one comment as observed by a source.
///
/// Nothing in here points back into a client library: `raw_payload` is an owned
/// JSON value so the snapshot can be archived and replayed as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentSnapshot {
    pub comment_id: String,
    pub thread_id: String,
    pub parent_comment_id: Option<String>,
    pub author_username: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub body_text: String,
    pub edited_utc: Option<DateTime<Utc>>,
    pub score: Option<i64>,
    pub permalink: Option<String>,
    pub is_deleted: bool,
    #[serde(default)]
    pub raw_payload: JsonValue,
}

impl CommentSnapshot {
    /// True when the snapshot shows any sign of deletion, whether or not the
    /// source already set `is_deleted`.
    pub fn observed_deleted(&self) -> bool {
        self.is_deleted || self.author_username.is_none() || is_deleted_marker(&self.body_text)
    }
}

/// Last known state of a stored comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingComment {
    pub comment_id: String,
    pub latest_version_id: Option<VersionId>,
    pub is_deleted: bool,
}

/// Stored version row as seen by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingVersion {
    pub version_id: VersionId,
    pub comment_id: String,
    pub body_text: String,
    pub retrieved_utc: DateTime<Utc>,
    pub is_latest: bool,
}

/// Metadata upsert for a comment. Deliberately has no latest-version field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRow {
    pub comment_id: String,
    pub thread_id: String,
    pub parent_comment_id: Option<String>,
    pub author_username: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub score: Option<i64>,
    pub permalink: Option<String>,
    pub is_deleted: bool,
    pub raw_payload: JsonValue,
    pub last_seen_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVersion {
    pub comment_id: String,
    pub body_text: String,
    pub edited_utc: Option<DateTime<Utc>>,
    pub retrieved_utc: DateTime<Utc>,
    pub is_latest: bool,
}

/// A version row as returned by the store after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedVersion {
    pub version_id: VersionId,
    pub comment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LatestPointer {
    pub comment_id: String,
    pub version_id: VersionId,
}

impl From<&InsertedVersion> for LatestPointer {
    fn from(v: &InsertedVersion) -> Self {
        Self {
            comment_id: v.comment_id.clone(),
            version_id: v.version_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Initial,
    Scheduled,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Initial => "initial",
            RunType::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initial" => Ok(RunType::Initial),
            "scheduled" => Ok(RunType::Scheduled),
            other => Err(format!("unknown run type `{other}` (expected initial|scheduled)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

/// Append-only audit row, one per run attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_type: RunType,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub number_of_comments_processed: u64,
    pub logged_at: DateTime<Utc>,
}

impl RunLogEntry {
    pub fn success(run_type: RunType, processed: u64, logged_at: DateTime<Utc>) -> Self {
        Self {
            run_type,
            status: RunStatus::Success,
            error_message: None,
            number_of_comments_processed: processed,
            logged_at,
        }
    }

    pub fn failure(
        run_type: RunType,
        error_message: &str,
        processed: u64,
        logged_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_type,
            status: RunStatus::Failure,
            error_message: Some(truncate_chars(error_message, MAX_ERROR_MESSAGE_CHARS)),
            number_of_comments_processed: processed,
            logged_at,
        }
    }
}

/// Truncate on a char boundary.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}
