//! PostgreSQL store over the `odyssey_*` tables.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odyssey_core::{
    CommentRow, ExistingComment, ExistingVersion, InsertedVersion, LatestPointer, NewVersion,
    RunLogEntry, VersionId,
};
use serde_json::Value as JsonValue;
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{CommentStore, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::ConstraintViolation(db.message().to_string()),
                _ => {
                    // 08xxx connection exceptions, 53xxx resource exhaustion,
                    // 57P0x operator intervention (restarts, shutdowns).
                    let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                    if code.starts_with("08") || code.starts_with("53") || code.starts_with("57P") {
                        StoreError::Transient(err.to_string())
                    } else {
                        StoreError::Unrecoverable(err.to_string())
                    }
                }
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            _ => StoreError::Unrecoverable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying odyssey migrations")?;
        info!("migrations applied");
        Ok(())
    }
}

fn version_from_row(row: &PgRow) -> Result<ExistingVersion, sqlx::Error> {
    Ok(ExistingVersion {
        version_id: row.try_get("version_id")?,
        comment_id: row.try_get("comment_id")?,
        body_text: row.try_get::<Option<String>, _>("body_text")?.unwrap_or_default(),
        retrieved_utc: row.try_get("retrieved_utc")?,
        is_latest: row.try_get("is_latest")?,
    })
}

#[async_trait]
impl CommentStore for PgStore {
    async fn get_comments(
        &self,
        comment_ids: &[String],
    ) -> Result<HashMap<String, ExistingComment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT comment_id, latest_version_id, is_deleted
              FROM odyssey_comments
             WHERE comment_id = ANY($1)
            "#,
        )
        .bind(comment_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let comment_id: String = row.try_get("comment_id")?;
            out.insert(
                comment_id.clone(),
                ExistingComment {
                    comment_id,
                    latest_version_id: row.try_get::<Option<Uuid>, _>("latest_version_id")?,
                    is_deleted: row.try_get::<Option<bool>, _>("is_deleted")?.unwrap_or(false),
                },
            );
        }
        Ok(out)
    }

    async fn get_versions(
        &self,
        version_ids: &[VersionId],
    ) -> Result<HashMap<VersionId, ExistingVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT version_id, comment_id, body_text, retrieved_utc, is_latest
              FROM odyssey_comment_versions
             WHERE version_id = ANY($1)
            "#,
        )
        .bind(version_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let version = version_from_row(row)?;
            out.insert(version.version_id, version);
        }
        Ok(out)
    }

    async fn get_latest_versions_by_comment(
        &self,
        comment_ids: &[String],
    ) -> Result<Vec<ExistingVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT version_id, comment_id, body_text, retrieved_utc, is_latest
              FROM odyssey_comment_versions
             WHERE comment_id = ANY($1)
               AND is_latest
            "#,
        )
        .bind(comment_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| version_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn upsert_comments(&self, rows: &[CommentRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let comment_ids: Vec<String> = rows.iter().map(|r| r.comment_id.clone()).collect();
        let thread_ids: Vec<String> = rows.iter().map(|r| r.thread_id.clone()).collect();
        let parents: Vec<Option<String>> = rows.iter().map(|r| r.parent_comment_id.clone()).collect();
        let authors: Vec<Option<String>> = rows.iter().map(|r| r.author_username.clone()).collect();
        let created: Vec<DateTime<Utc>> = rows.iter().map(|r| r.created_utc).collect();
        let scores: Vec<Option<i64>> = rows.iter().map(|r| r.score).collect();
        let permalinks: Vec<Option<String>> = rows.iter().map(|r| r.permalink.clone()).collect();
        let deleted: Vec<bool> = rows.iter().map(|r| r.is_deleted).collect();
        let raw: Vec<JsonValue> = rows.iter().map(|r| r.raw_payload.clone()).collect();
        let last_seen: Vec<DateTime<Utc>> = rows.iter().map(|r| r.last_seen_utc).collect();

        // latest_version_id is absent on purpose: only the pointer step writes it.
        sqlx::query(
            r#"
            INSERT INTO odyssey_comments (
                comment_id, thread_id, parent_comment_id, author_username, created_utc,
                score, permalink, is_deleted, raw_comment_json, last_seen_utc
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::text[], $5::timestamptz[],
                $6::bigint[], $7::text[], $8::bool[], $9::jsonb[], $10::timestamptz[]
            )
            ON CONFLICT (comment_id) DO UPDATE SET
                thread_id = EXCLUDED.thread_id,
                parent_comment_id = EXCLUDED.parent_comment_id,
                author_username = EXCLUDED.author_username,
                created_utc = EXCLUDED.created_utc,
                score = EXCLUDED.score,
                permalink = EXCLUDED.permalink,
                is_deleted = odyssey_comments.is_deleted OR EXCLUDED.is_deleted,
                raw_comment_json = EXCLUDED.raw_comment_json,
                last_seen_utc = EXCLUDED.last_seen_utc
            "#,
        )
        .bind(&comment_ids)
        .bind(&thread_ids)
        .bind(&parents)
        .bind(&authors)
        .bind(&created)
        .bind(&scores)
        .bind(&permalinks)
        .bind(&deleted)
        .bind(&raw)
        .bind(&last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_versions_not_latest(&self, version_ids: &[VersionId]) -> Result<(), StoreError> {
        if version_ids.is_empty() {
            return Ok(());
        }
        let result = sqlx::query(
            r#"
            UPDATE odyssey_comment_versions
               SET is_latest = FALSE
             WHERE version_id = ANY($1)
            "#,
        )
        .bind(version_ids)
        .execute(&self.pool)
        .await?;
        debug!(requested = version_ids.len(), demoted = result.rows_affected(), "versions demoted");
        Ok(())
    }

    async fn insert_versions(&self, rows: &[NewVersion]) -> Result<Vec<InsertedVersion>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let comment_ids: Vec<String> = rows.iter().map(|r| r.comment_id.clone()).collect();
        let bodies: Vec<String> = rows.iter().map(|r| r.body_text.clone()).collect();
        let edited: Vec<Option<DateTime<Utc>>> = rows.iter().map(|r| r.edited_utc).collect();
        let retrieved: Vec<DateTime<Utc>> = rows.iter().map(|r| r.retrieved_utc).collect();
        let latest: Vec<bool> = rows.iter().map(|r| r.is_latest).collect();

        let inserted = sqlx::query(
            r#"
            INSERT INTO odyssey_comment_versions (
                comment_id, body_text, edited_utc, retrieved_utc, is_latest
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::timestamptz[], $4::timestamptz[], $5::bool[]
            )
            RETURNING version_id, comment_id
            "#,
        )
        .bind(&comment_ids)
        .bind(&bodies)
        .bind(&edited)
        .bind(&retrieved)
        .bind(&latest)
        .fetch_all(&self.pool)
        .await?;

        inserted
            .iter()
            .map(|row| {
                Ok(InsertedVersion {
                    version_id: row.try_get("version_id")?,
                    comment_id: row.try_get("comment_id")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn upsert_latest_pointers(&self, pointers: &[LatestPointer]) -> Result<(), StoreError> {
        if pointers.is_empty() {
            return Ok(());
        }
        let comment_ids: Vec<String> = pointers.iter().map(|p| p.comment_id.clone()).collect();
        let version_ids: Vec<Uuid> = pointers.iter().map(|p| p.version_id).collect();

        // The batch never inserts; it must match every pointer row or roll back.
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE odyssey_comments AS c
               SET latest_version_id = p.version_id
              FROM UNNEST($1::text[], $2::uuid[]) AS p (comment_id, version_id)
             WHERE c.comment_id = p.comment_id
            "#,
        )
        .bind(&comment_ids)
        .bind(&version_ids)
        .execute(&mut *tx)
        .await?;

        let updated = result.rows_affected();
        if updated != pointers.len() as u64 {
            tx.rollback().await?;
            return Err(StoreError::ConstraintViolation(format!(
                "latest pointer batch matched {updated} of {} comment rows",
                pointers.len()
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_latest_pointer(&self, pointer: &LatestPointer) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE odyssey_comments
               SET latest_version_id = $2
             WHERE comment_id = $1
            "#,
        )
        .bind(&pointer.comment_id)
        .bind(pointer.version_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO odyssey_logs (
                run_type, status, error_message, number_of_comments_processed, created_at
            )
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.run_type.as_str())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(i64::try_from(entry.number_of_comments_processed).unwrap_or(i64::MAX))
        .bind(entry.logged_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
