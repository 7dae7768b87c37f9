//! Database query functions for the `dlq_items` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::DlqItem;

/// Parameters for inserting a new dead-letter row.
#[derive(Debug, Clone)]
pub struct NewDlqItem {
    pub id: String,
    pub task_run_id: String,
    pub task_id: String,
    pub pipeline_run_id: Option<String>,
    pub code_version: i32,
    pub code_hash: String,
    pub error: String,
    pub error_code: Option<String>,
    pub attempts: i32,
    pub input_path: String,
}

/// Insert a dead-letter item snapshotting the exhausted run.
pub async fn insert_dlq_item(pool: &PgPool, new: &NewDlqItem) -> Result<DlqItem> {
    let item = sqlx::query_as::<_, DlqItem>(
        "INSERT INTO dlq_items \
         (id, task_run_id, task_id, pipeline_run_id, code_version, code_hash, \
          error, error_code, attempts, input_path) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.task_run_id)
    .bind(&new.task_id)
    .bind(&new.pipeline_run_id)
    .bind(new.code_version)
    .bind(&new.code_hash)
    .bind(&new.error)
    .bind(&new.error_code)
    .bind(new.attempts)
    .bind(&new.input_path)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert DLQ item {}", new.id))?;

    Ok(item)
}

/// Fetch a single DLQ item by ID.
pub async fn get_dlq_item(pool: &PgPool, id: &str) -> Result<Option<DlqItem>> {
    let item = sqlx::query_as::<_, DlqItem>("SELECT * FROM dlq_items WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch DLQ item {id}"))?;

    Ok(item)
}

/// Filters for listing DLQ items. All fields are optional and combine with
/// AND.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub task_id: Option<String>,
    pub pipeline_run_id: Option<String>,
    pub failed_after: Option<DateTime<Utc>>,
    pub failed_before: Option<DateTime<Utc>>,
}

/// List DLQ items matching a filter, newest failures first.
pub async fn list_dlq_items(pool: &PgPool, filter: &DlqFilter, limit: i64) -> Result<Vec<DlqItem>> {
    let items = sqlx::query_as::<_, DlqItem>(
        "SELECT * FROM dlq_items \
         WHERE ($1::text IS NULL OR task_id = $1) \
           AND ($2::text IS NULL OR pipeline_run_id = $2) \
           AND ($3::timestamptz IS NULL OR failed_at >= $3) \
           AND ($4::timestamptz IS NULL OR failed_at <= $4) \
         ORDER BY failed_at DESC \
         LIMIT $5",
    )
    .bind(&filter.task_id)
    .bind(&filter.pipeline_run_id)
    .bind(filter.failed_after)
    .bind(filter.failed_before)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list DLQ items")?;

    Ok(items)
}

/// Stamp `retried_at` on a DLQ item when a manual replay is issued.
pub async fn mark_retried(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE dlq_items SET retried_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to mark DLQ item {id} retried"))?;

    Ok(result.rows_affected())
}

/// Delete items that failed before the retention horizon. Returns the
/// number of rows purged.
pub async fn purge_older_than(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM dlq_items WHERE failed_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to purge DLQ items")?;

    Ok(result.rows_affected())
}

/// Number of items dead-lettered within a time window.
pub async fn count_in_window(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM dlq_items WHERE failed_at >= $1 AND failed_at < $2",
    )
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await
    .context("failed to count DLQ items in window")?;

    Ok(row.0)
}
