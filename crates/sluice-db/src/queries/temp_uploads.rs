//! Database query functions for the `temp_uploads` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::TempUpload;

/// Insert a freshly registered upload.
#[allow(clippy::too_many_arguments)]
pub async fn insert_temp_upload(
    pool: &PgPool,
    id: &str,
    storage_path: &str,
    storage_backend_id: &str,
    original_filename: &str,
    mime_type: &str,
    size_bytes: i64,
    ttl_seconds: i64,
) -> Result<TempUpload> {
    let upload = sqlx::query_as::<_, TempUpload>(
        "INSERT INTO temp_uploads \
         (id, storage_path, storage_backend_id, original_filename, mime_type, size_bytes, \
          expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, NOW() + $7 * INTERVAL '1 second') \
         RETURNING *",
    )
    .bind(id)
    .bind(storage_path)
    .bind(storage_backend_id)
    .bind(original_filename)
    .bind(mime_type)
    .bind(size_bytes)
    .bind(ttl_seconds)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert temp upload {id}"))?;

    Ok(upload)
}

/// Fetch a single temp upload by ID.
pub async fn get_temp_upload(pool: &PgPool, id: &str) -> Result<Option<TempUpload>> {
    let upload = sqlx::query_as::<_, TempUpload>("SELECT * FROM temp_uploads WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch temp upload {id}"))?;

    Ok(upload)
}

/// Claim an upload for a run. The conditional `WHERE claimed_by_run_id IS
/// NULL` guarantees at most one claimant; returns the number of rows
/// claimed (0 = already claimed or unknown id).
pub async fn claim_for_run(pool: &PgPool, upload_id: &str, run_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE temp_uploads \
         SET claimed_by_run_id = $2 \
         WHERE id = $1 AND claimed_by_run_id IS NULL AND deleted_at IS NULL",
    )
    .bind(upload_id)
    .bind(run_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to claim temp upload {upload_id}"))?;

    Ok(result.rows_affected())
}

/// Expired, unclaimed, not-yet-deleted uploads, oldest first, capped per
/// sweep batch.
pub async fn select_expired_unclaimed(pool: &PgPool, limit: i64) -> Result<Vec<TempUpload>> {
    let uploads = sqlx::query_as::<_, TempUpload>(
        "SELECT * FROM temp_uploads \
         WHERE expires_at < NOW() AND claimed_by_run_id IS NULL AND deleted_at IS NULL \
         ORDER BY expires_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to select expired temp uploads")?;

    Ok(uploads)
}

/// Mark an upload's blob as deleted.
pub async fn mark_deleted(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE temp_uploads SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark temp upload {id} deleted"))?;

    Ok(result.rows_affected())
}

/// Drop rows whose blob was deleted more than `retention_days` ago.
pub async fn purge_archived(pool: &PgPool, retention_days: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM temp_uploads \
         WHERE deleted_at IS NOT NULL \
           AND deleted_at < NOW() - $1 * INTERVAL '1 day'",
    )
    .bind(retention_days)
    .execute(pool)
    .await
    .context("failed to purge archived temp uploads")?;

    Ok(result.rows_affected())
}
