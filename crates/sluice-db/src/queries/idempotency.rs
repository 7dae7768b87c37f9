//! Database query functions for the `idempotency_cache` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{AssetMap, IdempotencyEntry};

/// Look up a cache entry. A hit requires the task id and code version to
/// match and the entry to be unexpired.
pub async fn lookup(
    pool: &PgPool,
    cache_key: &str,
    task_id: &str,
    code_version: i32,
) -> Result<Option<IdempotencyEntry>> {
    let entry = sqlx::query_as::<_, IdempotencyEntry>(
        "SELECT * FROM idempotency_cache \
         WHERE cache_key = $1 AND task_id = $2 AND code_version = $3 \
           AND expires_at > NOW()",
    )
    .bind(cache_key)
    .bind(task_id)
    .bind(code_version)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to look up idempotency cache for task {task_id}"))?;

    Ok(entry)
}

/// Upsert a cache entry for a successful output.
#[allow(clippy::too_many_arguments)]
pub async fn upsert(
    pool: &PgPool,
    cache_key: &str,
    task_id: &str,
    code_version: i32,
    output_path: &str,
    output_size: Option<i64>,
    assets: Option<&AssetMap>,
    run_id: &str,
    ttl_seconds: i64,
) -> Result<IdempotencyEntry> {
    let entry = sqlx::query_as::<_, IdempotencyEntry>(
        "INSERT INTO idempotency_cache \
         (cache_key, task_id, code_version, output_path, output_size, assets, run_id, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW() + $8 * INTERVAL '1 second') \
         ON CONFLICT (cache_key) DO UPDATE \
         SET code_version = EXCLUDED.code_version, \
             output_path = EXCLUDED.output_path, \
             output_size = EXCLUDED.output_size, \
             assets = EXCLUDED.assets, \
             run_id = EXCLUDED.run_id, \
             inserted_at = NOW(), \
             expires_at = EXCLUDED.expires_at \
         RETURNING *",
    )
    .bind(cache_key)
    .bind(task_id)
    .bind(code_version)
    .bind(output_path)
    .bind(output_size)
    .bind(assets.map(Json))
    .bind(run_id)
    .bind(ttl_seconds)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert idempotency cache for task {task_id}"))?;

    Ok(entry)
}

/// Drop expired entries. Returns the number deleted.
pub async fn delete_expired(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM idempotency_cache WHERE expires_at <= NOW()")
        .execute(pool)
        .await
        .context("failed to delete expired idempotency entries")?;

    Ok(result.rows_affected())
}
