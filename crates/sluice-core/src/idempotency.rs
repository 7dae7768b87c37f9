//! Idempotency cache: opt-in deduplication of successful task outputs.
//!
//! The cache key is `SHA-256(task_id + ":" + user_key)`; the user key is a
//! free-form string produced by the worker's configured key function. A hit
//! requires the task id and code version to match and the entry to be
//! unexpired. Only `completed` runs with a non-null output path are cached.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use sluice_db::models::AssetMap;
use sluice_db::queries::idempotency as cache_db;

/// Final cache key for a `(task, user key)` pair.
pub fn cache_key(task_id: &str, user_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(b":");
    hasher.update(user_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// A cached output usable in place of a fresh execution.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub output_path: String,
    pub output_size: Option<i64>,
    pub assets: Option<AssetMap>,
    /// The run that originally produced the output.
    pub run_id: String,
}

/// Look up a cached result for `(task, user key, code version)`.
pub async fn lookup(
    pool: &PgPool,
    task_id: &str,
    user_key: &str,
    code_version: i32,
) -> Result<Option<CachedResult>> {
    let key = cache_key(task_id, user_key);
    let entry = cache_db::lookup(pool, &key, task_id, code_version).await?;
    Ok(entry.map(|e| CachedResult {
        output_path: e.output_path,
        output_size: e.output_size,
        assets: e.assets.map(|a| a.0),
        run_id: e.run_id,
    }))
}

/// Store a successful output under `(task, user key)` for `ttl_seconds`.
#[allow(clippy::too_many_arguments)]
pub async fn cache_result(
    pool: &PgPool,
    task_id: &str,
    user_key: &str,
    run_id: &str,
    code_version: i32,
    output_path: &str,
    output_size: Option<i64>,
    assets: Option<&AssetMap>,
    ttl_seconds: i64,
) -> Result<()> {
    let key = cache_key(task_id, user_key);
    cache_db::upsert(
        pool,
        &key,
        task_id,
        code_version,
        output_path,
        output_size,
        assets,
        run_id,
        ttl_seconds,
    )
    .await?;
    tracing::debug!(task_id, run_id, ttl_seconds, "cached task output");
    Ok(())
}
