//! Database query functions for the `statistics_buckets` table and the raw
//! sample queries the aggregator builds buckets from.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{BucketSize, PipelineRunStatus, StatisticsBucket, StatsScope, TaskRunStatus};

/// Scope restriction applied to sample queries. At most one field is set;
/// all-`None` means system scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeFilter {
    pub task_id: Option<String>,
    pub service_id: Option<String>,
    pub pipeline_id: Option<String>,
}

/// One task run's contribution to a bucket.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRunSample {
    pub status: TaskRunStatus,
    pub attempt: i32,
    pub error_code: Option<String>,
    pub runtime_ms: Option<f64>,
    pub wait_ms: Option<f64>,
}

/// Task runs created within `[from, to)`, restricted by scope.
pub async fn task_run_samples(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    filter: &ScopeFilter,
) -> Result<Vec<TaskRunSample>> {
    let samples = sqlx::query_as::<_, TaskRunSample>(
        "SELECT status, attempt, error_code, \
                CASE WHEN completed_at IS NOT NULL AND started_at IS NOT NULL \
                     THEN (EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0)::float8 \
                END AS runtime_ms, \
                CASE WHEN started_at IS NOT NULL \
                     THEN (EXTRACT(EPOCH FROM (started_at - created_at)) * 1000.0)::float8 \
                END AS wait_ms \
         FROM task_runs \
         WHERE created_at >= $1 AND created_at < $2 \
           AND ($3::text IS NULL OR task_id = $3) \
           AND ($4::text IS NULL OR \
                task_id IN (SELECT id FROM task_defs WHERE service_id = $4)) \
           AND ($5::text IS NULL OR \
                pipeline_run_id IN (SELECT id FROM pipeline_runs WHERE pipeline_id = $5))",
    )
    .bind(from)
    .bind(to)
    .bind(&filter.task_id)
    .bind(&filter.service_id)
    .bind(&filter.pipeline_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch task run samples")?;

    Ok(samples)
}

/// One pipeline run's contribution to a bucket.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunSample {
    pub status: PipelineRunStatus,
    pub runtime_ms: Option<f64>,
}

/// Pipeline runs created within `[from, to)`, restricted by scope.
pub async fn pipeline_run_samples(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    filter: &ScopeFilter,
) -> Result<Vec<PipelineRunSample>> {
    let samples = sqlx::query_as::<_, PipelineRunSample>(
        "SELECT status, \
                CASE WHEN completed_at IS NOT NULL AND started_at IS NOT NULL \
                     THEN (EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0)::float8 \
                END AS runtime_ms \
         FROM pipeline_runs \
         WHERE created_at >= $1 AND created_at < $2 \
           AND ($3::text IS NULL OR pipeline_id = $3)",
    )
    .bind(from)
    .bind(to)
    .bind(&filter.pipeline_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch pipeline run samples")?;

    Ok(samples)
}

/// Reconstructed queue depths at a point in time: runs that existed but had
/// not started, and runs that had started but not finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthsAt {
    pub queued: i64,
    pub running: i64,
}

/// Queue depths as of `at`, reconstructed from run timestamps so historical
/// buckets stay stable.
pub async fn queue_depths_at(
    pool: &PgPool,
    at: DateTime<Utc>,
    filter: &ScopeFilter,
) -> Result<DepthsAt> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT \
           COUNT(*) FILTER (WHERE started_at IS NULL OR started_at > $1), \
           COUNT(*) FILTER (WHERE started_at IS NOT NULL AND started_at <= $1) \
         FROM task_runs \
         WHERE created_at <= $1 \
           AND (completed_at IS NULL OR completed_at > $1) \
           AND ($2::text IS NULL OR task_id = $2) \
           AND ($3::text IS NULL OR \
                task_id IN (SELECT id FROM task_defs WHERE service_id = $3)) \
           AND ($4::text IS NULL OR \
                pipeline_run_id IN (SELECT id FROM pipeline_runs WHERE pipeline_id = $4))",
    )
    .bind(at)
    .bind(&filter.task_id)
    .bind(&filter.service_id)
    .bind(&filter.pipeline_id)
    .fetch_one(pool)
    .await
    .context("failed to reconstruct queue depths")?;

    Ok(DepthsAt {
        queued: row.0,
        running: row.1,
    })
}

/// Fetch one persisted bucket.
pub async fn get_bucket(
    pool: &PgPool,
    bucket_ts: DateTime<Utc>,
    bucket_size: BucketSize,
    scope: StatsScope,
    scope_id: &str,
) -> Result<Option<StatisticsBucket>> {
    let bucket = sqlx::query_as::<_, StatisticsBucket>(
        "SELECT * FROM statistics_buckets \
         WHERE bucket_ts = $1 AND bucket_size = $2 AND scope = $3 AND scope_id = $4",
    )
    .bind(bucket_ts)
    .bind(bucket_size)
    .bind(scope)
    .bind(scope_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch statistics bucket")?;

    Ok(bucket)
}

/// Upsert a bucket row after a (re)build.
pub async fn upsert_bucket(
    pool: &PgPool,
    bucket_ts: DateTime<Utc>,
    bucket_size: BucketSize,
    scope: StatsScope,
    scope_id: &str,
    data: &serde_json::Value,
    is_complete: bool,
) -> Result<StatisticsBucket> {
    let bucket = sqlx::query_as::<_, StatisticsBucket>(
        "INSERT INTO statistics_buckets \
         (bucket_ts, bucket_size, scope, scope_id, data, is_complete, last_built_at) \
         VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
         ON CONFLICT (bucket_ts, bucket_size, scope, scope_id) DO UPDATE \
         SET data = EXCLUDED.data, \
             is_complete = EXCLUDED.is_complete, \
             last_built_at = NOW() \
         RETURNING *",
    )
    .bind(bucket_ts)
    .bind(bucket_size)
    .bind(scope)
    .bind(scope_id)
    .bind(data)
    .bind(is_complete)
    .fetch_one(pool)
    .await
    .context("failed to upsert statistics bucket")?;

    Ok(bucket)
}
