//! Database query functions for the `pipeline_runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{FailureMode, PipelineRun, PipelineRunStatus, StructureSnapshot};

/// Parameters for inserting a new pipeline run row.
#[derive(Debug, Clone)]
pub struct NewPipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub failure_mode: FailureMode,
    pub input_path: String,
    pub structure: StructureSnapshot,
    pub pipeline_version: String,
    pub priority: Option<i32>,
    pub metadata: serde_json::Value,
}

/// Insert a new pipeline run with status `pending`.
pub async fn insert_pipeline_run(pool: &PgPool, new: &NewPipelineRun) -> Result<PipelineRun> {
    let run = sqlx::query_as::<_, PipelineRun>(
        "INSERT INTO pipeline_runs \
         (id, pipeline_id, failure_mode, input_path, structure, pipeline_version, \
          priority, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.pipeline_id)
    .bind(new.failure_mode)
    .bind(&new.input_path)
    .bind(Json(&new.structure))
    .bind(&new.pipeline_version)
    .bind(new.priority)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert pipeline run {}", new.id))?;

    Ok(run)
}

/// Fetch a single pipeline run by ID.
pub async fn get_pipeline_run(pool: &PgPool, id: &str) -> Result<Option<PipelineRun>> {
    let run = sqlx::query_as::<_, PipelineRun>("SELECT * FROM pipeline_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch pipeline run {id}"))?;

    Ok(run)
}

/// Transition `pending -> running` once the first task run is dispatched.
/// Zero rows affected means another dispatch got there first; that is fine.
pub async fn mark_running(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = 'running', started_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark pipeline run {id} running"))?;

    Ok(result.rows_affected())
}

/// Move a pipeline run into a terminal status. Guarded against double
/// finishing: only pending/running rows are updated.
pub async fn finish(
    pool: &PgPool,
    id: &str,
    status: PipelineRunStatus,
    error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = $2, error = $3, completed_at = NOW() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .bind(status)
    .bind(error)
    .execute(pool)
    .await
    .with_context(|| format!("failed to finish pipeline run {id}"))?;

    Ok(result.rows_affected())
}

/// Recent runs of one pipeline, newest first.
pub async fn list_runs_for_pipeline(
    pool: &PgPool,
    pipeline_id: &str,
    limit: i64,
) -> Result<Vec<PipelineRun>> {
    let runs = sqlx::query_as::<_, PipelineRun>(
        "SELECT * FROM pipeline_runs WHERE pipeline_id = $1 \
         ORDER BY created_at DESC LIMIT $2",
    )
    .bind(pipeline_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list runs for pipeline {pipeline_id}"))?;

    Ok(runs)
}
