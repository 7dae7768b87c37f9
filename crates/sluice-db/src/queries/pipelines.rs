//! Database query functions for the `pipelines` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::Pipeline;

/// Insert or replace a pipeline definition.
pub async fn upsert_pipeline(
    pool: &PgPool,
    id: &str,
    name: &str,
    entry_task_ids: &[String],
    pipeline_version: &str,
    description: &str,
) -> Result<Pipeline> {
    let pipeline = sqlx::query_as::<_, Pipeline>(
        "INSERT INTO pipelines (id, name, entry_task_ids, pipeline_version, description) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE \
         SET name = EXCLUDED.name, \
             entry_task_ids = EXCLUDED.entry_task_ids, \
             pipeline_version = EXCLUDED.pipeline_version, \
             description = EXCLUDED.description, \
             updated_at = NOW() \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(Json(entry_task_ids))
    .bind(pipeline_version)
    .bind(description)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert pipeline {id}"))?;

    Ok(pipeline)
}

/// Fetch a single pipeline by ID.
pub async fn get_pipeline(pool: &PgPool, id: &str) -> Result<Option<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch pipeline {id}"))?;

    Ok(pipeline)
}

/// List all pipeline definitions, ordered by id.
pub async fn list_pipelines(pool: &PgPool) -> Result<Vec<Pipeline>> {
    let pipelines = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines ORDER BY id")
        .fetch_all(pool)
        .await
        .context("failed to list pipelines")?;

    Ok(pipelines)
}
