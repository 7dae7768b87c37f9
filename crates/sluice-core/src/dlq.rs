//! Dead-letter queue: parking lot for runs that exhausted their retries.
//!
//! Items snapshot the final attempt verbatim and stay queryable until the
//! purge retention elapses. Manual replay creates a fresh run at attempt 1.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use sluice_db::models::{DlqItem, TaskRun, TaskRunStatus};
use sluice_db::queries::dlq as dlq_db;
use sluice_db::queries::task_runs as run_db;
use sluice_db::queries::tasks as task_db;

pub use sluice_db::queries::dlq::DlqFilter;

use crate::error::{CoreError, CoreResult};
use crate::ids;

/// Park an exhausted run in the DLQ.
pub async fn move_to_dlq(pool: &PgPool, run: &TaskRun) -> Result<DlqItem> {
    let item = dlq_db::insert_dlq_item(
        pool,
        &dlq_db::NewDlqItem {
            id: ids::dlq_id(),
            task_run_id: run.id.clone(),
            task_id: run.task_id.clone(),
            pipeline_run_id: run.pipeline_run_id.clone(),
            code_version: run.code_version,
            code_hash: run.code_hash.clone(),
            error: run
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_owned()),
            error_code: run.error_code.clone(),
            attempts: run.attempt,
            input_path: run.input_path.clone(),
        },
    )
    .await?;

    tracing::warn!(
        dlq_id = %item.id,
        run_id = %run.id,
        task_id = %run.task_id,
        attempts = run.attempt,
        error_code = run.error_code.as_deref().unwrap_or(""),
        "run moved to dead-letter queue"
    );

    Ok(item)
}

/// Manually replay a dead-lettered run.
///
/// Creates a fresh standalone run at attempt 1 with the original input
/// path, snapshotting the task's current code version, and stamps
/// `retried_at` on the item. The replay is detached from the original
/// pipeline run: that run is already terminal and its attempt chain stays
/// immutable.
pub async fn replay(pool: &PgPool, dlq_id: &str) -> CoreResult<TaskRun> {
    let item = dlq_db::get_dlq_item(pool, dlq_id)
        .await?
        .ok_or_else(|| CoreError::not_found("dlq item", dlq_id))?;

    let def = task_db::get_task_def(pool, &item.task_id)
        .await?
        .ok_or_else(|| CoreError::not_found("task", item.task_id.clone()))?;

    let run = run_db::insert_task_run(
        pool,
        &run_db::NewTaskRun {
            id: ids::task_run_id(),
            task_id: item.task_id.clone(),
            pipeline_run_id: None,
            status: TaskRunStatus::Pending,
            code_version: def.code_version,
            code_hash: def.code_hash.clone(),
            attempt: 1,
            max_retries: def.retries,
            priority: def.priority,
            input_path: item.input_path.clone(),
            idempotency_key: None,
            scheduled_at: None,
        },
    )
    .await?
    .context("replay run collided with an existing attempt")?;

    dlq_db::mark_retried(pool, dlq_id).await?;

    tracing::info!(
        dlq_id = %dlq_id,
        new_run_id = %run.id,
        task_id = %item.task_id,
        "replayed dead-lettered run"
    );

    Ok(run)
}

/// List DLQ items with optional filters.
pub async fn list(pool: &PgPool, filter: &DlqFilter, limit: i64) -> Result<Vec<DlqItem>> {
    dlq_db::list_dlq_items(pool, filter, limit).await
}

/// Delete items older than the retention window. Returns the purge count.
pub async fn purge(pool: &PgPool, retention_days: i64) -> Result<u64> {
    let cutoff = Utc::now()
        - ChronoDuration::try_days(retention_days).context("retention out of range")?;
    let purged = dlq_db::purge_older_than(pool, cutoff).await?;
    if purged > 0 {
        tracing::info!(purged, retention_days, "purged dead-letter items");
    }
    Ok(purged)
}
