//! Retry scheduling: computes backoff delays and enqueues the next attempt.
//!
//! The failed row stays terminal; the retry is a fresh `pending` row with
//! `attempt + 1` and a `scheduled_at` in the future. The retry snapshots
//! the task's *current* code version, so a redeploy between attempts runs
//! the new code.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use sluice_db::models::{RetryBackoff, TaskDef, TaskRun, TaskRunStatus};
use sluice_db::queries::task_runs as run_db;

use crate::ids;

/// Delay in milliseconds inserted after attempt `attempt` fails.
///
/// - `fixed`: the base delay.
/// - `exponential`: `base * 2^(attempt-1)`.
///
/// Both are capped at `max_ms`.
pub fn retry_delay_ms(attempt: i32, backoff: RetryBackoff, base_ms: i64, max_ms: i64) -> i64 {
    let delay = match backoff {
        RetryBackoff::Fixed => base_ms,
        RetryBackoff::Exponential => {
            let exp = (attempt - 1).clamp(0, 30) as u32;
            base_ms.saturating_mul(1_i64 << exp)
        }
    };
    delay.min(max_ms)
}

/// Enqueue the next attempt for a failed or timed-out run.
///
/// Returns the new run, or `None` when a row for the next attempt already
/// exists (duplicate failure handling).
pub async fn schedule_retry(
    pool: &PgPool,
    failed: &TaskRun,
    def: &TaskDef,
) -> Result<Option<TaskRun>> {
    let delay_ms = retry_delay_ms(
        failed.attempt,
        def.retry_backoff,
        def.retry_delay_ms,
        def.max_retry_delay_ms,
    );
    let scheduled_at = Utc::now()
        + ChronoDuration::try_milliseconds(delay_ms)
            .context("retry delay out of range")?;

    let new_run = run_db::insert_task_run(
        pool,
        &run_db::NewTaskRun {
            id: ids::task_run_id(),
            task_id: failed.task_id.clone(),
            pipeline_run_id: failed.pipeline_run_id.clone(),
            status: TaskRunStatus::Pending,
            code_version: def.code_version,
            code_hash: def.code_hash.clone(),
            attempt: failed.attempt + 1,
            max_retries: failed.max_retries,
            priority: failed.priority,
            input_path: failed.input_path.clone(),
            idempotency_key: failed.idempotency_key.clone(),
            scheduled_at: Some(scheduled_at),
        },
    )
    .await?;

    if let Some(run) = &new_run {
        tracing::info!(
            run_id = %run.id,
            task_id = %run.task_id,
            attempt = run.attempt,
            delay_ms,
            "scheduled retry"
        );
    }

    Ok(new_run)
}
