//! Worker callbacks: heartbeats and completions.
//!
//! Both endpoints are idempotent against duplicates and stale deliveries:
//! every transition is a guarded update, and a callback for an
//! already-terminal run is acknowledged without changing anything. A
//! callback for a cancelled run is discarded; the worker learns to stop
//! through `should_cancel`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use sluice_db::models::{AssetMap, TaskRun, TaskRunStatus};
use sluice_db::queries::pipeline_runs as prun_db;
use sluice_db::queries::services as service_db;
use sluice_db::queries::task_runs as run_db;
use sluice_db::queries::tasks as task_db;

use crate::error::{CoreError, CoreResult};
use crate::executor;
use crate::idempotency;
use crate::store::BlobStore;

/// Response to a heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    /// Whether the heartbeat was recorded against a running run.
    pub acknowledged: bool,
    /// The run was cancelled; the worker should stop as soon as it can.
    pub should_cancel: bool,
}

/// Record a worker heartbeat, merging progress into the run metadata.
pub async fn heartbeat(
    pool: &PgPool,
    run_id: &str,
    progress: Option<Value>,
    message: Option<String>,
) -> CoreResult<HeartbeatAck> {
    let run = run_db::get_task_run(pool, run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("task run", run_id))?;

    let mut patch = serde_json::Map::new();
    if let Some(progress) = progress {
        patch.insert("progress".to_owned(), progress);
    }
    if let Some(message) = message {
        patch.insert("message".to_owned(), Value::String(message));
    }

    let rows = run_db::record_heartbeat(pool, run_id, &Value::Object(patch)).await?;
    service_db::touch_service_for_task(pool, &run.task_id).await?;

    Ok(HeartbeatAck {
        acknowledged: rows > 0,
        should_cancel: run.status == TaskRunStatus::Cancelled,
    })
}

/// Reported outcome of a worker execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Failed,
}

/// The completion callback body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub status: CompletionStatus,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub output_size: Option<i64>,
    #[serde(default)]
    pub assets: Option<AssetMap>,
    #[serde(default)]
    pub logs_path: Option<String>,
    #[serde(default)]
    pub selected_next: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Handle a completion callback: transition the run, then drive the
/// downstream logic (fan-out on success, retry/DLQ on failure).
pub async fn complete_run(
    pool: &PgPool,
    store: &BlobStore,
    run_id: &str,
    payload: &CompletionPayload,
) -> CoreResult<TaskRun> {
    let run = run_db::get_task_run(pool, run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("task run", run_id))?;

    if run.status == TaskRunStatus::Cancelled {
        // Result discarded; whatever the worker wrote to the object store
        // stays there, harmlessly.
        tracing::info!(run_id, "completion for cancelled run discarded");
        return Ok(run);
    }
    if run.status.is_terminal() {
        tracing::debug!(run_id, status = %run.status, "duplicate completion ignored");
        return Ok(run);
    }

    match payload.status {
        CompletionStatus::Success => complete_success(pool, store, run, payload).await,
        CompletionStatus::Failed => complete_failure(pool, store, run, payload).await,
    }
}

async fn complete_success(
    pool: &PgPool,
    store: &BlobStore,
    run: TaskRun,
    payload: &CompletionPayload,
) -> CoreResult<TaskRun> {
    // The worker may narrow its successor set, never widen it.
    if let (Some(selected), Some(prun_id)) = (&payload.selected_next, &run.pipeline_run_id) {
        let prun = prun_db::get_pipeline_run(pool, prun_id)
            .await?
            .ok_or_else(|| CoreError::not_found("pipeline run", prun_id.as_str()))?;
        let allowed = prun
            .structure
            .0
            .get(&run.task_id)
            .map(|n| n.allowed_next.clone())
            .unwrap_or_default();
        let rejected: Vec<String> = selected
            .iter()
            .filter(|s| !allowed.contains(s))
            .cloned()
            .collect();
        if !rejected.is_empty() {
            return Err(CoreError::InvalidNextTasks {
                task_id: run.task_id.clone(),
                rejected,
            });
        }
    }

    let rows = run_db::complete_success(
        pool,
        &run.id,
        &run_db::CompletionUpdate {
            output_path: payload.output_path.clone(),
            output_size: payload.output_size,
            assets: payload.assets.clone(),
            logs_path: payload.logs_path.clone(),
            selected_next: payload.selected_next.clone(),
        },
    )
    .await?;

    let updated = run_db::get_task_run(pool, &run.id)
        .await?
        .ok_or_else(|| CoreError::not_found("task run", run.id.clone()))?;
    if rows == 0 {
        // Lost the race against a cancel or timeout sweep.
        tracing::debug!(run_id = %run.id, status = %updated.status, "stale success callback");
        return Ok(updated);
    }

    tracing::info!(
        run_id = %updated.id,
        task_id = %updated.task_id,
        attempt = updated.attempt,
        "task run completed"
    );

    // Cache only successful outputs with a real output path.
    if let (Some(user_key), Some(output_path)) = (&updated.idempotency_key, &updated.output_path) {
        if let Some(def) = task_db::get_task_def(pool, &updated.task_id).await? {
            if def.idempotency_ttl_seconds > 0 {
                idempotency::cache_result(
                    pool,
                    &updated.task_id,
                    user_key,
                    &updated.id,
                    updated.code_version,
                    output_path,
                    updated.output_size,
                    updated.assets.as_ref().map(|a| &a.0),
                    def.idempotency_ttl_seconds,
                )
                .await?;
            }
        }
    }

    service_db::touch_service_for_task(pool, &updated.task_id).await?;
    executor::after_success(pool, store, &updated).await?;

    Ok(updated)
}

async fn complete_failure(
    pool: &PgPool,
    store: &BlobStore,
    run: TaskRun,
    payload: &CompletionPayload,
) -> CoreResult<TaskRun> {
    let error = payload.error.as_deref().unwrap_or("task failed");
    let rows = run_db::complete_failure(
        pool,
        &run.id,
        error,
        payload.error_code.as_deref(),
        payload.logs_path.as_deref(),
    )
    .await?;

    let updated = run_db::get_task_run(pool, &run.id)
        .await?
        .ok_or_else(|| CoreError::not_found("task run", run.id.clone()))?;
    if rows == 0 {
        tracing::debug!(run_id = %run.id, status = %updated.status, "stale failure callback");
        return Ok(updated);
    }

    tracing::warn!(
        run_id = %updated.id,
        task_id = %updated.task_id,
        attempt = updated.attempt,
        error_code = payload.error_code.as_deref().unwrap_or(""),
        "task run failed"
    );

    service_db::touch_service_for_task(pool, &updated.task_id).await?;
    executor::handle_run_failure(pool, store, &updated).await?;

    Ok(updated)
}
