//! Database query functions for the `task_runs` table.
//!
//! Every status change is a guarded update (`WHERE status = <expected>`) so
//! duplicate callbacks and concurrent monitors cannot advance a run twice.
//! The poller's claim path additionally takes a row lock (`FOR UPDATE SKIP
//! LOCKED`) that is held across the dispatch POST.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{AssetMap, TaskRun, TaskRunStatus};

/// Parameters for inserting a new task run row.
#[derive(Debug, Clone)]
pub struct NewTaskRun {
    pub id: String,
    pub task_id: String,
    pub pipeline_run_id: Option<String>,
    pub status: TaskRunStatus,
    pub code_version: i32,
    pub code_hash: String,
    pub attempt: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub input_path: String,
    pub idempotency_key: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Insert a new task run. Returns `None` when a row with the same
/// `(pipeline_run_id, task_id, attempt)` already exists (dedup within a
/// pipeline run).
pub async fn insert_task_run(pool: &PgPool, new: &NewTaskRun) -> Result<Option<TaskRun>> {
    let run = sqlx::query_as::<_, TaskRun>(
        "INSERT INTO task_runs \
         (id, task_id, pipeline_run_id, status, code_version, code_hash, attempt, \
          max_retries, priority, input_path, idempotency_key, scheduled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, COALESCE($12, NOW())) \
         ON CONFLICT (pipeline_run_id, task_id, attempt) DO NOTHING \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.task_id)
    .bind(&new.pipeline_run_id)
    .bind(new.status)
    .bind(new.code_version)
    .bind(new.code_hash.as_str())
    .bind(new.attempt)
    .bind(new.max_retries)
    .bind(new.priority)
    .bind(&new.input_path)
    .bind(&new.idempotency_key)
    .bind(new.scheduled_at)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to insert task run {}", new.id))?;

    Ok(run)
}

/// Materialize an already-completed run from an idempotency cache hit. The
/// run is never dispatched; it points straight at the cached output.
pub async fn insert_cached_run(
    pool: &PgPool,
    new: &NewTaskRun,
    output_path: &str,
    output_size: Option<i64>,
    assets: Option<&AssetMap>,
) -> Result<Option<TaskRun>> {
    let run = sqlx::query_as::<_, TaskRun>(
        "INSERT INTO task_runs \
         (id, task_id, pipeline_run_id, status, code_version, code_hash, attempt, \
          max_retries, priority, input_path, idempotency_key, scheduled_at, \
          output_path, output_size, assets, started_at, completed_at) \
         VALUES ($1, $2, $3, 'completed', $4, $5, $6, $7, $8, $9, $10, NOW(), \
                 $11, $12, $13, NOW(), NOW()) \
         ON CONFLICT (pipeline_run_id, task_id, attempt) DO NOTHING \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.task_id)
    .bind(&new.pipeline_run_id)
    .bind(new.code_version)
    .bind(new.code_hash.as_str())
    .bind(new.attempt)
    .bind(new.max_retries)
    .bind(new.priority)
    .bind(&new.input_path)
    .bind(&new.idempotency_key)
    .bind(output_path)
    .bind(output_size)
    .bind(assets.map(Json))
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to insert cached task run {}", new.id))?;

    Ok(run)
}

/// Fetch a single task run by ID.
pub async fn get_task_run(pool: &PgPool, id: &str) -> Result<Option<TaskRun>> {
    let run = sqlx::query_as::<_, TaskRun>("SELECT * FROM task_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch task run {id}"))?;

    Ok(run)
}

// ---------------------------------------------------------------------------
// Claiming (poller / dispatcher)
// ---------------------------------------------------------------------------

/// Ready-to-dispatch candidates in priority order, respecting per-task
/// concurrency caps at claim time. No locks are taken; the dispatcher
/// re-claims each row under `FOR UPDATE SKIP LOCKED`.
pub async fn select_ready_candidates(pool: &PgPool, limit: i64) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT r.id, r.task_id \
         FROM task_runs r \
         JOIN task_defs t ON t.id = r.task_id \
         WHERE r.status = 'pending' \
           AND r.scheduled_at <= NOW() \
           AND (t.concurrency = 0 OR \
                (SELECT COUNT(*) FROM task_runs rr \
                  WHERE rr.task_id = r.task_id AND rr.status = 'running') < t.concurrency) \
         ORDER BY r.priority ASC, r.scheduled_at ASC, r.created_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to select ready candidates")?;

    Ok(rows)
}

/// A pending run claimed under a row lock. The lock is held until the
/// transaction commits, so the claim survives the dispatch POST without a
/// persisted in-flight marker.
pub struct ClaimedRun {
    pub tx: Transaction<'static, Postgres>,
    pub run: TaskRun,
}

/// Re-claim a candidate run for dispatch. Returns `None` when the row is no
/// longer pending/due, or when another claimant holds the lock.
pub async fn claim_pending_run(pool: &PgPool, run_id: &str) -> Result<Option<ClaimedRun>> {
    let mut tx = pool.begin().await.context("failed to begin claim transaction")?;

    let run = sqlx::query_as::<_, TaskRun>(
        "SELECT * FROM task_runs \
         WHERE id = $1 AND status = 'pending' AND scheduled_at <= NOW() \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(run_id)
    .fetch_optional(&mut *tx)
    .await
    .with_context(|| format!("failed to claim task run {run_id}"))?;

    match run {
        Some(run) => Ok(Some(ClaimedRun { tx, run })),
        None => {
            tx.rollback().await.ok();
            Ok(None)
        }
    }
}

/// Within a claim transaction: transition `pending -> running` and stamp
/// `started_at`/`heartbeat_at`.
pub async fn mark_running_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    run_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'running', started_at = NOW(), heartbeat_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(run_id)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to mark task run {run_id} running"))?;

    Ok(result.rows_affected())
}

/// Within a claim transaction: fail a pending run (dispatch never reached
/// the worker).
pub async fn fail_pending_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    run_id: &str,
    error: &str,
    error_code: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'failed', error = $2, error_code = $3, completed_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(run_id)
    .bind(error)
    .bind(error_code)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to fail pending task run {run_id}"))?;

    Ok(result.rows_affected())
}

/// Within a claim transaction: satisfy a pending run from the idempotency
/// cache without dispatching.
pub async fn complete_from_cache_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    run_id: &str,
    output_path: &str,
    output_size: Option<i64>,
    assets: Option<&AssetMap>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'completed', output_path = $2, output_size = $3, assets = $4, \
             started_at = NOW(), completed_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(run_id)
    .bind(output_path)
    .bind(output_size)
    .bind(assets.map(Json))
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to complete task run {run_id} from cache"))?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Completion / failure / cancellation
// ---------------------------------------------------------------------------

/// Fields persisted on a successful completion callback.
#[derive(Debug, Clone, Default)]
pub struct CompletionUpdate {
    pub output_path: Option<String>,
    pub output_size: Option<i64>,
    pub assets: Option<AssetMap>,
    pub logs_path: Option<String>,
    pub selected_next: Option<Vec<String>>,
}

/// Transition `running -> completed` and persist the worker's outputs.
/// Returns the number of rows changed (0 = duplicate or stale callback).
pub async fn complete_success(
    pool: &PgPool,
    run_id: &str,
    update: &CompletionUpdate,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'completed', output_path = $2, output_size = $3, assets = $4, \
             logs_path = $5, selected_next = $6, completed_at = NOW() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(run_id)
    .bind(&update.output_path)
    .bind(update.output_size)
    .bind(update.assets.as_ref().map(Json))
    .bind(&update.logs_path)
    .bind(update.selected_next.as_ref().map(Json))
    .execute(pool)
    .await
    .with_context(|| format!("failed to complete task run {run_id}"))?;

    Ok(result.rows_affected())
}

/// Transition `running -> failed` with the worker-reported error.
pub async fn complete_failure(
    pool: &PgPool,
    run_id: &str,
    error: &str,
    error_code: Option<&str>,
    logs_path: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'failed', error = $2, error_code = $3, logs_path = $4, \
             completed_at = NOW() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(run_id)
    .bind(error)
    .bind(error_code)
    .bind(logs_path)
    .execute(pool)
    .await
    .with_context(|| format!("failed to fail task run {run_id}"))?;

    Ok(result.rows_affected())
}

/// Cancel a run that has not finished yet. Running workers learn through
/// the heartbeat response.
pub async fn cancel_task_run(pool: &PgPool, run_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'cancelled', completed_at = NOW() \
         WHERE id = $1 AND status IN ('pending', 'waiting', 'running')",
    )
    .bind(run_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to cancel task run {run_id}"))?;

    Ok(result.rows_affected())
}

/// Cancel every non-terminal run of a pipeline run. Returns the cancelled
/// rows.
pub async fn cancel_non_terminal_for_pipeline(
    pool: &PgPool,
    pipeline_run_id: &str,
) -> Result<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "UPDATE task_runs \
         SET status = 'cancelled', completed_at = NOW() \
         WHERE pipeline_run_id = $1 AND status IN ('pending', 'waiting', 'running') \
         RETURNING *",
    )
    .bind(pipeline_run_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to cancel task runs for pipeline run {pipeline_run_id}"))?;

    Ok(runs)
}

/// Cancel queued runs for a set of tasks (used when a registration orphans
/// task definitions). Waiting runs are included: they can only ever be
/// promoted to pending, and their task no longer has a worker.
pub async fn cancel_queued_for_tasks(pool: &PgPool, task_ids: &[String]) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'cancelled', completed_at = NOW() \
         WHERE task_id = ANY($1) AND status IN ('pending', 'waiting')",
    )
    .bind(task_ids)
    .execute(pool)
    .await
    .context("failed to cancel queued runs for orphaned tasks")?;

    Ok(result.rows_affected())
}

/// Promote a waiting run whose upstreams have all completed.
pub async fn promote_waiting(pool: &PgPool, run_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET status = 'pending', scheduled_at = NOW() \
         WHERE id = $1 AND status = 'waiting'",
    )
    .bind(run_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to promote waiting task run {run_id}"))?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Heartbeats & timeouts
// ---------------------------------------------------------------------------

/// Record a heartbeat: bump `heartbeat_at` and merge a patch object into
/// the run metadata. Only running runs accept heartbeats.
pub async fn record_heartbeat(
    pool: &PgPool,
    run_id: &str,
    patch: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runs \
         SET heartbeat_at = NOW(), metadata = metadata || $2 \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(run_id)
    .bind(patch)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record heartbeat for task run {run_id}"))?;

    Ok(result.rows_affected())
}

/// Sweep running runs whose last heartbeat is older than twice the task's
/// heartbeat interval. Marks them `timeout` and returns the affected rows
/// so the caller can feed them into the retry/DLQ path.
pub async fn mark_timed_out_runs(pool: &PgPool) -> Result<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "UPDATE task_runs r \
         SET status = 'timeout', completed_at = NOW(), \
             error = 'missed heartbeat deadline', error_code = 'HEARTBEAT_TIMEOUT' \
         FROM task_defs t \
         WHERE t.id = r.task_id \
           AND r.status = 'running' \
           AND COALESCE(r.heartbeat_at, r.started_at) < \
               NOW() - (t.heartbeat_interval_ms * 2) * INTERVAL '1 millisecond' \
         RETURNING r.*",
    )
    .fetch_all(pool)
    .await
    .context("failed to sweep timed-out task runs")?;

    Ok(runs)
}

// ---------------------------------------------------------------------------
// Listing & counting
// ---------------------------------------------------------------------------

/// All runs belonging to a pipeline run, oldest first.
pub async fn list_runs_for_pipeline(pool: &PgPool, pipeline_run_id: &str) -> Result<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "SELECT * FROM task_runs WHERE pipeline_run_id = $1 ORDER BY created_at ASC",
    )
    .bind(pipeline_run_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list runs for pipeline run {pipeline_run_id}"))?;

    Ok(runs)
}

/// The latest attempt per task within a pipeline run. Roll-up decisions are
/// made over these rows, not over superseded attempts.
pub async fn latest_runs_for_pipeline(
    pool: &PgPool,
    pipeline_run_id: &str,
) -> Result<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "SELECT DISTINCT ON (task_id) * FROM task_runs \
         WHERE pipeline_run_id = $1 \
         ORDER BY task_id, attempt DESC",
    )
    .bind(pipeline_run_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list latest runs for pipeline run {pipeline_run_id}"))?;

    Ok(runs)
}

/// Terminal prior attempts in the same retry chain, oldest first. The chain
/// is identified by `(task_id, pipeline_run_id)` for pipeline runs and by
/// `(task_id, input_path)` for standalone runs (retries preserve the input
/// path).
pub async fn prior_attempts(
    pool: &PgPool,
    task_id: &str,
    pipeline_run_id: Option<&str>,
    input_path: &str,
    before_attempt: i32,
) -> Result<Vec<TaskRun>> {
    let runs = match pipeline_run_id {
        Some(prun) => {
            sqlx::query_as::<_, TaskRun>(
                "SELECT * FROM task_runs \
                 WHERE task_id = $1 AND pipeline_run_id = $2 AND attempt < $3 \
                   AND completed_at IS NOT NULL \
                 ORDER BY attempt ASC",
            )
            .bind(task_id)
            .bind(prun)
            .bind(before_attempt)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, TaskRun>(
                "SELECT * FROM task_runs \
                 WHERE task_id = $1 AND pipeline_run_id IS NULL AND input_path = $2 \
                   AND attempt < $3 AND completed_at IS NOT NULL \
                 ORDER BY attempt ASC",
            )
            .bind(task_id)
            .bind(input_path)
            .bind(before_attempt)
            .fetch_all(pool)
            .await
        }
    }
    .with_context(|| format!("failed to list prior attempts for task {task_id}"))?;

    Ok(runs)
}

/// Recent runs of one task, newest first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: &str, limit: i64) -> Result<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "SELECT * FROM task_runs WHERE task_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list runs for task {task_id}"))?;

    Ok(runs)
}

/// Number of runs currently executing, across all tasks.
pub async fn count_running(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM task_runs WHERE status = 'running'")
            .fetch_one(pool)
            .await
            .context("failed to count running task runs")?;

    Ok(row.0)
}

/// Number of running runs for one task (per-task concurrency accounting).
pub async fn count_running_for_task(pool: &PgPool, task_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_runs WHERE task_id = $1 AND status = 'running'",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to count running runs for task {task_id}"))?;

    Ok(row.0)
}

/// Current queue depths.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueTotals {
    pub pending: i64,
    pub running: i64,
    pub waiting: i64,
}

/// Count pending/running/waiting runs in one pass.
pub async fn queue_totals(pool: &PgPool) -> Result<QueueTotals> {
    let rows: Vec<(TaskRunStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM task_runs \
         WHERE status IN ('pending', 'running', 'waiting') \
         GROUP BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count queue totals")?;

    let mut totals = QueueTotals::default();
    for (status, count) in rows {
        match status {
            TaskRunStatus::Pending => totals.pending = count,
            TaskRunStatus::Running => totals.running = count,
            TaskRunStatus::Waiting => totals.waiting = count,
            _ => {}
        }
    }
    Ok(totals)
}

/// Per-task queue breakdown with the oldest pending enqueue time.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TaskQueueRow {
    pub task_id: String,
    pub pending: i64,
    pub running: i64,
    pub waiting: i64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Queue breakdown per task over non-terminal runs.
pub async fn per_task_queue(pool: &PgPool) -> Result<Vec<TaskQueueRow>> {
    let rows = sqlx::query_as::<_, TaskQueueRow>(
        "SELECT task_id, \
                COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                COUNT(*) FILTER (WHERE status = 'running') AS running, \
                COUNT(*) FILTER (WHERE status = 'waiting') AS waiting, \
                MIN(created_at) FILTER (WHERE status = 'pending') AS oldest_pending_at \
         FROM task_runs \
         WHERE status IN ('pending', 'running', 'waiting') \
         GROUP BY task_id \
         ORDER BY task_id",
    )
    .fetch_all(pool)
    .await
    .context("failed to compute per-task queue breakdown")?;

    Ok(rows)
}

/// Enqueue time of the oldest pending run, if any.
pub async fn oldest_pending_at(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let row: (Option<DateTime<Utc>>,) =
        sqlx::query_as("SELECT MIN(created_at) FROM task_runs WHERE status = 'pending'")
            .fetch_one(pool)
            .await
            .context("failed to find oldest pending run")?;

    Ok(row.0)
}

/// Average wait (enqueue to start) in milliseconds over runs started in the
/// last hour.
pub async fn avg_wait_ms_last_hour(pool: &PgPool) -> Result<Option<f64>> {
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT (AVG(EXTRACT(EPOCH FROM (started_at - created_at)) * 1000.0))::float8 \
         FROM task_runs \
         WHERE started_at >= NOW() - INTERVAL '1 hour'",
    )
    .fetch_one(pool)
    .await
    .context("failed to compute average wait")?;

    Ok(row.0)
}
