//! Pipeline executor: triggers runs, fans tasks out and in across the DAG
//! snapshot, resolves failures per failure mode, and rolls pipeline runs up
//! to their terminal status.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;

use sluice_db::models::{
    FailureMode, PipelineRun, PipelineRunStatus, StructureSnapshot, TaskDef, TaskRun,
    TaskRunStatus,
};
use sluice_db::queries::pipeline_runs as prun_db;
use sluice_db::queries::task_runs as run_db;
use sluice_db::queries::tasks as task_db;

use crate::dag;
use crate::dlq;
use crate::error::{CoreError, CoreResult};
use crate::idempotency;
use crate::ids;
use crate::maintenance;
use crate::registry;
use crate::retry;
use crate::schema::{InputSchema, ValidationIssue, ValidationMode};
use crate::store::{BlobStore, paths};

// ---------------------------------------------------------------------------
// Triggering
// ---------------------------------------------------------------------------

/// Parameters for triggering a pipeline.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub input: Value,
    pub failure_mode: Option<FailureMode>,
    pub priority: Option<i32>,
    pub metadata: Option<Value>,
    pub validation_mode: Option<ValidationMode>,
    /// Optional idempotency user keys per entry task.
    pub idempotency_keys: BTreeMap<String, String>,
}

impl TriggerRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            failure_mode: None,
            priority: None,
            metadata: None,
            validation_mode: None,
            idempotency_keys: BTreeMap::new(),
        }
    }
}

/// What a trigger produced.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub pipeline_run: PipelineRun,
    pub input_path: String,
    pub entry_tasks: Vec<String>,
    pub queued_runs: Vec<TaskRun>,
    pub warnings: Vec<ValidationIssue>,
}

/// Trigger a pipeline: freeze the structure, persist the input, validate
/// it, create the pipeline run, and queue (or cache-satisfy) every entry
/// task.
pub async fn trigger_pipeline(
    pool: &PgPool,
    store: &BlobStore,
    pipeline_id: &str,
    req: &TriggerRequest,
) -> CoreResult<TriggerOutcome> {
    maintenance::require_running(pool).await?;

    let pipeline = sluice_db::queries::pipelines::get_pipeline(pool, pipeline_id)
        .await?
        .ok_or_else(|| CoreError::not_found("pipeline", pipeline_id))?;

    let entry_tasks = pipeline.entry_task_ids.0.clone();
    let (snapshot, defs) = registry::load_reachable_defs(pool, &entry_tasks, true).await?;

    // Validate the input against every entry task's schema.
    let mode = req.validation_mode.unwrap_or_default();
    let mut warnings = Vec::new();
    if mode != ValidationMode::None {
        for entry in &entry_tasks {
            let Some(def) = defs.get(entry) else { continue };
            let Some(schema_json) = &def.input_schema else {
                continue;
            };
            let schema = match InputSchema::parse(schema_json) {
                Ok(schema) => schema,
                Err(e) => {
                    tracing::warn!(task_id = %entry, error = %e, "unusable input schema, skipping");
                    continue;
                }
            };
            let issues = schema.validate(&req.input);
            if issues.is_empty() {
                continue;
            }
            match mode {
                ValidationMode::Strict => {
                    return Err(CoreError::InvalidInput {
                        task_id: entry.clone(),
                        issues,
                    });
                }
                ValidationMode::Warn => {
                    tracing::warn!(
                        task_id = %entry,
                        issues = issues.len(),
                        "input validation warnings"
                    );
                    warnings.extend(issues);
                }
                ValidationMode::None => {}
            }
        }
    }

    let prun_id = ids::pipeline_run_id();
    let input_path = paths::pipeline_input(&prun_id);
    store.put_json(&input_path, &req.input).await?;

    let pipeline_run = prun_db::insert_pipeline_run(
        pool,
        &prun_db::NewPipelineRun {
            id: prun_id.clone(),
            pipeline_id: pipeline.id.clone(),
            failure_mode: req.failure_mode.unwrap_or(FailureMode::FailFast),
            input_path: input_path.clone(),
            structure: snapshot.clone(),
            pipeline_version: pipeline.pipeline_version.clone(),
            priority: req.priority,
            metadata: req.metadata.clone().unwrap_or_else(|| Value::Object(Default::default())),
        },
    )
    .await?;

    // Create every entry run first, then fan out from cached completions,
    // so a cache-satisfied entry cannot roll the pipeline up before its
    // siblings exist.
    let mut queued_runs = Vec::new();
    let mut cached_runs = Vec::new();
    for entry in &entry_tasks {
        let def = defs
            .get(entry)
            .with_context(|| format!("entry task {entry} missing from loaded defs"))?;

        let cached = match req.idempotency_keys.get(entry) {
            Some(user_key) if def.idempotency_ttl_seconds > 0 => {
                idempotency::lookup(pool, entry, user_key, def.code_version).await?
            }
            _ => None,
        };

        let new_run = run_db::NewTaskRun {
            id: ids::task_run_id(),
            task_id: entry.clone(),
            pipeline_run_id: Some(prun_id.clone()),
            status: TaskRunStatus::Pending,
            code_version: def.code_version,
            code_hash: def.code_hash.clone(),
            attempt: 1,
            max_retries: def.retries,
            priority: req.priority.unwrap_or(def.priority),
            input_path: input_path.clone(),
            idempotency_key: req.idempotency_keys.get(entry).cloned(),
            scheduled_at: None,
        };

        match cached {
            Some(hit) => {
                tracing::info!(
                    task_id = %entry,
                    pipeline_run_id = %prun_id,
                    cached_from = %hit.run_id,
                    "entry task satisfied from idempotency cache"
                );
                if let Some(run) = run_db::insert_cached_run(
                    pool,
                    &new_run,
                    &hit.output_path,
                    hit.output_size,
                    hit.assets.as_ref(),
                )
                .await?
                {
                    cached_runs.push(run.clone());
                    queued_runs.push(run);
                }
            }
            None => {
                if let Some(run) = run_db::insert_task_run(pool, &new_run).await? {
                    queued_runs.push(run);
                }
            }
        }
    }

    for run in &cached_runs {
        queue_downstream_tasks(pool, store, run).await?;
    }

    tracing::info!(
        pipeline_id = %pipeline.id,
        pipeline_run_id = %prun_id,
        entries = entry_tasks.len(),
        queued = queued_runs.len(),
        "pipeline triggered"
    );

    Ok(TriggerOutcome {
        pipeline_run,
        input_path,
        entry_tasks,
        queued_runs,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Standalone enqueue
// ---------------------------------------------------------------------------

/// Parameters for enqueuing a standalone task run.
#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub input: Value,
    pub priority: Option<i32>,
    pub idempotency_key: Option<String>,
    pub validation_mode: Option<ValidationMode>,
}

impl QueueRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            priority: None,
            idempotency_key: None,
            validation_mode: None,
        }
    }
}

/// Enqueue a standalone task run outside any pipeline.
pub async fn queue_task(
    pool: &PgPool,
    store: &BlobStore,
    task_id: &str,
    req: &QueueRequest,
) -> CoreResult<TaskRun> {
    maintenance::require_running(pool).await?;

    let def = registry::get_task(pool, task_id).await?;

    let mode = req.validation_mode.unwrap_or_default();
    if mode == ValidationMode::Strict {
        if let Some(schema_json) = &def.input_schema {
            if let Ok(schema) = InputSchema::parse(schema_json) {
                let issues = schema.validate(&req.input);
                if !issues.is_empty() {
                    return Err(CoreError::InvalidInput {
                        task_id: task_id.to_owned(),
                        issues,
                    });
                }
            }
        }
    }

    let run_id = ids::task_run_id();
    let input_path = paths::standalone_input(&run_id);
    store.put_json(&input_path, &req.input).await?;

    let new_run = run_db::NewTaskRun {
        id: run_id,
        task_id: task_id.to_owned(),
        pipeline_run_id: None,
        status: TaskRunStatus::Pending,
        code_version: def.code_version,
        code_hash: def.code_hash.clone(),
        attempt: 1,
        max_retries: def.retries,
        priority: req.priority.unwrap_or(def.priority),
        input_path,
        idempotency_key: req.idempotency_key.clone(),
        scheduled_at: None,
    };

    let cached = match &req.idempotency_key {
        Some(user_key) if def.idempotency_ttl_seconds > 0 => {
            idempotency::lookup(pool, task_id, user_key, def.code_version).await?
        }
        _ => None,
    };

    let run = match cached {
        Some(hit) => run_db::insert_cached_run(
            pool,
            &new_run,
            &hit.output_path,
            hit.output_size,
            hit.assets.as_ref(),
        )
        .await?
        .context("standalone run insert returned no row")?,
        None => run_db::insert_task_run(pool, &new_run)
            .await?
            .context("standalone run insert returned no row")?,
    };

    tracing::info!(run_id = %run.id, task_id, status = %run.status, "task queued");
    Ok(run)
}

// ---------------------------------------------------------------------------
// Fan-out / fan-in
// ---------------------------------------------------------------------------

/// Whether a task can be scheduled given the state of its predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every relevant predecessor completed.
    Ready,
    /// Some predecessor is still in flight or may still be created.
    Waiting,
    /// A predecessor ended non-completed; the task must never run.
    Blocked,
}

/// Evaluate readiness of `task_id` against the latest run status per task.
///
/// Conservative join rule: a task is ready only when every created
/// predecessor completed and no uncreated predecessor is still reachable
/// from an incomplete task. A predecessor that ended non-completed blocks
/// the task permanently.
pub fn evaluate_readiness(
    snapshot: &StructureSnapshot,
    task_id: &str,
    statuses: &BTreeMap<String, TaskRunStatus>,
) -> Readiness {
    let incomplete: Vec<&str> = statuses
        .iter()
        .filter(|(_, s)| !s.is_terminal())
        .map(|(id, _)| id.as_str())
        .collect();

    let mut waiting = false;
    for pred in dag::predecessors(snapshot, task_id) {
        match statuses.get(&pred) {
            Some(TaskRunStatus::Completed) => {}
            Some(status) if status.is_terminal() => return Readiness::Blocked,
            Some(_) => waiting = true,
            None => {
                // Not created yet; only relevant while some incomplete task
                // could still fan out to it.
                if dag::reachable_from_any(snapshot, incomplete.iter().copied(), &pred) {
                    waiting = true;
                }
            }
        }
    }

    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Fan out after a successful completion: create runs for the effective
/// next set, settle waiting runs, and roll the pipeline up if it finished.
pub async fn queue_downstream_tasks(
    pool: &PgPool,
    store: &BlobStore,
    completed: &TaskRun,
) -> Result<()> {
    let Some(prun_id) = &completed.pipeline_run_id else {
        return Ok(());
    };
    let prun = prun_db::get_pipeline_run(pool, prun_id)
        .await?
        .with_context(|| format!("pipeline run {prun_id} not found"))?;
    if prun.status.is_terminal() {
        return Ok(());
    }

    let snapshot = &prun.structure.0;
    let allowed = snapshot
        .get(&completed.task_id)
        .map(|n| n.allowed_next.clone())
        .unwrap_or_default();

    // The worker may narrow, never widen; anything outside the allowed set
    // was already rejected at callback time, so intersect defensively.
    let effective: Vec<String> = match &completed.selected_next {
        Some(selected) => allowed
            .iter()
            .filter(|a| selected.0.contains(a))
            .cloned()
            .collect(),
        None => allowed,
    };

    let latest = latest_status_map(pool, prun_id).await?;
    let mut statuses = latest.clone();

    let def_ids: Vec<String> = effective
        .iter()
        .filter(|t| !latest.contains_key(*t))
        .cloned()
        .collect();
    let defs: BTreeMap<String, TaskDef> = task_db::get_task_defs(pool, &def_ids)
        .await?
        .into_iter()
        .map(|d| (d.id.clone(), d))
        .collect();

    for next in &effective {
        if statuses.contains_key(next) {
            continue;
        }
        let readiness = evaluate_readiness(snapshot, next, &statuses);
        if readiness == Readiness::Blocked {
            continue;
        }

        let Some(def) = defs.get(next) else {
            tracing::error!(
                task_id = %next,
                pipeline_run_id = %prun_id,
                "downstream task has no definition, skipping"
            );
            continue;
        };

        let status = match readiness {
            Readiness::Ready => TaskRunStatus::Pending,
            _ => TaskRunStatus::Waiting,
        };
        let inserted = run_db::insert_task_run(
            pool,
            &run_db::NewTaskRun {
                id: ids::task_run_id(),
                task_id: next.clone(),
                pipeline_run_id: Some(prun_id.clone()),
                status,
                code_version: def.code_version,
                code_hash: def.code_hash.clone(),
                attempt: 1,
                max_retries: def.retries,
                priority: prun.priority.unwrap_or(def.priority),
                input_path: prun.input_path.clone(),
                idempotency_key: None,
                scheduled_at: None,
            },
        )
        .await?;

        if let Some(run) = inserted {
            tracing::debug!(
                run_id = %run.id,
                task_id = %next,
                pipeline_run_id = %prun_id,
                status = %run.status,
                "downstream task queued"
            );
            statuses.insert(next.clone(), run.status);
        }
    }

    settle_waiting_runs(pool, prun_id, snapshot).await?;
    maybe_complete_pipeline(pool, store, prun_id).await?;
    Ok(())
}

/// Re-evaluate every waiting run of a pipeline: promote the ready ones,
/// cancel the permanently blocked ones.
pub async fn settle_waiting_runs(
    pool: &PgPool,
    prun_id: &str,
    snapshot: &StructureSnapshot,
) -> Result<()> {
    let latest = run_db::latest_runs_for_pipeline(pool, prun_id).await?;
    let statuses: BTreeMap<String, TaskRunStatus> = latest
        .iter()
        .map(|r| (r.task_id.clone(), r.status))
        .collect();

    for run in latest.iter().filter(|r| r.status == TaskRunStatus::Waiting) {
        match evaluate_readiness(snapshot, &run.task_id, &statuses) {
            Readiness::Ready => {
                if run_db::promote_waiting(pool, &run.id).await? > 0 {
                    tracing::debug!(run_id = %run.id, task_id = %run.task_id, "waiting run promoted");
                }
            }
            Readiness::Blocked => {
                if run_db::cancel_task_run(pool, &run.id).await? > 0 {
                    tracing::debug!(run_id = %run.id, task_id = %run.task_id, "waiting run blocked, cancelled");
                }
            }
            Readiness::Waiting => {}
        }
    }
    Ok(())
}

/// Latest run status per task in a pipeline run.
async fn latest_status_map(
    pool: &PgPool,
    prun_id: &str,
) -> Result<BTreeMap<String, TaskRunStatus>> {
    let latest = run_db::latest_runs_for_pipeline(pool, prun_id).await?;
    Ok(latest
        .into_iter()
        .map(|r| (r.task_id, r.status))
        .collect())
}

// ---------------------------------------------------------------------------
// Completion roll-up
// ---------------------------------------------------------------------------

/// Roll a pipeline run up to its terminal status once every task run is
/// terminal, and write the aggregated output for its end nodes.
pub async fn maybe_complete_pipeline(pool: &PgPool, store: &BlobStore, prun_id: &str) -> Result<()> {
    let prun = prun_db::get_pipeline_run(pool, prun_id)
        .await?
        .with_context(|| format!("pipeline run {prun_id} not found"))?;
    if prun.status.is_terminal() {
        return Ok(());
    }

    let latest = run_db::latest_runs_for_pipeline(pool, prun_id).await?;
    if latest.is_empty() || latest.iter().any(|r| !r.status.is_terminal()) {
        return Ok(());
    }

    let completed = latest
        .iter()
        .filter(|r| r.status == TaskRunStatus::Completed)
        .count();
    let failed_like = latest
        .iter()
        .filter(|r| matches!(r.status, TaskRunStatus::Failed | TaskRunStatus::Timeout))
        .count();

    let status = if completed == latest.len() {
        PipelineRunStatus::Completed
    } else if failed_like > 0 {
        if completed > 0 {
            PipelineRunStatus::Partial
        } else {
            PipelineRunStatus::Failed
        }
    } else {
        PipelineRunStatus::Cancelled
    };

    let error = latest
        .iter()
        .find(|r| matches!(r.status, TaskRunStatus::Failed | TaskRunStatus::Timeout))
        .and_then(|r| r.error.clone());

    // Aggregate output: completed end nodes, keyed by task id. An end node
    // is a completed task none of whose allowed successors ever ran.
    let snapshot = &prun.structure.0;
    let ran: BTreeMap<&str, &TaskRun> = latest.iter().map(|r| (r.task_id.as_str(), r)).collect();
    let mut output = serde_json::Map::new();
    for run in latest.iter().filter(|r| r.status == TaskRunStatus::Completed) {
        let has_downstream_run = snapshot
            .get(&run.task_id)
            .map(|n| n.allowed_next.iter().any(|s| ran.contains_key(s.as_str())))
            .unwrap_or(false);
        if !has_downstream_run {
            if let Some(path) = &run.output_path {
                output.insert(
                    run.task_id.clone(),
                    serde_json::json!({
                        "outputPath": path,
                        "outputSize": run.output_size,
                    }),
                );
            }
        }
    }
    if !output.is_empty() {
        store
            .put_json(&paths::pipeline_output(prun_id), &Value::Object(output))
            .await?;
    }

    let rows = prun_db::finish(pool, prun_id, status, error.as_deref()).await?;
    if rows > 0 {
        tracing::info!(
            pipeline_run_id = %prun_id,
            status = %status,
            tasks = latest.len(),
            "pipeline run finished"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

/// Resolve a failed or timed-out run: retry when attempts remain and the
/// error is not fatal, otherwise dead-letter it and apply the pipeline's
/// failure mode.
pub async fn handle_run_failure(pool: &PgPool, store: &BlobStore, run: &TaskRun) -> Result<()> {
    debug_assert!(matches!(
        run.status,
        TaskRunStatus::Failed | TaskRunStatus::Timeout
    ));

    let def = task_db::get_task_def(pool, &run.task_id).await?;

    let fatal = match (&def, &run.error_code) {
        (Some(def), Some(code)) => def
            .fatal_error_prefix
            .as_deref()
            .is_some_and(|prefix| code.starts_with(prefix)),
        _ => false,
    };

    let attempts_left = run.attempt < run.max_retries + 1;

    if !fatal && attempts_left {
        if let Some(def) = &def {
            retry::schedule_retry(pool, run, def).await?;
            return Ok(());
        }
        tracing::warn!(
            run_id = %run.id,
            task_id = %run.task_id,
            "task definition gone, cannot retry"
        );
    }

    if fatal {
        tracing::warn!(
            run_id = %run.id,
            task_id = %run.task_id,
            error_code = run.error_code.as_deref().unwrap_or(""),
            "fatal error code, skipping retries"
        );
    }

    dlq::move_to_dlq(pool, run).await?;

    if let Some(prun_id) = &run.pipeline_run_id {
        handle_pipeline_failure(pool, store, prun_id, run).await?;
    }
    Ok(())
}

/// Apply a pipeline's failure mode after one of its tasks was
/// dead-lettered.
async fn handle_pipeline_failure(
    pool: &PgPool,
    store: &BlobStore,
    prun_id: &str,
    failed: &TaskRun,
) -> Result<()> {
    let prun = prun_db::get_pipeline_run(pool, prun_id)
        .await?
        .with_context(|| format!("pipeline run {prun_id} not found"))?;
    if prun.status.is_terminal() {
        return Ok(());
    }

    match prun.failure_mode {
        FailureMode::FailFast => {
            let cancelled = run_db::cancel_non_terminal_for_pipeline(pool, prun_id).await?;
            tracing::info!(
                pipeline_run_id = %prun_id,
                cancelled = cancelled.len(),
                failed_task = %failed.task_id,
                "fail-fast: cancelled remaining tasks"
            );
            prun_db::finish(
                pool,
                prun_id,
                PipelineRunStatus::Failed,
                failed.error.as_deref(),
            )
            .await?;
        }
        FailureMode::Continue | FailureMode::PartialMerge => {
            // The failed branch stops on its own (downstream is only created
            // from completions); settle cancels joins that can never fire.
            settle_waiting_runs(pool, prun_id, &prun.structure.0).await?;
            maybe_complete_pipeline(pool, store, prun_id).await?;
        }
    }
    Ok(())
}

/// Post-success hook shared by the completion callback and the
/// cache-satisfied dispatch path.
pub async fn after_success(pool: &PgPool, store: &BlobStore, run: &TaskRun) -> Result<()> {
    if run.pipeline_run_id.is_some() {
        queue_downstream_tasks(pool, store, run).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancel a pipeline run and every non-terminal task run it owns. Running
/// workers observe `should_cancel` on their next heartbeat.
pub async fn cancel_pipeline_run(pool: &PgPool, prun_id: &str) -> CoreResult<PipelineRun> {
    let prun = prun_db::get_pipeline_run(pool, prun_id)
        .await?
        .ok_or_else(|| CoreError::not_found("pipeline run", prun_id))?;

    match prun.status {
        PipelineRunStatus::Cancelled => return Ok(prun),
        status if status.is_terminal() => {
            return Err(CoreError::InvalidTransition(format!(
                "pipeline run {prun_id} is already {status}"
            )));
        }
        _ => {}
    }

    prun_db::finish(pool, prun_id, PipelineRunStatus::Cancelled, None).await?;
    let cancelled = run_db::cancel_non_terminal_for_pipeline(pool, prun_id).await?;
    tracing::info!(
        pipeline_run_id = %prun_id,
        cancelled = cancelled.len(),
        "pipeline run cancelled"
    );

    let prun = prun_db::get_pipeline_run(pool, prun_id)
        .await?
        .ok_or_else(|| CoreError::not_found("pipeline run", prun_id))?;
    Ok(prun)
}

/// Cancel a single run (standalone or within a pipeline).
pub async fn cancel_task_run(pool: &PgPool, run_id: &str) -> CoreResult<TaskRun> {
    let rows = run_db::cancel_task_run(pool, run_id).await?;
    let run = run_db::get_task_run(pool, run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("task run", run_id))?;
    if rows == 0 && run.status != TaskRunStatus::Cancelled {
        return Err(CoreError::InvalidTransition(format!(
            "task run {run_id} is already {}",
            run.status
        )));
    }
    Ok(run)
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// A stepwise execution plan with validation findings. No side effects.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DryRunReport {
    pub pipeline_id: String,
    pub pipeline_version: String,
    /// Topological layers from the entry tasks.
    pub plan: Vec<Vec<String>>,
    /// `allowed_next` targets with no registered definition.
    pub missing_tasks: Vec<String>,
    /// Input schema findings (when an input was supplied).
    pub warnings: Vec<ValidationIssue>,
}

/// Compute the execution plan for a pipeline without triggering it.
pub async fn dry_run(
    pool: &PgPool,
    pipeline_id: &str,
    input: Option<&Value>,
) -> CoreResult<DryRunReport> {
    let pipeline = sluice_db::queries::pipelines::get_pipeline(pool, pipeline_id)
        .await?
        .ok_or_else(|| CoreError::not_found("pipeline", pipeline_id))?;

    let entries = pipeline.entry_task_ids.0.clone();
    let (snapshot, defs) = registry::load_reachable_defs(pool, &entries, false).await?;

    let mut missing_tasks: Vec<String> = Vec::new();
    for def in defs.values() {
        for next in &def.allowed_next.0 {
            if !defs.contains_key(next) && !missing_tasks.contains(next) {
                missing_tasks.push(next.clone());
            }
        }
    }
    missing_tasks.sort();

    let mut warnings = Vec::new();
    if let Some(input) = input {
        for entry in &entries {
            let Some(schema_json) = defs.get(entry).and_then(|d| d.input_schema.as_ref()) else {
                continue;
            };
            if let Ok(schema) = InputSchema::parse(schema_json) {
                warnings.extend(schema.validate(input));
            }
        }
    }

    Ok(DryRunReport {
        pipeline_id: pipeline.id,
        pipeline_version: pipeline.pipeline_version,
        plan: dag::layers(&snapshot, &entries),
        missing_tasks,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
