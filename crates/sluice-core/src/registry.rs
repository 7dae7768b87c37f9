//! Service and task registration.
//!
//! Workers announce themselves with their full task set on startup. A
//! changed code hash bumps the task's code version and appends history;
//! tasks missing from a re-registration are orphaned and their queued runs
//! cancelled. A task id claimed by a different service is fatal to the
//! caller.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use sqlx::PgPool;

use sluice_db::models::{Pipeline, Service, StructureSnapshot, TaskDef};
use sluice_db::queries::pipelines as pipeline_db;
use sluice_db::queries::services as service_db;
use sluice_db::queries::task_runs as run_db;
use sluice_db::queries::tasks as task_db;

pub use sluice_db::queries::tasks::NewTaskDef;

use crate::dag;
use crate::error::{CoreError, CoreResult};

/// A full registration request from one worker service.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub service_id: String,
    pub version: String,
    pub base_url: String,
    pub tasks: Vec<NewTaskDef>,
}

/// One task whose code version moved during registration.
#[derive(Debug, Clone, Serialize)]
pub struct CodeChange {
    pub task_id: String,
    pub old_version: Option<i32>,
    pub new_version: i32,
}

/// What a registration did.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationOutcome {
    pub service: Service,
    pub code_changes: Vec<CodeChange>,
    /// Tasks previously owned by this service but absent from this
    /// registration. Their queued runs have been cancelled.
    pub orphaned_tasks: Vec<String>,
    pub cancelled_runs: u64,
}

/// Register (or re-register) a service with its task set.
pub async fn register(pool: &PgPool, req: &RegistrationRequest) -> CoreResult<RegistrationOutcome> {
    // Ownership check up front: a task id claimed by another service is a
    // configuration error, surfaced before any mutation.
    for task in &req.tasks {
        if let Some(owner) = task_db::task_owner(pool, &task.id).await? {
            if owner != req.service_id {
                return Err(CoreError::TaskOwnedByOtherService {
                    task_id: task.id.clone(),
                    owner,
                });
            }
        }
    }

    let previous = task_db::list_task_defs_for_service(pool, &req.service_id).await?;
    let service =
        service_db::upsert_service(pool, &req.service_id, &req.version, &req.base_url).await?;

    let mut code_changes = Vec::new();
    for task in &req.tasks {
        let outcome = task_db::upsert_task_def(pool, &req.service_id, &req.version, task).await?;
        if outcome.created {
            code_changes.push(CodeChange {
                task_id: task.id.clone(),
                old_version: None,
                new_version: outcome.task.code_version,
            });
        } else if let Some((old, new)) = outcome.version_bump {
            tracing::info!(
                task_id = %task.id,
                old_version = old,
                new_version = new,
                "task code changed"
            );
            code_changes.push(CodeChange {
                task_id: task.id.clone(),
                old_version: Some(old),
                new_version: new,
            });
        }
    }

    let submitted: BTreeSet<&str> = req.tasks.iter().map(|t| t.id.as_str()).collect();
    let orphaned_tasks: Vec<String> = previous
        .iter()
        .filter(|t| !submitted.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect();

    let cancelled_runs = if orphaned_tasks.is_empty() {
        0
    } else {
        let cancelled = run_db::cancel_queued_for_tasks(pool, &orphaned_tasks).await?;
        tracing::warn!(
            service_id = %req.service_id,
            orphaned = ?orphaned_tasks,
            cancelled_runs = cancelled,
            "registration orphaned tasks"
        );
        cancelled
    };

    Ok(RegistrationOutcome {
        service,
        code_changes,
        orphaned_tasks,
        cancelled_runs,
    })
}

/// Read-only task lookup.
pub async fn get_task(pool: &PgPool, task_id: &str) -> CoreResult<TaskDef> {
    task_db::get_task_def(pool, task_id)
        .await?
        .ok_or_else(|| CoreError::not_found("task", task_id))
}

/// Read-only service lookup.
pub async fn get_service(pool: &PgPool, service_id: &str) -> CoreResult<Service> {
    service_db::get_service(pool, service_id)
        .await?
        .ok_or_else(|| CoreError::not_found("service", service_id))
}

/// Register a pipeline definition over already-registered tasks. The
/// pipeline version is a hash of the reachable structure; `allowed_next`
/// targets that do not exist yet are tolerated here and validated at
/// trigger time.
pub async fn register_pipeline(
    pool: &PgPool,
    id: &str,
    name: &str,
    entry_task_ids: &[String],
    description: &str,
) -> CoreResult<Pipeline> {
    let (snapshot, _defs) = load_reachable_defs(pool, entry_task_ids, false).await?;
    let version = dag::structure_hash(&snapshot);
    let pipeline =
        pipeline_db::upsert_pipeline(pool, id, name, entry_task_ids, &version, description)
            .await?;
    Ok(pipeline)
}

/// Load every task definition reachable from the entries and build the
/// structure snapshot.
///
/// With `require_complete`, a dangling `allowed_next` target (or a missing
/// entry) is an error; otherwise dangling targets are dropped from the
/// snapshot. Missing entries are always an error.
pub async fn load_reachable_defs(
    pool: &PgPool,
    entries: &[String],
    require_complete: bool,
) -> CoreResult<(StructureSnapshot, BTreeMap<String, TaskDef>)> {
    let mut defs: BTreeMap<String, TaskDef> = BTreeMap::new();
    let mut queue: VecDeque<String> = entries.iter().cloned().collect();
    let mut seen: BTreeSet<String> = entries.iter().cloned().collect();

    while !queue.is_empty() {
        let batch: Vec<String> = queue.drain(..).collect();
        let loaded = task_db::get_task_defs(pool, &batch).await?;
        let loaded_ids: BTreeSet<&str> = loaded.iter().map(|d| d.id.as_str()).collect();

        for id in &batch {
            if !loaded_ids.contains(id.as_str()) {
                let is_entry = entries.contains(id);
                if is_entry || require_complete {
                    return Err(CoreError::not_found("task", id.clone()));
                }
            }
        }

        for def in loaded {
            for next in &def.allowed_next.0 {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
            defs.insert(def.id.clone(), def);
        }
    }

    let mut snapshot: StructureSnapshot = StructureSnapshot::new();
    for def in defs.values() {
        let allowed_next = def
            .allowed_next
            .0
            .iter()
            .filter(|n| defs.contains_key(*n))
            .cloned()
            .collect();
        snapshot.insert(
            def.id.clone(),
            sluice_db::models::StructureNode { allowed_next },
        );
    }

    Ok((snapshot, defs))
}
