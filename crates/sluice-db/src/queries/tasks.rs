//! Database query functions for the `task_defs` and `task_code_history`
//! tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{RetryBackoff, TaskCodeHistory, TaskDef};

/// Submitted definition for one task, as sent by a registering service.
#[derive(Debug, Clone)]
pub struct NewTaskDef {
    pub id: String,
    pub code_hash: String,
    pub allowed_next: Vec<String>,
    pub timeout_seconds: i32,
    pub retries: i32,
    pub retry_backoff: RetryBackoff,
    pub retry_delay_ms: i64,
    pub max_retry_delay_ms: i64,
    pub heartbeat_interval_ms: i64,
    pub concurrency: i32,
    pub priority: i32,
    pub idempotency_ttl_seconds: i64,
    pub fatal_error_prefix: Option<String>,
    pub input_schema: Option<serde_json::Value>,
    pub description: String,
}

impl Default for NewTaskDef {
    fn default() -> Self {
        Self {
            id: String::new(),
            code_hash: String::new(),
            allowed_next: Vec::new(),
            timeout_seconds: 300,
            retries: 0,
            retry_backoff: RetryBackoff::Exponential,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            heartbeat_interval_ms: 15_000,
            concurrency: 0,
            priority: 100,
            idempotency_ttl_seconds: 0,
            fatal_error_prefix: Some("FATAL_".to_owned()),
            input_schema: None,
            description: String::new(),
        }
    }
}

/// Outcome of upserting one task definition during registration.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub task: TaskDef,
    /// `Some((old, new))` when the code hash changed and the version was
    /// bumped; `None` for brand-new tasks and unchanged re-registrations.
    pub version_bump: Option<(i32, i32)>,
    pub created: bool,
}

/// Upsert one task definition on behalf of a service registration.
///
/// Runs in a transaction: a changed `code_hash` bumps `code_version` by one
/// and appends a `task_code_history` row atomically. Re-registering with an
/// identical hash updates the mutable fields but leaves the version and the
/// history untouched. Brand-new tasks start at version 1 with one history
/// row.
pub async fn upsert_task_def(
    pool: &PgPool,
    service_id: &str,
    service_version: &str,
    new: &NewTaskDef,
) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let existing = sqlx::query_as::<_, TaskDef>(
        "SELECT * FROM task_defs WHERE id = $1 FOR UPDATE",
    )
    .bind(&new.id)
    .fetch_optional(&mut *tx)
    .await
    .with_context(|| format!("failed to lock task def {}", new.id))?;

    let outcome = match existing {
        None => {
            let task = sqlx::query_as::<_, TaskDef>(
                "INSERT INTO task_defs \
                 (id, service_id, code_hash, allowed_next, timeout_seconds, retries, \
                  retry_backoff, retry_delay_ms, max_retry_delay_ms, heartbeat_interval_ms, \
                  concurrency, priority, idempotency_ttl_seconds, fatal_error_prefix, \
                  input_schema, description) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
                 RETURNING *",
            )
            .bind(&new.id)
            .bind(service_id)
            .bind(&new.code_hash)
            .bind(Json(&new.allowed_next))
            .bind(new.timeout_seconds)
            .bind(new.retries)
            .bind(new.retry_backoff)
            .bind(new.retry_delay_ms)
            .bind(new.max_retry_delay_ms)
            .bind(new.heartbeat_interval_ms)
            .bind(new.concurrency)
            .bind(new.priority)
            .bind(new.idempotency_ttl_seconds)
            .bind(&new.fatal_error_prefix)
            .bind(&new.input_schema)
            .bind(&new.description)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to insert task def {}", new.id))?;

            sqlx::query(
                "INSERT INTO task_code_history (task_id, code_version, code_hash, service_version) \
                 VALUES ($1, 1, $2, $3)",
            )
            .bind(&new.id)
            .bind(&new.code_hash)
            .bind(service_version)
            .execute(&mut *tx)
            .await
            .context("failed to record initial code history")?;

            UpsertOutcome {
                task,
                version_bump: None,
                created: true,
            }
        }
        Some(prev) => {
            let bumped = prev.code_hash != new.code_hash;
            let next_version = if bumped {
                prev.code_version + 1
            } else {
                prev.code_version
            };

            let task = sqlx::query_as::<_, TaskDef>(
                "UPDATE task_defs SET \
                 code_hash = $2, code_version = $3, allowed_next = $4, timeout_seconds = $5, \
                 retries = $6, retry_backoff = $7, retry_delay_ms = $8, max_retry_delay_ms = $9, \
                 heartbeat_interval_ms = $10, concurrency = $11, priority = $12, \
                 idempotency_ttl_seconds = $13, fatal_error_prefix = $14, input_schema = $15, \
                 description = $16, updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING *",
            )
            .bind(&new.id)
            .bind(&new.code_hash)
            .bind(next_version)
            .bind(Json(&new.allowed_next))
            .bind(new.timeout_seconds)
            .bind(new.retries)
            .bind(new.retry_backoff)
            .bind(new.retry_delay_ms)
            .bind(new.max_retry_delay_ms)
            .bind(new.heartbeat_interval_ms)
            .bind(new.concurrency)
            .bind(new.priority)
            .bind(new.idempotency_ttl_seconds)
            .bind(&new.fatal_error_prefix)
            .bind(&new.input_schema)
            .bind(&new.description)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to update task def {}", new.id))?;

            if bumped {
                sqlx::query(
                    "INSERT INTO task_code_history (task_id, code_version, code_hash, service_version) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(&new.id)
                .bind(next_version)
                .bind(&new.code_hash)
                .bind(service_version)
                .execute(&mut *tx)
                .await
                .context("failed to record code history")?;
            }

            UpsertOutcome {
                task,
                version_bump: bumped.then_some((prev.code_version, next_version)),
                created: false,
            }
        }
    };

    tx.commit().await.context("failed to commit task upsert")?;
    Ok(outcome)
}

/// Fetch a single task definition by ID.
pub async fn get_task_def(pool: &PgPool, id: &str) -> Result<Option<TaskDef>> {
    let task = sqlx::query_as::<_, TaskDef>("SELECT * FROM task_defs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch task def {id}"))?;

    Ok(task)
}

/// Fetch several task definitions at once.
pub async fn get_task_defs(pool: &PgPool, ids: &[String]) -> Result<Vec<TaskDef>> {
    let tasks = sqlx::query_as::<_, TaskDef>(
        "SELECT * FROM task_defs WHERE id = ANY($1) ORDER BY id",
    )
    .bind(ids)
    .fetch_all(pool)
    .await
    .context("failed to fetch task defs")?;

    Ok(tasks)
}

/// List all task definitions owned by a service.
pub async fn list_task_defs_for_service(pool: &PgPool, service_id: &str) -> Result<Vec<TaskDef>> {
    let tasks = sqlx::query_as::<_, TaskDef>(
        "SELECT * FROM task_defs WHERE service_id = $1 ORDER BY id",
    )
    .bind(service_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list task defs for service {service_id}"))?;

    Ok(tasks)
}

/// Which service currently owns a task id, if any.
pub async fn task_owner(pool: &PgPool, task_id: &str) -> Result<Option<String>> {
    let owner: Option<(String,)> =
        sqlx::query_as("SELECT service_id FROM task_defs WHERE id = $1")
            .bind(task_id)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to look up owner of task {task_id}"))?;

    Ok(owner.map(|(id,)| id))
}

/// Full code history for a task, oldest first.
pub async fn get_code_history(pool: &PgPool, task_id: &str) -> Result<Vec<TaskCodeHistory>> {
    let rows = sqlx::query_as::<_, TaskCodeHistory>(
        "SELECT * FROM task_code_history WHERE task_id = $1 ORDER BY code_version ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to fetch code history for task {task_id}"))?;

    Ok(rows)
}
