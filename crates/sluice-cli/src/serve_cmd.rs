//! `sluice serve`: the HTTP API over the scheduling engine, plus the
//! background orchestrator loops.
//!
//! Handlers are thin: parse the wire shape, call into `sluice-core`, map
//! errors onto status codes. All scheduling behavior lives in the core.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use sluice_core::callbacks::{self, CompletionPayload, HeartbeatAck};
use sluice_core::config::OrchestratorConfig;
use sluice_core::dlq;
use sluice_core::error::{CoreError, codes};
use sluice_core::executor::{self, QueueRequest, TriggerRequest};
use sluice_core::ids;
use sluice_core::maintenance;
use sluice_core::registry::{self, NewTaskDef, RegistrationRequest};
use sluice_core::runtime::Orchestrator;
use sluice_core::schema::ValidationMode;
use sluice_core::stats;
use sluice_core::store::{BlobStore, paths};
use sluice_core::token::TokenConfig;
use sluice_db::models::{FailureMode, RetryBackoff, TaskRun};
use sluice_db::queries::{
    pipeline_runs as prun_db, services as service_db, task_runs as run_db,
    temp_uploads as upload_db,
};

// ---------------------------------------------------------------------------
// State & error type
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub store: BlobStore,
}

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unavailable(mode) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::ORCHESTRATOR_UNAVAILABLE,
                format!("orchestrator is not accepting new work (mode: {mode})"),
            ),
            CoreError::NotFound { kind, id } => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{kind} {id} not found"),
            ),
            CoreError::InvalidInput { task_id, issues } => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: codes::INVALID_INPUT,
                message: format!("input validation failed for task {task_id}"),
                details: serde_json::to_value(&issues).ok(),
            },
            CoreError::InvalidNextTasks { task_id, rejected } => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: codes::INVALID_NEXT_TASKS,
                message: format!("task {task_id} selected next tasks outside its allowed set"),
                details: serde_json::to_value(&rejected).ok(),
            },
            CoreError::TaskOwnedByOtherService { task_id, owner } => Self::new(
                StatusCode::CONFLICT,
                "TASK_OWNED_BY_OTHER_SERVICE",
                format!("task {task_id} is already registered to service {owner}"),
            ),
            CoreError::InvalidTransition(msg) => {
                Self::new(StatusCode::CONFLICT, "INVALID_TRANSITION", msg)
            }
            CoreError::Internal(err) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                format!("{err:#}"),
            ),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            format!("{err:#}"),
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": self.message,
            "code": self.code,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSpecBody {
    id: String,
    code_hash: String,
    #[serde(default)]
    allowed_next: Vec<String>,
    timeout_seconds: Option<i32>,
    retries: Option<i32>,
    retry_backoff: Option<RetryBackoff>,
    retry_delay_ms: Option<i64>,
    max_retry_delay_ms: Option<i64>,
    heartbeat_interval_ms: Option<i64>,
    concurrency: Option<i32>,
    priority: Option<i32>,
    idempotency_ttl_seconds: Option<i64>,
    fatal_error_prefix: Option<String>,
    input_schema: Option<Value>,
    #[serde(default)]
    description: String,
}

impl TaskSpecBody {
    fn into_def(self) -> NewTaskDef {
        let defaults = NewTaskDef::default();
        NewTaskDef {
            id: self.id,
            code_hash: self.code_hash,
            allowed_next: self.allowed_next,
            timeout_seconds: self.timeout_seconds.unwrap_or(defaults.timeout_seconds),
            retries: self.retries.unwrap_or(defaults.retries),
            retry_backoff: self.retry_backoff.unwrap_or(defaults.retry_backoff),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            max_retry_delay_ms: self
                .max_retry_delay_ms
                .unwrap_or(defaults.max_retry_delay_ms),
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(defaults.heartbeat_interval_ms),
            concurrency: self.concurrency.unwrap_or(defaults.concurrency),
            priority: self.priority.unwrap_or(defaults.priority),
            idempotency_ttl_seconds: self
                .idempotency_ttl_seconds
                .unwrap_or(defaults.idempotency_ttl_seconds),
            fatal_error_prefix: self.fatal_error_prefix.or(defaults.fatal_error_prefix),
            input_schema: self.input_schema,
            description: self.description,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    service_id: String,
    version: String,
    base_url: String,
    #[serde(default)]
    tasks: Vec<TaskSpecBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineBody {
    id: String,
    name: String,
    entry_task_ids: Vec<String>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerBody {
    input: Value,
    failure_mode: Option<FailureMode>,
    priority: Option<i32>,
    metadata: Option<Value>,
    validation_mode: Option<ValidationMode>,
    #[serde(default)]
    idempotency_keys: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedTask {
    run_id: String,
    task_id: String,
    status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    pipeline_run_id: String,
    status: String,
    input_path: String,
    entry_tasks: Vec<String>,
    queued_tasks: Vec<QueuedTask>,
    warnings: Vec<sluice_core::schema::ValidationIssue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueBody {
    input: Value,
    priority: Option<i32>,
    idempotency_key: Option<String>,
    validation_mode: Option<ValidationMode>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DryRunBody {
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBody {
    progress: Option<Value>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    filename: String,
    mime_type: String,
    size_bytes: i64,
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    id: String,
    storage_path: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PurgeBody {
    older_than_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DlqQuery {
    task_id: Option<String>,
    pipeline_run_id: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsQuery {
    scope: Option<String>,
    scope_id: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    bucket: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineRunDetail {
    #[serde(flatten)]
    run: sluice_db::models::PipelineRun,
    tasks: Vec<TaskRun>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/services/register", post(register_service))
        .route("/api/services", get(list_services))
        .route("/api/pipelines", post(register_pipeline))
        .route("/api/pipelines/{id}/trigger", post(trigger_pipeline))
        .route("/api/pipelines/{id}/dry-run", post(dry_run_pipeline))
        .route("/api/tasks/{id}/queue", post(queue_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/heartbeat", post(heartbeat))
        .route("/api/runs/{id}/complete", post(complete_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/pipeline-runs/{id}", get(get_pipeline_run))
        .route("/api/pipeline-runs/{id}/cancel", post(cancel_pipeline_run))
        .route("/api/dlq", get(list_dlq))
        .route("/api/dlq/purge", post(purge_dlq))
        .route("/api/dlq/{id}/retry", post(retry_dlq))
        .route("/api/stats", get(get_stats))
        .route("/api/stats/queue", get(get_queue_stats))
        .route("/api/state", get(get_state))
        .route("/api/maintenance/request", post(request_maintenance))
        .route("/api/maintenance/exit", post(exit_maintenance))
        .route("/api/uploads", post(register_upload))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    pool: PgPool,
    store: BlobStore,
    token_config: TokenConfig,
    config: OrchestratorConfig,
    bind: &str,
    port: u16,
) -> Result<()> {
    let orchestrator = Orchestrator::new(pool.clone(), store.clone(), token_config, config)?;
    let handles = orchestrator.start();

    let app = build_router(AppState { pool, store });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("sluice serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("sluice serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "sluice",
        "api": "/api",
    }))
}

async fn register_service(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, AppError> {
    let req = RegistrationRequest {
        service_id: body.service_id,
        version: body.version,
        base_url: body.base_url,
        tasks: body.tasks.into_iter().map(TaskSpecBody::into_def).collect(),
    };
    let outcome = registry::register(&state.pool, &req).await?;
    Ok(Json(outcome))
}

async fn list_services(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let services = service_db::list_services(&state.pool).await?;
    Ok(Json(services))
}

async fn register_pipeline(
    State(state): State<AppState>,
    Json(body): Json<PipelineBody>,
) -> Result<impl IntoResponse, AppError> {
    let pipeline = registry::register_pipeline(
        &state.pool,
        &body.id,
        &body.name,
        &body.entry_task_ids,
        &body.description,
    )
    .await?;
    Ok(Json(pipeline))
}

async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TriggerBody>,
) -> Result<impl IntoResponse, AppError> {
    let req = TriggerRequest {
        input: body.input,
        failure_mode: body.failure_mode,
        priority: body.priority,
        metadata: body.metadata,
        validation_mode: body.validation_mode,
        idempotency_keys: body.idempotency_keys,
    };
    let outcome = executor::trigger_pipeline(&state.pool, &state.store, &id, &req).await?;
    Ok(Json(TriggerResponse {
        pipeline_run_id: outcome.pipeline_run.id,
        status: outcome.pipeline_run.status.to_string(),
        input_path: outcome.input_path,
        entry_tasks: outcome.entry_tasks,
        queued_tasks: outcome
            .queued_runs
            .iter()
            .map(|r| QueuedTask {
                run_id: r.id.clone(),
                task_id: r.task_id.clone(),
                status: r.status.to_string(),
            })
            .collect(),
        warnings: outcome.warnings,
    }))
}

async fn dry_run_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<DryRunBody>>,
) -> Result<impl IntoResponse, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let report = executor::dry_run(&state.pool, &id, body.input.as_ref()).await?;
    Ok(Json(report))
}

async fn queue_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<QueueBody>,
) -> Result<impl IntoResponse, AppError> {
    let req = QueueRequest {
        input: body.input,
        priority: body.priority,
        idempotency_key: body.idempotency_key,
        validation_mode: body.validation_mode,
    };
    let run = executor::queue_task(&state.pool, &state.store, &id, &req).await?;
    Ok(Json(run))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let def = registry::get_task(&state.pool, &id).await?;
    Ok(Json(def))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskRunDetail {
    #[serde(flatten)]
    run: TaskRun,
    /// Earlier terminal attempts in the same retry chain.
    previous_attempts: Vec<TaskRun>,
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = run_db::get_task_run(&state.pool, &id)
        .await?
        .ok_or_else(|| CoreError::not_found("task run", id))?;
    let previous_attempts = run_db::prior_attempts(
        &state.pool,
        &run.task_id,
        run.pipeline_run_id.as_deref(),
        &run.input_path,
        run.attempt,
    )
    .await?;
    Ok(Json(TaskRunDetail {
        run,
        previous_attempts,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<HeartbeatAck>, AppError> {
    let ack = callbacks::heartbeat(&state.pool, &id, body.progress, body.message).await?;
    Ok(Json(ack))
}

async fn complete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CompletionPayload>,
) -> Result<impl IntoResponse, AppError> {
    let run = callbacks::complete_run(&state.pool, &state.store, &id, &body).await?;
    Ok(Json(run))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = executor::cancel_task_run(&state.pool, &id).await?;
    Ok(Json(run))
}

async fn get_pipeline_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = prun_db::get_pipeline_run(&state.pool, &id)
        .await?
        .ok_or_else(|| CoreError::not_found("pipeline run", id.clone()))?;
    let tasks = run_db::list_runs_for_pipeline(&state.pool, &id).await?;
    Ok(Json(PipelineRunDetail { run, tasks }))
}

async fn cancel_pipeline_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = executor::cancel_pipeline_run(&state.pool, &id).await?;
    Ok(Json(run))
}

async fn list_dlq(
    State(state): State<AppState>,
    Query(query): Query<DlqQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = dlq::DlqFilter {
        task_id: query.task_id,
        pipeline_run_id: query.pipeline_run_id,
        ..Default::default()
    };
    let items = dlq::list(&state.pool, &filter, query.limit.unwrap_or(100)).await?;
    Ok(Json(items))
}

async fn retry_dlq(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = dlq::replay(&state.pool, &id).await?;
    Ok(Json(run))
}

async fn purge_dlq(
    State(state): State<AppState>,
    body: Option<Json<PurgeBody>>,
) -> Result<impl IntoResponse, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let purged = dlq::purge(&state.pool, body.older_than_days.unwrap_or(30)).await?;
    Ok(Json(serde_json::json!({ "purged": purged })))
}

async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let scope = query
        .scope
        .as_deref()
        .unwrap_or("system")
        .parse()
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", format!("{e}")))?;
    let bucket = query
        .bucket
        .as_deref()
        .unwrap_or("1h")
        .parse()
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", format!("{e}")))?;
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query
        .from
        .unwrap_or_else(|| to - ChronoDuration::hours(24));

    let report = stats::get_statistics(
        &state.pool,
        &stats::StatsRequest {
            scope,
            scope_id: query.scope_id,
            from,
            to,
            bucket,
        },
    )
    .await?;
    Ok(Json(report))
}

async fn get_queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let stats = stats::queue_stats(&state.pool).await?;
    Ok(Json(stats))
}

async fn get_state(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let report = maintenance::state_report(&state.pool).await?;
    Ok(Json(report))
}

async fn request_maintenance(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let result = maintenance::request_maintenance(&state.pool).await?;
    Ok(Json(result))
}

async fn exit_maintenance(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let result = maintenance::exit_maintenance(&state.pool).await?;
    Ok(Json(result))
}

async fn register_upload(
    State(state): State<AppState>,
    Json(body): Json<UploadBody>,
) -> Result<impl IntoResponse, AppError> {
    let id = ids::temp_upload_id();
    let storage_path = paths::temp_upload(&id, &body.filename);
    let upload = upload_db::insert_temp_upload(
        &state.pool,
        &id,
        &storage_path,
        "default",
        &body.filename,
        &body.mime_type,
        body.size_bytes,
        body.ttl_seconds.unwrap_or(3600),
    )
    .await?;
    Ok(Json(UploadResponse {
        id: upload.id,
        storage_path: upload.storage_path,
        expires_at: upload.expires_at,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
