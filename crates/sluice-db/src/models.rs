use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------

/// Status of a single task run (one attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskRunStatus {
    /// Terminal statuses carry a non-null `completed_at`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskRunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError {
                kind: "task run status",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

impl PipelineRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Partial
        )
    }
}

impl fmt::Display for PipelineRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Partial => "partial",
        };
        f.write_str(s)
    }
}

impl FromStr for PipelineRunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "partial" => Ok(Self::Partial),
            other => Err(ParseEnumError {
                kind: "pipeline run status",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------

/// How a pipeline run reacts when one of its tasks exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Cancel every non-terminal task run; pipeline run fails immediately.
    #[serde(alias = "fail-fast")]
    FailFast,
    /// Only the failed branch stops; unrelated branches keep going.
    Continue,
    /// Downstream of the failed task is never scheduled; siblings continue.
    #[serde(alias = "partial-merge")]
    PartialMerge,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailFast => "fail_fast",
            Self::Continue => "continue",
            Self::PartialMerge => "partial_merge",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            "partial_merge" | "partial-merge" => Ok(Self::PartialMerge),
            other => Err(ParseEnumError {
                kind: "failure mode",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    Fixed,
    Exponential,
}

impl fmt::Display for RetryBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        };
        f.write_str(s)
    }
}

impl FromStr for RetryBackoff {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(ParseEnumError {
                kind: "retry backoff",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------

/// Process-wide orchestrator mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorMode {
    Running,
    WaitingForMaintenance,
    Maintenance,
}

impl fmt::Display for OrchestratorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::WaitingForMaintenance => "waiting_for_maintenance",
            Self::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

impl FromStr for OrchestratorMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting_for_maintenance" => Ok(Self::WaitingForMaintenance),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(ParseEnumError {
                kind: "orchestrator mode",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------

/// Axis a statistics bucket aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StatsScope {
    System,
    Service,
    Task,
    Pipeline,
}

impl fmt::Display for StatsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::Service => "service",
            Self::Task => "task",
            Self::Pipeline => "pipeline",
        };
        f.write_str(s)
    }
}

impl FromStr for StatsScope {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "service" => Ok(Self::Service),
            "task" => Ok(Self::Task),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(ParseEnumError {
                kind: "statistics scope",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------

/// Size of a statistics bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum BucketSize {
    #[sqlx(rename = "1m")]
    #[serde(rename = "1m")]
    Minute,
    #[sqlx(rename = "1h")]
    #[serde(rename = "1h")]
    Hour,
    #[sqlx(rename = "1d")]
    #[serde(rename = "1d")]
    Day,
}

impl BucketSize {
    /// Bucket width in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86400,
        }
    }
}

impl fmt::Display for BucketSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minute => "1m",
            Self::Hour => "1h",
            Self::Day => "1d",
        };
        f.write_str(s)
    }
}

impl FromStr for BucketSize {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::Minute),
            "1h" => Ok(Self::Hour),
            "1d" => Ok(Self::Day),
            other => Err(ParseEnumError {
                kind: "bucket size",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON column payloads
// ---------------------------------------------------------------------------

/// One node of the DAG structure frozen onto a pipeline run at trigger time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureNode {
    pub allowed_next: Vec<String>,
}

/// Frozen DAG structure: task id -> allowed successors. Isolates a running
/// pipeline from subsequent pipeline edits.
pub type StructureSnapshot = BTreeMap<String, StructureNode>;

/// Reference to a named asset a worker produced alongside its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Map of asset key -> reference.
pub type AssetMap = BTreeMap<String, AssetRef>;

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered worker instance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: String,
    pub version: String,
    pub base_url: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A task definition registered by a service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDef {
    pub id: String,
    pub service_id: String,
    pub code_hash: String,
    pub code_version: i32,
    pub allowed_next: Json<Vec<String>>,
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
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of a task's code hash changes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskCodeHistory {
    pub task_id: String,
    pub code_version: i32,
    pub code_hash: String,
    pub service_version: String,
    pub recorded_at: DateTime<Utc>,
}

/// A pipeline definition: named entry points into the task DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub entry_task_ids: Json<Vec<String>>,
    pub pipeline_version: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub status: PipelineRunStatus,
    pub failure_mode: FailureMode,
    pub input_path: String,
    pub structure: Json<StructureSnapshot>,
    pub pipeline_version: String,
    /// Trigger-level priority override for every run in this pipeline.
    pub priority: Option<i32>,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One attempt at executing a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRun {
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
    pub output_path: Option<String>,
    pub output_size: Option<i64>,
    pub assets: Option<Json<AssetMap>>,
    pub logs_path: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub idempotency_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub selected_next: Option<Json<Vec<String>>>,
    pub metadata: serde_json::Value,
}

/// A run whose retries are exhausted, parked for manual inspection.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DlqItem {
    pub id: String,
    pub task_run_id: String,
    pub task_id: String,
    pub pipeline_run_id: Option<String>,
    pub code_version: i32,
    pub code_hash: String,
    pub error: String,
    pub error_code: Option<String>,
    pub attempts: i32,
    pub input_path: String,
    pub failed_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
}

/// A cached successful output, keyed by SHA-256(task_id:user_key).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyEntry {
    pub cache_key: String,
    pub task_id: String,
    pub code_version: i32,
    pub output_path: String,
    pub output_size: Option<i64>,
    pub assets: Option<Json<AssetMap>>,
    pub run_id: String,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The singleton orchestrator state row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrchestratorState {
    pub id: String,
    pub mode: OrchestratorMode,
    pub mode_changed_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A file uploaded ahead of a run, waiting to be claimed by a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TempUpload {
    pub id: String,
    pub storage_path: String,
    pub storage_backend_id: String,
    pub original_filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub claimed_by_run_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One persisted statistics rollup bucket.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StatisticsBucket {
    pub bucket_ts: DateTime<Utc>,
    pub bucket_size: BucketSize,
    pub scope: StatsScope,
    pub scope_id: String,
    pub data: serde_json::Value,
    pub is_complete: bool,
    pub last_built_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
