//! Error taxonomy for the scheduling engine.
//!
//! Operations the HTTP surface maps onto status codes return [`CoreError`];
//! everything else propagates `anyhow::Error` through the `Internal`
//! variant. Stable error-code strings stored on runs live in [`codes`].

use sluice_db::models::OrchestratorMode;

use crate::schema::ValidationIssue;

/// Reserved, stable error-code strings. Workers may emit additional codes;
/// those are stored verbatim.
pub mod codes {
    pub const DISPATCH_FAILED: &str = "DISPATCH_FAILED";
    pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
    pub const INVALID_NEXT_TASKS: &str = "INVALID_NEXT_TASKS";
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const ORCHESTRATOR_UNAVAILABLE: &str = "ORCHESTRATOR_UNAVAILABLE";
}

/// Errors surfaced to callers of the scheduling engine.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The admission gate is closed (maintenance lifecycle).
    #[error("orchestrator is not accepting new work (mode: {0})")]
    Unavailable(OrchestratorMode),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Input failed schema validation in strict mode.
    #[error("input validation failed for task {task_id}")]
    InvalidInput {
        task_id: String,
        issues: Vec<ValidationIssue>,
    },

    /// A worker selected next tasks outside its allowed set.
    #[error("task {task_id} selected next tasks outside its allowed set: {rejected:?}")]
    InvalidNextTasks {
        task_id: String,
        rejected: Vec<String>,
    },

    /// A registration tried to claim a task owned by another service.
    #[error("task {task_id} is already registered to service {owner}")]
    TaskOwnedByOtherService { task_id: String, owner: String },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
