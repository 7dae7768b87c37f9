//! Maintenance lifecycle: a three-state machine over the singleton
//! orchestrator state row.
//!
//! ```text
//! running --request--> waiting_for_maintenance --drained--> maintenance
//!    ^                          |                               |
//!    +----------exit-----------+-------------exit--------------+
//! ```
//!
//! `waiting_for_maintenance` closes the admission gate but lets queued and
//! running work finish; the monitor promotes to `maintenance` once
//! `(pending + running) == 0`. A direct `running -> maintenance` jump is
//! not a legal edge.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use sluice_db::models::{OrchestratorMode, OrchestratorState};
use sluice_db::queries::state as state_db;
use sluice_db::queries::task_runs as run_db;

use crate::error::{CoreError, CoreResult};

/// Orchestrator state with live queue counts.
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    pub mode: OrchestratorMode,
    pub mode_changed_at: DateTime<Utc>,
    pub pending_tasks: i64,
    pub running_tasks: i64,
    pub waiting_tasks: i64,
}

/// Current mode plus queue counts, seeding the singleton on first access.
pub async fn state_report(pool: &PgPool) -> Result<StateReport> {
    let state = state_db::get_or_seed_state(pool).await?;
    let totals = run_db::queue_totals(pool).await?;
    Ok(StateReport {
        mode: state.mode,
        mode_changed_at: state.mode_changed_at,
        pending_tasks: totals.pending,
        running_tasks: totals.running,
        waiting_tasks: totals.waiting,
    })
}

/// Admission gate: new triggers and enqueues require `running` mode.
pub async fn require_running(pool: &PgPool) -> CoreResult<()> {
    let state = state_db::get_or_seed_state(pool).await?;
    match state.mode {
        OrchestratorMode::Running => Ok(()),
        mode => Err(CoreError::Unavailable(mode)),
    }
}

/// Request maintenance: `running -> waiting_for_maintenance`.
///
/// Idempotent when the orchestrator is already waiting or in maintenance.
pub async fn request_maintenance(pool: &PgPool) -> CoreResult<OrchestratorState> {
    let rows = state_db::transition_mode(
        pool,
        OrchestratorMode::Running,
        OrchestratorMode::WaitingForMaintenance,
    )
    .await?;

    let state = state_db::get_or_seed_state(pool).await?;
    if rows > 0 {
        tracing::info!("maintenance requested, draining tasks");
    }
    Ok(state)
}

/// Exit maintenance: back to `running` from either non-running mode.
pub async fn exit_maintenance(pool: &PgPool) -> CoreResult<OrchestratorState> {
    let from_waiting = state_db::transition_mode(
        pool,
        OrchestratorMode::WaitingForMaintenance,
        OrchestratorMode::Running,
    )
    .await?;
    let from_maintenance = state_db::transition_mode(
        pool,
        OrchestratorMode::Maintenance,
        OrchestratorMode::Running,
    )
    .await?;

    let state = state_db::get_or_seed_state(pool).await?;
    if from_waiting + from_maintenance > 0 {
        tracing::info!("maintenance exited, accepting work again");
    }
    Ok(state)
}

/// Monitor tick: promote `waiting_for_maintenance -> maintenance` once all
/// pending and running work has drained. Returns `true` when the promotion
/// happened.
pub async fn check_drained(pool: &PgPool) -> Result<bool> {
    let state = state_db::get_or_seed_state(pool).await?;
    if state.mode != OrchestratorMode::WaitingForMaintenance {
        return Ok(false);
    }

    let totals = run_db::queue_totals(pool).await?;
    if totals.pending + totals.running > 0 {
        return Ok(false);
    }

    let rows = state_db::transition_mode(
        pool,
        OrchestratorMode::WaitingForMaintenance,
        OrchestratorMode::Maintenance,
    )
    .await?;
    if rows > 0 {
        tracing::info!("all tasks drained, entering maintenance");
    }
    Ok(rows > 0)
}
