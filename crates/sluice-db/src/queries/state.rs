//! Database query functions for the singleton `orchestrator_state` row.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{OrchestratorMode, OrchestratorState};

/// Fixed id of the singleton row.
pub const SINGLETON_ID: &str = "singleton";

/// Fetch the orchestrator state, seeding the row on first access.
pub async fn get_or_seed_state(pool: &PgPool) -> Result<OrchestratorState> {
    sqlx::query("INSERT INTO orchestrator_state (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(SINGLETON_ID)
        .execute(pool)
        .await
        .context("failed to seed orchestrator state")?;

    let state = sqlx::query_as::<_, OrchestratorState>(
        "SELECT * FROM orchestrator_state WHERE id = $1",
    )
    .bind(SINGLETON_ID)
    .fetch_one(pool)
    .await
    .context("failed to fetch orchestrator state")?;

    Ok(state)
}

/// Atomically transition the mode. Uses optimistic locking on the current
/// mode so concurrent transitions cannot race; zero rows affected means the
/// mode was not `from`.
pub async fn transition_mode(
    pool: &PgPool,
    from: OrchestratorMode,
    to: OrchestratorMode,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orchestrator_state \
         SET mode = $1, mode_changed_at = NOW() \
         WHERE id = $2 AND mode = $3",
    )
    .bind(to)
    .bind(SINGLETON_ID)
    .bind(from)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition orchestrator mode {from} -> {to}"))?;

    Ok(result.rows_affected())
}
