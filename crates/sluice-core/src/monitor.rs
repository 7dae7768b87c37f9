//! Periodic monitors: heartbeat-timeout detection and the
//! maintenance-drain check.

use anyhow::Result;
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use sluice_db::queries::task_runs as run_db;

use crate::executor;
use crate::maintenance;
use crate::store::BlobStore;

/// Mark every running run whose heartbeat went stale as `timeout` and feed
/// each into the retry/DLQ path. Returns the number of runs timed out.
pub async fn sweep_timeouts(pool: &PgPool, store: &BlobStore) -> Result<usize> {
    let runs = run_db::mark_timed_out_runs(pool).await?;
    for run in &runs {
        tracing::warn!(
            run_id = %run.id,
            task_id = %run.task_id,
            attempt = run.attempt,
            "run timed out (missed heartbeats)"
        );
        executor::handle_run_failure(pool, store, run).await?;
    }
    Ok(runs.len())
}

/// Run the timeout monitor until cancelled.
pub async fn run_timeout_monitor(
    pool: PgPool,
    store: BlobStore,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("timeout monitor stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                match sweep_timeouts(&pool, &store).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(timed_out = n, "timeout sweep"),
                    Err(e) => tracing::error!(error = %e, "timeout sweep failed"),
                }
            }
        }
    }
}

/// Run the maintenance-drain monitor until cancelled.
pub async fn run_maintenance_monitor(pool: PgPool, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("maintenance monitor stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = maintenance::check_drained(&pool).await {
                    tracing::error!(error = %e, "maintenance drain check failed");
                }
            }
        }
    }
}
