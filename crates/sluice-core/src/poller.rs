//! Poller: periodic claim of ready runs under the global and per-task
//! concurrency caps.
//!
//! One logical control loop; each claimed run is dispatched on its own
//! spawned task so slow workers do not serialize the batch. A serverless
//! deployment skips the loop and calls [`Poller::tick`] directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use sluice_db::models::OrchestratorMode;
use sluice_db::queries::state as state_db;
use sluice_db::queries::task_runs as run_db;
use sluice_db::queries::tasks as task_db;

use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::executor;
use crate::store::BlobStore;

pub struct Poller {
    pool: PgPool,
    store: BlobStore,
    dispatcher: Arc<Dispatcher>,
    config: OrchestratorConfig,
}

impl Poller {
    pub fn new(
        pool: PgPool,
        store: BlobStore,
        dispatcher: Arc<Dispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            store,
            dispatcher,
            config,
        }
    }

    /// One poll pass. Returns the number of runs that moved (dispatched or
    /// satisfied from cache).
    pub async fn tick(&self) -> Result<usize> {
        let state = state_db::get_or_seed_state(&self.pool).await?;
        if state.mode != OrchestratorMode::Running {
            return Ok(0);
        }

        let running = run_db::count_running(&self.pool).await?;
        let capacity = self.config.max_concurrency as i64 - running;
        if capacity <= 0 {
            return Ok(0);
        }

        let candidates = run_db::select_ready_candidates(&self.pool, capacity).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        // The claim query checks per-task caps against committed state;
        // batch-internal accounting keeps two claims of the same capped
        // task from both going out in one tick.
        let mut budgets: BTreeMap<String, i64> = BTreeMap::new();
        let mut selected: Vec<String> = Vec::new();
        for (run_id, task_id) in candidates {
            if !budgets.contains_key(&task_id) {
                let cap = task_db::get_task_def(&self.pool, &task_id)
                    .await?
                    .map(|d| d.concurrency)
                    .unwrap_or(0);
                let budget = if cap <= 0 {
                    i64::MAX
                } else {
                    cap as i64 - run_db::count_running_for_task(&self.pool, &task_id).await?
                };
                budgets.insert(task_id.clone(), budget);
            }
            let budget = budgets.get_mut(&task_id).expect("budget just inserted");
            if *budget > 0 {
                *budget -= 1;
                selected.push(run_id);
            }
        }

        let mut handles = Vec::with_capacity(selected.len());
        for run_id in selected {
            let dispatcher = Arc::clone(&self.dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch_run(&run_id).await
            }));
        }

        let mut processed = 0;
        for handle in handles {
            let outcome = handle.await.context("dispatch task panicked")??;
            match outcome {
                DispatchOutcome::Started(_) => processed += 1,
                DispatchOutcome::CompletedFromCache(run) => {
                    processed += 1;
                    executor::after_success(&self.pool, &self.store, &run).await?;
                }
                DispatchOutcome::FailedDispatch(run) => {
                    executor::handle_run_failure(&self.pool, &self.store, &run).await?;
                }
                DispatchOutcome::NotClaimed => {}
            }
        }

        Ok(processed)
    }

    /// Run the poll loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("poller stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(dispatched = n, "poll tick"),
                        Err(e) => tracing::error!(error = %e, "poll tick failed"),
                    }
                }
            }
        }
    }
}
