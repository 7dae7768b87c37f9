//! Orchestrator runtime: wires the poller, monitors, and housekeeping
//! loops together under one cancellation token.
//!
//! Exactly one orchestrator process owns the scheduling loop; the DB lock
//! discipline in the claim path is what keeps a future multi-process
//! deployment safe, not anything in here.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cleanup;
use crate::config::OrchestratorConfig;
use crate::dispatch::{Dispatcher, HttpWorkerClient, WorkerClient};
use crate::monitor;
use crate::poller::Poller;
use crate::store::BlobStore;
use crate::token::TokenConfig;

pub struct Orchestrator {
    pool: PgPool,
    store: BlobStore,
    config: OrchestratorConfig,
    poller: Arc<Poller>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator with the production HTTP worker transport.
    pub fn new(
        pool: PgPool,
        store: BlobStore,
        token_config: TokenConfig,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let client: Arc<dyn WorkerClient> =
            Arc::new(HttpWorkerClient::new(config.dispatch_timeout)?);
        Ok(Self::with_client(pool, store, token_config, config, client))
    }

    /// Build an orchestrator with a custom worker transport (tests).
    pub fn with_client(
        pool: PgPool,
        store: BlobStore,
        token_config: TokenConfig,
        config: OrchestratorConfig,
        client: Arc<dyn WorkerClient>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            store.clone(),
            client,
            token_config,
            config.clone(),
        ));
        let poller = Arc::new(Poller::new(
            pool.clone(),
            store.clone(),
            dispatcher,
            config.clone(),
        ));
        Self {
            pool,
            store,
            config,
            poller,
            cancel: CancellationToken::new(),
        }
    }

    /// Serverless entry point: one poll pass, no background loops.
    pub async fn tick(&self) -> Result<usize> {
        self.poller.tick().await
    }

    /// Spawn every background loop. The returned handles finish after
    /// [`Orchestrator::shutdown`].
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let poller = Arc::clone(&self.poller);
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                poller.run(cancel).await;
            }));
        }

        handles.push(tokio::spawn(monitor::run_timeout_monitor(
            self.pool.clone(),
            self.store.clone(),
            self.config.timeout_check_interval,
            self.cancel.clone(),
        )));

        handles.push(tokio::spawn(monitor::run_maintenance_monitor(
            self.pool.clone(),
            self.config.maintenance_check_interval,
            self.cancel.clone(),
        )));

        handles.push(tokio::spawn(cleanup::run_cleanup_loop(
            self.pool.clone(),
            self.store.clone(),
            self.config.clone(),
            self.cancel.clone(),
        )));

        tracing::info!(
            max_concurrency = self.config.max_concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "orchestrator started"
        );
        handles
    }

    /// Signal every loop to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
