//! Task dispatcher: claims a pending run under a row lock, builds the
//! dispatch payload, and POSTs it to the owning worker.
//!
//! The claim transaction stays open across the (bounded) POST, so the row
//! never needs a persisted in-flight marker: either the dispatch succeeds
//! and the run commits as `running`, or it fails and commits as `failed`
//! with `DISPATCH_FAILED`, feeding the retry/DLQ path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use sluice_db::models::{AssetMap, TaskDef, TaskRun, TaskRunStatus};
use sluice_db::queries::pipeline_runs as prun_db;
use sluice_db::queries::services as service_db;
use sluice_db::queries::task_runs as run_db;
use sluice_db::queries::tasks as task_db;
use sluice_db::queries::temp_uploads as upload_db;

use crate::config::OrchestratorConfig;
use crate::dag;
use crate::error::codes;
use crate::idempotency;
use crate::ids;
use crate::store::BlobStore;
use crate::token::{self, TokenConfig};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Reference to one upstream task's output, shipped with the dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRef {
    pub output_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetMap>,
}

/// One earlier attempt in this run's retry chain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousAttempt {
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The payload POSTed to `{base_url}/tasks/{task_id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    pub run_id: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_run_id: Option<String>,
    pub attempt: i32,
    pub code_version: i32,
    pub code_hash: String,
    pub storage_token: String,
    pub input_path: String,
    pub upstream_refs: BTreeMap<String, UpstreamRef>,
    pub previous_attempts: Vec<PreviousAttempt>,
    pub heartbeat_interval_ms: i64,
}

// ---------------------------------------------------------------------------
// Worker transport
// ---------------------------------------------------------------------------

/// Seam for the orchestrator-to-worker POST, so tests can stub the wire.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn dispatch(
        &self,
        base_url: &str,
        task_id: &str,
        payload: &DispatchPayload,
    ) -> Result<()>;
}

/// Production transport over reqwest with a bounded timeout.
pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build worker HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn dispatch(
        &self,
        base_url: &str,
        task_id: &str,
        payload: &DispatchPayload,
    ) -> Result<()> {
        let url = format!("{}/tasks/{}", base_url.trim_end_matches('/'), task_id);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("dispatch POST to {url} failed"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "worker at {url} answered {}",
                response.status()
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// What happened to one claimed run.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The row was gone, already claimed, or no longer due.
    NotClaimed,
    /// Worker accepted; the run is now `running`.
    Started(TaskRun),
    /// Dispatch never reached the worker; the run is `failed` with
    /// `DISPATCH_FAILED`.
    FailedDispatch(TaskRun),
    /// Satisfied from the idempotency cache without touching the worker.
    CompletedFromCache(TaskRun),
}

pub struct Dispatcher {
    pool: PgPool,
    store: BlobStore,
    client: Arc<dyn WorkerClient>,
    token_config: TokenConfig,
    config: OrchestratorConfig,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        store: BlobStore,
        client: Arc<dyn WorkerClient>,
        token_config: TokenConfig,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            store,
            client,
            token_config,
            config,
        }
    }

    /// Claim and dispatch one pending run.
    ///
    /// All pool reads (definition, service, idempotency, payload pieces)
    /// happen before the claim, so a dispatch never holds the claim
    /// transaction while waiting on a second pool connection. The
    /// transaction brackets only the guarded claim, the POST, and the
    /// status update.
    pub async fn dispatch_run(&self, run_id: &str) -> Result<DispatchOutcome> {
        let Some(run) = run_db::get_task_run(&self.pool, run_id).await? else {
            return Ok(DispatchOutcome::NotClaimed);
        };
        if run.status != TaskRunStatus::Pending {
            return Ok(DispatchOutcome::NotClaimed);
        }

        let def = task_db::get_task_def(&self.pool, &run.task_id).await?;

        // Idempotency lookup happens before any dispatch: a hit short-
        // circuits the worker entirely and inherits the cached output.
        let mut cached = None;
        if let (Some(def), Some(user_key)) = (&def, &run.idempotency_key) {
            if def.idempotency_ttl_seconds > 0 {
                cached = idempotency::lookup(&self.pool, &run.task_id, user_key, run.code_version)
                    .await?;
            }
        }

        let service = match &def {
            Some(def) => service_db::get_service(&self.pool, &def.service_id).await?,
            None => None,
        };
        let payload = match &def {
            Some(def) => Some(self.build_payload(&run, def).await?),
            None => None,
        };

        // Claim under a row lock; from here on no other pool connection is
        // acquired until the transaction commits.
        let Some(run_db::ClaimedRun { mut tx, run }) =
            run_db::claim_pending_run(&self.pool, run_id).await?
        else {
            return Ok(DispatchOutcome::NotClaimed);
        };

        if let Some(hit) = cached {
            run_db::complete_from_cache_in_tx(
                &mut tx,
                &run.id,
                &hit.output_path,
                hit.output_size,
                hit.assets.as_ref(),
            )
            .await?;
            tx.commit().await.context("failed to commit cache completion")?;
            tracing::info!(
                run_id = %run.id,
                task_id = %run.task_id,
                cached_from = %hit.run_id,
                "run satisfied from idempotency cache"
            );
            return Ok(DispatchOutcome::CompletedFromCache(
                self.reload(&run.id).await?,
            ));
        }

        let (Some(_def), Some(service), Some(payload)) = (def, service, payload) else {
            run_db::fail_pending_in_tx(
                &mut tx,
                &run.id,
                "task definition or owning service not found",
                codes::DISPATCH_FAILED,
            )
            .await?;
            tx.commit().await.context("failed to commit dispatch failure")?;
            return Ok(DispatchOutcome::FailedDispatch(self.reload(&run.id).await?));
        };

        match self
            .client
            .dispatch(&service.base_url, &run.task_id, &payload)
            .await
        {
            Ok(()) => {
                run_db::mark_running_in_tx(&mut tx, &run.id).await?;
                tx.commit().await.context("failed to commit dispatch")?;
                tracing::info!(
                    run_id = %run.id,
                    task_id = %run.task_id,
                    attempt = run.attempt,
                    service = %service.id,
                    "run dispatched"
                );
                self.after_dispatch(&run).await;
                Ok(DispatchOutcome::Started(self.reload(&run.id).await?))
            }
            Err(e) => {
                run_db::fail_pending_in_tx(
                    &mut tx,
                    &run.id,
                    &format!("{e:#}"),
                    codes::DISPATCH_FAILED,
                )
                .await?;
                tx.commit().await.context("failed to commit dispatch failure")?;
                tracing::warn!(
                    run_id = %run.id,
                    task_id = %run.task_id,
                    error = %e,
                    "dispatch failed"
                );
                Ok(DispatchOutcome::FailedDispatch(self.reload(&run.id).await?))
            }
        }
    }

    async fn reload(&self, run_id: &str) -> Result<TaskRun> {
        run_db::get_task_run(&self.pool, run_id)
            .await?
            .with_context(|| format!("task run {run_id} vanished"))
    }

    /// Assemble the dispatch payload: storage token, upstream refs for
    /// completed predecessors, and the prior attempt history.
    async fn build_payload(&self, run: &TaskRun, def: &TaskDef) -> Result<DispatchPayload> {
        let mut upstream_refs = BTreeMap::new();
        if let Some(prun_id) = &run.pipeline_run_id {
            let prun = prun_db::get_pipeline_run(&self.pool, prun_id)
                .await?
                .with_context(|| format!("pipeline run {prun_id} not found"))?;
            let preds = dag::predecessors(&prun.structure.0, &run.task_id);
            let latest = run_db::latest_runs_for_pipeline(&self.pool, prun_id).await?;
            for upstream in latest {
                if upstream.status == TaskRunStatus::Completed
                    && preds.contains(&upstream.task_id)
                {
                    if let Some(output_path) = upstream.output_path {
                        upstream_refs.insert(
                            upstream.task_id,
                            UpstreamRef {
                                output_path,
                                assets: upstream.assets.map(|a| a.0),
                            },
                        );
                    }
                }
            }
        }

        let previous_attempts = run_db::prior_attempts(
            &self.pool,
            &run.task_id,
            run.pipeline_run_id.as_deref(),
            &run.input_path,
            run.attempt,
        )
        .await?
        .into_iter()
        .filter(|r| matches!(r.status, TaskRunStatus::Failed | TaskRunStatus::Timeout))
        .map(|r| PreviousAttempt {
            attempt: r.attempt,
            error: r.error,
            error_code: r.error_code,
            timestamp: r.completed_at.unwrap_or(r.created_at),
        })
        .collect();

        let storage_token = token::mint_token(
            &self.token_config,
            &self.config.storage_backend_id,
            self.config.storage_token_ttl,
        );

        Ok(DispatchPayload {
            run_id: run.id.clone(),
            task_id: run.task_id.clone(),
            pipeline_run_id: run.pipeline_run_id.clone(),
            attempt: run.attempt,
            code_version: run.code_version,
            code_hash: run.code_hash.clone(),
            storage_token,
            input_path: run.input_path.clone(),
            upstream_refs,
            previous_attempts,
            heartbeat_interval_ms: def.heartbeat_interval_ms,
        })
    }

    /// Post-dispatch housekeeping: mark the pipeline running and claim temp
    /// uploads referenced by the input. Neither may fail the dispatch.
    async fn after_dispatch(&self, run: &TaskRun) {
        if let Some(prun_id) = &run.pipeline_run_id {
            if let Err(e) = prun_db::mark_running(&self.pool, prun_id).await {
                tracing::warn!(pipeline_run_id = %prun_id, error = %e, "failed to mark pipeline running");
            }
        }

        match self.store.get_json(&run.input_path).await {
            Ok(input) => {
                let mut upload_ids = std::collections::BTreeSet::new();
                ids::collect_temp_upload_ids(&input, &mut upload_ids);
                for upload_id in upload_ids {
                    match upload_db::claim_for_run(&self.pool, &upload_id, &run.id).await {
                        Ok(1) => {
                            tracing::debug!(upload_id = %upload_id, run_id = %run.id, "temp upload claimed");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(upload_id = %upload_id, error = %e, "temp upload claim failed");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "could not scan input for temp uploads");
            }
        }
    }
}
