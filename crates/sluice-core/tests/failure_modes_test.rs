//! Pipeline failure modes beyond fail-fast: continue and partial-merge,
//! and the terminal roll-up rules.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sluice_core::callbacks::{self, CompletionPayload, CompletionStatus};
use sluice_core::config::OrchestratorConfig;
use sluice_core::dispatch::{DispatchPayload, Dispatcher, WorkerClient};
use sluice_core::executor::{self, TriggerRequest};
use sluice_core::poller::Poller;
use sluice_core::registry::{self, NewTaskDef, RegistrationRequest};
use sluice_core::store::BlobStore;
use sluice_core::token::TokenConfig;
use sluice_db::models::{FailureMode, PipelineRunStatus, TaskRun, TaskRunStatus};
use sluice_db::queries::{pipeline_runs as prun_db, task_runs as run_db};
use sluice_test_utils::{create_test_db, drop_test_db};

#[derive(Default)]
struct StubWorker {
    dispatched: Mutex<Vec<DispatchPayload>>,
}

#[async_trait]
impl WorkerClient for StubWorker {
    async fn dispatch(
        &self,
        _base_url: &str,
        _task_id: &str,
        payload: &DispatchPayload,
    ) -> anyhow::Result<()> {
        self.dispatched.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

struct Harness {
    pool: sqlx::PgPool,
    store: BlobStore,
    poller: Poller,
}

fn harness(pool: sqlx::PgPool) -> Harness {
    let store = BlobStore::in_memory();
    let config = OrchestratorConfig::default();
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        store.clone(),
        Arc::new(StubWorker::default()),
        TokenConfig::new(b"test-secret".to_vec()),
        config.clone(),
    ));
    let poller = Poller::new(pool.clone(), store.clone(), dispatcher, config);
    Harness { pool, store, poller }
}

async fn register_graph(pool: &sqlx::PgPool, specs: &[(&str, &[&str])]) {
    registry::register(
        pool,
        &RegistrationRequest {
            service_id: "svc".to_owned(),
            version: "1.0.0".to_owned(),
            base_url: "http://localhost:9900".to_owned(),
            tasks: specs
                .iter()
                .map(|(id, next)| NewTaskDef {
                    id: (*id).to_owned(),
                    code_hash: format!("{:0>16}", id),
                    allowed_next: next.iter().map(|n| (*n).to_owned()).collect(),
                    retries: 0,
                    retry_delay_ms: 10,
                    ..NewTaskDef::default()
                })
                .collect(),
        },
    )
    .await
    .expect("registration should succeed");
}

async fn trigger(h: &Harness, pipeline: &str, mode: FailureMode) -> String {
    let mut req = TriggerRequest::new(serde_json::json!({}));
    req.failure_mode = Some(mode);
    executor::trigger_pipeline(&h.pool, &h.store, pipeline, &req)
        .await
        .unwrap()
        .pipeline_run
        .id
}

async fn latest(h: &Harness, prun_id: &str) -> BTreeMap<String, TaskRun> {
    run_db::latest_runs_for_pipeline(&h.pool, prun_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.task_id.clone(), r))
        .collect()
}

async fn succeed(h: &Harness, run_id: &str) {
    callbacks::complete_run(
        &h.pool,
        &h.store,
        run_id,
        &CompletionPayload {
            status: CompletionStatus::Success,
            output_path: Some(format!("out/{run_id}.json")),
            output_size: None,
            assets: None,
            logs_path: None,
            selected_next: None,
            error: None,
            error_code: None,
        },
    )
    .await
    .unwrap();
}

async fn fail(h: &Harness, run_id: &str) {
    callbacks::complete_run(
        &h.pool,
        &h.store,
        run_id,
        &CompletionPayload {
            status: CompletionStatus::Failed,
            output_path: None,
            output_size: None,
            assets: None,
            logs_path: None,
            selected_next: None,
            error: Some("boom".to_owned()),
            error_code: Some("WORKER_ERROR".to_owned()),
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn continue_mode_lets_siblings_finish_and_rolls_up_partial() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_graph(&pool, &[("A", &["B", "C"]), ("B", &[]), ("C", &[])]).await;
    registry::register_pipeline(&pool, "p", "p", &["A".to_owned()], "").await.unwrap();
    let prun_id = trigger(&h, "p", FailureMode::Continue).await;

    h.poller.tick().await.unwrap();
    let runs = latest(&h, &prun_id).await;
    succeed(&h, &runs["A"].id).await;

    h.poller.tick().await.unwrap();
    let runs = latest(&h, &prun_id).await;

    // B fails exhaustively; C keeps running.
    fail(&h, &runs["B"].id).await;
    let runs = latest(&h, &prun_id).await;
    assert_eq!(runs["B"].status, TaskRunStatus::Failed);
    assert_eq!(runs["C"].status, TaskRunStatus::Running);

    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert!(!prun.status.is_terminal(), "pipeline must wait for C");

    succeed(&h, &runs["C"].id).await;
    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Partial);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn all_branches_failing_rolls_up_failed() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_graph(&pool, &[("A", &[])]).await;
    registry::register_pipeline(&pool, "p", "p", &["A".to_owned()], "").await.unwrap();
    let prun_id = trigger(&h, "p", FailureMode::Continue).await;

    h.poller.tick().await.unwrap();
    let runs = latest(&h, &prun_id).await;
    fail(&h, &runs["A"].id).await;

    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Failed);
    assert!(prun.error.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn partial_merge_never_schedules_downstream_of_failed_upstream() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    // Diamond: D joins B and C.
    register_graph(
        &pool,
        &[("A", &["B", "C"]), ("B", &["D"]), ("C", &["D"]), ("D", &[])],
    )
    .await;
    registry::register_pipeline(&pool, "p", "p", &["A".to_owned()], "").await.unwrap();
    let prun_id = trigger(&h, "p", FailureMode::PartialMerge).await;

    h.poller.tick().await.unwrap();
    let runs = latest(&h, &prun_id).await;
    succeed(&h, &runs["A"].id).await;

    h.poller.tick().await.unwrap();
    let runs = latest(&h, &prun_id).await;

    // B fails; C completes. D has a failed upstream and must never run.
    fail(&h, &runs["B"].id).await;
    let runs = latest(&h, &prun_id).await;
    succeed(&h, &runs["C"].id).await;

    let runs = latest(&h, &prun_id).await;
    match runs.get("D") {
        None => {}
        Some(d) => assert_eq!(d.status, TaskRunStatus::Cancelled),
    }

    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Partial);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn waiting_join_is_cancelled_when_late_branch_fails() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_graph(
        &pool,
        &[("A", &["B", "C"]), ("B", &["D"]), ("C", &["D"]), ("D", &[])],
    )
    .await;
    registry::register_pipeline(&pool, "p", "p", &["A".to_owned()], "").await.unwrap();
    let prun_id = trigger(&h, "p", FailureMode::Continue).await;

    h.poller.tick().await.unwrap();
    let runs = latest(&h, &prun_id).await;
    succeed(&h, &runs["A"].id).await;

    h.poller.tick().await.unwrap();
    let runs = latest(&h, &prun_id).await;

    // B completes first: D is created waiting on C.
    succeed(&h, &runs["B"].id).await;
    let runs = latest(&h, &prun_id).await;
    assert_eq!(runs["D"].status, TaskRunStatus::Waiting);

    // C fails: the waiting join can never fire.
    fail(&h, &runs["C"].id).await;
    let runs = latest(&h, &prun_id).await;
    assert_eq!(runs["D"].status, TaskRunStatus::Cancelled);

    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Partial);

    pool.close().await;
    drop_test_db(&db_name).await;
}
