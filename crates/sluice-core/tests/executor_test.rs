//! End-to-end scheduling scenarios driven through the poller and a stub
//! worker transport. Worker behavior is simulated by posting completion
//! callbacks, exactly as a real worker would.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use sluice_core::callbacks::{self, CompletionPayload, CompletionStatus};
use sluice_core::config::OrchestratorConfig;
use sluice_core::dispatch::{DispatchPayload, Dispatcher, WorkerClient};
use sluice_core::executor::{self, QueueRequest, TriggerRequest};
use sluice_core::poller::Poller;
use sluice_core::registry::{self, NewTaskDef, RegistrationRequest};
use sluice_core::store::BlobStore;
use sluice_core::token::TokenConfig;
use sluice_db::models::{FailureMode, PipelineRunStatus, TaskRunStatus};
use sluice_db::queries::{dlq as dlq_db, pipeline_runs as prun_db, task_runs as run_db};
use sluice_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------

/// Records every dispatch; the worker itself never runs.
#[derive(Default)]
struct StubWorker {
    dispatched: Mutex<Vec<DispatchPayload>>,
}

impl StubWorker {
    fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    fn dispatched_tasks(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.task_id.clone())
            .collect()
    }
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
    worker: Arc<StubWorker>,
}

fn harness(pool: sqlx::PgPool) -> Harness {
    let store = BlobStore::in_memory();
    let worker = Arc::new(StubWorker::default());
    let config = OrchestratorConfig {
        max_concurrency: 8,
        ..OrchestratorConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        store.clone(),
        worker.clone(),
        TokenConfig::new(b"test-secret".to_vec()),
        config.clone(),
    ));
    let poller = Poller::new(pool.clone(), store.clone(), dispatcher, config);
    Harness {
        pool,
        store,
        poller,
        worker,
    }
}

/// Register one service with tasks wired as `(id, allowed_next)` edges.
async fn register_tasks(
    pool: &sqlx::PgPool,
    specs: &[(&str, &[&str])],
    tweak: impl Fn(&mut NewTaskDef),
) {
    let tasks = specs
        .iter()
        .map(|(id, next)| {
            let mut def = NewTaskDef {
                id: (*id).to_owned(),
                code_hash: format!("{:0>16}", id),
                allowed_next: next.iter().map(|n| (*n).to_owned()).collect(),
                retry_delay_ms: 10,
                ..NewTaskDef::default()
            };
            tweak(&mut def);
            def
        })
        .collect();

    registry::register(
        pool,
        &RegistrationRequest {
            service_id: "svc".to_owned(),
            version: "1.0.0".to_owned(),
            base_url: "http://localhost:9900".to_owned(),
            tasks,
        },
    )
    .await
    .expect("registration should succeed");
}

async fn success(h: &Harness, run_id: &str, output: &str, selected_next: Option<Vec<&str>>) {
    callbacks::complete_run(
        &h.pool,
        &h.store,
        run_id,
        &CompletionPayload {
            status: CompletionStatus::Success,
            output_path: Some(output.to_owned()),
            output_size: Some(16),
            assets: None,
            logs_path: None,
            selected_next: selected_next
                .map(|s| s.into_iter().map(str::to_owned).collect()),
            error: None,
            error_code: None,
        },
    )
    .await
    .expect("completion should succeed");
}

async fn failure(h: &Harness, run_id: &str, code: &str) {
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
            error: Some("worker reported failure".to_owned()),
            error_code: Some(code.to_owned()),
        },
    )
    .await
    .expect("failure callback should succeed");
}

/// Latest run per task id for a pipeline run.
async fn latest_by_task(
    pool: &sqlx::PgPool,
    prun_id: &str,
) -> BTreeMap<String, sluice_db::models::TaskRun> {
    run_db::latest_runs_for_pipeline(pool, prun_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.task_id.clone(), r))
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: happy linear A -> B
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_linear_pipeline() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &["B"]), ("B", &[])], |_| {}).await;
    registry::register_pipeline(&pool, "p1", "linear", &["A".to_owned()], "")
        .await
        .unwrap();

    let outcome = executor::trigger_pipeline(
        &pool,
        &h.store,
        "p1",
        &TriggerRequest::new(serde_json::json!({ "x": 1 })),
    )
    .await
    .unwrap();
    let prun_id = outcome.pipeline_run.id.clone();
    assert_eq!(outcome.entry_tasks, vec!["A".to_owned()]);
    assert_eq!(outcome.queued_runs.len(), 1);

    // Input persisted to the object store.
    let input = h.store.get_json(&outcome.input_path).await.unwrap();
    assert_eq!(input, serde_json::json!({ "x": 1 }));

    // Poll: A dispatched and running.
    assert_eq!(h.poller.tick().await.unwrap(), 1);
    assert_eq!(h.worker.dispatched_tasks(), vec!["A".to_owned()]);
    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["A"].status, TaskRunStatus::Running);

    // A completes, selecting B.
    success(&h, &runs["A"].id, "out/a.json", Some(vec!["B"])).await;
    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["A"].status, TaskRunStatus::Completed);
    assert_eq!(runs["B"].status, TaskRunStatus::Pending);

    // Poll: B dispatched with A's output as upstream ref.
    assert_eq!(h.poller.tick().await.unwrap(), 1);
    {
        let dispatched = h.worker.dispatched.lock().unwrap();
        let b_payload = &dispatched[1];
        assert_eq!(b_payload.task_id, "B");
        assert_eq!(
            b_payload.upstream_refs.get("A").map(|u| u.output_path.as_str()),
            Some("out/a.json")
        );
        assert!(b_payload.storage_token.starts_with("sluice_st_"));
    }

    let runs = latest_by_task(&pool, &prun_id).await;
    success(&h, &runs["B"].id, "out/b.json", None).await;

    // Both completed, pipeline completed, B queued exactly once.
    let all = run_db::list_runs_for_pipeline(&pool, &prun_id).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.status == TaskRunStatus::Completed));

    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Completed);
    assert!(prun.completed_at.is_some());

    // Aggregate output keyed by the end node.
    let output = h
        .store
        .get_json(&format!("runs/{prun_id}/output.json"))
        .await
        .unwrap();
    assert_eq!(output["B"]["outputPath"], "out/b.json");
    assert!(output.get("A").is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 2: retry then succeed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_with_exponential_backoff_then_succeed() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &[])], |def| {
        def.retries = 3;
        def.retry_delay_ms = 200;
        def.max_retry_delay_ms = 10_000;
    })
    .await;

    let run = executor::queue_task(
        &pool,
        &h.store,
        "A",
        &QueueRequest::new(serde_json::json!({ "x": 1 })),
    )
    .await
    .unwrap();

    // Attempt 1 fails.
    h.poller.tick().await.unwrap();
    failure(&h, &run.id, "NETWORK_ERROR").await;

    let attempt1 = run_db::get_task_run(&pool, &run.id).await.unwrap().unwrap();
    assert_eq!(attempt1.status, TaskRunStatus::Failed);

    let chain = run_db::list_runs_for_task(&pool, "A", 10).await.unwrap();
    assert_eq!(chain.len(), 2);
    let attempt2 = chain.iter().find(|r| r.attempt == 2).unwrap().clone();
    // Delay after attempt 1: >= base * 2^0.
    let gap = (attempt2.scheduled_at - attempt1.completed_at.unwrap()).num_milliseconds();
    assert!(gap >= 190, "first retry delay was {gap}ms");

    // Attempt 2 becomes due, fails again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.poller.tick().await.unwrap(), 1);
    failure(&h, &attempt2.id, "NETWORK_ERROR").await;

    let chain = run_db::list_runs_for_task(&pool, "A", 10).await.unwrap();
    assert_eq!(chain.len(), 3);
    let attempt2 = run_db::get_task_run(&pool, &attempt2.id).await.unwrap().unwrap();
    let attempt3 = chain.iter().find(|r| r.attempt == 3).unwrap().clone();
    // Delay after attempt 2: >= base * 2^1.
    let gap = (attempt3.scheduled_at - attempt2.completed_at.unwrap()).num_milliseconds();
    assert!(gap >= 390, "second retry delay was {gap}ms");

    // Attempt 3 succeeds; the dispatch carries the failure history.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.poller.tick().await.unwrap(), 1);
    {
        let dispatched = h.worker.dispatched.lock().unwrap();
        let last = dispatched.last().unwrap();
        assert_eq!(last.attempt, 3);
        assert_eq!(last.previous_attempts.len(), 2);
        assert_eq!(
            last.previous_attempts[0].error_code.as_deref(),
            Some("NETWORK_ERROR")
        );
    }
    success(&h, &attempt3.id, "out/a.json", None).await;

    let final_run = run_db::get_task_run(&pool, &attempt3.id).await.unwrap().unwrap();
    assert_eq!(final_run.status, TaskRunStatus::Completed);
    assert_eq!(final_run.attempt, 3);

    // No DLQ entry.
    let dlq = dlq_db::list_dlq_items(&pool, &Default::default(), 10).await.unwrap();
    assert!(dlq.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 3: retry exhaustion lands in the DLQ
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_exhaustion_moves_to_dlq() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &[])], |def| {
        def.retries = 2;
        def.retry_delay_ms = 10;
    })
    .await;

    let run = executor::queue_task(
        &pool,
        &h.store,
        "A",
        &QueueRequest::new(serde_json::json!({})),
    )
    .await
    .unwrap();

    let mut current = run.id.clone();
    for attempt in 1..=3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.poller.tick().await.unwrap(), 1, "attempt {attempt}");
        failure(&h, &current, "NETWORK_ERROR").await;
        if attempt < 3 {
            let chain = run_db::list_runs_for_task(&pool, "A", 10).await.unwrap();
            current = chain
                .iter()
                .find(|r| r.attempt == attempt + 1)
                .expect("retry row should exist")
                .id
                .clone();
        }
    }

    let chain = run_db::list_runs_for_task(&pool, "A", 10).await.unwrap();
    assert_eq!(chain.len(), 3);
    assert!(chain.iter().all(|r| r.status == TaskRunStatus::Failed));

    let dlq = dlq_db::list_dlq_items(&pool, &Default::default(), 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].attempts, 3);
    assert_eq!(dlq[0].task_id, "A");

    // Manual replay starts a fresh chain at attempt 1.
    let replayed = sluice_core::dlq::replay(&pool, &dlq[0].id).await.unwrap();
    assert_eq!(replayed.attempt, 1);
    assert_eq!(replayed.input_path, run.input_path);
    let item = dlq_db::get_dlq_item(&pool, &dlq[0].id).await.unwrap().unwrap();
    assert!(item.retried_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 4: fan-out / fan-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diamond_fan_out_fan_in() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(
        &pool,
        &[("A", &["B", "C"]), ("B", &["D"]), ("C", &["D"]), ("D", &[])],
        |_| {},
    )
    .await;
    registry::register_pipeline(&pool, "diamond", "diamond", &["A".to_owned()], "")
        .await
        .unwrap();

    let outcome = executor::trigger_pipeline(
        &pool,
        &h.store,
        "diamond",
        &TriggerRequest::new(serde_json::json!({})),
    )
    .await
    .unwrap();
    let prun_id = outcome.pipeline_run.id.clone();

    h.poller.tick().await.unwrap();
    let runs = latest_by_task(&pool, &prun_id).await;
    success(&h, &runs["A"].id, "out/a.json", None).await;

    // B and C queued; D does not exist yet.
    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["B"].status, TaskRunStatus::Pending);
    assert_eq!(runs["C"].status, TaskRunStatus::Pending);
    assert!(!runs.contains_key("D"));

    h.poller.tick().await.unwrap();
    let runs = latest_by_task(&pool, &prun_id).await;
    success(&h, &runs["B"].id, "out/b.json", None).await;

    // D exists but must wait for C.
    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["D"].status, TaskRunStatus::Waiting);

    success(&h, &runs["C"].id, "out/c.json", None).await;
    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["D"].status, TaskRunStatus::Pending);

    h.poller.tick().await.unwrap();
    let runs = latest_by_task(&pool, &prun_id).await;
    // D's dispatch carries both upstream outputs.
    {
        let dispatched = h.worker.dispatched.lock().unwrap();
        let d_payload = dispatched.iter().find(|p| p.task_id == "D").unwrap();
        assert_eq!(d_payload.upstream_refs.len(), 2);
        assert!(d_payload.upstream_refs.contains_key("B"));
        assert!(d_payload.upstream_refs.contains_key("C"));
    }
    success(&h, &runs["D"].id, "out/d.json", None).await;

    // Exactly one run for D; pipeline completed.
    let all = run_db::list_runs_for_pipeline(&pool, &prun_id).await.unwrap();
    assert_eq!(all.iter().filter(|r| r.task_id == "D").count(), 1);
    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 5: fail-fast cancels the running sibling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fail_fast_cancels_siblings() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &["B", "C"]), ("B", &[]), ("C", &[])], |def| {
        def.retries = 0;
    })
    .await;
    registry::register_pipeline(&pool, "ff", "fail fast", &["A".to_owned()], "")
        .await
        .unwrap();

    let mut req = TriggerRequest::new(serde_json::json!({}));
    req.failure_mode = Some(FailureMode::FailFast);
    let outcome = executor::trigger_pipeline(&pool, &h.store, "ff", &req).await.unwrap();
    let prun_id = outcome.pipeline_run.id.clone();

    h.poller.tick().await.unwrap();
    let runs = latest_by_task(&pool, &prun_id).await;
    success(&h, &runs["A"].id, "out/a.json", None).await;

    // Both branches dispatched and running.
    h.poller.tick().await.unwrap();
    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["B"].status, TaskRunStatus::Running);
    assert_eq!(runs["C"].status, TaskRunStatus::Running);

    // B fails exhaustively (retries = 0) while C is still running.
    failure(&h, &runs["B"].id, "FATAL_CRASH").await;

    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["B"].status, TaskRunStatus::Failed);
    assert_eq!(runs["C"].status, TaskRunStatus::Cancelled);

    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Failed);

    let dlq = dlq_db::list_dlq_items(&pool, &Default::default(), 10).await.unwrap();
    assert_eq!(dlq.len(), 1);

    // A late completion from the cancelled worker is discarded.
    success(&h, &runs["C"].id, "out/c.json", None).await;
    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["C"].status, TaskRunStatus::Cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 6: idempotency hit skips dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idempotency_hit_skips_dispatch() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &[])], |def| {
        def.idempotency_ttl_seconds = 3600;
    })
    .await;

    let mut req = QueueRequest::new(serde_json::json!({ "x": 1 }));
    req.idempotency_key = Some("k1".to_owned());
    let first = executor::queue_task(&pool, &h.store, "A", &req).await.unwrap();

    h.poller.tick().await.unwrap();
    assert_eq!(h.worker.dispatch_count(), 1);
    success(&h, &first.id, "p1", None).await;

    // Second enqueue with the same key: satisfied from cache at enqueue.
    let second = executor::queue_task(&pool, &h.store, "A", &req).await.unwrap();
    assert_eq!(second.status, TaskRunStatus::Completed);
    assert_eq!(second.output_path.as_deref(), Some("p1"));

    // No further dispatches.
    h.poller.tick().await.unwrap();
    assert_eq!(h.worker.dispatch_count(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn idempotency_hit_on_pipeline_entry_schedules_downstream() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &["B"]), ("B", &[])], |def| {
        def.idempotency_ttl_seconds = 3600;
    })
    .await;
    registry::register_pipeline(&pool, "p1", "cached entry", &["A".to_owned()], "")
        .await
        .unwrap();

    // Seed the cache through a standalone run.
    let mut req = QueueRequest::new(serde_json::json!({ "x": 1 }));
    req.idempotency_key = Some("k1".to_owned());
    let warmup = executor::queue_task(&pool, &h.store, "A", &req).await.unwrap();
    h.poller.tick().await.unwrap();
    success(&h, &warmup.id, "p1-output", None).await;

    // Trigger with the same entry key: A materializes completed, B queues
    // immediately, the worker is never called for A.
    let mut trigger = TriggerRequest::new(serde_json::json!({ "x": 1 }));
    trigger
        .idempotency_keys
        .insert("A".to_owned(), "k1".to_owned());
    let outcome = executor::trigger_pipeline(&pool, &h.store, "p1", &trigger).await.unwrap();
    let prun_id = outcome.pipeline_run.id.clone();

    let runs = latest_by_task(&pool, &prun_id).await;
    assert_eq!(runs["A"].status, TaskRunStatus::Completed);
    assert_eq!(runs["A"].output_path.as_deref(), Some("p1-output"));
    assert_eq!(runs["B"].status, TaskRunStatus::Pending);

    let before = h.worker.dispatch_count();
    h.poller.tick().await.unwrap();
    assert_eq!(h.worker.dispatch_count(), before + 1);
    assert_eq!(h.worker.dispatched_tasks().last().map(String::as_str), Some("B"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Maintenance admission gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn maintenance_gate_blocks_new_work() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &[])], |_| {}).await;
    registry::register_pipeline(&pool, "p1", "gate", &["A".to_owned()], "")
        .await
        .unwrap();

    sluice_core::maintenance::request_maintenance(&pool).await.unwrap();
    let gate_closed_at = Utc::now();

    let err = executor::trigger_pipeline(
        &pool,
        &h.store,
        "p1",
        &TriggerRequest::new(serde_json::json!({})),
    )
    .await
    .expect_err("trigger should be rejected");
    assert!(matches!(err, sluice_core::error::CoreError::Unavailable(_)));

    let err = executor::queue_task(
        &pool,
        &h.store,
        "A",
        &QueueRequest::new(serde_json::json!({})),
    )
    .await
    .expect_err("enqueue should be rejected");
    assert!(matches!(err, sluice_core::error::CoreError::Unavailable(_)));

    // No run rows appeared after the gate closed.
    let runs = run_db::list_runs_for_task(&pool, "A", 10).await.unwrap();
    assert!(runs.iter().all(|r| r.created_at <= gate_closed_at));

    // Nothing queued or running: the monitor promotes to maintenance.
    assert!(sluice_core::maintenance::check_drained(&pool).await.unwrap());
    let report = sluice_core::maintenance::state_report(&pool).await.unwrap();
    assert_eq!(
        report.mode,
        sluice_db::models::OrchestratorMode::Maintenance
    );

    // Poller refuses to claim while not running.
    assert_eq!(h.poller.tick().await.unwrap(), 0);

    sluice_core::maintenance::exit_maintenance(&pool).await.unwrap();
    executor::queue_task(
        &pool,
        &h.store,
        "A",
        &QueueRequest::new(serde_json::json!({})),
    )
    .await
    .expect("enqueue should work again");

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Cancellation propagates through heartbeats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_pipeline_tells_worker_via_heartbeat() {
    let (pool, db_name) = create_test_db().await;
    let h = harness(pool.clone());

    register_tasks(&pool, &[("A", &[])], |_| {}).await;
    registry::register_pipeline(&pool, "p1", "cancel", &["A".to_owned()], "")
        .await
        .unwrap();

    let outcome = executor::trigger_pipeline(
        &pool,
        &h.store,
        "p1",
        &TriggerRequest::new(serde_json::json!({})),
    )
    .await
    .unwrap();
    let prun_id = outcome.pipeline_run.id.clone();

    h.poller.tick().await.unwrap();
    let runs = latest_by_task(&pool, &prun_id).await;
    let run_id = runs["A"].id.clone();

    // Worker is alive and heartbeating.
    let ack = callbacks::heartbeat(&pool, &run_id, None, None).await.unwrap();
    assert!(ack.acknowledged);
    assert!(!ack.should_cancel);

    executor::cancel_pipeline_run(&pool, &prun_id).await.unwrap();

    let ack = callbacks::heartbeat(&pool, &run_id, None, None).await.unwrap();
    assert!(!ack.acknowledged);
    assert!(ack.should_cancel);

    let prun = prun_db::get_pipeline_run(&pool, &prun_id).await.unwrap().unwrap();
    assert_eq!(prun.status, PipelineRunStatus::Cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}
