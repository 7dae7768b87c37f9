//! Integration tests for task run state transitions, claiming, and
//! dedup invariants.

use sluice_db::models::TaskRunStatus;
use sluice_db::queries::pipeline_runs::{NewPipelineRun, insert_pipeline_run};
use sluice_db::queries::services::upsert_service;
use sluice_db::queries::task_runs::{
    self, NewTaskRun, cancel_task_run, claim_pending_run, complete_failure, complete_success,
    get_task_run, insert_task_run, mark_running_in_tx, promote_waiting, queue_totals,
    record_heartbeat,
};
use sluice_db::queries::tasks::{NewTaskDef, upsert_task_def};
use sluice_test_utils::{create_test_db, drop_test_db};

async fn seed_task(pool: &sqlx::PgPool, task_id: &str) {
    upsert_service(pool, "svc", "1.0.0", "http://localhost:9000")
        .await
        .expect("service upsert should succeed");
    upsert_task_def(
        pool,
        "svc",
        "1.0.0",
        &NewTaskDef {
            id: task_id.to_owned(),
            code_hash: "deadbeefdeadbeef".to_owned(),
            ..NewTaskDef::default()
        },
    )
    .await
    .expect("task upsert should succeed");
}

fn new_run(id: &str, task_id: &str) -> NewTaskRun {
    NewTaskRun {
        id: id.to_owned(),
        task_id: task_id.to_owned(),
        pipeline_run_id: None,
        status: TaskRunStatus::Pending,
        code_version: 1,
        code_hash: "deadbeefdeadbeef".to_owned(),
        attempt: 1,
        max_retries: 0,
        priority: 100,
        input_path: format!("standalone/{id}/input.json"),
        idempotency_key: None,
        scheduled_at: None,
    }
}

#[tokio::test]
async fn claim_and_run_to_completion() {
    let (pool, db_name) = create_test_db().await;
    seed_task(&pool, "encode").await;

    insert_task_run(&pool, &new_run("trun_a", "encode"))
        .await
        .unwrap()
        .expect("insert should return the row");

    // Claim under row lock, mark running, commit.
    let claimed = claim_pending_run(&pool, "trun_a")
        .await
        .unwrap()
        .expect("pending run should be claimable");
    let mut tx = claimed.tx;
    assert_eq!(mark_running_in_tx(&mut tx, "trun_a").await.unwrap(), 1);
    tx.commit().await.unwrap();

    let run = get_task_run(&pool, "trun_a").await.unwrap().unwrap();
    assert_eq!(run.status, TaskRunStatus::Running);
    assert!(run.started_at.is_some());

    // Complete with outputs.
    let rows = complete_success(
        &pool,
        "trun_a",
        &task_runs::CompletionUpdate {
            output_path: Some("standalone/trun_a/output.json".to_owned()),
            output_size: Some(64),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let run = get_task_run(&pool, "trun_a").await.unwrap().unwrap();
    assert_eq!(run.status, TaskRunStatus::Completed);
    assert!(run.completed_at.is_some());

    // Duplicate completion is a guarded no-op.
    let rows = complete_success(&pool, "trun_a", &Default::default())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claimed_run_is_invisible_to_second_claimant() {
    let (pool, db_name) = create_test_db().await;
    seed_task(&pool, "encode").await;

    insert_task_run(&pool, &new_run("trun_a", "encode"))
        .await
        .unwrap();

    let first = claim_pending_run(&pool, "trun_a").await.unwrap();
    assert!(first.is_some());

    // While the first transaction holds the lock, SKIP LOCKED hides the row.
    let second = claim_pending_run(&pool, "trun_a").await.unwrap();
    assert!(second.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn future_scheduled_run_is_not_claimable() {
    let (pool, db_name) = create_test_db().await;
    seed_task(&pool, "encode").await;

    let mut run = new_run("trun_later", "encode");
    run.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    insert_task_run(&pool, &run).await.unwrap();

    assert!(claim_pending_run(&pool, "trun_later").await.unwrap().is_none());
    let candidates = task_runs::select_ready_candidates(&pool, 10).await.unwrap();
    assert!(candidates.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_attempt_within_pipeline_is_rejected() {
    let (pool, db_name) = create_test_db().await;
    seed_task(&pool, "encode").await;

    insert_pipeline_run(
        &pool,
        &NewPipelineRun {
            id: "prun_x".to_owned(),
            pipeline_id: "p1".to_owned(),
            failure_mode: sluice_db::models::FailureMode::FailFast,
            input_path: "pipelines/prun_x/input.json".to_owned(),
            structure: Default::default(),
            pipeline_version: "0000000000000000".to_owned(),
            priority: None,
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let mut a = new_run("trun_1", "encode");
    a.pipeline_run_id = Some("prun_x".to_owned());
    let mut b = new_run("trun_2", "encode");
    b.pipeline_run_id = Some("prun_x".to_owned());

    assert!(insert_task_run(&pool, &a).await.unwrap().is_some());
    // Same (pipeline_run_id, task_id, attempt): conflict, no row.
    assert!(insert_task_run(&pool, &b).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn heartbeat_only_lands_on_running_runs() {
    let (pool, db_name) = create_test_db().await;
    seed_task(&pool, "encode").await;

    insert_task_run(&pool, &new_run("trun_a", "encode"))
        .await
        .unwrap();

    // Pending: rejected.
    let patch = serde_json::json!({ "progress": { "pct": 10 } });
    assert_eq!(record_heartbeat(&pool, "trun_a", &patch).await.unwrap(), 0);

    let claimed = claim_pending_run(&pool, "trun_a").await.unwrap().unwrap();
    let mut tx = claimed.tx;
    mark_running_in_tx(&mut tx, "trun_a").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(record_heartbeat(&pool, "trun_a", &patch).await.unwrap(), 1);
    let run = get_task_run(&pool, "trun_a").await.unwrap().unwrap();
    assert_eq!(run.metadata["progress"]["pct"], 10);
    assert!(run.heartbeat_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failure_then_cancel_guards() {
    let (pool, db_name) = create_test_db().await;
    seed_task(&pool, "encode").await;

    insert_task_run(&pool, &new_run("trun_a", "encode"))
        .await
        .unwrap();
    let claimed = claim_pending_run(&pool, "trun_a").await.unwrap().unwrap();
    let mut tx = claimed.tx;
    mark_running_in_tx(&mut tx, "trun_a").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        complete_failure(&pool, "trun_a", "boom", Some("NETWORK_ERROR"), None)
            .await
            .unwrap(),
        1
    );
    let run = get_task_run(&pool, "trun_a").await.unwrap().unwrap();
    assert_eq!(run.status, TaskRunStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some("NETWORK_ERROR"));

    // A terminal run cannot be cancelled.
    assert_eq!(cancel_task_run(&pool, "trun_a").await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn waiting_runs_promote_and_count() {
    let (pool, db_name) = create_test_db().await;
    seed_task(&pool, "encode").await;

    let mut run = new_run("trun_w", "encode");
    run.status = TaskRunStatus::Waiting;
    insert_task_run(&pool, &run).await.unwrap();

    let totals = queue_totals(&pool).await.unwrap();
    assert_eq!(totals.waiting, 1);
    assert_eq!(totals.pending, 0);

    assert_eq!(promote_waiting(&pool, "trun_w").await.unwrap(), 1);
    let totals = queue_totals(&pool).await.unwrap();
    assert_eq!(totals.waiting, 0);
    assert_eq!(totals.pending, 1);

    // Double promote is a no-op.
    assert_eq!(promote_waiting(&pool, "trun_w").await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
