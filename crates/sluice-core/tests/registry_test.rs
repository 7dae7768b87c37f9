//! Registration semantics: ownership, orphaning, code-version bumps,
//! pipeline registration.

use sluice_core::error::CoreError;
use sluice_core::registry::{self, NewTaskDef, RegistrationRequest};
use sluice_db::models::TaskRunStatus;
use sluice_db::queries::task_runs::{self, NewTaskRun};
use sluice_test_utils::{create_test_db, drop_test_db};

fn request(service_id: &str, task_ids: &[&str]) -> RegistrationRequest {
    RegistrationRequest {
        service_id: service_id.to_owned(),
        version: "1.0.0".to_owned(),
        base_url: format!("http://localhost:9900/{service_id}"),
        tasks: task_ids
            .iter()
            .map(|id| NewTaskDef {
                id: (*id).to_owned(),
                code_hash: "deadbeefdeadbeef".to_owned(),
                ..NewTaskDef::default()
            })
            .collect(),
    }
}

#[tokio::test]
async fn task_claimed_by_other_service_is_rejected() {
    let (pool, db_name) = create_test_db().await;

    registry::register(&pool, &request("svc-a", &["encode"])).await.unwrap();

    let err = registry::register(&pool, &request("svc-b", &["encode"]))
        .await
        .expect_err("cross-service claim should fail");
    match err {
        CoreError::TaskOwnedByOtherService { task_id, owner } => {
            assert_eq!(task_id, "encode");
            assert_eq!(owner, "svc-a");
        }
        other => panic!("unexpected error: {other}"),
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn missing_tasks_are_orphaned_and_their_queue_drained() {
    let (pool, db_name) = create_test_db().await;

    registry::register(&pool, &request("svc", &["encode", "publish"])).await.unwrap();

    // Queue a run for the task about to be orphaned.
    task_runs::insert_task_run(
        &pool,
        &NewTaskRun {
            id: "trun_orphan".to_owned(),
            task_id: "publish".to_owned(),
            pipeline_run_id: None,
            status: TaskRunStatus::Pending,
            code_version: 1,
            code_hash: "deadbeefdeadbeef".to_owned(),
            attempt: 1,
            max_retries: 0,
            priority: 100,
            input_path: "standalone/trun_orphan/input.json".to_owned(),
            idempotency_key: None,
            scheduled_at: None,
        },
    )
    .await
    .unwrap();

    let outcome = registry::register(&pool, &request("svc", &["encode"])).await.unwrap();
    assert_eq!(outcome.orphaned_tasks, vec!["publish".to_owned()]);
    assert_eq!(outcome.cancelled_runs, 1);

    let run = task_runs::get_task_run(&pool, "trun_orphan").await.unwrap().unwrap();
    assert_eq!(run.status, TaskRunStatus::Cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn code_change_is_reported_once() {
    let (pool, db_name) = create_test_db().await;

    let outcome = registry::register(&pool, &request("svc", &["encode"])).await.unwrap();
    assert_eq!(outcome.code_changes.len(), 1);
    assert_eq!(outcome.code_changes[0].old_version, None);
    assert_eq!(outcome.code_changes[0].new_version, 1);

    // Same hash: no change entry.
    let outcome = registry::register(&pool, &request("svc", &["encode"])).await.unwrap();
    assert!(outcome.code_changes.is_empty());

    // New hash: bump reported.
    let mut req = request("svc", &["encode"]);
    req.tasks[0].code_hash = "cafebabecafebabe".to_owned();
    let outcome = registry::register(&pool, &req).await.unwrap();
    assert_eq!(outcome.code_changes.len(), 1);
    assert_eq!(outcome.code_changes[0].old_version, Some(1));
    assert_eq!(outcome.code_changes[0].new_version, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pipeline_version_tracks_structure() {
    let (pool, db_name) = create_test_db().await;

    let mut req = request("svc", &["a", "b"]);
    req.tasks[0].allowed_next = vec!["b".to_owned()];
    registry::register(&pool, &req).await.unwrap();

    let p1 = registry::register_pipeline(&pool, "p", "p", &["a".to_owned()], "").await.unwrap();

    // Re-register with the same structure: version stable.
    let p2 = registry::register_pipeline(&pool, "p", "p", &["a".to_owned()], "").await.unwrap();
    assert_eq!(p1.pipeline_version, p2.pipeline_version);

    // Change the edge set: version moves.
    let mut req = request("svc", &["a", "b", "c"]);
    req.tasks[0].allowed_next = vec!["b".to_owned(), "c".to_owned()];
    registry::register(&pool, &req).await.unwrap();
    let p3 = registry::register_pipeline(&pool, "p", "p", &["a".to_owned()], "").await.unwrap();
    assert_ne!(p1.pipeline_version, p3.pipeline_version);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pipeline_with_unknown_entry_is_rejected() {
    let (pool, db_name) = create_test_db().await;

    let err = registry::register_pipeline(&pool, "p", "p", &["ghost".to_owned()], "")
        .await
        .expect_err("unknown entry should fail");
    assert!(matches!(err, CoreError::NotFound { .. }));

    pool.close().await;
    drop_test_db(&db_name).await;
}
