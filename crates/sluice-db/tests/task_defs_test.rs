//! Integration tests for task definition upserts and code history.

use sluice_db::queries::services::upsert_service;
use sluice_db::queries::tasks::{NewTaskDef, get_code_history, get_task_def, upsert_task_def};
use sluice_test_utils::{create_test_db, drop_test_db};

fn def(id: &str, code_hash: &str) -> NewTaskDef {
    NewTaskDef {
        id: id.to_owned(),
        code_hash: code_hash.to_owned(),
        ..NewTaskDef::default()
    }
}

#[tokio::test]
async fn new_task_starts_at_version_one_with_history() {
    let (pool, db_name) = create_test_db().await;
    upsert_service(&pool, "svc", "1.0.0", "http://localhost:9000")
        .await
        .expect("service upsert should succeed");

    let outcome = upsert_task_def(&pool, "svc", "1.0.0", &def("encode", "deadbeefdeadbeef"))
        .await
        .expect("upsert should succeed");

    assert!(outcome.created);
    assert_eq!(outcome.task.code_version, 1);
    assert!(outcome.version_bump.is_none());

    let history = get_code_history(&pool, "encode").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].code_version, 1);
    assert_eq!(history[0].code_hash, "deadbeefdeadbeef");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn identical_hash_reregistration_is_a_noop() {
    let (pool, db_name) = create_test_db().await;
    upsert_service(&pool, "svc", "1.0.0", "http://localhost:9000")
        .await
        .unwrap();

    upsert_task_def(&pool, "svc", "1.0.0", &def("encode", "deadbeefdeadbeef"))
        .await
        .unwrap();
    let outcome = upsert_task_def(&pool, "svc", "1.0.1", &def("encode", "deadbeefdeadbeef"))
        .await
        .unwrap();

    assert!(!outcome.created);
    assert!(outcome.version_bump.is_none());
    assert_eq!(outcome.task.code_version, 1);

    // No second history row.
    let history = get_code_history(&pool, "encode").await.unwrap();
    assert_eq!(history.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn changed_hash_bumps_version_and_appends_history() {
    let (pool, db_name) = create_test_db().await;
    upsert_service(&pool, "svc", "1.0.0", "http://localhost:9000")
        .await
        .unwrap();

    upsert_task_def(&pool, "svc", "1.0.0", &def("encode", "deadbeefdeadbeef"))
        .await
        .unwrap();
    let outcome = upsert_task_def(&pool, "svc", "2.0.0", &def("encode", "cafebabecafebabe"))
        .await
        .unwrap();

    assert_eq!(outcome.version_bump, Some((1, 2)));
    assert_eq!(outcome.task.code_version, 2);
    assert_eq!(outcome.task.code_hash, "cafebabecafebabe");

    let history = get_code_history(&pool, "encode").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].code_version, 2);
    assert_eq!(history[1].service_version, "2.0.0");

    let task = get_task_def(&pool, "encode").await.unwrap().unwrap();
    assert_eq!(task.code_version, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mutable_fields_update_without_version_bump() {
    let (pool, db_name) = create_test_db().await;
    upsert_service(&pool, "svc", "1.0.0", "http://localhost:9000")
        .await
        .unwrap();

    upsert_task_def(&pool, "svc", "1.0.0", &def("encode", "deadbeefdeadbeef"))
        .await
        .unwrap();

    let mut updated = def("encode", "deadbeefdeadbeef");
    updated.retries = 5;
    updated.allowed_next = vec!["publish".to_owned()];
    let outcome = upsert_task_def(&pool, "svc", "1.0.0", &updated)
        .await
        .unwrap();

    assert_eq!(outcome.task.code_version, 1);
    assert_eq!(outcome.task.retries, 5);
    assert_eq!(outcome.task.allowed_next.0, vec!["publish".to_owned()]);

    pool.close().await;
    drop_test_db(&db_name).await;
}
