//! Dispatcher against a real HTTP worker stub: payload contents, failure
//! handling, and temp-upload claiming.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use sluice_core::config::OrchestratorConfig;
use sluice_core::dispatch::{DispatchOutcome, Dispatcher, HttpWorkerClient};
use sluice_core::executor::{self, QueueRequest};
use sluice_core::registry::{self, NewTaskDef, RegistrationRequest};
use sluice_core::store::BlobStore;
use sluice_core::token::{self, TokenConfig};
use sluice_db::models::TaskRunStatus;
use sluice_db::queries::{dlq as dlq_db, task_runs as run_db, temp_uploads as upload_db};
use sluice_test_utils::{create_test_db, drop_test_db};

type Received = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

/// Spawn a stub worker server; `ok` controls whether it accepts dispatches.
async fn spawn_worker(ok: bool) -> (String, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));

    let state = received.clone();
    let app = Router::new()
        .route(
            "/tasks/{id}",
            post(
                move |State(state): State<Received>,
                      Path(id): Path<String>,
                      Json(payload): Json<serde_json::Value>| async move {
                    state.lock().unwrap().push((id, payload));
                    if ok {
                        (StatusCode::OK, Json(serde_json::json!({})))
                    } else {
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(serde_json::json!({ "error": "worker exploded" })),
                        )
                    }
                },
            ),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), received)
}

async fn setup(pool: &sqlx::PgPool, base_url: &str) -> (BlobStore, Dispatcher, TokenConfig) {
    registry::register(
        pool,
        &RegistrationRequest {
            service_id: "svc".to_owned(),
            version: "1.0.0".to_owned(),
            base_url: base_url.to_owned(),
            tasks: vec![NewTaskDef {
                id: "encode".to_owned(),
                code_hash: "deadbeefdeadbeef".to_owned(),
                retries: 0,
                ..NewTaskDef::default()
            }],
        },
    )
    .await
    .expect("registration should succeed");

    let store = BlobStore::in_memory();
    let token_config = TokenConfig::new(b"test-secret".to_vec());
    let dispatcher = Dispatcher::new(
        pool.clone(),
        store.clone(),
        Arc::new(HttpWorkerClient::new(Duration::from_secs(5)).unwrap()),
        token_config.clone(),
        OrchestratorConfig::default(),
    );
    (store, dispatcher, token_config)
}

#[tokio::test]
async fn dispatch_posts_full_payload_and_marks_running() {
    let (pool, db_name) = create_test_db().await;
    let (base_url, received) = spawn_worker(true).await;
    let (store, dispatcher, token_config) = setup(&pool, &base_url).await;

    let run = executor::queue_task(
        &pool,
        &store,
        "encode",
        &QueueRequest::new(serde_json::json!({ "width": 640 })),
    )
    .await
    .unwrap();

    let outcome = dispatcher.dispatch_run(&run.id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Started(_)));

    let updated = run_db::get_task_run(&pool, &run.id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskRunStatus::Running);
    assert!(updated.started_at.is_some());

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (task_id, payload) = &received[0];
    assert_eq!(task_id, "encode");
    assert_eq!(payload["runId"], run.id);
    assert_eq!(payload["taskId"], "encode");
    assert_eq!(payload["attempt"], 1);
    assert_eq!(payload["codeVersion"], 1);
    assert_eq!(payload["codeHash"], "deadbeefdeadbeef");
    assert_eq!(payload["inputPath"], run.input_path);
    assert_eq!(payload["heartbeatIntervalMs"], 15000);
    assert_eq!(payload["previousAttempts"], serde_json::json!([]));

    // The shipped storage token validates against the orchestrator secret.
    let claims =
        token::validate_token(&token_config, payload["storageToken"].as_str().unwrap()).unwrap();
    assert_eq!(claims.backend_id, "default");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn rejecting_worker_fails_the_run_into_the_dlq() {
    let (pool, db_name) = create_test_db().await;
    let (base_url, _received) = spawn_worker(false).await;
    let (store, dispatcher, _token) = setup(&pool, &base_url).await;

    let run = executor::queue_task(
        &pool,
        &store,
        "encode",
        &QueueRequest::new(serde_json::json!({})),
    )
    .await
    .unwrap();

    let outcome = dispatcher.dispatch_run(&run.id).await.unwrap();
    let DispatchOutcome::FailedDispatch(failed) = outcome else {
        panic!("expected FailedDispatch");
    };
    assert_eq!(failed.status, TaskRunStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("DISPATCH_FAILED"));

    // Zero retries: straight to the DLQ once the failure is handled.
    executor::handle_run_failure(&pool, &store, &failed).await.unwrap();
    let dlq = dlq_db::list_dlq_items(&pool, &Default::default(), 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].error_code.as_deref(), Some("DISPATCH_FAILED"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unreachable_worker_fails_dispatch() {
    let (pool, db_name) = create_test_db().await;
    // Nothing listens on this port.
    let (store, dispatcher, _token) = setup(&pool, "http://127.0.0.1:1").await;

    let run = executor::queue_task(
        &pool,
        &store,
        "encode",
        &QueueRequest::new(serde_json::json!({})),
    )
    .await
    .unwrap();

    let outcome = dispatcher.dispatch_run(&run.id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::FailedDispatch(_)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_claims_temp_uploads_referenced_by_input() {
    let (pool, db_name) = create_test_db().await;
    let (base_url, _received) = spawn_worker(true).await;
    let (store, dispatcher, _token) = setup(&pool, &base_url).await;

    upload_db::insert_temp_upload(
        &pool,
        "tmp_source",
        "temp-uploads/tmp_source/input.bin",
        "default",
        "input.bin",
        "application/octet-stream",
        10,
        3600,
    )
    .await
    .unwrap();

    let run = executor::queue_task(
        &pool,
        &store,
        "encode",
        &QueueRequest::new(serde_json::json!({
            "source": "tmp_source",
            "nested": { "also": ["tmp_missing"] }
        })),
    )
    .await
    .unwrap();

    let outcome = dispatcher.dispatch_run(&run.id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Started(_)));

    let upload = upload_db::get_temp_upload(&pool, "tmp_source").await.unwrap().unwrap();
    assert_eq!(upload.claimed_by_run_id.as_deref(), Some(run.id.as_str()));

    pool.close().await;
    drop_test_db(&db_name).await;
}
