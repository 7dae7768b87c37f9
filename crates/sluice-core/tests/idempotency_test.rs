//! Idempotency cache laws: hits require task + code version + freshness.

use std::time::Duration;

use sluice_core::idempotency;
use sluice_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn cached_result_is_returned_until_ttl_elapses() {
    let (pool, db_name) = create_test_db().await;

    idempotency::cache_result(
        &pool, "encode", "k1", "trun_origin", 3, "out/p1.json", Some(64), None, 1,
    )
    .await
    .unwrap();

    let hit = idempotency::lookup(&pool, "encode", "k1", 3)
        .await
        .unwrap()
        .expect("fresh entry should hit");
    assert_eq!(hit.output_path, "out/p1.json");
    assert_eq!(hit.output_size, Some(64));
    assert_eq!(hit.run_id, "trun_origin");

    // TTL of one second: wait it out, then miss.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(idempotency::lookup(&pool, "encode", "k1", 3).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn code_version_mismatch_misses() {
    let (pool, db_name) = create_test_db().await;

    idempotency::cache_result(
        &pool, "encode", "k1", "trun_origin", 3, "out/p1.json", None, None, 3600,
    )
    .await
    .unwrap();

    assert!(idempotency::lookup(&pool, "encode", "k1", 4).await.unwrap().is_none());
    assert!(idempotency::lookup(&pool, "encode", "k1", 3).await.unwrap().is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn different_user_keys_do_not_collide() {
    let (pool, db_name) = create_test_db().await;

    idempotency::cache_result(
        &pool, "encode", "k1", "trun_1", 1, "out/one.json", None, None, 3600,
    )
    .await
    .unwrap();
    idempotency::cache_result(
        &pool, "encode", "k2", "trun_2", 1, "out/two.json", None, None, 3600,
    )
    .await
    .unwrap();

    let one = idempotency::lookup(&pool, "encode", "k1", 1).await.unwrap().unwrap();
    let two = idempotency::lookup(&pool, "encode", "k2", 1).await.unwrap().unwrap();
    assert_eq!(one.output_path, "out/one.json");
    assert_eq!(two.output_path, "out/two.json");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn upsert_refreshes_existing_entry() {
    let (pool, db_name) = create_test_db().await;

    idempotency::cache_result(
        &pool, "encode", "k1", "trun_old", 1, "out/old.json", None, None, 3600,
    )
    .await
    .unwrap();
    idempotency::cache_result(
        &pool, "encode", "k1", "trun_new", 2, "out/new.json", None, None, 3600,
    )
    .await
    .unwrap();

    // Old code version no longer hits; the refreshed one does.
    assert!(idempotency::lookup(&pool, "encode", "k1", 1).await.unwrap().is_none());
    let hit = idempotency::lookup(&pool, "encode", "k1", 2).await.unwrap().unwrap();
    assert_eq!(hit.output_path, "out/new.json");
    assert_eq!(hit.run_id, "trun_new");

    pool.close().await;
    drop_test_db(&db_name).await;
}
