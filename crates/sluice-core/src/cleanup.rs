//! Housekeeping sweeps: expired temp uploads, archived upload rows, and
//! expired idempotency entries.

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use sluice_db::queries::idempotency as cache_db;
use sluice_db::queries::temp_uploads as upload_db;

use crate::config::OrchestratorConfig;
use crate::store::BlobStore;

/// Delete the blobs of expired, unclaimed uploads (batched) and mark their
/// rows. A failing blob deletion is logged and skipped; the row stays
/// eligible for the next sweep. Returns how many uploads were handled.
pub async fn sweep_expired_uploads(
    pool: &PgPool,
    store: &BlobStore,
    batch_size: i64,
) -> Result<usize> {
    let expired = upload_db::select_expired_unclaimed(pool, batch_size).await?;
    let mut handled = 0;

    for upload in &expired {
        if let Err(e) = store.delete(&upload.storage_path).await {
            tracing::error!(
                upload_id = %upload.id,
                path = %upload.storage_path,
                error = %e,
                "failed to delete expired upload blob"
            );
            continue;
        }
        upload_db::mark_deleted(pool, &upload.id).await?;
        handled += 1;
    }

    if handled > 0 {
        tracing::info!(handled, "expired temp uploads cleaned");
    }
    Ok(handled)
}

/// One full housekeeping pass.
pub async fn sweep(pool: &PgPool, store: &BlobStore, config: &OrchestratorConfig) -> Result<()> {
    sweep_expired_uploads(pool, store, config.cleanup_batch_size).await?;

    let archived = upload_db::purge_archived(pool, config.upload_archive_days).await?;
    if archived > 0 {
        tracing::info!(archived, "old temp-upload rows purged");
    }

    let expired_cache = cache_db::delete_expired(pool).await?;
    if expired_cache > 0 {
        tracing::debug!(expired_cache, "expired idempotency entries dropped");
    }

    Ok(())
}

/// Run the cleanup loop until cancelled.
pub async fn run_cleanup_loop(
    pool: PgPool,
    store: BlobStore,
    config: OrchestratorConfig,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("cleanup loop stopped");
                return;
            }
            _ = tokio::time::sleep(config.cleanup_interval) => {
                if let Err(e) = sweep(&pool, &store, &config).await {
                    tracing::error!(error = %e, "cleanup sweep failed");
                }
            }
        }
    }
}
