//! Database query functions for the `services` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Service;

/// Insert or refresh a service row. Registration always bumps
/// `last_seen_at`; `version` and `base_url` take the submitted values.
pub async fn upsert_service(
    pool: &PgPool,
    id: &str,
    version: &str,
    base_url: &str,
) -> Result<Service> {
    let service = sqlx::query_as::<_, Service>(
        "INSERT INTO services (id, version, base_url) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE \
         SET version = EXCLUDED.version, \
             base_url = EXCLUDED.base_url, \
             last_seen_at = NOW() \
         RETURNING *",
    )
    .bind(id)
    .bind(version)
    .bind(base_url)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert service {id}"))?;

    Ok(service)
}

/// Fetch a single service by ID.
pub async fn get_service(pool: &PgPool, id: &str) -> Result<Option<Service>> {
    let service = sqlx::query_as::<_, Service>("SELECT * FROM services WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch service {id}"))?;

    Ok(service)
}

/// List all registered services, most recently seen first.
pub async fn list_services(pool: &PgPool) -> Result<Vec<Service>> {
    let services =
        sqlx::query_as::<_, Service>("SELECT * FROM services ORDER BY last_seen_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list services")?;

    Ok(services)
}

/// Bump `last_seen_at` for the service owning a given task. Called on every
/// worker callback so liveness reflects actual traffic.
pub async fn touch_service_for_task(pool: &PgPool, task_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE services SET last_seen_at = NOW() \
         WHERE id = (SELECT service_id FROM task_defs WHERE id = $1)",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to touch service for task {task_id}"))?;

    Ok(())
}
