//! Connection pooling, database bootstrap, and schema migrations.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Postgres error code raised by `CREATE DATABASE` when the target already
/// exists.
const DUPLICATE_DATABASE: &str = "42P04";

/// How long connection acquisition may block before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool against the configured database.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))
}

/// Apply every pending migration bundled with this crate.
///
/// The migrator is constructed at runtime from the crate's `migrations/`
/// directory, so building the workspace never needs a live database (the
/// `sqlx::migrate!()` macro would).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let dir = migrations_dir();
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations up to date");
    Ok(())
}

// CARGO_MANIFEST_DIR is baked in when this crate compiles, so the CLI and
// every test binary resolve the same migration set.
fn migrations_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Create the configured database if it does not exist yet.
///
/// Issues `CREATE DATABASE` over a maintenance connection and treats the
/// duplicate-database error as success, so two processes bootstrapping at
/// once cannot race each other.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("could not determine database name from URL")?;

    // CREATE DATABASE cannot take the name as a bind parameter; refuse
    // anything that is not a plain identifier before formatting it in.
    if !is_plain_identifier(name) {
        bail!("database name {name:?} is not a plain identifier");
    }

    let maintenance_url = config.maintenance_url();
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))?;

    let outcome = admin
        .execute(format!("CREATE DATABASE {name}").as_str())
        .await;
    admin.close().await;

    match outcome {
        Ok(_) => {
            info!(db = name, "database created");
            Ok(())
        }
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(DUPLICATE_DATABASE) => {
            info!(db = name, "database already present");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to create database {name}")),
    }
}

/// ASCII letter or underscore first, then letters, digits, or underscores.
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_accepted() {
        assert!(is_plain_identifier("sluice"));
        assert!(is_plain_identifier("sluice_test_07"));
        assert!(is_plain_identifier("_scratch"));
    }

    #[test]
    fn injection_shaped_names_rejected() {
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("7days"));
        assert!(!is_plain_identifier("db;DROP TABLE task_runs"));
        assert!(!is_plain_identifier("db name"));
        assert!(!is_plain_identifier("db\"quoted"));
    }
}
