//! Postgres fixtures for sluice integration tests.
//!
//! Tests share one database server and isolate state by giving every test
//! its own database, created migrated and dropped around the test body.
//! The server is taken from `SLUICE_TEST_PG_URL` when a harness already
//! runs one (e.g. a nextest setup script); otherwise a testcontainers
//! Postgres is started lazily and lives for the rest of the test binary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use sluice_db::pool;

static SERVER: OnceCell<PgServer> = OnceCell::const_new();
static DB_SEQ: AtomicU32 = AtomicU32::new(0);

/// The shared server: its root URL (no database path) and, when
/// testcontainers started it, the handle that keeps it alive.
struct PgServer {
    root_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

impl PgServer {
    async fn get() -> &'static PgServer {
        SERVER.get_or_init(PgServer::start).await
    }

    async fn start() -> PgServer {
        if let Ok(root_url) = std::env::var("SLUICE_TEST_PG_URL") {
            return PgServer {
                root_url,
                _container: None,
            };
        }

        let container = Postgres::default()
            .with_tag("18")
            .start()
            .await
            .expect("postgres test container should start");
        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");

        PgServer {
            root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
            _container: Some(container),
        }
    }

    /// Short-lived single connection to the server's `postgres` database,
    /// for CREATE/DROP DATABASE statements.
    async fn admin(&self) -> PgPool {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/postgres", self.root_url))
            .await
            .expect("admin connection to test server should succeed")
    }

    async fn connect_to(&self, db_name: &str) -> PgPool {
        PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/{db_name}", self.root_url))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to test database {db_name}: {e}"))
    }
}

/// Mint a database name unique across tests, binaries, and reruns against
/// an external server: a per-process sequence number plus a random tag.
fn fresh_db_name() -> String {
    let mut tag = [0u8; 4];
    rand::rng().fill(&mut tag);
    format!(
        "sluice_test_{}_{}",
        DB_SEQ.fetch_add(1, Ordering::Relaxed),
        hex::encode(tag)
    )
}

/// Create an isolated database with all migrations applied.
///
/// Returns the pool and the database name; pass the name to
/// [`drop_test_db`] when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let server = PgServer::get().await;
    let db_name = fresh_db_name();

    let admin = server.admin().await;
    admin
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create test database {db_name}: {e}"));
    admin.close().await;

    let db = server.connect_to(&db_name).await;
    pool::run_migrations(&db)
        .await
        .expect("migrations should apply to the test database");

    (db, db_name)
}

/// Drop a database created by [`create_test_db`].
///
/// Terminates any lingering connections first. Errors are swallowed so a
/// teardown hiccup never masks the test's own result; the database is
/// gone, already dropped, or left for the container to take down.
pub async fn drop_test_db(db_name: &str) {
    let server = PgServer::get().await;
    let admin = server.admin().await;

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = admin.execute(terminate.as_str()).await;
    let _ = admin
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    admin.close().await;
}
