mod config;
mod dlq_cmd;
mod maintenance_cmd;
mod serve_cmd;
mod stats_cmd;
mod status_cmd;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use sluice_core::store::BlobStore;
use sluice_db::pool;

use config::SluiceConfig;

#[derive(Parser)]
#[command(name = "sluice", about = "Durable task-and-pipeline orchestrator")]
struct Cli {
    /// Database URL (overrides SLUICE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a sluice config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/sluice")]
        db_url: String,
        /// Local blob storage root
        #[arg(long)]
        storage_root: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and run migrations
    DbInit,
    /// Run the orchestrator with its HTTP API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 7070)]
        port: u16,
        /// Maximum task runs in flight
        #[arg(long, default_value_t = 16)]
        max_concurrency: usize,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
    },
    /// Run one poller pass and exit (serverless mode)
    Tick,
    /// Show orchestrator state and queue depths (or one run's detail)
    Status {
        /// Task run or pipeline run id (trun_… / prun_…)
        run_id: Option<String>,
    },
    /// Maintenance lifecycle control
    Maintenance {
        #[command(subcommand)]
        command: maintenance_cmd::MaintenanceCommands,
    },
    /// Dead-letter queue inspection and replay
    Dlq {
        #[command(subcommand)]
        command: dlq_cmd::DlqCommands,
    },
    /// Bucketed statistics
    Stats {
        /// Scope: system, service, task, or pipeline
        #[arg(long, default_value = "system")]
        scope: String,
        /// Scope id (service/task/pipeline id)
        #[arg(long)]
        scope_id: Option<String>,
        /// Bucket size: 1m, 1h, or 1d
        #[arg(long, default_value = "1h")]
        bucket: String,
        /// Hours to look back
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            storage_root,
            force,
        } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let file = config::ConfigFile {
                database: config::DatabaseSection { url: db_url },
                auth: config::AuthSection {
                    token_secret: config::generate_token_secret(),
                },
                storage: config::StorageSection {
                    root: storage_root
                        .unwrap_or_else(|| config::config_dir().join("blobs").display().to_string()),
                },
            };
            config::save_config(&file)?;
            println!("wrote {}", path.display());
        }

        Commands::DbInit => {
            let resolved = SluiceConfig::resolve(cli.database_url.as_deref())?;
            pool::ensure_database_exists(&resolved.db_config).await?;
            let db = pool::create_pool(&resolved.db_config).await?;
            pool::run_migrations(&db).await?;
            println!("database ready at {}", resolved.db_config.database_url);
        }

        Commands::Serve {
            bind,
            port,
            max_concurrency,
            poll_interval_ms,
        } => {
            let resolved = SluiceConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config).await?;
            std::fs::create_dir_all(&resolved.storage_root).with_context(|| {
                format!("failed to create blob root {}", resolved.storage_root.display())
            })?;
            let store = BlobStore::local(&resolved.storage_root)?;

            let mut orch_config = sluice_core::config::OrchestratorConfig::default();
            orch_config.max_concurrency = max_concurrency;
            orch_config.poll_interval = std::time::Duration::from_millis(poll_interval_ms);

            serve_cmd::run_serve(db, store, resolved.token_config, orch_config, &bind, port)
                .await?;
        }

        Commands::Tick => {
            let resolved = SluiceConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config).await?;
            let store = BlobStore::local(&resolved.storage_root)?;
            let orchestrator = sluice_core::runtime::Orchestrator::new(
                db,
                store,
                resolved.token_config,
                sluice_core::config::OrchestratorConfig::default(),
            )?;
            let processed = orchestrator.tick().await?;
            println!("processed {processed} runs");
        }

        Commands::Status { run_id } => {
            let resolved = SluiceConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config).await?;
            status_cmd::run_status(&db, run_id.as_deref()).await?;
        }

        Commands::Maintenance { command } => {
            let resolved = SluiceConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config).await?;
            maintenance_cmd::run(&db, command).await?;
        }

        Commands::Dlq { command } => {
            let resolved = SluiceConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config).await?;
            dlq_cmd::run(&db, command).await?;
        }

        Commands::Stats {
            scope,
            scope_id,
            bucket,
            hours,
        } => {
            let resolved = SluiceConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config).await?;
            stats_cmd::run(&db, &scope, scope_id.as_deref(), &bucket, hours).await?;
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_owned();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        }
    }

    Ok(())
}
