//! `sluice dlq`: inspect, replay, and purge dead-lettered runs.

use anyhow::Result;
use clap::Subcommand;
use sqlx::PgPool;

use sluice_core::dlq;

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered runs
    List {
        /// Filter by task id
        #[arg(long)]
        task_id: Option<String>,
        /// Filter by pipeline run id
        #[arg(long)]
        pipeline_run_id: Option<String>,
        /// Maximum rows
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Replay one item as a fresh run
    Retry {
        /// DLQ item id (dlq_…)
        id: String,
    },
    /// Delete items older than the retention window
    Purge {
        /// Retention in days
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
}

pub async fn run(pool: &PgPool, command: DlqCommands) -> Result<()> {
    match command {
        DlqCommands::List {
            task_id,
            pipeline_run_id,
            limit,
        } => {
            let filter = dlq::DlqFilter {
                task_id,
                pipeline_run_id,
                ..Default::default()
            };
            let items = dlq::list(pool, &filter, limit).await?;
            if items.is_empty() {
                println!("dead-letter queue is empty");
                return Ok(());
            }
            for item in &items {
                println!(
                    "{}  {:<28} attempts={} {}  {}",
                    item.failed_at.to_rfc3339(),
                    item.task_id,
                    item.attempts,
                    item.error_code.as_deref().unwrap_or("-"),
                    item.id,
                );
            }
        }
        DlqCommands::Retry { id } => {
            let new_run = dlq::replay(pool, &id).await?;
            println!("replayed as {}", new_run.id);
        }
        DlqCommands::Purge { older_than_days } => {
            let purged = dlq::purge(pool, older_than_days).await?;
            println!("purged {purged} items");
        }
    }
    Ok(())
}
