//! `sluice maintenance`: the three-state lifecycle from the command line.

use anyhow::Result;
use clap::Subcommand;
use sqlx::PgPool;

use sluice_core::maintenance;

#[derive(Subcommand)]
pub enum MaintenanceCommands {
    /// Stop admitting new work and drain running tasks
    Request,
    /// Return to running mode
    Exit,
    /// Show the current mode and queue depths
    Status,
}

pub async fn run(pool: &PgPool, command: MaintenanceCommands) -> Result<()> {
    match command {
        MaintenanceCommands::Request => {
            let state = maintenance::request_maintenance(pool).await?;
            println!("mode: {}", state.mode);
        }
        MaintenanceCommands::Exit => {
            let state = maintenance::exit_maintenance(pool).await?;
            println!("mode: {}", state.mode);
        }
        MaintenanceCommands::Status => {
            let report = maintenance::state_report(pool).await?;
            println!("mode:    {}", report.mode);
            println!("since:   {}", report.mode_changed_at.to_rfc3339());
            println!(
                "queue:   {} pending, {} running, {} waiting",
                report.pending_tasks, report.running_tasks, report.waiting_tasks
            );
        }
    }
    Ok(())
}
