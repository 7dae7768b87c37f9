//! `sluice status`: orchestrator state, queue depths, or one run's detail.

use anyhow::Result;
use sqlx::PgPool;

use sluice_core::{maintenance, stats};
use sluice_db::queries::{pipeline_runs as prun_db, task_runs as run_db};

pub async fn run_status(pool: &PgPool, run_id: Option<&str>) -> Result<()> {
    match run_id {
        Some(id) if id.starts_with("prun_") => show_pipeline_run(pool, id).await,
        Some(id) => show_task_run(pool, id).await,
        None => show_overview(pool).await,
    }
}

async fn show_overview(pool: &PgPool) -> Result<()> {
    let state = maintenance::state_report(pool).await?;
    println!("mode:    {}", state.mode);
    println!("since:   {}", state.mode_changed_at.to_rfc3339());
    println!(
        "queue:   {} pending, {} running, {} waiting",
        state.pending_tasks, state.running_tasks, state.waiting_tasks
    );

    let queue = stats::queue_stats(pool).await?;
    if let Some(oldest) = queue.oldest_pending_ms {
        println!("oldest pending: {:.1}s", oldest as f64 / 1000.0);
    }
    if let Some(avg) = queue.avg_wait_ms_last_hour {
        println!("avg wait (1h):  {:.0}ms", avg);
    }
    for task in &queue.per_task {
        println!(
            "  {:<32} {} pending / {} running / {} waiting",
            task.task_id, task.pending, task.running, task.waiting
        );
    }
    Ok(())
}

async fn show_task_run(pool: &PgPool, id: &str) -> Result<()> {
    let Some(run) = run_db::get_task_run(pool, id).await? else {
        anyhow::bail!("task run {id} not found");
    };
    println!("run:       {}", run.id);
    println!("task:      {}", run.task_id);
    println!("status:    {}", run.status);
    println!("attempt:   {} (max retries {})", run.attempt, run.max_retries);
    println!("input:     {}", run.input_path);
    if let Some(prun) = &run.pipeline_run_id {
        println!("pipeline:  {prun}");
    }
    if let Some(output) = &run.output_path {
        println!("output:    {output}");
    }
    if let Some(error) = &run.error {
        println!(
            "error:     {} ({})",
            error,
            run.error_code.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn show_pipeline_run(pool: &PgPool, id: &str) -> Result<()> {
    let Some(prun) = prun_db::get_pipeline_run(pool, id).await? else {
        anyhow::bail!("pipeline run {id} not found");
    };
    println!("pipeline run: {}", prun.id);
    println!("pipeline:     {}", prun.pipeline_id);
    println!("status:       {}", prun.status);
    println!("failure mode: {}", prun.failure_mode);
    if let Some(error) = &prun.error {
        println!("error:        {error}");
    }

    let runs = run_db::list_runs_for_pipeline(pool, id).await?;
    println!("tasks ({}):", runs.len());
    for run in &runs {
        println!(
            "  {:<28} attempt {} {:<10} {}",
            run.task_id, run.attempt, run.status.to_string(), run.id
        );
    }
    Ok(())
}
