//! `sluice stats`: bucketed rollups on the command line.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use sluice_core::stats;
use sluice_db::models::{BucketSize, StatsScope};

pub async fn run(
    pool: &PgPool,
    scope: &str,
    scope_id: Option<&str>,
    bucket: &str,
    hours: i64,
) -> Result<()> {
    let scope: StatsScope = scope.parse().context("bad --scope")?;
    let bucket: BucketSize = bucket.parse().context("bad --bucket")?;

    let to = Utc::now();
    let from = to - ChronoDuration::try_hours(hours).context("bad --hours")?;

    let report = stats::get_statistics(
        pool,
        &stats::StatsRequest {
            scope,
            scope_id: scope_id.map(str::to_owned),
            from,
            to,
            bucket,
        },
    )
    .await?;

    println!(
        "scope: {} {}  bucket: {}  window: last {}h",
        report.scope,
        if report.scope_id.is_empty() {
            "-"
        } else {
            &report.scope_id
        },
        report.bucket,
        hours
    );

    for bucket in &report.buckets {
        if bucket.data.tasks_total == 0 && bucket.data.pipelines_total == 0 {
            continue;
        }
        let p95 = bucket
            .runtime_percentiles
            .p95
            .map(|v| format!("{v:.0}ms"))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{}  tasks={} completed={} failed={} p95={}",
            bucket.bucket_ts.to_rfc3339(),
            bucket.data.tasks_total,
            bucket.data.task_counts.get("completed").unwrap_or(&0),
            bucket.data.task_counts.get("failed").unwrap_or(&0),
            p95,
        );
    }

    let s = &report.summary;
    println!("---");
    println!(
        "total={} completed={} failed={} retries={} dlq={}",
        s.tasks_total, s.completed, s.failed, s.retries, s.dlq_total
    );
    if let Some(rate) = s.success_rate {
        println!("success rate: {:.1}%", rate * 100.0);
    }
    if let Some(avg) = s.avg_runtime_ms {
        println!("avg runtime:  {avg:.0}ms");
    }
    if let Some(avg) = s.avg_wait_ms {
        println!("avg wait:     {avg:.0}ms");
    }
    Ok(())
}
