//! Statistics aggregator: bucketed rollups over task and pipeline runs
//! with t-digest percentiles, plus real-time queue stats.
//!
//! Buckets are aligned to their size, persisted on first query, and
//! rebuilt while still trailing (at most once per minute). Historical
//! buckets are immutable once marked complete.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use sluice_db::models::{BucketSize, StatsScope, TaskRunStatus};
use sluice_db::queries::dlq as dlq_db;
use sluice_db::queries::statistics as stats_db;
use sluice_db::queries::task_runs as run_db;

use crate::digest::TDigest;

/// Seconds a trailing bucket's build stays fresh before a re-query
/// rebuilds it.
const REBUILD_AFTER_SECONDS: i64 = 60;

// ---------------------------------------------------------------------------
// Bucket payload
// ---------------------------------------------------------------------------

/// Count/sum/min/max accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggStats {
    pub count: i64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AggStats {
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Everything stored in one bucket row's `data` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketData {
    pub task_counts: BTreeMap<String, i64>,
    pub tasks_total: i64,
    /// Runs with attempt > 1.
    pub retries: i64,
    /// Retried runs that completed.
    pub retry_successes: i64,
    pub runtime: AggStats,
    pub wait: AggStats,
    pub runtime_digest: TDigest,
    pub wait_digest: TDigest,
    pub pipeline_counts: BTreeMap<String, i64>,
    pub pipelines_total: i64,
    pub pipeline_runtime: AggStats,
    pub pipeline_runtime_digest: TDigest,
    pub errors_by_code: BTreeMap<String, i64>,
    /// Queue depths reconstructed at the bucket end.
    pub queued_at_end: i64,
    pub running_at_end: i64,
    /// Runs dead-lettered within the bucket.
    pub dlq_delta: i64,
}

/// Floor a timestamp to its bucket boundary.
pub fn align_bucket(ts: DateTime<Utc>, size: BucketSize) -> DateTime<Utc> {
    let width = size.seconds();
    let secs = ts.timestamp();
    let aligned = secs - secs.rem_euclid(width);
    DateTime::from_timestamp(aligned, 0).expect("aligned timestamp in range")
}

fn scope_filter(scope: StatsScope, scope_id: &str) -> stats_db::ScopeFilter {
    let mut filter = stats_db::ScopeFilter::default();
    match scope {
        StatsScope::System => {}
        StatsScope::Task => filter.task_id = Some(scope_id.to_owned()),
        StatsScope::Service => filter.service_id = Some(scope_id.to_owned()),
        StatsScope::Pipeline => filter.pipeline_id = Some(scope_id.to_owned()),
    }
    filter
}

/// Build one bucket's data from raw samples.
pub async fn build_bucket(
    pool: &PgPool,
    bucket_start: DateTime<Utc>,
    size: BucketSize,
    scope: StatsScope,
    scope_id: &str,
) -> Result<BucketData> {
    let bucket_end = bucket_start
        + ChronoDuration::try_seconds(size.seconds()).context("bucket width out of range")?;
    let filter = scope_filter(scope, scope_id);

    let mut data = BucketData::default();

    let samples = stats_db::task_run_samples(pool, bucket_start, bucket_end, &filter).await?;
    let mut runtimes = Vec::new();
    let mut waits = Vec::new();
    for sample in &samples {
        *data
            .task_counts
            .entry(sample.status.to_string())
            .or_insert(0) += 1;
        data.tasks_total += 1;

        if sample.attempt > 1 {
            data.retries += 1;
            if sample.status == TaskRunStatus::Completed {
                data.retry_successes += 1;
            }
        }

        if matches!(sample.status, TaskRunStatus::Failed | TaskRunStatus::Timeout) {
            if let Some(code) = &sample.error_code {
                *data.errors_by_code.entry(code.clone()).or_insert(0) += 1;
            }
        }

        if let Some(runtime) = sample.runtime_ms.filter(|v| *v >= 0.0) {
            data.runtime.add(runtime);
            runtimes.push(runtime);
        }
        if let Some(wait) = sample.wait_ms.filter(|v| *v >= 0.0) {
            data.wait.add(wait);
            waits.push(wait);
        }
    }
    data.runtime_digest = TDigest::from_values(&runtimes);
    data.wait_digest = TDigest::from_values(&waits);

    // Pipeline rollups only exist for scopes with a pipeline dimension.
    if matches!(scope, StatsScope::System | StatsScope::Pipeline) {
        let pipelines =
            stats_db::pipeline_run_samples(pool, bucket_start, bucket_end, &filter).await?;
        let mut pipeline_runtimes = Vec::new();
        for sample in &pipelines {
            *data
                .pipeline_counts
                .entry(sample.status.to_string())
                .or_insert(0) += 1;
            data.pipelines_total += 1;
            if let Some(runtime) = sample.runtime_ms.filter(|v| *v >= 0.0) {
                data.pipeline_runtime.add(runtime);
                pipeline_runtimes.push(runtime);
            }
        }
        data.pipeline_runtime_digest = TDigest::from_values(&pipeline_runtimes);
    }

    let depth_at = bucket_end.min(Utc::now());
    let depths = stats_db::queue_depths_at(pool, depth_at, &filter).await?;
    data.queued_at_end = depths.queued;
    data.running_at_end = depths.running;

    data.dlq_delta = dlq_db::count_in_window(pool, bucket_start, bucket_end).await?;

    Ok(data)
}

// ---------------------------------------------------------------------------
// Querying
// ---------------------------------------------------------------------------

/// A statistics query.
#[derive(Debug, Clone)]
pub struct StatsRequest {
    pub scope: StatsScope,
    pub scope_id: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub bucket: BucketSize,
}

/// p50/p95/p99 extracted from a digest at query time.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl Percentiles {
    fn from_digest(digest: &TDigest) -> Self {
        Self {
            p50: digest.quantile(0.5),
            p95: digest.quantile(0.95),
            p99: digest.quantile(0.99),
        }
    }
}

/// One bucket in a query response.
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    pub bucket_ts: DateTime<Utc>,
    pub is_complete: bool,
    pub runtime_percentiles: Percentiles,
    pub wait_percentiles: Percentiles,
    pub pipeline_runtime_percentiles: Percentiles,
    #[serde(flatten)]
    pub data: BucketData,
}

/// Totals accumulated across the queried buckets, weighted by count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub tasks_total: i64,
    pub completed: i64,
    pub failed: i64,
    pub retries: i64,
    pub dlq_total: i64,
    pub success_rate: Option<f64>,
    pub avg_runtime_ms: Option<f64>,
    pub avg_wait_ms: Option<f64>,
}

/// A full statistics response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub scope: StatsScope,
    pub scope_id: String,
    pub bucket: BucketSize,
    pub buckets: Vec<BucketReport>,
    pub summary: StatsSummary,
}

/// Query statistics over `[from, to)`, building or refreshing buckets as
/// needed.
pub async fn get_statistics(pool: &PgPool, req: &StatsRequest) -> Result<StatsReport> {
    let scope_id = req.scope_id.clone().unwrap_or_default();
    let width = ChronoDuration::try_seconds(req.bucket.seconds())
        .context("bucket width out of range")?;
    let now = Utc::now();

    let mut buckets = Vec::new();
    let mut summary = StatsSummary::default();
    let mut runtime_sum = 0.0;
    let mut runtime_count = 0_i64;
    let mut wait_sum = 0.0;
    let mut wait_count = 0_i64;

    let mut ts = align_bucket(req.from, req.bucket);
    while ts < req.to {
        let bucket_end = ts + width;
        let existing = stats_db::get_bucket(pool, ts, req.bucket, req.scope, &scope_id).await?;

        let needs_rebuild = match &existing {
            None => true,
            Some(row) if row.is_complete => false,
            Some(row) => {
                // Still trailing when built; refresh once closed or when
                // the last build went stale.
                bucket_end <= now
                    || (now - row.last_built_at).num_seconds() >= REBUILD_AFTER_SECONDS
            }
        };

        let (data, is_complete) = if needs_rebuild {
            let data = build_bucket(pool, ts, req.bucket, req.scope, &scope_id).await?;
            let is_complete = bucket_end <= now;
            let json = serde_json::to_value(&data).context("failed to serialize bucket")?;
            stats_db::upsert_bucket(pool, ts, req.bucket, req.scope, &scope_id, &json, is_complete)
                .await?;
            (data, is_complete)
        } else {
            let row = existing.expect("checked above");
            let data: BucketData = serde_json::from_value(row.data)
                .context("failed to deserialize bucket data")?;
            (data, row.is_complete)
        };

        summary.tasks_total += data.tasks_total;
        summary.completed += data.task_counts.get("completed").copied().unwrap_or(0);
        summary.failed += data.task_counts.get("failed").copied().unwrap_or(0)
            + data.task_counts.get("timeout").copied().unwrap_or(0);
        summary.retries += data.retries;
        summary.dlq_total += data.dlq_delta;
        runtime_sum += data.runtime.sum;
        runtime_count += data.runtime.count;
        wait_sum += data.wait.sum;
        wait_count += data.wait.count;

        buckets.push(BucketReport {
            bucket_ts: ts,
            is_complete,
            runtime_percentiles: Percentiles::from_digest(&data.runtime_digest),
            wait_percentiles: Percentiles::from_digest(&data.wait_digest),
            pipeline_runtime_percentiles: Percentiles::from_digest(&data.pipeline_runtime_digest),
            data,
        });

        ts = bucket_end;
    }

    summary.success_rate = (summary.tasks_total > 0)
        .then(|| summary.completed as f64 / summary.tasks_total as f64);
    summary.avg_runtime_ms = (runtime_count > 0).then(|| runtime_sum / runtime_count as f64);
    summary.avg_wait_ms = (wait_count > 0).then(|| wait_sum / wait_count as f64);

    Ok(StatsReport {
        scope: req.scope,
        scope_id,
        bucket: req.bucket,
        buckets,
        summary,
    })
}

// ---------------------------------------------------------------------------
// Real-time queue stats
// ---------------------------------------------------------------------------

/// Per-task live queue row.
#[derive(Debug, Clone, Serialize)]
pub struct TaskQueueStats {
    pub task_id: String,
    pub pending: i64,
    pub running: i64,
    pub waiting: i64,
    pub oldest_wait_ms: Option<i64>,
}

/// Live queue picture across all tasks.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub waiting: i64,
    pub per_task: Vec<TaskQueueStats>,
    /// Age of the oldest pending run.
    pub oldest_pending_ms: Option<i64>,
    /// Average enqueue-to-start wait over the last hour.
    pub avg_wait_ms_last_hour: Option<f64>,
}

/// Snapshot current queue depths and waits.
pub async fn queue_stats(pool: &PgPool) -> Result<QueueStats> {
    let now = Utc::now();
    let totals = run_db::queue_totals(pool).await?;
    let per_task = run_db::per_task_queue(pool)
        .await?
        .into_iter()
        .map(|row| TaskQueueStats {
            task_id: row.task_id,
            pending: row.pending,
            running: row.running,
            waiting: row.waiting,
            oldest_wait_ms: row
                .oldest_pending_at
                .map(|t| (now - t).num_milliseconds()),
        })
        .collect();

    let oldest_pending_ms = run_db::oldest_pending_at(pool)
        .await?
        .map(|t| (now - t).num_milliseconds());
    let avg_wait_ms_last_hour = run_db::avg_wait_ms_last_hour(pool).await?;

    Ok(QueueStats {
        pending: totals.pending,
        running: totals.running,
        waiting: totals.waiting,
        per_task,
        oldest_pending_ms,
        avg_wait_ms_last_hour,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
