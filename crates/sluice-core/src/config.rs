//! Runtime configuration for the scheduling engine.

use std::time::Duration;

/// Tunables for the poller, monitors, and housekeeping sweeps.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the poller claims ready runs.
    pub poll_interval: Duration,
    /// Maximum task runs in flight across all tasks.
    pub max_concurrency: usize,
    /// Timeout for the dispatch POST to a worker.
    pub dispatch_timeout: Duration,
    /// How often the heartbeat monitor sweeps for stale runs.
    pub timeout_check_interval: Duration,
    /// How often the maintenance monitor checks for drained queues.
    pub maintenance_check_interval: Duration,
    /// How often the temp-upload cleanup sweep runs.
    pub cleanup_interval: Duration,
    /// Temp uploads handled per cleanup batch.
    pub cleanup_batch_size: i64,
    /// Days a temp-upload row is kept after its blob is deleted.
    pub upload_archive_days: i64,
    /// Days a dead-letter item is kept before purge eligibility.
    pub dlq_retention_days: i64,
    /// Storage backend id stamped into minted tokens.
    pub storage_backend_id: String,
    /// Lifetime of a minted storage token.
    pub storage_token_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_concurrency: 16,
            dispatch_timeout: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(10),
            maintenance_check_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),
            cleanup_batch_size: 100,
            upload_archive_days: 7,
            dlq_retention_days: 30,
            storage_backend_id: "default".to_owned(),
            storage_token_ttl: Duration::from_secs(3600),
        }
    }
}
