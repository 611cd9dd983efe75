use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the batch pipeline. Every field has a default, so a config
/// file only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Flush once this many finished runs are buffered.
    pub result_batch_size: usize,
    /// Flush on add once the last flush is at least this old.
    pub flush_interval_ms: u64,
    /// Period of the background buffer sweep.
    pub sweep_interval_ms: u64,

    /// Local mode work queue bound. Publishers block when it is full.
    pub queue_capacity: usize,
    /// Local mode consumer threads.
    pub consumer_count: usize,

    /// Run ids per broker message.
    pub message_batch_size: usize,
    /// This process's worker index, when messages are partitioned.
    pub worker_index: Option<u32>,
    /// Declared worker count. Partitioning applies only when > 1.
    pub worker_count: u32,
    /// Broker messages leased per receive.
    pub max_in_flight: u32,
    pub visibility_timeout_ms: u64,
    /// Idle wait between empty receives.
    pub poll_interval_ms: u64,

    pub snapshot_cache_ttl_ms: u64,
    pub snapshot_cache_capacity: usize,

    /// Failed attempts after which a run is terminal.
    pub max_run_attempts: u32,
    /// Period of the finalizer scanner.
    pub scanner_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            result_batch_size: 50,
            flush_interval_ms: 2_000,
            sweep_interval_ms: 1_000,
            queue_capacity: 100_000,
            consumer_count: 4,
            message_batch_size: 25,
            worker_index: None,
            worker_count: 1,
            max_in_flight: 8,
            visibility_timeout_ms: 300_000,
            poll_interval_ms: 500,
            snapshot_cache_ttl_ms: 15 * 60 * 1000,
            snapshot_cache_capacity: 64,
            max_run_attempts: 5,
            scanner_interval_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    /// In tests, use PipelineConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Small thresholds and short intervals so tests finish quickly.
    pub fn default_test() -> Self {
        Self {
            result_batch_size: 4,
            flush_interval_ms: 50,
            sweep_interval_ms: 20,
            queue_capacity: 1_000,
            consumer_count: 2,
            message_batch_size: 3,
            max_in_flight: 4,
            visibility_timeout_ms: 1_000,
            poll_interval_ms: 10,
            snapshot_cache_ttl_ms: 60_000,
            snapshot_cache_capacity: 8,
            scanner_interval_ms: 50,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.result_batch_size > 0, "result_batch_size must be > 0");
        anyhow::ensure!(self.queue_capacity > 0, "queue_capacity must be > 0");
        anyhow::ensure!(self.consumer_count > 0, "consumer_count must be > 0");
        anyhow::ensure!(self.message_batch_size > 0, "message_batch_size must be > 0");
        anyhow::ensure!(self.worker_count > 0, "worker_count must be > 0");
        anyhow::ensure!(self.max_in_flight > 0, "max_in_flight must be > 0");
        anyhow::ensure!(self.max_run_attempts > 0, "max_run_attempts must be > 0");
        if let Some(index) = self.worker_index {
            anyhow::ensure!(
                index < self.worker_count,
                "worker_index {index} is outside worker_count {}",
                self.worker_count
            );
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scanner_interval(&self) -> Duration {
        Duration::from_millis(self.scanner_interval_ms)
    }

    pub fn snapshot_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "consumer_count": 9, "worker_count": 3, "worker_index": 2 }"#)
                .unwrap();
        assert_eq!(config.consumer_count, 9);
        assert_eq!(config.max_run_attempts, 5);
        assert_eq!(config.queue_capacity, 100_000);
        config.validate().unwrap();
    }

    #[test]
    fn worker_index_must_fit_worker_count() {
        let config = PipelineConfig {
            worker_index: Some(2),
            worker_count: 2,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PipelineConfig::load("/nonexistent/pipeline.json").unwrap_err();
        assert!(err.to_string().contains("Cannot read"));
    }
}
