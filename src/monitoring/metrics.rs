use super::types::{
    CheckpointOutcome, LeaseEventType, MonitoringConfig, MonitoringEvent, MonitoringEventType,
    ShardEventType,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Holds aggregated metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    // Processing
    pub records_processed: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub retry_attempts: u64,
    pub processing_time: Duration,
    pub avg_batch_time: Duration,
    pub max_batch_time: Duration,
    pub millis_behind_latest: Option<i64>,

    // Checkpoints
    pub checkpoints_succeeded: u64,
    pub checkpoints_failed: u64,
    pub checkpoint_conflicts: u64,

    // Leases
    pub leases_acquired: u64,
    pub lease_renewals: u64,
    pub leases_lost: u64,

    pub window_start: Instant,
    pub last_updated: Instant,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            records_processed: 0,
            batches_processed: 0,
            batches_failed: 0,
            retry_attempts: 0,
            processing_time: Duration::default(),
            avg_batch_time: Duration::default(),
            max_batch_time: Duration::default(),
            millis_behind_latest: None,
            checkpoints_succeeded: 0,
            checkpoints_failed: 0,
            checkpoint_conflicts: 0,
            leases_acquired: 0,
            lease_renewals: 0,
            leases_lost: 0,
            window_start: now,
            last_updated: now,
        }
    }
}

/// Aggregates monitoring events into metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ShardMetrics>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<MonitoringEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<MonitoringEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// An aggregator reporting every `config.metrics_interval`
    pub fn from_config(
        config: &MonitoringConfig,
        monitoring_rx: mpsc::Receiver<MonitoringEvent>,
    ) -> Self {
        Self::new(config.metrics_interval, monitoring_rx)
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    /// Process events and log metrics every window until the channel closes
    pub async fn run(mut self) {
        let mut ticker = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        self.emit_metrics().await;
                        debug!("Monitoring channel closed, stopping metrics aggregation");
                        return;
                    }
                },
                _ = ticker.tick() => self.emit_metrics().await,
            }
        }
    }

    pub async fn process_event(&self, event: MonitoringEvent) {
        let mut metrics = self.metrics.write().await;
        let shard_metrics = metrics.entry(event.shard_id.clone()).or_default();

        match event.event_type {
            MonitoringEventType::Lease { event_type, counter } => match event_type {
                LeaseEventType::Acquired => {
                    shard_metrics.leases_acquired += 1;
                    debug!(shard_id = %event.shard_id, counter, "Lease acquired");
                }
                LeaseEventType::Renewed => shard_metrics.lease_renewals += 1,
                LeaseEventType::Lost => {
                    shard_metrics.leases_lost += 1;
                    warn!(shard_id = %event.shard_id, counter, "Lease lost");
                }
                LeaseEventType::Released => {
                    trace!(shard_id = %event.shard_id, counter, "Lease released");
                }
            },
            MonitoringEventType::BatchProcessed {
                record_count,
                attempts,
                duration,
                millis_behind_latest,
            } => {
                shard_metrics.records_processed += record_count as u64;
                shard_metrics.batches_processed += 1;
                shard_metrics.retry_attempts += u64::from(attempts.saturating_sub(1));
                shard_metrics.processing_time += duration;
                shard_metrics.avg_batch_time = shard_metrics
                    .processing_time
                    .div_f64(shard_metrics.batches_processed as f64);
                if duration > shard_metrics.max_batch_time {
                    shard_metrics.max_batch_time = duration;
                }
                if millis_behind_latest.is_some() {
                    shard_metrics.millis_behind_latest = millis_behind_latest;
                }
            }
            MonitoringEventType::BatchFailed { attempts, error } => {
                shard_metrics.batches_failed += 1;
                shard_metrics.retry_attempts += u64::from(attempts.saturating_sub(1));
                warn!(shard_id = %event.shard_id, attempts, error = %error, "Batch failed");
            }
            MonitoringEventType::Checkpoint {
                checkpoint,
                outcome,
            } => match outcome {
                CheckpointOutcome::Success => {
                    shard_metrics.checkpoints_succeeded += 1;
                    trace!(shard_id = %event.shard_id, checkpoint = %checkpoint, "Checkpoint successful");
                }
                CheckpointOutcome::Conflict => shard_metrics.checkpoint_conflicts += 1,
                CheckpointOutcome::Failure(error) => {
                    shard_metrics.checkpoints_failed += 1;
                    warn!(
                        shard_id = %event.shard_id,
                        checkpoint = %checkpoint,
                        error = %error,
                        "Checkpoint failed"
                    );
                }
            },
            MonitoringEventType::ShardEvent {
                event_type,
                details,
            } => match event_type {
                ShardEventType::Started => {
                    debug!(shard_id = %event.shard_id, "Shard consumer started");
                }
                ShardEventType::Completed => {
                    debug!(shard_id = %event.shard_id, details = ?details, "Shard consumer completed");
                }
                ShardEventType::Failed => {
                    warn!(shard_id = %event.shard_id, details = ?details, "Shard consumer failed");
                }
                ShardEventType::Interrupted => {
                    info!(shard_id = %event.shard_id, details = ?details, "Shard consumer interrupted");
                }
            },
        }

        shard_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let mut metrics = self.metrics.write().await;

        for (shard_id, metrics) in metrics.iter() {
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                shard_id = %shard_id,
                records_processed = metrics.records_processed,
                batches_processed = metrics.batches_processed,
                batches_failed = metrics.batches_failed,
                retry_attempts = metrics.retry_attempts,
                avg_batch_time_ms = %metrics.avg_batch_time.as_millis(),
                max_batch_time_ms = %metrics.max_batch_time.as_millis(),
                millis_behind_latest = ?metrics.millis_behind_latest,
                checkpoints_succeeded = metrics.checkpoints_succeeded,
                checkpoints_failed = metrics.checkpoints_failed,
                checkpoint_conflicts = metrics.checkpoint_conflicts,
                leases_lost = metrics.leases_lost,
                "Metrics for window"
            );

            if metrics.checkpoints_failed > 0 {
                warn!(
                    shard_id = %shard_id,
                    failures = metrics.checkpoints_failed,
                    "Checkpoint failures detected"
                );
            }
        }

        metrics.retain(|_, m| m.last_updated.elapsed() <= self.window_duration * 2);
    }

    /// Shared handle to the live metrics, readable after `run` consumes the aggregator
    pub fn metrics(&self) -> Arc<RwLock<HashMap<String, ShardMetrics>>> {
        self.metrics.clone()
    }

    /// Get current metrics for all shards
    pub async fn get_metrics(&self) -> HashMap<String, ShardMetrics> {
        self.metrics.read().await.clone()
    }

    /// Get metrics for a specific shard
    pub async fn get_shard_metrics(&self, shard_id: &str) -> Option<ShardMetrics> {
        self.metrics.read().await.get(shard_id).cloned()
    }
}
