use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::trace;

/// Configuration for the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often to emit aggregated metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Represents a monitoring event from the worker
#[derive(Debug, Clone)]
pub struct MonitoringEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// ID of the shard this event relates to
    pub shard_id: String,
    /// The type of event and its details
    pub event_type: MonitoringEventType,
}

/// The different types of events that can occur while coordinating shards
#[derive(Debug, Clone, PartialEq)]
pub enum MonitoringEventType {
    Lease {
        event_type: LeaseEventType,
        counter: u64,
    },
    BatchProcessed {
        record_count: usize,
        attempts: u32,
        duration: Duration,
        millis_behind_latest: Option<i64>,
    },
    BatchFailed {
        attempts: u32,
        error: String,
    },
    Checkpoint {
        checkpoint: String,
        outcome: CheckpointOutcome,
    },
    ShardEvent {
        event_type: ShardEventType,
        details: Option<String>,
    },
}

/// Types of lease events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEventType {
    Acquired,
    Renewed,
    /// Another worker took the lease
    Lost,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Success,
    /// The write was fenced by a newer lease counter
    Conflict,
    Failure(String),
}

/// Types of shard-level events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEventType {
    /// Started consuming a shard
    Started,
    /// Stopped consuming a shard without error
    Completed,
    /// Consumer stopped on a fatal error
    Failed,
    /// Consumer stopped because the lease was lost
    Interrupted,
}

impl MonitoringEvent {
    fn new(shard_id: impl Into<String>, event_type: MonitoringEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id: shard_id.into(),
            event_type,
        }
    }

    pub fn lease(shard_id: impl Into<String>, event_type: LeaseEventType, counter: u64) -> Self {
        Self::new(shard_id, MonitoringEventType::Lease { event_type, counter })
    }

    pub fn batch_processed(
        shard_id: impl Into<String>,
        record_count: usize,
        attempts: u32,
        duration: Duration,
        millis_behind_latest: Option<i64>,
    ) -> Self {
        Self::new(
            shard_id,
            MonitoringEventType::BatchProcessed {
                record_count,
                attempts,
                duration,
                millis_behind_latest,
            },
        )
    }

    pub fn batch_failed(shard_id: impl Into<String>, attempts: u32, error: String) -> Self {
        Self::new(shard_id, MonitoringEventType::BatchFailed { attempts, error })
    }

    pub fn checkpoint(
        shard_id: impl Into<String>,
        checkpoint: impl ToString,
        outcome: CheckpointOutcome,
    ) -> Self {
        Self::new(
            shard_id,
            MonitoringEventType::Checkpoint {
                checkpoint: checkpoint.to_string(),
                outcome,
            },
        )
    }

    pub fn shard_event(
        shard_id: impl Into<String>,
        event_type: ShardEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            shard_id,
            MonitoringEventType::ShardEvent {
                event_type,
                details,
            },
        )
    }
}

/// Sending half of the optional monitoring channel.
///
/// Events are dropped rather than awaited when the channel is full, so a
/// slow consumer of events never stalls lease renewal.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<MonitoringEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<mpsc::Sender<MonitoringEvent>>) -> Self {
        Self { tx }
    }

    /// Create a sink and its receiver according to the config
    pub(crate) fn channel(config: &MonitoringConfig) -> (Self, Option<mpsc::Receiver<MonitoringEvent>>) {
        if config.enabled {
            let (tx, rx) = mpsc::channel(config.channel_size.max(1));
            (Self::new(Some(tx)), Some(rx))
        } else {
            (Self::new(None), None)
        }
    }

    pub(crate) fn emit(&self, event: MonitoringEvent) {
        if let Some(tx) = &self.tx {
            match tx.try_send(event) {
                Ok(()) => trace!("Sent monitoring event"),
                Err(e) => trace!(error = %e, "Dropped monitoring event"),
            }
        }
    }
}
