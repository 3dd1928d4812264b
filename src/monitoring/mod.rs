//! Monitoring system for tracking lease ownership and shard progress
//!
//! Workers optionally stream [`MonitoringEvent`]s over a bounded channel;
//! [`MetricsAggregator`] folds them into per-shard counters.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, ShardMetrics};
pub(crate) use types::EventSink;
pub use types::{
    CheckpointOutcome, LeaseEventType, MonitoringConfig, MonitoringEvent, MonitoringEventType,
    ShardEventType,
};
