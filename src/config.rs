//! Worker configuration
//!
//! Every field has a usable default; [`WorkerConfig::from_env`] overlays
//! `KCL_*` environment variables so a deployment can be configured without
//! code changes.

use crate::error::{CoordinatorError, Result};
use crate::monitoring::MonitoringConfig;
use crate::retry::RetryConfig;
use crate::types::StartingPosition;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

/// Where a shard without a checkpoint starts reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialPosition {
    /// Start from the oldest available record
    TrimHorizon,
    /// Start from records arriving after the consumer starts
    Latest,
    /// Start from the first record at or after a timestamp
    AtTimestamp(DateTime<Utc>),
}

impl InitialPosition {
    pub fn starting_position(&self) -> StartingPosition {
        match self {
            InitialPosition::TrimHorizon => StartingPosition::TrimHorizon,
            InitialPosition::Latest => StartingPosition::Latest,
            InitialPosition::AtTimestamp(ts) => StartingPosition::AtTimestamp(*ts),
        }
    }
}

/// Configuration for a [`Worker`](crate::Worker)
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Logical consumer group; workers sharing it share leases
    pub application_name: String,
    /// Name of the stream to consume
    pub stream_name: String,
    /// Identity written into lease rows, stable for the process lifetime
    pub worker_id: String,
    /// Where shards without a checkpoint start
    pub initial_position: InitialPosition,
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// Time between lease reconciliation cycles
    pub reconcile_interval: Duration,
    /// Maximum number of records requested per pull
    pub max_records: usize,
    /// Checkpoint after this many processed batches
    pub checkpoint_every_batches: u32,
    /// Checkpoint when this much time passed since the last one
    pub checkpoint_interval: Duration,
    /// Sleep after an empty pull on an open shard
    pub idle_time_between_reads: Duration,
    /// Retry policy applied to each batch handed to the record processor
    pub processing_retry: RetryConfig,
    /// Retry policy for listing shards during discovery
    pub discovery_retry: RetryConfig,
    /// Backoff for stream reads; retried until shutdown
    pub source_retry: RetryConfig,
    /// Backoff for checkpoint loads and lease releases while the store is
    /// unavailable
    pub store_retry: RetryConfig,
    /// Retry policy for checkpoint writes. Unbounded by default; with a
    /// bound, a periodic checkpoint that keeps failing is skipped and
    /// attempted again after the next batch.
    pub checkpoint_retry: RetryConfig,
    /// How long a cached topology may be served when listing shards fails
    pub max_topology_staleness: Duration,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let application_name = "kinesis-coordinator".to_string();
        Self {
            worker_id: generate_worker_id(&application_name),
            application_name,
            stream_name: String::new(),
            initial_position: InitialPosition::TrimHorizon,
            lease_duration: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(10),
            max_records: 100,
            checkpoint_every_batches: 1,
            checkpoint_interval: Duration::from_secs(60),
            idle_time_between_reads: Duration::from_secs(1),
            processing_retry: RetryConfig::default(),
            discovery_retry: RetryConfig::default(),
            source_retry: RetryConfig {
                max_retries: None,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(10),
                jitter_factor: 0.1,
            },
            store_retry: RetryConfig {
                max_retries: None,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(5),
                jitter_factor: 0.1,
            },
            checkpoint_retry: RetryConfig {
                max_retries: None,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(5),
                jitter_factor: 0.1,
            },
            max_topology_staleness: Duration::from_secs(300),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Default worker identity: `<application>-<pid>-<random hex>`
pub fn generate_worker_id(application_name: &str) -> String {
    format!(
        "{}-{}-{:08x}",
        application_name,
        std::process::id(),
        rand::random::<u32>()
    )
}

impl WorkerConfig {
    pub fn new(application_name: impl Into<String>, stream_name: impl Into<String>) -> Self {
        let application_name = application_name.into();
        Self {
            worker_id: generate_worker_id(&application_name),
            application_name,
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    /// Build a configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Unset variables keep their defaults. The result is validated.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("KCL_APPLICATION_NAME") {
            config.worker_id = generate_worker_id(&name);
            config.application_name = name;
        }
        if let Some(stream) = lookup("KCL_STREAM_NAME") {
            config.stream_name = stream;
        }
        if let Some(worker_id) = lookup("KCL_WORKER_ID") {
            config.worker_id = worker_id;
        }

        if let Some(position) = lookup("KCL_INITIAL_POSITION") {
            config.initial_position = match position.trim().to_ascii_uppercase().as_str() {
                "TRIM_HORIZON" => InitialPosition::TrimHorizon,
                "LATEST" => InitialPosition::Latest,
                "AT_TIMESTAMP" => {
                    let raw = lookup("KCL_INITIAL_POSITION_TIMESTAMP").ok_or_else(|| {
                        CoordinatorError::Config(
                            "KCL_INITIAL_POSITION_TIMESTAMP is required for AT_TIMESTAMP".into(),
                        )
                    })?;
                    let ts = DateTime::parse_from_rfc3339(raw.trim()).map_err(|e| {
                        CoordinatorError::Config(format!(
                            "invalid KCL_INITIAL_POSITION_TIMESTAMP {:?}: {}",
                            raw, e
                        ))
                    })?;
                    InitialPosition::AtTimestamp(ts.with_timezone(&Utc))
                }
                other => {
                    return Err(CoordinatorError::Config(format!(
                        "unknown KCL_INITIAL_POSITION {:?}",
                        other
                    )))
                }
            };
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, "KCL_LEASE_DURATION_MS")? {
            config.lease_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "KCL_RECONCILE_INTERVAL_MS")? {
            config.reconcile_interval = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var(&lookup, "KCL_MAX_RECORDS")? {
            config.max_records = max;
        }
        if let Some(batches) = parse_var(&lookup, "KCL_CHECKPOINT_EVERY_BATCHES")? {
            config.checkpoint_every_batches = batches;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "KCL_CHECKPOINT_INTERVAL_MS")? {
            config.checkpoint_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "KCL_IDLE_TIME_BETWEEN_READS_MS")? {
            config.idle_time_between_reads = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, "KCL_MAX_PROCESSING_ATTEMPTS")? {
            config.processing_retry.max_retries = Some(attempts);
        }
        if let Some(retries) = parse_var(&lookup, "KCL_CHECKPOINT_RETRIES")? {
            config.checkpoint_retry.max_retries = Some(retries);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "KCL_CHECKPOINT_ERROR_SLEEP_MS")? {
            // A fixed pause between attempts
            let sleep = Duration::from_millis(ms);
            config.checkpoint_retry.initial_backoff = sleep;
            config.checkpoint_retry.max_backoff = sleep;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CoordinatorError::Config(msg.to_string()));

        if self.application_name.trim().is_empty() {
            return fail("application name must not be empty");
        }
        if self.stream_name.trim().is_empty() {
            return fail("stream name must not be empty");
        }
        if self.worker_id.trim().is_empty() {
            return fail("worker id must not be empty");
        }
        if self.lease_duration.is_zero() {
            return fail("lease duration must be positive");
        }
        if self.reconcile_interval.is_zero() {
            return fail("reconcile interval must be positive");
        }
        if self.reconcile_interval >= self.lease_duration {
            // Leases would lapse between renewals
            return fail("reconcile interval must be shorter than the lease duration");
        }
        if self.max_records == 0 || self.max_records > 10_000 {
            return fail("max records must be between 1 and 10000");
        }
        if self.checkpoint_every_batches == 0 {
            return fail("checkpoint_every_batches must be at least 1");
        }
        if self.processing_retry.max_retries == Some(0) {
            return fail("processing retry policy must allow at least one attempt");
        }
        if self.checkpoint_retry.max_retries == Some(0) {
            return fail("checkpoint retry policy must allow at least one attempt");
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            CoordinatorError::Config(format!("invalid {} {:?}: {}", key, raw, e))
        }),
    }
}
