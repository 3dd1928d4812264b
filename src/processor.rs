//! User-supplied record processing
//!
//! A [`RecordProcessor`] is cloned once per owned shard and driven through
//! `initialize`, any number of `process_records` calls, then `shutdown`.
//! [`PerRecord`] adapts a [`PerRecordProcessor`] that handles one record at
//! a time and decides itself when progress should be checkpointed.

use crate::error::ProcessingError;
use crate::types::{Checkpoint, Record, ShutdownReason, StartingPosition};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Trait for implementing record processing logic
///
/// Delivery is at-least-once: after a failover or a crash the records since
/// the last checkpoint are delivered again, so processing must be idempotent.
///
/// # Examples
///
/// ```rust
/// use kinesis_coordinator::{ProcessingError, Record, RecordProcessor};
///
/// #[derive(Clone)]
/// struct PrintProcessor;
///
/// #[async_trait::async_trait]
/// impl RecordProcessor for PrintProcessor {
///     async fn process_records(
///         &self,
///         shard_id: &str,
///         records: &[Record],
///     ) -> Result<(), ProcessingError> {
///         for record in records {
///             if record.data.is_empty() {
///                 return Err(ProcessingError::hard(anyhow::anyhow!("empty payload")));
///             }
///             println!("{} {}", shard_id, record.sequence_number);
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RecordProcessor: Send + Sync + Clone + 'static {
    /// Called once before the first batch of a shard
    async fn initialize(
        &self,
        _shard_id: &str,
        _position: &StartingPosition,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Process one batch, in order.
    ///
    /// * `Ok(())` marks every record of the batch as processed
    /// * `Err(ProcessingError::SoftFailure)` retries the whole batch with backoff
    /// * `Err(ProcessingError::HardFailure)` stops the shard immediately
    async fn process_records(
        &self,
        shard_id: &str,
        records: &[Record],
    ) -> Result<(), ProcessingError>;

    /// Asked after every delivered batch; `true` checkpoints the batch
    /// without waiting for the configured cadence.
    fn should_checkpoint(&self, _shard_id: &str) -> bool {
        false
    }

    /// Called before each checkpoint write of the shard
    async fn before_checkpoint(&self, _shard_id: &str, _checkpoint: &Checkpoint) {}

    /// Called once a checkpoint has been persisted
    async fn after_checkpoint(&self, _shard_id: &str, _checkpoint: &Checkpoint) {}

    /// Called once when the consumer stops, after the final checkpoint.
    ///
    /// With [`ShutdownReason::LeaseLost`] another worker already owns the
    /// shard and nothing processed since the last checkpoint will be
    /// recorded.
    async fn shutdown(&self, _shard_id: &str, _reason: ShutdownReason) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Record-at-a-time processing logic, run through [`PerRecord`]
#[async_trait]
pub trait PerRecordProcessor: Send + Sync + Clone + 'static {
    async fn initialize(
        &self,
        _shard_id: &str,
        _position: &StartingPosition,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn process_record(&self, shard_id: &str, record: &Record) -> Result<(), ProcessingError>;

    /// Asked after every record; `true` requests a checkpoint at the end of
    /// the current batch.
    fn should_checkpoint(&self, _shard_id: &str) -> bool {
        false
    }

    async fn before_checkpoint(&self, _shard_id: &str, _checkpoint: &Checkpoint) {}

    async fn after_checkpoint(&self, _shard_id: &str, _checkpoint: &Checkpoint) {}

    async fn shutdown(&self, _shard_id: &str, _reason: ShutdownReason) -> Result<(), ProcessingError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ShardProgress {
    /// Last record handed to the inner processor
    delivered: Option<Checkpoint>,
    checkpoint_requested: bool,
}

/// Runs a [`PerRecordProcessor`] as a [`RecordProcessor`].
///
/// A batch retried after a soft failure resumes at the failed record;
/// records the inner processor already accepted are not handed over again.
#[derive(Debug, Clone)]
pub struct PerRecord<T> {
    inner: T,
    shards: Arc<Mutex<HashMap<String, ShardProgress>>>,
}

impl<T: PerRecordProcessor> PerRecord<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            shards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn already_delivered(&self, shard_id: &str, record: &Record) -> bool {
        self.shards
            .lock()
            .get(shard_id)
            .and_then(|progress| progress.delivered.as_ref())
            .map_or(false, |delivered| record.is_covered_by(delivered))
    }
}

#[async_trait]
impl<T: PerRecordProcessor> RecordProcessor for PerRecord<T> {
    async fn initialize(
        &self,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<(), ProcessingError> {
        self.shards.lock().remove(shard_id);
        self.inner.initialize(shard_id, position).await
    }

    async fn process_records(
        &self,
        shard_id: &str,
        records: &[Record],
    ) -> Result<(), ProcessingError> {
        for record in records {
            if self.already_delivered(shard_id, record) {
                continue;
            }
            self.inner.process_record(shard_id, record).await?;

            let wants_checkpoint = self.inner.should_checkpoint(shard_id);
            let mut shards = self.shards.lock();
            let progress = shards.entry(shard_id.to_string()).or_default();
            progress.delivered = Some(Checkpoint::for_record(record));
            progress.checkpoint_requested |= wants_checkpoint;
        }
        Ok(())
    }

    fn should_checkpoint(&self, shard_id: &str) -> bool {
        self.shards
            .lock()
            .get_mut(shard_id)
            .map_or(false, |progress| std::mem::take(&mut progress.checkpoint_requested))
    }

    async fn before_checkpoint(&self, shard_id: &str, checkpoint: &Checkpoint) {
        self.inner.before_checkpoint(shard_id, checkpoint).await
    }

    async fn after_checkpoint(&self, shard_id: &str, checkpoint: &Checkpoint) {
        self.inner.after_checkpoint(shard_id, checkpoint).await
    }

    async fn shutdown(&self, shard_id: &str, reason: ShutdownReason) -> Result<(), ProcessingError> {
        self.shards.lock().remove(shard_id);
        self.inner.shutdown(shard_id, reason).await
    }
}
