//! Per-shard consumption loop
//!
//! A consumer owns one leased shard: it pulls batches in order, hands them
//! to the record processor and checkpoints progress under the lease
//! counter. It stops when the shard ends, when asked to, when the lease is
//! lost, or when processing fails for good.

use crate::client::{GetRecordsOutput, StreamSource};
use crate::config::WorkerConfig;
use crate::coordinator::HeldLease;
use crate::error::{CoordinatorError, ProcessingError, Result, SourceError, StoreError};
use crate::monitoring::{
    CheckpointOutcome, EventSink, LeaseEventType, MonitoringEvent, ShardEventType,
};
use crate::processor::RecordProcessor;
use crate::retry::{Backoff, RetryConfig, RetryError};
use crate::store::LeaseStore;
use crate::types::{Checkpoint, Record, ShutdownReason, StartingPosition};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a shard consumer, observable through [`ShardConsumer::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initializing,
    Processing,
    ShutdownRequested,
    ShutDown,
}

/// How a consumer ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOutcome {
    pub shard_id: String,
    pub reason: ShutdownReason,
    /// Last checkpoint persisted for the shard by this consumer
    pub checkpoint: Option<Checkpoint>,
    pub records_processed: u64,
}

/// Resolves once the lease carries a shutdown reason matching `lost_only`
async fn shutdown_requested(mut rx: watch::Receiver<Option<ShutdownReason>>, lost_only: bool) {
    let matches = |reason: &Option<ShutdownReason>| match reason {
        Some(ShutdownReason::LeaseLost) => true,
        Some(_) => !lost_only,
        None => false,
    };
    if rx.wait_for(matches).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct ShardConsumer<P, C, S> {
    shard_id: String,
    worker_id: String,
    lease: Arc<HeldLease>,
    processor: P,
    source: Arc<C>,
    store: Arc<S>,
    config: Arc<WorkerConfig>,
    events: EventSink,
    state_tx: watch::Sender<ConsumerState>,

    initialized: bool,
    /// Records at or before this point were processed before a restart
    skip_through: Option<Checkpoint>,
    last_processed: Option<Checkpoint>,
    last_persisted: Option<Checkpoint>,
    batches_since_checkpoint: u32,
    last_checkpoint_at: Instant,
    records_processed: u64,
}

impl<P, C, S> ShardConsumer<P, C, S>
where
    P: RecordProcessor,
    C: StreamSource,
    S: LeaseStore,
{
    pub fn new(
        lease: Arc<HeldLease>,
        processor: P,
        source: Arc<C>,
        store: Arc<S>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConsumerState::Initializing);
        Self {
            shard_id: lease.shard_id().to_string(),
            worker_id: config.worker_id.clone(),
            lease,
            processor,
            source,
            store,
            config,
            events: EventSink::default(),
            state_tx,
            initialized: false,
            skip_through: None,
            last_processed: None,
            last_persisted: None,
            batches_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
            records_processed: 0,
        }
    }

    pub(crate) fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Observe the consumer's lifecycle
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        trace!(shard_id = %self.shard_id, state = ?state, "Consumer state change");
        self.state_tx.send_replace(state);
    }

    /// Consume the shard until it ends, shutdown is requested, the lease is
    /// lost, or processing fails.
    pub async fn run(mut self) -> Result<ConsumerOutcome> {
        info!(shard_id = %self.shard_id, worker_id = %self.worker_id, "Starting shard consumer");
        self.events.emit(MonitoringEvent::shard_event(
            self.shard_id.clone(),
            ShardEventType::Started,
            None,
        ));

        let result = self.consume().await;
        self.set_state(ConsumerState::ShutDown);

        match &result {
            Ok(outcome) => {
                info!(
                    shard_id = %self.shard_id,
                    reason = %outcome.reason,
                    records_processed = outcome.records_processed,
                    checkpoint = ?outcome.checkpoint,
                    "Shard consumer shut down"
                );
                let event_type = match outcome.reason {
                    ShutdownReason::LeaseLost => ShardEventType::Interrupted,
                    _ => ShardEventType::Completed,
                };
                self.events.emit(MonitoringEvent::shard_event(
                    self.shard_id.clone(),
                    event_type,
                    Some(outcome.reason.to_string()),
                ));
            }
            Err(e) => {
                error!(shard_id = %self.shard_id, error = %e, "Shard consumer failed");
                self.events.emit(MonitoringEvent::shard_event(
                    self.shard_id.clone(),
                    ShardEventType::Failed,
                    Some(e.to_string()),
                ));
            }
        }
        result
    }

    async fn consume(&mut self) -> Result<ConsumerOutcome> {
        self.set_state(ConsumerState::Initializing);

        let stored = match self.load_checkpoint().await {
            Ok(stored) => stored,
            Err(RetryError::Interrupted) => {
                let reason = self.pending_reason();
                return self.finish(reason).await;
            }
            Err(e) => return Err(e.into()),
        };
        self.last_persisted = stored.clone();

        let position = match &stored {
            Some(Checkpoint::ShardEnd) => {
                debug!(shard_id = %self.shard_id, "Shard already fully consumed");
                return self.finish(ShutdownReason::ShardEnd).await;
            }
            Some(checkpoint) => {
                if let Checkpoint::At { sub_sequence, .. } = checkpoint {
                    if *sub_sequence > 0 {
                        self.skip_through = Some(checkpoint.clone());
                    }
                }
                checkpoint
                    .resume_position()
                    .unwrap_or_else(|| self.config.initial_position.starting_position())
            }
            None => self.config.initial_position.starting_position(),
        };

        debug!(shard_id = %self.shard_id, position = ?position, "Initializing record processor");
        if let Err(e) = self.processor.initialize(&self.shard_id, &position).await {
            return Err(self.abort(self.processing_failure(e)).await);
        }
        self.initialized = true;

        self.set_state(ConsumerState::Processing);
        let reason = self.process_from(position).await?;
        self.finish(reason).await
    }

    /// The main pull loop; returns why it stopped
    async fn process_from(&mut self, mut position: StartingPosition) -> Result<ShutdownReason> {
        self.last_checkpoint_at = Instant::now();

        loop {
            if let Some(reason) = self.lease.shutdown_reason() {
                return Ok(reason);
            }

            let GetRecordsOutput {
                records,
                next_position,
                millis_behind_latest,
            } = match self.fetch(&position).await {
                Ok(Ok(output)) => output,
                Ok(Err(SourceError::ResourceNotFound(resource))) => {
                    // Deleted or trimmed out of retention: nothing left to read
                    warn!(
                        shard_id = %self.shard_id,
                        resource = %resource,
                        "Shard no longer exists, treating it as ended"
                    );
                    return Ok(ShutdownReason::ShardEnd);
                }
                Ok(Err(e)) => return Err(self.abort(e.into()).await),
                Err(RetryError::Interrupted) => continue,
                Err(e) => return Err(self.abort(e.into()).await),
            };

            let records = self.skip_processed(records);
            let idle = records.is_empty();
            let mut requested = false;
            if !idle {
                self.process_batch(&records, millis_behind_latest).await?;
                requested = self.processor.should_checkpoint(&self.shard_id);
            }

            match next_position {
                None => return Ok(ShutdownReason::ShardEnd),
                Some(next) => position = next,
            }

            if self.checkpoint_due(requested) {
                if let Some(checkpoint) = self.last_processed.clone() {
                    match self.write_checkpoint(checkpoint).await {
                        Ok(true) => {}
                        Ok(false) => return Ok(ShutdownReason::LeaseLost),
                        Err(e) => {
                            // Progress stays pending and is retried after the next batch
                            warn!(shard_id = %self.shard_id, error = %e, "Giving up on checkpoint");
                        }
                    }
                }
            }

            if idle {
                trace!(shard_id = %self.shard_id, "No new records, idling");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_time_between_reads) => {}
                    _ = shutdown_requested(self.lease.subscribe(), false) => {}
                }
            }
        }
    }

    fn pending_reason(&self) -> ShutdownReason {
        self.lease
            .shutdown_reason()
            .unwrap_or(ShutdownReason::Requested)
    }

    async fn load_checkpoint(&self) -> std::result::Result<Option<Checkpoint>, RetryError> {
        let store = self.store.clone();
        let shard_id = self.shard_id.clone();
        self.config
            .store_retry
            .handle()
            .retry(
                || {
                    let store = store.clone();
                    let shard_id = shard_id.clone();
                    async move { store.get_checkpoint(&shard_id).await }
                },
                shutdown_requested(self.lease.subscribe(), false),
            )
            .await
    }

    /// Read the next batch. Retryable errors are retried until shutdown;
    /// anything else is handed back as the inner error.
    async fn fetch(
        &self,
        position: &StartingPosition,
    ) -> std::result::Result<std::result::Result<GetRecordsOutput, SourceError>, RetryError> {
        let source = self.source.clone();
        let limit = self.config.max_records;
        self.config
            .source_retry
            .handle()
            .retry(
                || {
                    let source = source.clone();
                    async move {
                        match source.get_records(&self.shard_id, position, limit).await {
                            Ok(output) => Ok(Ok(output)),
                            Err(e) if e.is_retryable() => Err(e),
                            Err(e) => Ok(Err(e)),
                        }
                    }
                },
                shutdown_requested(self.lease.subscribe(), false),
            )
            .await
    }

    fn skip_processed(&mut self, records: Vec<Record>) -> Vec<Record> {
        let Some(checkpoint) = self.skip_through.take() else {
            return records;
        };
        if records.is_empty() {
            self.skip_through = Some(checkpoint);
            return records;
        }

        let before = records.len();
        let remaining: Vec<Record> = records
            .into_iter()
            .filter(|record| !record.is_covered_by(&checkpoint))
            .collect();
        debug!(
            shard_id = %self.shard_id,
            skipped = before - remaining.len(),
            "Skipped records already covered by checkpoint"
        );
        remaining
    }

    /// Deliver one batch, retrying soft failures with backoff.
    ///
    /// Shutdown requests do not interrupt the retries: a batch is either
    /// delivered completely or reported as failed.
    async fn process_batch(
        &mut self,
        records: &[Record],
        millis_behind_latest: Option<i64>,
    ) -> Result<()> {
        let retry = &self.config.processing_retry;
        let max_attempts = retry.max_retries.unwrap_or(u32::MAX).max(1);
        let backoff = retry.backoff();
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.processor.process_records(&self.shard_id, records).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.next_delay(attempt - 1);
                    warn!(
                        shard_id = %self.shard_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Soft failure, will retry batch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        shard_id = %self.shard_id,
                        attempt,
                        error = %e,
                        "Batch processing failed"
                    );
                    self.events.emit(MonitoringEvent::batch_failed(
                        self.shard_id.clone(),
                        attempt,
                        e.to_string(),
                    ));
                    let failure = self.processing_failure(e);
                    return Err(self.abort(failure).await);
                }
            }
        }

        if let Some(last) = records.last() {
            self.last_processed = Some(Checkpoint::for_record(last));
        }
        self.records_processed += records.len() as u64;
        self.batches_since_checkpoint += 1;

        trace!(
            shard_id = %self.shard_id,
            count = records.len(),
            attempts = attempt,
            "Batch processed"
        );
        self.events.emit(MonitoringEvent::batch_processed(
            self.shard_id.clone(),
            records.len(),
            attempt,
            started.elapsed(),
            millis_behind_latest,
        ));
        Ok(())
    }

    fn processing_failure(&self, error: ProcessingError) -> CoordinatorError {
        CoordinatorError::ProcessingFailed {
            shard_id: self.shard_id.clone(),
            message: error.to_string(),
        }
    }

    fn has_unpersisted_progress(&self) -> bool {
        self.last_processed.is_some() && self.last_processed != self.last_persisted
    }

    /// `requested` is the processor asking for a checkpoint right away
    fn checkpoint_due(&self, requested: bool) -> bool {
        self.has_unpersisted_progress()
            && (requested
                || self.batches_since_checkpoint >= self.config.checkpoint_every_batches
                || self.last_checkpoint_at.elapsed() >= self.config.checkpoint_interval)
    }

    /// Persist a checkpoint fenced by the lease counter.
    ///
    /// Returns `false` when the write was fenced because another worker
    /// took the lease. Store unavailability is retried per the checkpoint
    /// retry policy or until the lease is lost.
    async fn write_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<bool> {
        let lease = self.lease.clone();
        let store = self.store.clone();
        let shard_id = self.shard_id.clone();

        if self.initialized {
            self.processor
                .before_checkpoint(&self.shard_id, &checkpoint)
                .await;
        }

        let result = self
            .config
            .checkpoint_retry
            .handle()
            .retry(
                || {
                    let lease = lease.clone();
                    let store = store.clone();
                    let shard_id = shard_id.clone();
                    let checkpoint = checkpoint.clone();
                    async move {
                        let counter = lease.lock_counter().await;
                        match store.put_checkpoint(&shard_id, &checkpoint, *counter).await {
                            Ok(()) => Ok(Ok(())),
                            Err(StoreError::Conflict { .. }) => Ok(Err(*counter)),
                            Err(e) => Err(e),
                        }
                    }
                },
                shutdown_requested(self.lease.subscribe(), true),
            )
            .await;

        match result {
            Ok(Ok(())) => {
                debug!(shard_id = %self.shard_id, checkpoint = %checkpoint, "Checkpoint saved");
                self.events.emit(MonitoringEvent::checkpoint(
                    self.shard_id.clone(),
                    &checkpoint,
                    CheckpointOutcome::Success,
                ));
                self.batches_since_checkpoint = 0;
                self.last_checkpoint_at = Instant::now();
                if self.initialized {
                    self.processor
                        .after_checkpoint(&self.shard_id, &checkpoint)
                        .await;
                }
                self.last_persisted = Some(checkpoint);
                Ok(true)
            }
            Ok(Err(counter)) => {
                warn!(
                    shard_id = %self.shard_id,
                    checkpoint = %checkpoint,
                    counter,
                    "Checkpoint fenced by a newer lease, stopping consumer"
                );
                self.events.emit(MonitoringEvent::checkpoint(
                    self.shard_id.clone(),
                    &checkpoint,
                    CheckpointOutcome::Conflict,
                ));
                self.lease.request_shutdown(ShutdownReason::LeaseLost);
                Ok(false)
            }
            Err(RetryError::Interrupted) => {
                warn!(shard_id = %self.shard_id, "Lease lost while checkpoint was pending");
                Ok(false)
            }
            Err(e) => {
                self.events.emit(MonitoringEvent::checkpoint(
                    self.shard_id.clone(),
                    &checkpoint,
                    CheckpointOutcome::Failure(e.to_string()),
                ));
                Err(CoordinatorError::StoreUnavailable(e.to_string()))
            }
        }
    }

    /// Give the lease back so another worker can pick the shard up at once
    async fn release(&self) {
        let counter = {
            let counter = self.lease.lock_counter().await;
            self.lease.mark_released();
            *counter
        };

        let store = self.store.clone();
        let release_retry = RetryConfig {
            max_retries: Some(3),
            ..self.config.store_retry.clone()
        };
        let result = release_retry
            .handle()
            .retry_to_completion(|| {
                let store = store.clone();
                async move {
                    match store.release(&self.shard_id, &self.worker_id, counter).await {
                        Ok(()) => Ok(true),
                        Err(StoreError::Conflict { .. }) => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            })
            .await;

        match result {
            Ok(true) => {
                debug!(shard_id = %self.shard_id, counter, "Released lease");
                self.events.emit(MonitoringEvent::lease(
                    self.shard_id.clone(),
                    LeaseEventType::Released,
                    counter,
                ));
            }
            Ok(false) => {
                debug!(shard_id = %self.shard_id, "Lease already taken, nothing to release");
            }
            Err(e) => {
                warn!(
                    shard_id = %self.shard_id,
                    error = %e,
                    "Failed to release lease, it will expire instead"
                );
            }
        }
    }

    /// Stop after a fatal error, keeping whatever progress was made
    async fn abort(&mut self, failure: CoordinatorError) -> CoordinatorError {
        self.set_state(ConsumerState::ShutdownRequested);

        if self.lease.shutdown_reason() == Some(ShutdownReason::LeaseLost) {
            return failure;
        }

        if self.has_unpersisted_progress() {
            if let Some(checkpoint) = self.last_processed.clone() {
                match self.write_checkpoint(checkpoint).await {
                    Ok(true) => {}
                    Ok(false) => return failure,
                    Err(e) => {
                        warn!(shard_id = %self.shard_id, error = %e, "Could not save progress before stopping");
                    }
                }
            }
        }
        self.release().await;
        failure
    }

    async fn finish(&mut self, reason: ShutdownReason) -> Result<ConsumerOutcome> {
        // A lost lease trumps whatever stopped the loop
        let mut reason = match self.lease.shutdown_reason() {
            Some(ShutdownReason::LeaseLost) => ShutdownReason::LeaseLost,
            _ => reason,
        };
        self.set_state(ConsumerState::ShutdownRequested);
        debug!(shard_id = %self.shard_id, reason = %reason, "Shutting down shard consumer");

        let final_checkpoint = match reason {
            ShutdownReason::ShardEnd => Some(Checkpoint::ShardEnd),
            ShutdownReason::Requested => self.last_processed.clone(),
            ShutdownReason::LeaseLost => None,
        };

        let mut failure = None;
        if reason.may_checkpoint() {
            if let Some(checkpoint) = final_checkpoint {
                if self.last_persisted.as_ref() != Some(&checkpoint) {
                    match self.write_checkpoint(checkpoint).await {
                        Ok(true) => {}
                        Ok(false) => reason = ShutdownReason::LeaseLost,
                        Err(e) => failure = Some(e),
                    }
                }
            }
        }

        // The processor hears the final reason, after its last checkpoint
        if self.initialized {
            if let Err(e) = self.processor.shutdown(&self.shard_id, reason).await {
                warn!(shard_id = %self.shard_id, error = %e, "Record processor shutdown failed");
            }
        }

        if let Some(e) = failure {
            // Unsaved progress stays claimed until the lease expires
            return Err(e);
        }
        if reason.may_checkpoint() {
            self.release().await;
        }

        Ok(ConsumerOutcome {
            shard_id: self.shard_id.clone(),
            reason,
            checkpoint: self.last_persisted.clone(),
            records_processed: self.records_processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{CheckpointStore, InMemoryLeaseStore, LeaseTable};
    use crate::test::mocks::{MockRecordProcessor, MockStreamSource};
    use crate::test::TestUtils;
    use crate::types::{SequenceNumber, Shard};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const WORKER: &str = "worker-a";

    struct Harness {
        source: Arc<MockStreamSource>,
        store: Arc<InMemoryLeaseStore>,
        processor: MockRecordProcessor,
        config: WorkerConfig,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = TestUtils::create_test_config("test-stream");
            config.worker_id = WORKER.to_string();
            Self {
                source: Arc::new(MockStreamSource::new()),
                store: Arc::new(InMemoryLeaseStore::new(Duration::from_secs(30))),
                processor: MockRecordProcessor::new(),
                config,
            }
        }

        async fn consumer(
            &self,
            shard_id: &str,
        ) -> anyhow::Result<(
            ShardConsumer<MockRecordProcessor, MockStreamSource, InMemoryLeaseStore>,
            Arc<HeldLease>,
        )> {
            let counter = self.store.acquire(shard_id, WORKER, 0).await?;
            let lease = Arc::new(HeldLease::new(shard_id, counter));
            let consumer = ShardConsumer::new(
                lease.clone(),
                self.processor.clone(),
                self.source.clone(),
                self.store.clone(),
                Arc::new(self.config.clone()),
            );
            Ok((consumer, lease))
        }
    }

    #[tokio::test]
    async fn test_checkpoints_every_n_batches_and_on_shutdown() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.config.max_records = 100;
        harness.config.checkpoint_every_batches = 3;
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 1000))
            .await;

        let (consumer, lease) = harness.consumer("shard-1").await?;
        let state = consumer.state();
        let handle = tokio::spawn(consumer.run());

        harness
            .processor
            .wait_for_records(1000, Duration::from_secs(5))
            .await?;
        assert_eq!(*state.borrow(), ConsumerState::Processing);
        // Batches 3, 6 and 9 were checkpointed; batch 10 is still pending
        assert_eq!(
            harness.store.get_checkpoint("shard-1").await?,
            Some(Checkpoint::at("900", 0))
        );

        lease.request_shutdown(ShutdownReason::Requested);
        let outcome = handle.await??;

        assert_eq!(outcome.reason, ShutdownReason::Requested);
        assert_eq!(outcome.records_processed, 1000);
        assert_eq!(outcome.checkpoint, Some(Checkpoint::at("1000", 0)));
        assert_eq!(
            harness.store.get_checkpoint("shard-1").await?,
            Some(Checkpoint::at("1000", 0))
        );
        assert_eq!(*state.borrow(), ConsumerState::ShutDown);

        let stored = harness.store.get_lease("shard-1").await.expect("lease row");
        assert_eq!(stored.owner, None);
        assert_eq!(
            harness.processor.shutdown_reasons("shard-1").await,
            vec![ShutdownReason::Requested]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_retries_checkpoint_last_good_batch() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.config.max_records = 100;
        harness.config.checkpoint_every_batches = 3;
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 1000))
            .await;
        harness.processor.fail_batch("shard-1", 5, u32::MAX).await;

        let (consumer, _lease) = harness.consumer("shard-1").await?;
        let result = consumer.run().await;

        assert!(matches!(
            result,
            Err(CoordinatorError::ProcessingFailed { ref shard_id, .. }) if shard_id == "shard-1"
        ));
        assert_eq!(harness.processor.attempts("shard-1", 5).await, 3);
        assert_eq!(harness.processor.processed_count_for("shard-1").await, 400);
        assert_eq!(
            harness.store.get_checkpoint("shard-1").await?,
            Some(Checkpoint::at("400", 0))
        );
        let stored = harness.store.get_lease("shard-1").await.expect("lease row");
        assert_eq!(stored.owner, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_retried() -> anyhow::Result<()> {
        let harness = Harness::new();
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 10))
            .await;
        harness.processor.fail_batch_hard("shard-1", 1).await;

        let (consumer, _lease) = harness.consumer("shard-1").await?;
        let result = consumer.run().await;

        assert!(matches!(result, Err(CoordinatorError::ProcessingFailed { .. })));
        assert_eq!(harness.processor.attempts("shard-1", 1).await, 1);
        assert_eq!(harness.store.get_checkpoint("shard-1").await?, None);
        assert_eq!(harness.store.get_lease("shard-1").await.expect("lease row").owner, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_shard_checkpoints_shard_end() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.config.max_records = 100;
        harness
            .source
            .add_shard_with_records(
                Shard::open("shard-1").closed(),
                TestUtils::sequential_records(1, 250),
            )
            .await;

        let (consumer, _lease) = harness.consumer("shard-1").await?;
        let outcome = consumer.run().await?;

        assert_eq!(outcome.reason, ShutdownReason::ShardEnd);
        assert_eq!(outcome.records_processed, 250);
        assert_eq!(
            harness.store.get_checkpoint("shard-1").await?,
            Some(Checkpoint::ShardEnd)
        );
        assert_eq!(harness.store.get_lease("shard-1").await.expect("lease row").owner, None);
        assert_eq!(
            harness.processor.shutdown_reasons("shard-1").await,
            vec![ShutdownReason::ShardEnd]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_finished_shard_does_nothing() -> anyhow::Result<()> {
        let harness = Harness::new();
        harness
            .source
            .add_shard_with_records(
                Shard::open("shard-1").closed(),
                TestUtils::sequential_records(1, 10),
            )
            .await;
        let (consumer, lease) = harness.consumer("shard-1").await?;
        harness
            .store
            .put_checkpoint("shard-1", &Checkpoint::ShardEnd, lease.counter().await)
            .await?;

        let outcome = consumer.run().await?;
        assert_eq!(outcome.reason, ShutdownReason::ShardEnd);
        assert_eq!(outcome.records_processed, 0);
        assert!(harness.processor.initialized("shard-1").await.is_empty());
        assert_eq!(harness.source.get_records_calls("shard-1").await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_resumes_after_checkpoint() -> anyhow::Result<()> {
        let harness = Harness::new();
        harness
            .source
            .add_shard_with_records(
                Shard::open("shard-1").closed(),
                TestUtils::sequential_records(1, 1000),
            )
            .await;
        let (consumer, lease) = harness.consumer("shard-1").await?;
        harness
            .store
            .put_checkpoint("shard-1", &Checkpoint::at("500", 0), lease.counter().await)
            .await?;

        let outcome = consumer.run().await?;
        assert_eq!(outcome.records_processed, 500);
        assert_eq!(
            harness.processor.initialized("shard-1").await,
            vec![StartingPosition::AfterSequence(SequenceNumber::new("500"))]
        );
        let processed = harness.processor.processed_records("shard-1").await;
        assert_eq!(processed[0].sequence_number, SequenceNumber::new("501"));
        Ok(())
    }

    #[tokio::test]
    async fn test_resumes_inside_aggregated_record() -> anyhow::Result<()> {
        let harness = Harness::new();
        let mut records = TestUtils::aggregated_records("10", 3);
        records.extend(TestUtils::sequential_records(11, 2));
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1").closed(), records)
            .await;
        let (consumer, lease) = harness.consumer("shard-1").await?;
        harness
            .store
            .put_checkpoint("shard-1", &Checkpoint::at("10", 1), lease.counter().await)
            .await?;

        consumer.run().await?;
        let processed: Vec<(String, u64)> = harness
            .processor
            .processed_records("shard-1")
            .await
            .into_iter()
            .map(|r| (r.sequence_number.to_string(), r.sub_sequence_number))
            .collect();
        assert_eq!(
            processed,
            vec![
                ("10".to_string(), 2),
                ("11".to_string(), 0),
                ("12".to_string(), 0)
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_checkpoint_conflict_stops_without_release() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        let clock = ManualClock::new();
        harness.store = Arc::new(
            InMemoryLeaseStore::new(Duration::from_secs(30)).with_clock(Arc::new(clock.clone())),
        );
        harness.config.max_records = 10;
        harness.config.checkpoint_every_batches = 1;
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 200))
            .await;
        harness.processor.set_delay(Duration::from_millis(20)).await;

        let (consumer, lease) = harness.consumer("shard-1").await?;
        let handle = tokio::spawn(consumer.run());
        harness
            .processor
            .wait_for_records(20, Duration::from_secs(5))
            .await?;

        // Another worker takes over after the lease lapses
        clock.advance(Duration::from_secs(31));
        let stolen = harness
            .store
            .acquire("shard-1", "worker-b", lease.counter().await)
            .await?;

        let outcome = handle.await??;
        assert_eq!(outcome.reason, ShutdownReason::LeaseLost);
        assert!(outcome.records_processed < 200);

        let stored = harness.store.get_lease("shard-1").await.expect("lease row");
        assert_eq!(stored.owner.as_deref(), Some("worker-b"));
        assert_eq!(stored.counter, stolen);
        assert_eq!(
            harness.processor.shutdown_reasons("shard-1").await,
            vec![ShutdownReason::LeaseLost]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_lease_skips_final_checkpoint() -> anyhow::Result<()> {
        let harness = Harness::new();
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 50))
            .await;

        let (consumer, lease) = harness.consumer("shard-1").await?;
        let handle = tokio::spawn(consumer.run());
        harness
            .processor
            .wait_for_records(50, Duration::from_secs(5))
            .await?;

        lease.request_shutdown(ShutdownReason::LeaseLost);
        let outcome = handle.await??;

        assert_eq!(outcome.reason, ShutdownReason::LeaseLost);
        assert_eq!(harness.store.get_checkpoint("shard-1").await?, None);
        assert_eq!(
            harness.store.get_lease("shard-1").await.expect("lease row").owner.as_deref(),
            Some(WORKER)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_source_errors_are_retried() -> anyhow::Result<()> {
        let harness = Harness::new();
        harness
            .source
            .add_shard_with_records(
                Shard::open("shard-1").closed(),
                TestUtils::sequential_records(1, 30),
            )
            .await;
        harness.source.fail_get_records("shard-1", 3).await;

        let (consumer, _lease) = harness.consumer("shard-1").await?;
        let outcome = consumer.run().await?;

        assert_eq!(outcome.reason, ShutdownReason::ShardEnd);
        assert_eq!(outcome.records_processed, 30);
        Ok(())
    }

    #[tokio::test]
    async fn test_deleted_shard_is_treated_as_ended() -> anyhow::Result<()> {
        let harness = Harness::new();
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 10))
            .await;
        let (consumer, _lease) = harness.consumer("shard-1").await?;
        harness.source.remove_shard("shard-1").await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), consumer.run()).await??;

        assert_eq!(outcome.reason, ShutdownReason::ShardEnd);
        assert_eq!(outcome.records_processed, 0);
        assert_eq!(harness.source.get_records_calls("shard-1").await, 0);
        assert_eq!(
            harness.store.get_checkpoint("shard-1").await?,
            Some(Checkpoint::ShardEnd)
        );
        assert_eq!(harness.store.get_lease("shard-1").await.expect("lease row").owner, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_access_denied_is_fatal() -> anyhow::Result<()> {
        let harness = Harness::new();
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 10))
            .await;
        harness.source.deny_get_records("shard-1").await;

        let (consumer, _lease) = harness.consumer("shard-1").await?;
        let result = tokio::time::timeout(Duration::from_secs(2), consumer.run()).await?;

        assert!(matches!(result, Err(CoordinatorError::Source(_))));
        assert_eq!(harness.source.get_records_calls("shard-1").await, 1);
        assert_eq!(harness.store.get_checkpoint("shard-1").await?, None);
        assert_eq!(harness.store.get_lease("shard-1").await.expect("lease row").owner, None);
        Ok(())
    }

    /// Asks for a checkpoint every 25 records and logs the checkpoint hooks
    #[derive(Clone, Default)]
    struct HookedProcessor {
        seen: Arc<parking_lot::Mutex<usize>>,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl crate::processor::PerRecordProcessor for HookedProcessor {
        async fn process_record(
            &self,
            _shard_id: &str,
            _record: &Record,
        ) -> std::result::Result<(), ProcessingError> {
            *self.seen.lock() += 1;
            Ok(())
        }

        fn should_checkpoint(&self, _shard_id: &str) -> bool {
            *self.seen.lock() % 25 == 0
        }

        async fn before_checkpoint(&self, _shard_id: &str, checkpoint: &Checkpoint) {
            self.log.lock().push(format!("before {}", checkpoint));
        }

        async fn after_checkpoint(&self, _shard_id: &str, checkpoint: &Checkpoint) {
            self.log.lock().push(format!("after {}", checkpoint));
        }

        async fn shutdown(
            &self,
            _shard_id: &str,
            reason: ShutdownReason,
        ) -> std::result::Result<(), ProcessingError> {
            self.log.lock().push(format!("shutdown {}", reason));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_processor_requested_checkpoints_run_hooks() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.config.max_records = 10;
        harness.config.checkpoint_every_batches = 100;
        harness
            .source
            .add_shard_with_records(
                Shard::open("shard-1").closed(),
                TestUtils::sequential_records(1, 50),
            )
            .await;

        let hooked = HookedProcessor::default();
        let counter = harness.store.acquire("shard-1", WORKER, 0).await?;
        let consumer = ShardConsumer::new(
            Arc::new(HeldLease::new("shard-1", counter)),
            crate::processor::PerRecord::new(hooked.clone()),
            harness.source.clone(),
            harness.store.clone(),
            Arc::new(harness.config.clone()),
        );

        let outcome = consumer.run().await?;
        assert_eq!(outcome.reason, ShutdownReason::ShardEnd);
        assert_eq!(*hooked.seen.lock(), 50);
        // Record 25 asked during the third batch; the shard ends before
        // record 50's request is served
        assert_eq!(
            *hooked.log.lock(),
            vec![
                "before 30/0",
                "after 30/0",
                "before SHARD_END",
                "after SHARD_END",
                "shutdown SHARD_END"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_bounded_checkpoint_retries_keep_processing() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.config.max_records = 10;
        harness.config.checkpoint_every_batches = 1;
        harness.config.checkpoint_retry.max_retries = Some(2);
        harness.source.add_shard(Shard::open("shard-1")).await;

        let (consumer, lease) = harness.consumer("shard-1").await?;
        let handle = tokio::spawn(consumer.run());
        while harness.source.get_records_calls("shard-1").await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        harness.store.set_unavailable(true);
        harness
            .source
            .push_records("shard-1", TestUtils::sequential_records(1, 30))
            .await;
        harness
            .processor
            .wait_for_records(30, Duration::from_secs(5))
            .await?;
        assert!(!handle.is_finished());

        harness.store.set_unavailable(false);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while harness.store.get_checkpoint("shard-1").await? != Some(Checkpoint::at("30", 0)) {
            assert!(tokio::time::Instant::now() < deadline, "checkpoint never landed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        lease.request_shutdown(ShutdownReason::Requested);
        let outcome = handle.await??;
        assert_eq!(outcome.reason, ShutdownReason::Requested);
        assert_eq!(outcome.checkpoint, Some(Checkpoint::at("30", 0)));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_outage_delays_checkpoint() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.config.max_records = 10;
        harness
            .source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 10))
            .await;

        let (consumer, lease) = harness.consumer("shard-1").await?;
        let handle = tokio::spawn(consumer.run());
        harness
            .processor
            .wait_for_records(10, Duration::from_secs(5))
            .await?;

        harness.store.set_unavailable(true);
        lease.request_shutdown(ShutdownReason::Requested);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        harness.store.set_unavailable(false);
        let outcome = handle.await??;
        assert_eq!(outcome.checkpoint, Some(Checkpoint::at("10", 0)));
        Ok(())
    }
}
