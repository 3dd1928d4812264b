//! In-process worker driving lease reconciliation and shard consumers
//!
//! A [`Worker`] runs one coordination loop plus one tokio task per owned
//! shard. Workers never talk to each other; they meet only in the shared
//! lease table.

use crate::client::StreamSource;
use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::consumer::{ConsumerOutcome, ConsumerState, ShardConsumer};
use crate::coordinator::{HeldLease, LeaseCoordinator};
use crate::error::{CoordinatorError, Result};
use crate::monitoring::{EventSink, MonitoringEvent};
use crate::processor::RecordProcessor;
use crate::retry::shutdown_signalled;
use crate::store::LeaseStore;
use crate::tracker::ShardTracker;
use crate::types::ShutdownReason;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// A shard consumer that stopped with an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard_id: String,
    pub error: String,
}

struct ConsumerHandle {
    lease: Arc<HeldLease>,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<Result<ConsumerOutcome>>,
}

/// Consumes a sharded stream in cooperation with other workers
///
/// # Examples
///
/// ```no_run
/// use kinesis_coordinator::{
///     InMemoryLeaseStore, KinesisStreamSource, ProcessingError, Record, RecordProcessor, Worker,
///     WorkerConfig,
/// };
/// use std::sync::Arc;
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
///         println!("{}: {} records", shard_id, records.len());
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = WorkerConfig::from_env()?;
///     let source = KinesisStreamSource::from_env(config.stream_name.clone()).await;
///     let store = InMemoryLeaseStore::new(config.lease_duration);
///
///     let (worker, _events) =
///         Worker::new(config, PrintProcessor, Arc::new(source), Arc::new(store))?;
///
///     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
///     tokio::spawn(async move {
///         let _ = tokio::signal::ctrl_c().await;
///         let _ = shutdown_tx.send(true);
///     });
///
///     worker.run(shutdown_rx).await?;
///     Ok(())
/// }
/// ```
pub struct Worker<P, C, S> {
    config: Arc<WorkerConfig>,
    processor: P,
    source: Arc<C>,
    store: Arc<S>,
    coordinator: LeaseCoordinator<C, S>,
    consumers: Mutex<BTreeMap<String, ConsumerHandle>>,
    failures: Mutex<Vec<ShardFailure>>,
    events: EventSink,
}

impl<P, C, S> Worker<P, C, S>
where
    P: RecordProcessor,
    C: StreamSource + 'static,
    S: LeaseStore + 'static,
{
    /// Creates a new worker
    ///
    /// Returns the worker and, when monitoring is enabled, the receiving end
    /// of its event channel.
    pub fn new(
        config: WorkerConfig,
        processor: P,
        source: Arc<C>,
        store: Arc<S>,
    ) -> Result<(Self, Option<mpsc::Receiver<MonitoringEvent>>)> {
        Self::with_clock(config, processor, source, store, Arc::new(SystemClock))
    }

    /// Like [`Worker::new`], judging lease expiry against `clock`
    pub fn with_clock(
        config: WorkerConfig,
        processor: P,
        source: Arc<C>,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, Option<mpsc::Receiver<MonitoringEvent>>)> {
        config.validate()?;
        if store.lease_duration() != config.lease_duration {
            // Renewal cadence is planned against the configured duration
            return Err(CoordinatorError::Config(format!(
                "store grants {:?} leases but the worker is configured for {:?}",
                store.lease_duration(),
                config.lease_duration
            )));
        }
        let config = Arc::new(config);
        let (events, monitoring_rx) = EventSink::channel(&config.monitoring);

        let tracker = ShardTracker::new(
            source.clone(),
            store.clone(),
            config.discovery_retry.clone(),
            config.max_topology_staleness,
        );
        let coordinator = LeaseCoordinator::new(
            config.worker_id.clone(),
            store.clone(),
            tracker,
            clock,
            events.clone(),
        );

        let worker = Self {
            config,
            processor,
            source,
            store,
            coordinator,
            consumers: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
            events,
        };
        Ok((worker, monitoring_rx))
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Shards with a live consumer, in ascending order
    pub fn owned_shards(&self) -> Vec<String> {
        self.consumers.lock().keys().cloned().collect()
    }

    pub fn consumer_state(&self, shard_id: &str) -> Option<ConsumerState> {
        self.consumers
            .lock()
            .get(shard_id)
            .map(|handle| *handle.state.borrow())
    }

    /// Fatal per-shard errors recorded since the worker started
    pub fn failures(&self) -> Vec<ShardFailure> {
        self.failures.lock().clone()
    }

    /// Run reconciliation cycles until `shutdown` carries `true`, then shut
    /// every consumer down.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            stream = %self.config.stream_name,
            "Starting worker"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Reconciliation cycle failed");
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        info!(worker_id = %self.config.worker_id, "Worker shutdown complete");
        Ok(())
    }

    /// One cycle: reap stopped consumers, reconcile leases, then start a
    /// consumer for every held lease that lacks one.
    ///
    /// Consumers are started even when reconciliation returns an error, as
    /// leases taken before the failure are already held.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<()> {
        self.reap_finished().await;

        let result = self.coordinator.reconcile().await;
        if let Ok(outcome) = &result {
            for shard_id in &outcome.lost {
                debug!(shard_id = %shard_id, "Consumer told its lease was lost");
            }
        }

        self.start_consumers();
        result.map(|_| ())
    }

    /// Request shutdown of every consumer and wait for all of them to stop
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ConsumerHandle)> = {
            let mut consumers = self.consumers.lock();
            for handle in consumers.values() {
                handle.lease.request_shutdown(ShutdownReason::Requested);
            }
            std::mem::take(&mut *consumers).into_iter().collect()
        };

        info!(consumers = handles.len(), "Shutting down shard consumers");
        for (shard_id, handle) in handles {
            let ConsumerHandle { lease, task, .. } = handle;
            let result = task.await;
            self.settle(&shard_id, &lease, result);
        }
    }

    fn start_consumers(&self) {
        let mut consumers = self.consumers.lock();
        for shard_id in self.coordinator.held_shards() {
            // A consumer from an older lease on this shard is still winding down
            if consumers.contains_key(&shard_id) {
                continue;
            }
            let Some(lease) = self.coordinator.held_lease(&shard_id) else {
                continue;
            };

            let consumer = ShardConsumer::new(
                lease.clone(),
                self.processor.clone(),
                self.source.clone(),
                self.store.clone(),
                self.config.clone(),
            )
            .with_events(self.events.clone());
            let state = consumer.state();
            let task = tokio::spawn(consumer.run());

            debug!(shard_id = %shard_id, "Started shard consumer");
            consumers.insert(shard_id, ConsumerHandle { lease, state, task });
        }
    }

    async fn reap_finished(&self) {
        let finished: Vec<(String, ConsumerHandle)> = {
            let mut consumers = self.consumers.lock();
            let done: Vec<String> = consumers
                .iter()
                .filter(|(_, handle)| handle.task.is_finished())
                .map(|(shard_id, _)| shard_id.clone())
                .collect();
            done.into_iter()
                .filter_map(|shard_id| consumers.remove_entry(&shard_id))
                .collect()
        };

        for (shard_id, handle) in finished {
            let ConsumerHandle { lease, task, .. } = handle;
            let result = task.await;
            self.settle(&shard_id, &lease, result);
        }
    }

    fn settle(
        &self,
        shard_id: &str,
        lease: &Arc<HeldLease>,
        result: std::result::Result<Result<ConsumerOutcome>, JoinError>,
    ) {
        let still_current = self
            .coordinator
            .held_lease(shard_id)
            .map_or(false, |held| Arc::ptr_eq(&held, lease));
        if still_current {
            self.coordinator.forget(shard_id);
        }

        let error = match result {
            Ok(Ok(outcome)) => {
                info!(
                    shard_id = %shard_id,
                    reason = %outcome.reason,
                    records = outcome.records_processed,
                    "Shard consumer stopped"
                );
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("consumer task aborted: {}", e),
        };

        error!(shard_id = %shard_id, error = %error, "Shard consumer failed");
        self.failures.lock().push(ShardFailure {
            shard_id: shard_id.to_string(),
            error,
        });
    }
}
