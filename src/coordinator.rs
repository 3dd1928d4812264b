//! Lease reconciliation
//!
//! Workers never talk to each other. Each one periodically lists the lease
//! table, takes expired leases up to its fair share and renews what it
//! holds; conditional writes on the lease counter resolve every race.

use crate::clock::Clock;
use crate::client::StreamSource;
use crate::error::{Result, StoreError};
use crate::monitoring::{EventSink, LeaseEventType, MonitoringEvent};
use crate::store::LeaseStore;
use crate::tracker::ShardTracker;
use crate::types::{Lease, ShutdownReason};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, MutexGuard};
use tracing::{debug, info, instrument, trace, warn};

/// A lease this worker currently holds.
///
/// The counter sits behind an async mutex: renewals and checkpoint writes
/// for the shard take it for the duration of their store call, so a renewal
/// never fences a checkpoint issued by the same process.
#[derive(Debug)]
pub struct HeldLease {
    shard_id: String,
    counter: tokio::sync::Mutex<u64>,
    released: AtomicBool,
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
}

impl HeldLease {
    pub fn new(shard_id: impl Into<String>, counter: u64) -> Self {
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            shard_id: shard_id.into(),
            counter: tokio::sync::Mutex::new(counter),
            released: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Lock the counter for a conditional write
    pub async fn lock_counter(&self) -> MutexGuard<'_, u64> {
        self.counter.lock().await
    }

    pub async fn counter(&self) -> u64 {
        *self.counter.lock().await
    }

    /// Stop renewing; must be called with the counter locked
    pub fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Ask the shard's consumer to stop.
    ///
    /// A lost lease overrides an earlier graceful request: once another
    /// worker owns the shard nothing may be checkpointed.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        self.shutdown_tx.send_if_modified(|current| match current {
            None => {
                *current = Some(reason);
                true
            }
            Some(existing) if *existing != reason && reason == ShutdownReason::LeaseLost => {
                *current = Some(reason);
                true
            }
            Some(_) => false,
        });
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.shutdown_tx.subscribe()
    }
}

/// What one reconciliation cycle changed
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Leases taken this cycle; each needs a consumer
    pub acquired: Vec<Arc<HeldLease>>,
    /// Shards whose lease was taken by another worker
    pub lost: Vec<String>,
}

/// Number of leases one worker should hold
pub fn target_lease_count(unfinished_leases: usize, active_workers: usize) -> usize {
    let workers = active_workers.max(1);
    unfinished_leases.div_ceil(workers).max(1)
}

pub struct LeaseCoordinator<C, S> {
    worker_id: String,
    store: Arc<S>,
    tracker: ShardTracker<C, S>,
    clock: Arc<dyn Clock>,
    held: Mutex<BTreeMap<String, Arc<HeldLease>>>,
    events: EventSink,
}

impl<C, S> LeaseCoordinator<C, S>
where
    C: StreamSource,
    S: LeaseStore,
{
    pub(crate) fn new(
        worker_id: impl Into<String>,
        store: Arc<S>,
        tracker: ShardTracker<C, S>,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            tracker,
            clock,
            held: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn tracker(&self) -> &ShardTracker<C, S> {
        &self.tracker
    }

    /// Shards this worker currently holds, in ascending order
    pub fn held_shards(&self) -> Vec<String> {
        self.held.lock().keys().cloned().collect()
    }

    pub fn held_lease(&self, shard_id: &str) -> Option<Arc<HeldLease>> {
        self.held.lock().get(shard_id).cloned()
    }

    /// Drop a lease whose consumer has stopped
    pub fn forget(&self, shard_id: &str) {
        if self.held.lock().remove(shard_id).is_some() {
            trace!(shard_id = %shard_id, "Forgot lease");
        }
    }

    /// Run one reconciliation cycle.
    ///
    /// Held leases are renewed first so a failing discovery never lets them
    /// lapse; an error from the acquisition phase is returned after renewal
    /// has already happened.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let lost = self.renew_leases().await;
        let acquired = self.take_leases().await?;

        if !acquired.is_empty() || !lost.is_empty() {
            info!(
                acquired = acquired.len(),
                lost = lost.len(),
                held = self.held.lock().len(),
                "Lease reconciliation changed ownership"
            );
        }

        Ok(ReconcileOutcome { acquired, lost })
    }

    async fn renew_leases(&self) -> Vec<String> {
        let held: Vec<Arc<HeldLease>> = self.held.lock().values().cloned().collect();
        let results = join_all(held.iter().map(|lease| self.renew_lease(lease))).await;

        let mut lost = Vec::new();
        for (lease, still_held) in held.iter().zip(results) {
            if !still_held {
                lease.request_shutdown(ShutdownReason::LeaseLost);
                self.forget(lease.shard_id());
                lost.push(lease.shard_id().to_string());
            }
        }
        lost
    }

    /// Returns false only when the lease is confirmed lost
    async fn renew_lease(&self, lease: &HeldLease) -> bool {
        let mut counter = lease.lock_counter().await;
        if lease.is_released() {
            return true;
        }

        match self
            .store
            .renew(lease.shard_id(), &self.worker_id, *counter)
            .await
        {
            Ok(new_counter) => {
                trace!(shard_id = %lease.shard_id(), counter = new_counter, "Renewed lease");
                *counter = new_counter;
                self.events.emit(MonitoringEvent::lease(
                    lease.shard_id(),
                    LeaseEventType::Renewed,
                    new_counter,
                ));
                true
            }
            Err(StoreError::Conflict { .. }) => {
                warn!(
                    shard_id = %lease.shard_id(),
                    counter = *counter,
                    "Lease lost to another worker"
                );
                self.events.emit(MonitoringEvent::lease(
                    lease.shard_id(),
                    LeaseEventType::Lost,
                    *counter,
                ));
                false
            }
            Err(e) => {
                // Unconfirmed; keep consuming and try again next cycle
                warn!(shard_id = %lease.shard_id(), error = %e, "Lease renewal failed");
                true
            }
        }
    }

    async fn take_leases(&self) -> Result<Vec<Arc<HeldLease>>> {
        let topology = self.tracker.discover_shards().await?;
        let mut leases: BTreeMap<String, Lease> = self
            .store
            .list_leases()
            .await?
            .into_iter()
            .map(|lease| (lease.shard_id.clone(), lease))
            .collect();

        for shard_id in topology.shard_ids() {
            if leases.contains_key(shard_id) {
                continue;
            }
            if self.store.create_lease_if_absent(shard_id).await? {
                debug!(shard_id = %shard_id, "Created lease for new shard");
            }
            leases.insert(shard_id.to_string(), Lease::unowned(shard_id));
        }

        let now = self.clock.now();
        let mut unfinished = Vec::new();
        for lease in leases.into_values() {
            // Trimmed shards can no longer be read
            if !topology.contains(&lease.shard_id) {
                continue;
            }
            if self.tracker.is_finished(&lease.shard_id).await? {
                continue;
            }
            unfinished.push(lease);
        }

        let mut active_workers: HashSet<&str> = unfinished
            .iter()
            .filter(|lease| !lease.is_expired(now))
            .filter_map(|lease| lease.owner.as_deref())
            .collect();
        active_workers.insert(self.worker_id.as_str());

        let target = target_lease_count(unfinished.len(), active_workers.len());
        let mut held_count = self.held.lock().len();
        debug!(
            unfinished = unfinished.len(),
            active_workers = active_workers.len(),
            target,
            held = held_count,
            "Computed lease target"
        );

        let mut acquired = Vec::new();
        for lease in &unfinished {
            if held_count >= target {
                break;
            }
            if self.held.lock().contains_key(&lease.shard_id) {
                continue;
            }
            // A lease recorded under our id but unknown here survived a restart
            let available = lease.is_expired(now) || lease.is_owned_by(&self.worker_id);
            if !available {
                continue;
            }
            if !self.tracker.is_ready(&topology, &lease.shard_id).await? {
                continue;
            }

            match self
                .store
                .acquire(&lease.shard_id, &self.worker_id, lease.counter)
                .await
            {
                Ok(counter) => {
                    info!(shard_id = %lease.shard_id, counter, "Acquired lease");
                    let held = Arc::new(HeldLease::new(lease.shard_id.clone(), counter));
                    self.held
                        .lock()
                        .insert(lease.shard_id.clone(), held.clone());
                    self.events.emit(MonitoringEvent::lease(
                        lease.shard_id.clone(),
                        LeaseEventType::Acquired,
                        counter,
                    ));
                    acquired.push(held);
                    held_count += 1;
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(shard_id = %lease.shard_id, "Lost acquisition race");
                }
                Err(e) => {
                    warn!(shard_id = %lease.shard_id, error = %e, "Lease acquisition failed");
                    break;
                }
            }
        }

        Ok(acquired)
    }
}
