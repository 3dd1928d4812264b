use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{CheckpointStore, LeaseTable, StoreResult};
use crate::types::{Checkpoint, Lease};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone)]
struct LeaseRow {
    lease: Lease,
    checkpoint: Option<Checkpoint>,
}

/// In-memory lease table and checkpoint store.
///
/// Clones share the same rows, so several workers in one process (or one
/// test) can coordinate through it exactly as they would through a remote
/// table.
#[derive(Debug, Clone)]
pub struct InMemoryLeaseStore {
    rows: Arc<RwLock<BTreeMap<String, LeaseRow>>>,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryLeaseStore {
    pub fn new(lease_duration: Duration) -> Self {
        debug!(lease_duration_ms = ?lease_duration.as_millis(), "Initializing in-memory lease store");
        Self {
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            lease_duration,
            clock: Arc::new(SystemClock),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make every operation fail as if the backing table were unreachable
    #[cfg(any(test, feature = "test-utils"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fetch a single lease row
    pub async fn get_lease(&self, shard_id: &str) -> Option<Lease> {
        self.rows.read().await.get(shard_id).map(|row| row.lease.clone())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable(anyhow::anyhow!(
                "in-memory lease store marked unavailable"
            )))
        } else {
            Ok(())
        }
    }

    fn expiry(&self) -> chrono::DateTime<chrono::Utc> {
        let duration = chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        self.clock.now() + duration
    }
}

#[async_trait]
impl CheckpointStore for InMemoryLeaseStore {
    #[instrument(skip(self))]
    async fn get_checkpoint(&self, shard_id: &str) -> StoreResult<Option<Checkpoint>> {
        self.check_available()?;
        let rows = self.rows.read().await;
        let checkpoint = rows.get(shard_id).and_then(|row| row.checkpoint.clone());

        trace!(shard_id = %shard_id, checkpoint = ?checkpoint, "Retrieved checkpoint from memory");
        Ok(checkpoint)
    }

    #[instrument(skip(self))]
    async fn put_checkpoint(
        &self,
        shard_id: &str,
        checkpoint: &Checkpoint,
        expected_lease_counter: u64,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut rows = self.rows.write().await;
        let row = rows.entry(shard_id.to_string()).or_insert_with(|| LeaseRow {
            lease: Lease::unowned(shard_id),
            checkpoint: None,
        });

        if row.lease.counter > expected_lease_counter {
            debug!(
                shard_id = %shard_id,
                stored_counter = row.lease.counter,
                expected_counter = expected_lease_counter,
                "Rejected fenced checkpoint write"
            );
            return Err(StoreError::conflict(shard_id));
        }

        row.checkpoint = Some(checkpoint.clone());
        trace!(shard_id = %shard_id, checkpoint = %checkpoint, "Checkpoint saved to memory");
        Ok(())
    }
}

#[async_trait]
impl LeaseTable for InMemoryLeaseStore {
    fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    async fn list_leases(&self) -> StoreResult<Vec<Lease>> {
        self.check_available()?;
        Ok(self
            .rows
            .read()
            .await
            .values()
            .map(|row| row.lease.clone())
            .collect())
    }

    #[instrument(skip(self))]
    async fn create_lease_if_absent(&self, shard_id: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut rows = self.rows.write().await;
        if rows.contains_key(shard_id) {
            return Ok(false);
        }
        rows.insert(
            shard_id.to_string(),
            LeaseRow {
                lease: Lease::unowned(shard_id),
                checkpoint: None,
            },
        );
        debug!(shard_id = %shard_id, "Created lease");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn acquire(
        &self,
        shard_id: &str,
        worker_id: &str,
        expected_counter: u64,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let now = self.clock.now();
        let expires_at = self.expiry();
        let mut rows = self.rows.write().await;

        // A missing row behaves like a fresh lease at counter 0
        if expected_counter != 0 && !rows.contains_key(shard_id) {
            return Err(StoreError::conflict(shard_id));
        }
        let row = rows.entry(shard_id.to_string()).or_insert_with(|| LeaseRow {
            lease: Lease::unowned(shard_id),
            checkpoint: None,
        });

        let lease = &mut row.lease;
        let takeable = lease.is_expired(now) || lease.is_owned_by(worker_id);
        if lease.counter != expected_counter || !takeable {
            return Err(StoreError::conflict(shard_id));
        }

        lease.counter += 1;
        lease.owner = Some(worker_id.to_string());
        lease.expires_at = Some(expires_at);
        Ok(lease.counter)
    }

    #[instrument(skip(self))]
    async fn renew(&self, shard_id: &str, worker_id: &str, counter: u64) -> StoreResult<u64> {
        self.check_available()?;
        let expires_at = self.expiry();
        let mut rows = self.rows.write().await;

        match rows.get_mut(shard_id) {
            Some(row) if row.lease.counter == counter && row.lease.is_owned_by(worker_id) => {
                row.lease.counter += 1;
                row.lease.expires_at = Some(expires_at);
                Ok(row.lease.counter)
            }
            _ => Err(StoreError::conflict(shard_id)),
        }
    }

    #[instrument(skip(self))]
    async fn release(&self, shard_id: &str, worker_id: &str, counter: u64) -> StoreResult<()> {
        self.check_available()?;
        let mut rows = self.rows.write().await;

        match rows.get_mut(shard_id) {
            Some(row) if row.lease.counter == counter && row.lease.is_owned_by(worker_id) => {
                row.lease.owner = None;
                row.lease.expires_at = None;
                Ok(())
            }
            _ => Err(StoreError::conflict(shard_id)),
        }
    }
}
