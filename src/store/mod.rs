//! Durable lease and checkpoint storage
//!
//! Both traits are implemented by the same backend: a shard's lease row also
//! carries its checkpoint, which lets a checkpoint write be fenced by the
//! lease counter in a single conditional operation.

use crate::error::StoreError;
use crate::types::{Checkpoint, Lease};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable mapping from shard to last processed position
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieve the checkpoint for a given shard
    async fn get_checkpoint(&self, shard_id: &str) -> StoreResult<Option<Checkpoint>>;

    /// Save a checkpoint for a given shard.
    ///
    /// Fails with [`StoreError::Conflict`], leaving the stored checkpoint
    /// untouched, when the shard's lease counter has advanced past
    /// `expected_lease_counter`.
    async fn put_checkpoint(
        &self,
        shard_id: &str,
        checkpoint: &Checkpoint,
        expected_lease_counter: u64,
    ) -> StoreResult<()>;
}

/// Durable record of shard ownership.
///
/// Every mutation is conditional on the caller's last observed counter; a
/// [`StoreError::Conflict`] means someone else got there first.
#[async_trait]
pub trait LeaseTable: Send + Sync {
    /// How long an acquired or renewed lease stays valid
    fn lease_duration(&self) -> Duration;

    async fn list_leases(&self) -> StoreResult<Vec<Lease>>;

    /// Register an unowned lease for a newly discovered shard.
    ///
    /// Returns `false` when the lease already existed.
    async fn create_lease_if_absent(&self, shard_id: &str) -> StoreResult<bool>;

    /// Take ownership, returning the new counter
    async fn acquire(
        &self,
        shard_id: &str,
        worker_id: &str,
        expected_counter: u64,
    ) -> StoreResult<u64>;

    /// Extend ownership, returning the new counter
    async fn renew(&self, shard_id: &str, worker_id: &str, counter: u64) -> StoreResult<u64>;

    /// Give up ownership so another worker can acquire without waiting for expiry
    async fn release(&self, shard_id: &str, worker_id: &str, counter: u64) -> StoreResult<()>;
}

/// A backend serving both leases and checkpoints
pub trait LeaseStore: LeaseTable + CheckpointStore {}

impl<T: LeaseTable + CheckpointStore> LeaseStore for T {}

// Re-export implementations
#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbLeaseStore;
pub use memory::InMemoryLeaseStore;
