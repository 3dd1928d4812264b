//! Kinesis Coordinator - lease-based consumption of sharded streams
//!
//! Several workers cooperatively consume every shard of a stream. Shards are
//! handed out through leases kept in a shared table, progress is
//! checkpointed under the lease counter, and child shards wait until their
//! parents have been consumed to the end.
//!
//! Start with [`Worker`], implement [`RecordProcessor`] for your records,
//! and pick a [`StreamSource`] and a [`LeaseStore`] backend.

pub mod client;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod monitoring;
pub mod processor;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod types;
pub mod worker;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

#[cfg(test)]
mod tests;

pub use client::{GetRecordsOutput, KinesisStreamSource, StreamSource};
pub use clock::{Clock, SystemClock};
pub use config::{InitialPosition, WorkerConfig};
pub use consumer::{ConsumerOutcome, ConsumerState, ShardConsumer};
pub use error::{CoordinatorError, ProcessingError, Result, SourceError, StoreError};
pub use processor::{PerRecord, PerRecordProcessor, RecordProcessor};
pub use retry::{Backoff, ExponentialBackoff, RetryConfig};
pub use types::{
    Checkpoint, Lease, Record, SequenceNumber, Shard, ShutdownReason, StartingPosition,
};
pub use worker::{ShardFailure, Worker};

// Re-export main traits
pub use crate::store::{CheckpointStore, LeaseStore, LeaseTable};

// Re-export implementations
pub use crate::store::memory::InMemoryLeaseStore;

#[cfg(feature = "dynamodb-store")]
pub use crate::store::dynamodb::DynamoDbLeaseStore;
