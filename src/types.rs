//! Data model shared by the stores, the tracker and the consumers

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A stream sequence number.
///
/// Sequence numbers are arbitrarily large decimal strings, so they are
/// compared numerically rather than lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn significant_digits(&self) -> &str {
        let trimmed = self.0.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.significant_digits();
        let b = other.significant_digits();
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceNumber {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SequenceNumber {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// An ordered, append-only partition of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub adjacent_parent_shard_id: Option<String>,
    /// A shard is closed once it has been split or merged; it still holds
    /// records until they age out of the stream.
    pub closed: bool,
}

impl Shard {
    pub fn open(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
            adjacent_parent_shard_id: None,
            closed: false,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_shard_id = Some(parent.into());
        self
    }

    pub fn with_adjacent_parent(mut self, parent: impl Into<String>) -> Self {
        self.adjacent_parent_shard_id = Some(parent.into());
        self
    }

    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    /// Parent ids in lineage order (parent first, then adjacent parent)
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.parent_shard_id
            .as_deref()
            .into_iter()
            .chain(self.adjacent_parent_shard_id.as_deref())
    }
}

/// A single record pulled from a shard
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub sequence_number: SequenceNumber,
    /// Position inside an aggregated record; zero for plain records
    pub sub_sequence_number: u64,
    pub partition_key: String,
    pub data: Bytes,
    pub approximate_arrival_timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(
        sequence_number: impl Into<SequenceNumber>,
        partition_key: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            sub_sequence_number: 0,
            partition_key: partition_key.into(),
            data: data.into(),
            approximate_arrival_timestamp: None,
        }
    }

    /// Whether this record sits at or before the given checkpoint
    pub fn is_covered_by(&self, checkpoint: &Checkpoint) -> bool {
        match checkpoint {
            Checkpoint::ShardEnd => true,
            Checkpoint::At {
                sequence,
                sub_sequence,
            } => match self.sequence_number.cmp(sequence) {
                Ordering::Less => true,
                Ordering::Equal => self.sub_sequence_number <= *sub_sequence,
                Ordering::Greater => false,
            },
        }
    }
}

/// Where a read starts within a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartingPosition {
    TrimHorizon,
    Latest,
    AtTimestamp(DateTime<Utc>),
    AtSequence(SequenceNumber),
    AfterSequence(SequenceNumber),
}

/// Durable progress marker for a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    At {
        sequence: SequenceNumber,
        sub_sequence: u64,
    },
    /// Every record of a closed shard has been processed
    ShardEnd,
}

impl Checkpoint {
    pub const SHARD_END_MARKER: &'static str = "SHARD_END";

    pub fn at(sequence: impl Into<SequenceNumber>, sub_sequence: u64) -> Self {
        Checkpoint::At {
            sequence: sequence.into(),
            sub_sequence,
        }
    }

    pub fn for_record(record: &Record) -> Self {
        Checkpoint::At {
            sequence: record.sequence_number.clone(),
            sub_sequence: record.sub_sequence_number,
        }
    }

    pub fn is_shard_end(&self) -> bool {
        matches!(self, Checkpoint::ShardEnd)
    }

    /// The position to resume reading from after this checkpoint.
    ///
    /// Returns `None` for `ShardEnd`, which has nothing left to read.
    pub fn resume_position(&self) -> Option<StartingPosition> {
        match self {
            Checkpoint::ShardEnd => None,
            Checkpoint::At {
                sequence,
                sub_sequence: 0,
            } => Some(StartingPosition::AfterSequence(sequence.clone())),
            // Part of an aggregated record is still outstanding
            Checkpoint::At { sequence, .. } => Some(StartingPosition::AtSequence(sequence.clone())),
        }
    }

    /// Encodes the checkpoint as (sequence, sub-sequence) columns
    pub fn to_parts(&self) -> (String, u64) {
        match self {
            Checkpoint::ShardEnd => (Self::SHARD_END_MARKER.to_string(), 0),
            Checkpoint::At {
                sequence,
                sub_sequence,
            } => (sequence.to_string(), *sub_sequence),
        }
    }

    pub fn from_parts(sequence: &str, sub_sequence: u64) -> Self {
        if sequence == Self::SHARD_END_MARKER {
            Checkpoint::ShardEnd
        } else {
            Checkpoint::at(sequence, sub_sequence)
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::ShardEnd => f.write_str(Self::SHARD_END_MARKER),
            Checkpoint::At {
                sequence,
                sub_sequence,
            } => write!(f, "{}/{}", sequence, sub_sequence),
        }
    }
}

/// Time-bounded ownership claim over a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub shard_id: String,
    pub owner: Option<String>,
    /// Fencing token, bumped on every acquisition and renewal
    pub counter: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn unowned(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            owner: None,
            counter: 0,
            expires_at: None,
        }
    }

    /// A lease is up for grabs when nobody owns it or its owner stopped renewing
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.owner, self.expires_at) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(_), Some(expires_at)) => expires_at < now,
        }
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner.as_deref() == Some(worker_id)
    }
}

/// Why a shard consumer stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// The shard is closed and fully consumed; `ShardEnd` is checkpointed
    ShardEnd,
    /// Graceful stop; the last processed position is checkpointed
    Requested,
    /// Another worker owns the shard; nothing may be written
    LeaseLost,
}

impl ShutdownReason {
    /// Whether the consumer may still write a checkpoint and release
    pub fn may_checkpoint(&self) -> bool {
        !matches!(self, ShutdownReason::LeaseLost)
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownReason::ShardEnd => "SHARD_END",
            ShutdownReason::Requested => "REQUESTED",
            ShutdownReason::LeaseLost => "LEASE_LOST",
        };
        f.write_str(name)
    }
}
