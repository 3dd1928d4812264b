use crate::client::{GetRecordsOutput, StreamSource};
use crate::error::{ProcessingError, SourceError};
use crate::processor::RecordProcessor;
use crate::types::{Record, Shard, ShutdownReason, StartingPosition};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct MockShard {
    shard: Option<Shard>,
    records: Vec<Record>,
    get_records_failures: u32,
    get_records_calls: usize,
    access_denied: bool,
}

#[derive(Debug, Default)]
struct SourceState {
    shards: BTreeMap<String, MockShard>,
    list_shards_failures: u32,
    list_shards_denied: u32,
    list_shards_calls: usize,
}

/// In-memory stream source.
///
/// Shards hold an ordered record log; reads honour every
/// [`StartingPosition`] and closed shards report their end once the log is
/// exhausted.
#[derive(Debug, Default, Clone)]
pub struct MockStreamSource {
    state: Arc<Mutex<SourceState>>,
}

impl MockStreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_shard(&self, shard: Shard) {
        self.add_shard_with_records(shard, Vec::new()).await;
    }

    pub async fn add_shard_with_records(&self, shard: Shard, records: Vec<Record>) {
        let mut state = self.state.lock().await;
        let entry = state.shards.entry(shard.shard_id.clone()).or_default();
        entry.shard = Some(shard);
        entry.records.extend(records);
    }

    pub async fn push_records(&self, shard_id: &str, records: Vec<Record>) {
        let mut state = self.state.lock().await;
        state
            .shards
            .entry(shard_id.to_string())
            .or_default()
            .records
            .extend(records);
    }

    pub async fn close_shard(&self, shard_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(shard) = state
            .shards
            .get_mut(shard_id)
            .and_then(|entry| entry.shard.as_mut())
        {
            shard.closed = true;
        }
    }

    /// Drop a shard from listings, as if trimmed out of retention
    pub async fn remove_shard(&self, shard_id: &str) {
        self.state.lock().await.shards.remove(shard_id);
    }

    /// Make the next `times` listings fail
    pub async fn fail_list_shards(&self, times: u32) {
        self.state.lock().await.list_shards_failures = times;
    }

    /// Make the next `times` listings fail with a non-retryable error
    pub async fn deny_list_shards(&self, times: u32) {
        self.state.lock().await.list_shards_denied = times;
    }

    /// Reject every further read of a shard as unauthorized
    pub async fn deny_get_records(&self, shard_id: &str) {
        self.state
            .lock()
            .await
            .shards
            .entry(shard_id.to_string())
            .or_default()
            .access_denied = true;
    }

    /// Make the next `times` reads of a shard fail
    pub async fn fail_get_records(&self, shard_id: &str, times: u32) {
        self.state
            .lock()
            .await
            .shards
            .entry(shard_id.to_string())
            .or_default()
            .get_records_failures = times;
    }

    pub async fn list_shards_calls(&self) -> usize {
        self.state.lock().await.list_shards_calls
    }

    pub async fn get_records_calls(&self, shard_id: &str) -> usize {
        self.state
            .lock()
            .await
            .shards
            .get(shard_id)
            .map(|entry| entry.get_records_calls)
            .unwrap_or(0)
    }
}

fn start_index(records: &[Record], position: &StartingPosition) -> usize {
    match position {
        StartingPosition::TrimHorizon => 0,
        StartingPosition::Latest => records.len(),
        StartingPosition::AtTimestamp(ts) => records
            .iter()
            .position(|r| r.approximate_arrival_timestamp.map_or(true, |at| at >= *ts))
            .unwrap_or(records.len()),
        StartingPosition::AtSequence(seq) => records
            .iter()
            .position(|r| r.sequence_number >= *seq)
            .unwrap_or(records.len()),
        StartingPosition::AfterSequence(seq) => records
            .iter()
            .position(|r| r.sequence_number > *seq)
            .unwrap_or(records.len()),
    }
}

#[async_trait]
impl StreamSource for MockStreamSource {
    async fn list_shards(&self) -> Result<Vec<Shard>, SourceError> {
        let mut state = self.state.lock().await;
        state.list_shards_calls += 1;
        if state.list_shards_denied > 0 {
            state.list_shards_denied -= 1;
            return Err(SourceError::AccessDenied("test-stream".to_string()));
        }
        if state.list_shards_failures > 0 {
            state.list_shards_failures -= 1;
            return Err(SourceError::Throttled);
        }
        Ok(state
            .shards
            .values()
            .filter_map(|entry| entry.shard.clone())
            .collect())
    }

    async fn get_records(
        &self,
        shard_id: &str,
        position: &StartingPosition,
        limit: usize,
    ) -> Result<GetRecordsOutput, SourceError> {
        let mut state = self.state.lock().await;
        let entry = state
            .shards
            .get_mut(shard_id)
            .ok_or_else(|| SourceError::ResourceNotFound(shard_id.to_string()))?;
        entry.get_records_calls += 1;

        if entry.access_denied {
            return Err(SourceError::AccessDenied(shard_id.to_string()));
        }
        if entry.get_records_failures > 0 {
            entry.get_records_failures -= 1;
            return Err(SourceError::Transient(anyhow::anyhow!(
                "simulated read failure"
            )));
        }

        let start = start_index(&entry.records, position);
        let end = (start + limit).min(entry.records.len());
        let records = entry.records[start..end].to_vec();
        let closed = entry.shard.as_ref().map_or(false, |shard| shard.closed);

        let next_position = if closed && end == entry.records.len() {
            None
        } else {
            // An empty read pins relative positions to the current tip
            let last_read = records
                .last()
                .or_else(|| start.checked_sub(1).map(|i| &entry.records[i]));
            Some(
                last_read
                    .map(|r| StartingPosition::AfterSequence(r.sequence_number.clone()))
                    .unwrap_or_else(|| position.clone()),
            )
        };

        debug!(shard_id = %shard_id, count = records.len(), "Mock returned records");
        Ok(GetRecordsOutput {
            millis_behind_latest: Some(((entry.records.len() - end) as i64) * 1000),
            records,
            next_position,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    remaining: u32,
    hard: bool,
}

#[derive(Debug, Default)]
struct ProcessorState {
    processed: HashMap<String, Vec<Record>>,
    /// Successful batches per shard
    batches: HashMap<String, u32>,
    /// Attempts per (shard, batch number)
    attempts: HashMap<(String, u32), u32>,
    failures: HashMap<(String, u32), FailurePlan>,
    initialized: HashMap<String, Vec<StartingPosition>>,
    shutdowns: HashMap<String, Vec<ShutdownReason>>,
    delay: Option<Duration>,
}

/// Record processor that remembers everything it was given.
///
/// Batches are numbered per shard from 1 in the order they succeed, so a
/// planned failure of batch N hits the N-th distinct batch however often it
/// is retried.
#[derive(Debug, Default, Clone)]
pub struct MockRecordProcessor {
    state: Arc<Mutex<ProcessorState>>,
}

impl MockRecordProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail batch `batch_number` of a shard with a soft error `times` times
    pub async fn fail_batch(&self, shard_id: &str, batch_number: u32, times: u32) {
        self.state.lock().await.failures.insert(
            (shard_id.to_string(), batch_number),
            FailurePlan {
                remaining: times,
                hard: false,
            },
        );
    }

    /// Fail batch `batch_number` of a shard with a hard error
    pub async fn fail_batch_hard(&self, shard_id: &str, batch_number: u32) {
        self.state.lock().await.failures.insert(
            (shard_id.to_string(), batch_number),
            FailurePlan {
                remaining: u32::MAX,
                hard: true,
            },
        );
    }

    /// Sleep this long inside every batch
    pub async fn set_delay(&self, delay: Duration) {
        self.state.lock().await.delay = Some(delay);
    }

    pub async fn processed_records(&self, shard_id: &str) -> Vec<Record> {
        self.state
            .lock()
            .await
            .processed
            .get(shard_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn processed_count_for(&self, shard_id: &str) -> usize {
        self.state
            .lock()
            .await
            .processed
            .get(shard_id)
            .map_or(0, Vec::len)
    }

    pub async fn processed_count(&self) -> usize {
        self.state.lock().await.processed.values().map(Vec::len).sum()
    }

    pub async fn attempts(&self, shard_id: &str, batch_number: u32) -> u32 {
        self.state
            .lock()
            .await
            .attempts
            .get(&(shard_id.to_string(), batch_number))
            .copied()
            .unwrap_or(0)
    }

    pub async fn initialized(&self, shard_id: &str) -> Vec<StartingPosition> {
        self.state
            .lock()
            .await
            .initialized
            .get(shard_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn shutdown_reasons(&self, shard_id: &str) -> Vec<ShutdownReason> {
        self.state
            .lock()
            .await
            .shutdowns
            .get(shard_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Wait until at least `count` records were processed across all shards
    pub async fn wait_for_records(&self, count: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let processed = self.processed_count().await;
            if processed >= count {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("processed {} of {} records before timeout", processed, count);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl RecordProcessor for MockRecordProcessor {
    async fn initialize(
        &self,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<(), ProcessingError> {
        self.state
            .lock()
            .await
            .initialized
            .entry(shard_id.to_string())
            .or_default()
            .push(position.clone());
        Ok(())
    }

    async fn process_records(
        &self,
        shard_id: &str,
        records: &[Record],
    ) -> Result<(), ProcessingError> {
        let delay = self.state.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let batch_number = state.batches.get(shard_id).copied().unwrap_or(0) + 1;
        let key = (shard_id.to_string(), batch_number);
        *state.attempts.entry(key.clone()).or_default() += 1;

        if let Some(plan) = state.failures.get_mut(&key) {
            if plan.remaining > 0 {
                plan.remaining -= 1;
                let error = anyhow::anyhow!("planned failure of batch {}", batch_number);
                return Err(if plan.hard {
                    ProcessingError::hard(error)
                } else {
                    ProcessingError::soft(error)
                });
            }
        }

        state.batches.insert(shard_id.to_string(), batch_number);
        state
            .processed
            .entry(shard_id.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn shutdown(&self, shard_id: &str, reason: ShutdownReason) -> Result<(), ProcessingError> {
        self.state
            .lock()
            .await
            .shutdowns
            .entry(shard_id.to_string())
            .or_default()
            .push(reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestUtils;
    use crate::types::SequenceNumber;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_mock_source_positions() -> anyhow::Result<()> {
        let source = MockStreamSource::new();
        source
            .add_shard_with_records(Shard::open("shard-1"), TestUtils::sequential_records(1, 5))
            .await;

        let output = source
            .get_records("shard-1", &StartingPosition::TrimHorizon, 2)
            .await?;
        assert_eq!(output.records.len(), 2);
        assert_eq!(
            output.next_position,
            Some(StartingPosition::AfterSequence(SequenceNumber::new("2")))
        );

        let position = StartingPosition::AtSequence(SequenceNumber::new("4"));
        let output = source.get_records("shard-1", &position, 10).await?;
        assert_eq!(output.records.len(), 2);

        let output = source
            .get_records("shard-1", &StartingPosition::Latest, 10)
            .await?;
        assert!(output.records.is_empty());
        assert_eq!(
            output.next_position,
            Some(StartingPosition::AfterSequence(SequenceNumber::new("5")))
        );

        source.close_shard("shard-1").await;
        let position = StartingPosition::AfterSequence(SequenceNumber::new("3"));
        let output = source.get_records("shard-1", &position, 10).await?;
        assert_eq!(output.records.len(), 2);
        assert_eq!(output.next_position, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_mock_processor_planned_failures() -> anyhow::Result<()> {
        let processor = MockRecordProcessor::new();
        processor.fail_batch("shard-1", 2, 1).await;
        let batch = TestUtils::sequential_records(1, 3);

        processor.process_records("shard-1", &batch).await?;
        assert!(processor.process_records("shard-1", &batch).await.is_err());
        processor.process_records("shard-1", &batch).await?;

        assert_eq!(processor.attempts("shard-1", 1).await, 1);
        assert_eq!(processor.attempts("shard-1", 2).await, 2);
        assert_eq!(processor.processed_count_for("shard-1").await, 6);
        Ok(())
    }
}
