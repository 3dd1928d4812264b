//! Test utilities and mock implementations for exercising workers without AWS

pub mod mocks;

use crate::config::WorkerConfig;
use crate::retry::RetryConfig;
use crate::types::Record;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Route `tracing` output to the test harness, once per process
    pub fn init_logging() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> Record {
        Record::new(sequence_number, "test-partition-key", data.to_vec())
    }

    /// Records with consecutive numeric sequence numbers starting at `first`
    pub fn sequential_records(first: u64, count: usize) -> Vec<Record> {
        (first..first + count as u64)
            .map(|seq| {
                Self::create_test_record(&seq.to_string(), format!("data-{}", seq).as_bytes())
            })
            .collect()
    }

    /// The user records packed into one aggregated record
    pub fn aggregated_records(sequence_number: &str, count: u64) -> Vec<Record> {
        (0..count)
            .map(|sub| {
                let mut record = Self::create_test_record(
                    sequence_number,
                    format!("data-{}-{}", sequence_number, sub).as_bytes(),
                );
                record.sub_sequence_number = sub;
                record
            })
            .collect()
    }

    /// A configuration with short intervals and near-instant backoff
    pub fn create_test_config(stream_name: &str) -> WorkerConfig {
        let fast = |max_retries| RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            jitter_factor: 0.0,
        };

        WorkerConfig {
            lease_duration: Duration::from_secs(2),
            reconcile_interval: Duration::from_millis(100),
            max_records: 100,
            checkpoint_every_batches: 5,
            checkpoint_interval: Duration::from_secs(60),
            idle_time_between_reads: Duration::from_millis(10),
            processing_retry: fast(Some(3)),
            discovery_retry: fast(Some(2)),
            source_retry: fast(None),
            store_retry: RetryConfig {
                initial_backoff: Duration::from_millis(5),
                ..fast(None)
            },
            checkpoint_retry: RetryConfig {
                initial_backoff: Duration::from_millis(5),
                ..fast(None)
            },
            max_topology_staleness: Duration::from_secs(60),
            ..WorkerConfig::new("test-app", stream_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SequenceNumber;

    #[test]
    fn test_sequential_records() {
        let records = TestUtils::sequential_records(7, 3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence_number, SequenceNumber::new("7"));
        assert_eq!(records[2].sequence_number, SequenceNumber::new("9"));
        assert_eq!(records[0].partition_key, "test-partition-key");
        assert_eq!(records[1].data.as_ref(), b"data-8");
    }

    #[test]
    fn test_aggregated_records_share_sequence() {
        let records = TestUtils::aggregated_records("42", 3);
        assert!(records
            .iter()
            .all(|r| r.sequence_number == SequenceNumber::new("42")));
        let subs: Vec<u64> = records.iter().map(|r| r.sub_sequence_number).collect();
        assert_eq!(subs, vec![0, 1, 2]);
    }

    #[test]
    fn test_config_is_valid() {
        TestUtils::init_logging();
        assert!(TestUtils::create_test_config("stream").validate().is_ok());
    }
}
