// tests/common/mod.rs
#![allow(dead_code)]

use kinesis_coordinator::monitoring::MonitoringConfig;
use kinesis_coordinator::test::mocks::{MockRecordProcessor, MockStreamSource};
use kinesis_coordinator::test::TestUtils;
use kinesis_coordinator::{InMemoryLeaseStore, InitialPosition, Worker, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;

pub type TestWorker = Worker<MockRecordProcessor, MockStreamSource, InMemoryLeaseStore>;

/// Logging comes from the `test-utils` feature, as a downstream crate would use it
pub fn init_logging() {
    TestUtils::init_logging();
}

pub fn create_test_config() -> WorkerConfig {
    WorkerConfig {
        initial_position: InitialPosition::TrimHorizon,
        max_records: 100,
        checkpoint_every_batches: 3,
        checkpoint_interval: Duration::from_secs(3600),
        monitoring: MonitoringConfig {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        },
        ..TestUtils::create_test_config("test-stream")
    }
}

pub struct TestContext {
    pub config: WorkerConfig,
    pub source: Arc<MockStreamSource>,
    pub processor: MockRecordProcessor,
    pub store: Arc<InMemoryLeaseStore>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(create_test_config())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        init_logging();
        let store = InMemoryLeaseStore::new(config.lease_duration);
        Self {
            config,
            source: Arc::new(MockStreamSource::new()),
            processor: MockRecordProcessor::new(),
            store: Arc::new(store),
        }
    }

    pub fn worker(&self, worker_id: &str) -> anyhow::Result<TestWorker> {
        let config = WorkerConfig {
            worker_id: worker_id.to_string(),
            ..self.config.clone()
        };
        let (worker, _monitoring_rx) = Worker::new(
            config,
            self.processor.clone(),
            self.source.clone(),
            self.store.clone(),
        )?;
        Ok(worker)
    }
}

/// Wait for the processor to see `expected_records` in total
pub async fn verify_processing_complete(
    processor: &MockRecordProcessor,
    expected_records: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    processor.wait_for_records(expected_records, timeout).await
}
