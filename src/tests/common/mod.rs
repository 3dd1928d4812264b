use crate::clock::{Clock, ManualClock};
use crate::config::WorkerConfig;
use crate::store::InMemoryLeaseStore;
use crate::test::mocks::{MockRecordProcessor, MockStreamSource};
use crate::test::TestUtils;
use crate::Worker;
use std::sync::Arc;
use std::time::Duration;

pub type TestWorker = Worker<MockRecordProcessor, MockStreamSource, InMemoryLeaseStore>;

/// Shared fixtures for worker-level tests
pub struct TestContext {
    pub config: WorkerConfig,
    pub source: Arc<MockStreamSource>,
    pub processor: MockRecordProcessor,
    pub store: Arc<InMemoryLeaseStore>,
    pub clock: ManualClock,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(TestUtils::create_test_config("test-stream"))
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        TestUtils::init_logging();
        let clock = ManualClock::new();
        let store = InMemoryLeaseStore::new(config.lease_duration).with_clock(Arc::new(clock.clone()));
        Self {
            config,
            source: Arc::new(MockStreamSource::new()),
            processor: MockRecordProcessor::new(),
            store: Arc::new(store),
            clock,
        }
    }

    /// A worker sharing this context's source, store and clock
    pub fn worker(&self, worker_id: &str) -> anyhow::Result<TestWorker> {
        let config = WorkerConfig {
            worker_id: worker_id.to_string(),
            ..self.config.clone()
        };
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let (worker, _) = Worker::with_clock(
            config,
            self.processor.clone(),
            self.source.clone(),
            self.store.clone(),
            clock,
        )?;
        Ok(worker)
    }
}

/// Poll `condition` until it holds or the timeout passes
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while !condition().await {
        if start.elapsed() > timeout {
            anyhow::bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
