//! Shard topology discovery and lineage readiness

use crate::client::StreamSource;
use crate::error::{CoordinatorError, Result};
use crate::retry::RetryConfig;
use crate::store::{CheckpointStore, StoreResult};
use crate::types::Shard;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Immutable snapshot of the stream's shards and their lineage
#[derive(Debug, Clone, Default)]
pub struct ShardTopology {
    shards: BTreeMap<String, Shard>,
    children: HashMap<String, Vec<String>>,
}

impl ShardTopology {
    pub fn from_shards(shards: impl IntoIterator<Item = Shard>) -> Self {
        let shards: BTreeMap<String, Shard> = shards
            .into_iter()
            .map(|shard| (shard.shard_id.clone(), shard))
            .collect();

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for shard in shards.values() {
            for parent in shard.parents() {
                children
                    .entry(parent.to_string())
                    .or_default()
                    .push(shard.shard_id.clone());
            }
        }
        for list in children.values_mut() {
            list.sort();
        }

        Self { shards, children }
    }

    pub fn get(&self, shard_id: &str) -> Option<&Shard> {
        self.shards.get(shard_id)
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.shards.contains_key(shard_id)
    }

    /// Shards in ascending id order
    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shards created by splitting or merging `shard_id`
    pub fn children(&self, shard_id: &str) -> &[String] {
        self.children
            .get(shard_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every ancestor of `shard_id` still present in the topology.
    ///
    /// Parents trimmed out of retention are skipped along with their own
    /// lineage.
    pub fn ancestors(&self, shard_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut pending: Vec<&str> = self
            .get(shard_id)
            .map(|shard| shard.parents().collect())
            .unwrap_or_default();

        while let Some(id) = pending.pop() {
            if let Some(shard) = self.get(id) {
                if seen.insert(id.to_string()) {
                    pending.extend(shard.parents());
                }
            }
        }

        let mut ancestors: Vec<String> = seen.into_iter().collect();
        ancestors.sort();
        ancestors
    }
}

struct CachedTopology {
    topology: Arc<ShardTopology>,
    fetched_at: Instant,
}

/// Tracks the shard topology and which shards have been fully consumed
pub struct ShardTracker<C, S> {
    source: Arc<C>,
    store: Arc<S>,
    retry: RetryConfig,
    max_staleness: Duration,
    cached: Mutex<Option<CachedTopology>>,
    finished: Mutex<HashSet<String>>,
}

impl<C, S> ShardTracker<C, S>
where
    C: StreamSource,
    S: CheckpointStore,
{
    pub fn new(source: Arc<C>, store: Arc<S>, retry: RetryConfig, max_staleness: Duration) -> Self {
        Self {
            source,
            store,
            retry,
            max_staleness,
            cached: Mutex::new(None),
            finished: Mutex::new(HashSet::new()),
        }
    }

    /// List the stream's shards, retrying transient failures.
    ///
    /// When listing fails, the last topology is served while it is younger
    /// than the configured staleness bound. Errors retrying cannot fix are
    /// not retried.
    #[instrument(skip(self))]
    pub async fn discover_shards(&self) -> Result<Arc<ShardTopology>> {
        let source = self.source.clone();
        let result = self
            .retry
            .handle()
            .retry_to_completion(|| {
                let source = source.clone();
                async move {
                    match source.list_shards().await {
                        Ok(shards) => Ok(Ok(shards)),
                        Err(e) if e.is_retryable() => Err(e),
                        Err(e) => Ok(Err(e)),
                    }
                }
            })
            .await;

        let error = match result {
            Ok(Ok(shards)) => {
                let topology = Arc::new(ShardTopology::from_shards(shards));
                let previous = self.cached.lock().replace(CachedTopology {
                    topology: topology.clone(),
                    fetched_at: Instant::now(),
                });
                let previous_len = previous.map(|cached| cached.topology.len());
                if previous_len != Some(topology.len()) {
                    info!(shards = topology.len(), "Shard topology changed");
                }
                return Ok(topology);
            }
            Ok(Err(e)) => CoordinatorError::from(e),
            Err(e) => CoordinatorError::TransientSource(format!("shard discovery failed: {}", e)),
        };

        let cached = self.cached.lock();
        match cached.as_ref() {
            Some(cached) if cached.fetched_at.elapsed() <= self.max_staleness => {
                warn!(
                    error = %error,
                    age_ms = cached.fetched_at.elapsed().as_millis() as u64,
                    "Shard listing failed, serving cached topology"
                );
                Ok(cached.topology.clone())
            }
            _ => Err(error),
        }
    }

    /// Whether `shard_id` has checkpoint `ShardEnd`.
    ///
    /// Finished is terminal, so positive answers are remembered.
    pub async fn is_finished(&self, shard_id: &str) -> StoreResult<bool> {
        if self.finished.lock().contains(shard_id) {
            return Ok(true);
        }

        let finished = self
            .store
            .get_checkpoint(shard_id)
            .await?
            .map(|checkpoint| checkpoint.is_shard_end())
            .unwrap_or(false);

        if finished {
            debug!(shard_id = %shard_id, "Shard fully consumed");
            self.finished.lock().insert(shard_id.to_string());
        }
        Ok(finished)
    }

    /// A shard may be consumed once every ancestor still in the topology
    /// has been consumed to its end.
    pub async fn is_ready(&self, topology: &ShardTopology, shard_id: &str) -> StoreResult<bool> {
        for ancestor in topology.ancestors(shard_id) {
            if !self.is_finished(&ancestor).await? {
                debug!(
                    shard_id = %shard_id,
                    blocked_by = %ancestor,
                    "Shard waiting on unfinished ancestor"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}
