//! Stream source abstraction and its Kinesis implementation

use crate::error::SourceError;
use crate::types::{Record, SequenceNumber, Shard, StartingPosition};
use async_trait::async_trait;
use aws_sdk_kinesis::{
    error::{ProvideErrorMetadata, SdkError},
    types::ShardIteratorType,
    Client,
};
use aws_smithy_types_convert::date_time::DateTimeExt;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Result of a single pull from a shard
#[derive(Debug, Clone, Default)]
pub struct GetRecordsOutput {
    pub records: Vec<Record>,
    /// Where the next pull starts; `None` once a closed shard is exhausted
    pub next_position: Option<StartingPosition>,
    pub millis_behind_latest: Option<i64>,
}

/// A sharded, ordered record stream
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// All shards currently in retention, open and closed
    async fn list_shards(&self) -> Result<Vec<Shard>, SourceError>;

    /// Pull up to `limit` records starting at `position`, in order
    async fn get_records(
        &self,
        shard_id: &str,
        position: &StartingPosition,
        limit: usize,
    ) -> Result<GetRecordsOutput, SourceError>;
}

#[async_trait]
impl<T: StreamSource + ?Sized> StreamSource for Arc<T> {
    async fn list_shards(&self) -> Result<Vec<Shard>, SourceError> {
        (**self).list_shards().await
    }

    async fn get_records(
        &self,
        shard_id: &str,
        position: &StartingPosition,
        limit: usize,
    ) -> Result<GetRecordsOutput, SourceError> {
        (**self).get_records(shard_id, position, limit).await
    }
}

/// [`StreamSource`] backed by the Kinesis data plane.
///
/// Shard iterators returned by `GetRecords` are cached per shard together
/// with the position they continue from, so steady-state reads cost one
/// call. An expired iterator is evicted and reported as
/// [`SourceError::ExpiredIterator`]; the retry requests a fresh one.
#[derive(Debug, Clone)]
pub struct KinesisStreamSource {
    client: Client,
    stream_name: String,
    iterators: Arc<Mutex<HashMap<String, (StartingPosition, String)>>>,
}

impl KinesisStreamSource {
    pub fn new(client: Client, stream_name: impl Into<String>) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
            iterators: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build a source from the ambient AWS configuration
    pub async fn from_env(stream_name: impl Into<String>) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&sdk_config), stream_name)
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    fn cached_iterator(&self, shard_id: &str, position: &StartingPosition) -> Option<String> {
        let iterators = self.iterators.lock();
        match iterators.get(shard_id) {
            Some((cached_position, iterator)) if cached_position == position => {
                Some(iterator.clone())
            }
            _ => None,
        }
    }

    async fn shard_iterator(
        &self,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<String, SourceError> {
        if let Some(iterator) = self.cached_iterator(shard_id, position) {
            trace!(shard_id = %shard_id, "Reusing cached shard iterator");
            return Ok(iterator);
        }

        let mut request = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream_name)
            .shard_id(shard_id);

        request = match position {
            StartingPosition::TrimHorizon => {
                request.shard_iterator_type(ShardIteratorType::TrimHorizon)
            }
            StartingPosition::Latest => request.shard_iterator_type(ShardIteratorType::Latest),
            StartingPosition::AtTimestamp(ts) => request
                .shard_iterator_type(ShardIteratorType::AtTimestamp)
                .timestamp(aws_smithy_types::DateTime::from_millis(ts.timestamp_millis())),
            StartingPosition::AtSequence(seq) => request
                .shard_iterator_type(ShardIteratorType::AtSequenceNumber)
                .starting_sequence_number(seq.as_str()),
            StartingPosition::AfterSequence(seq) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(seq.as_str()),
        };

        let response = request
            .send()
            .await
            .map_err(|e| classify(shard_id, e))?;

        debug!(shard_id = %shard_id, position = ?position, "Obtained shard iterator");
        response
            .shard_iterator()
            .map(String::from)
            .ok_or_else(|| SourceError::Transient(anyhow::anyhow!("no shard iterator returned")))
    }
}

#[async_trait]
impl StreamSource for KinesisStreamSource {
    async fn list_shards(&self) -> Result<Vec<Shard>, SourceError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects a stream name alongside a continuation token
            let request = match next_token.take() {
                Some(token) => self.client.list_shards().next_token(token),
                None => self.client.list_shards().stream_name(&self.stream_name),
            };
            let response = request
                .send()
                .await
                .map_err(|e| classify(&self.stream_name, e))?;

            shards.extend(response.shards().iter().map(|shard| {
                let closed = shard
                    .sequence_number_range()
                    .and_then(|range| range.ending_sequence_number())
                    .is_some();
                Shard {
                    shard_id: shard.shard_id().to_string(),
                    parent_shard_id: shard.parent_shard_id().map(String::from),
                    adjacent_parent_shard_id: shard.adjacent_parent_shard_id().map(String::from),
                    closed,
                }
            }));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stream = %self.stream_name, count = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn get_records(
        &self,
        shard_id: &str,
        position: &StartingPosition,
        limit: usize,
    ) -> Result<GetRecordsOutput, SourceError> {
        let requested_at = Utc::now();
        let iterator = self.shard_iterator(shard_id, position).await?;

        let response = match self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit.min(i32::MAX as usize) as i32)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.iterators.lock().remove(shard_id);
                return Err(classify(shard_id, e));
            }
        };

        let records: Vec<Record> = response
            .records()
            .iter()
            .map(|record| Record {
                sequence_number: SequenceNumber::new(record.sequence_number()),
                sub_sequence_number: 0,
                partition_key: record.partition_key().to_string(),
                data: bytes::Bytes::copy_from_slice(record.data().as_ref()),
                approximate_arrival_timestamp: record
                    .approximate_arrival_timestamp()
                    .and_then(|ts| ts.to_chrono_utc().ok()),
            })
            .collect();

        let next_position = match response.next_shard_iterator() {
            None => {
                self.iterators.lock().remove(shard_id);
                debug!(shard_id = %shard_id, "Reached end of closed shard");
                None
            }
            Some(next_iterator) => {
                let next_position = resume_position(position, &records, requested_at);
                self.iterators.lock().insert(
                    shard_id.to_string(),
                    (next_position.clone(), next_iterator.to_string()),
                );
                Some(next_position)
            }
        };

        trace!(
            shard_id = %shard_id,
            count = records.len(),
            millis_behind_latest = ?response.millis_behind_latest(),
            "Fetched records"
        );

        Ok(GetRecordsOutput {
            records,
            next_position,
            millis_behind_latest: response.millis_behind_latest(),
        })
    }
}

/// Where the read after `records` continues.
///
/// An empty read from `Latest` is pinned to the time the iterator was
/// requested, so an iterator evicted after a failed call is replaced by an
/// `AT_TIMESTAMP` one instead of a fresh `LATEST` that would skip whatever
/// arrived in between. Any other empty read keeps its position.
fn resume_position(
    position: &StartingPosition,
    records: &[Record],
    requested_at: DateTime<Utc>,
) -> StartingPosition {
    match (records.last(), position) {
        (Some(record), _) => StartingPosition::AfterSequence(record.sequence_number.clone()),
        (None, StartingPosition::Latest) => StartingPosition::AtTimestamp(requested_at),
        (None, _) => position.clone(),
    }
}

/// Maps a Kinesis error onto the source taxonomy by its error code
fn classify<E, R>(resource: &str, err: SdkError<E, R>) -> SourceError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(String::from);
    match code.as_deref() {
        Some("ExpiredIteratorException") => {
            debug!(shard_id = %resource, "Shard iterator expired");
            SourceError::ExpiredIterator(resource.to_string())
        }
        Some("ProvisionedThroughputExceededException") | Some("LimitExceededException") => {
            warn!(resource = %resource, "Kinesis throttled the request");
            SourceError::Throttled
        }
        Some("ResourceNotFoundException") => SourceError::ResourceNotFound(resource.to_string()),
        Some("AccessDeniedException") | Some("KMSAccessDeniedException") => {
            SourceError::AccessDenied(resource.to_string())
        }
        _ => SourceError::Transient(anyhow::Error::new(err).context("Kinesis request failed")),
    }
}
