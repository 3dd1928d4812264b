use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{CheckpointStore, LeaseTable, StoreResult};
use crate::types::{Checkpoint, Lease};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoClient};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};

const LEASE_KEY: &str = "lease_key";
const LEASE_OWNER: &str = "lease_owner";
const LEASE_COUNTER: &str = "lease_counter";
const EXPIRES_AT: &str = "expires_at_millis";
const CHECKPOINT: &str = "checkpoint";
const CHECKPOINT_SUB_SEQUENCE: &str = "checkpoint_sub_sequence";

type Item = HashMap<String, AttributeValue>;

/// DynamoDB-backed lease table and checkpoint store.
///
/// One item per shard holds both the lease and the checkpoint. Every
/// mutation is an `UpdateItem` guarded by a condition expression, so a
/// `ConditionalCheckFailedException` maps to [`StoreError::Conflict`].
#[derive(Debug, Clone)]
pub struct DynamoDbLeaseStore {
    client: DynamoClient,
    table_name: String,
    key_prefix: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl DynamoDbLeaseStore {
    pub fn builder() -> DynamoDbLeaseStoreBuilder {
        DynamoDbLeaseStoreBuilder::new()
    }

    fn prefixed_key(&self, shard_id: &str) -> String {
        format!("{}{}", self.key_prefix, shard_id)
    }

    fn key_attr(&self, shard_id: &str) -> AttributeValue {
        AttributeValue::S(self.prefixed_key(shard_id))
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry_millis(&self) -> i64 {
        self.now_millis() + self.lease_duration.as_millis() as i64
    }

    fn lease_from_item(&self, item: &Item) -> anyhow::Result<Lease> {
        let key = string_attr(item, LEASE_KEY)?.context("lease item without key")?;
        let shard_id = key
            .strip_prefix(self.key_prefix.as_str())
            .unwrap_or(key.as_str())
            .to_string();
        let counter = number_attr(item, LEASE_COUNTER)?.unwrap_or(0) as u64;
        let owner = string_attr(item, LEASE_OWNER)?;
        let expires_at = number_attr(item, EXPIRES_AT)?
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

        Ok(Lease {
            shard_id,
            owner,
            counter,
            expires_at,
        })
    }
}

fn string_attr(item: &Item, name: &str) -> anyhow::Result<Option<String>> {
    match item.get(name) {
        None => Ok(None),
        Some(attr) => attr
            .as_s()
            .map(|s| Some(s.clone()))
            .map_err(|_| anyhow::anyhow!("attribute {} is not a string", name)),
    }
}

fn number_attr(item: &Item, name: &str) -> anyhow::Result<Option<i64>> {
    match item.get(name) {
        None => Ok(None),
        Some(attr) => {
            let raw = attr
                .as_n()
                .map_err(|_| anyhow::anyhow!("attribute {} is not a number", name))?;
            raw.parse::<i64>()
                .map(Some)
                .with_context(|| format!("attribute {} holds invalid number {}", name, raw))
        }
    }
}

fn checkpoint_from_item(item: &Item) -> anyhow::Result<Option<Checkpoint>> {
    let sequence = match string_attr(item, CHECKPOINT)? {
        Some(sequence) => sequence,
        None => return Ok(None),
    };
    let sub_sequence = number_attr(item, CHECKPOINT_SUB_SEQUENCE)?.unwrap_or(0) as u64;
    Ok(Some(Checkpoint::from_parts(&sequence, sub_sequence)))
}

fn number(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

/// Maps a failed conditional update onto the store taxonomy
fn classify<E>(
    shard_id: &str,
    err: aws_sdk_dynamodb::error::SdkError<E, aws_sdk_dynamodb::config::http::HttpResponse>,
    is_condition_failure: impl Fn(&E) -> bool,
) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if err.as_service_error().map(is_condition_failure).unwrap_or(false) {
        StoreError::conflict(shard_id)
    } else {
        StoreError::unavailable(anyhow::Error::new(err).context("DynamoDB request failed"))
    }
}

#[async_trait]
impl CheckpointStore for DynamoDbLeaseStore {
    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get_checkpoint(&self, shard_id: &str) -> StoreResult<Option<Checkpoint>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(LEASE_KEY, self.key_attr(shard_id))
            .consistent_read(true)
            .send()
            .await
            .context("Failed to get checkpoint from DynamoDB")
            .map_err(StoreError::unavailable)?;

        let checkpoint = match response.item() {
            Some(item) => checkpoint_from_item(item).map_err(StoreError::unavailable)?,
            None => None,
        };

        debug!(shard_id = %shard_id, checkpoint = ?checkpoint, "Retrieved checkpoint from DynamoDB");
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn put_checkpoint(
        &self,
        shard_id: &str,
        checkpoint: &Checkpoint,
        expected_lease_counter: u64,
    ) -> StoreResult<()> {
        let (sequence, sub_sequence) = checkpoint.to_parts();

        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(LEASE_KEY, self.key_attr(shard_id))
            .update_expression("SET #cp = :cp, #sub = :sub")
            .condition_expression("attribute_not_exists(#key) OR #counter <= :expected")
            .expression_attribute_names("#cp", CHECKPOINT)
            .expression_attribute_names("#sub", CHECKPOINT_SUB_SEQUENCE)
            .expression_attribute_names("#key", LEASE_KEY)
            .expression_attribute_names("#counter", LEASE_COUNTER)
            .expression_attribute_values(":cp", AttributeValue::S(sequence))
            .expression_attribute_values(":sub", number(sub_sequence))
            .expression_attribute_values(":expected", number(expected_lease_counter))
            .send()
            .await
            .map_err(|e| classify(shard_id, e, |e| e.is_conditional_check_failed_exception()))?;

        trace!(shard_id = %shard_id, checkpoint = %checkpoint, "Checkpoint saved to DynamoDB");
        Ok(())
    }
}

#[async_trait]
impl LeaseTable for DynamoDbLeaseStore {
    fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn list_leases(&self) -> StoreResult<Vec<Lease>> {
        let mut leases = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let response = self
                .client
                .scan()
                .table_name(&self.table_name)
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .context("Failed to scan lease table")
                .map_err(StoreError::unavailable)?;

            for item in response.items() {
                let is_ours = matches!(
                    string_attr(item, LEASE_KEY),
                    Ok(Some(ref key)) if key.starts_with(self.key_prefix.as_str())
                );
                if is_ours {
                    leases.push(self.lease_from_item(item).map_err(StoreError::unavailable)?);
                }
            }

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        trace!(count = leases.len(), "Listed leases from DynamoDB");
        Ok(leases)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn create_lease_if_absent(&self, shard_id: &str) -> StoreResult<bool> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(LEASE_KEY, self.key_attr(shard_id))
            .item(LEASE_COUNTER, number(0))
            .condition_expression("attribute_not_exists(#key)")
            .expression_attribute_names("#key", LEASE_KEY)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(shard_id = %shard_id, "Created lease in DynamoDB");
                Ok(true)
            }
            Err(e) => match classify(shard_id, e, |e| e.is_conditional_check_failed_exception()) {
                StoreError::Conflict { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn acquire(
        &self,
        shard_id: &str,
        worker_id: &str,
        expected_counter: u64,
    ) -> StoreResult<u64> {
        let takeable = "(#counter = :expected AND (attribute_not_exists(#owner) OR #expires < :now OR #owner = :owner))";
        let condition = if expected_counter == 0 {
            format!("attribute_not_exists(#key) OR {}", takeable)
        } else {
            takeable.to_string()
        };
        let new_counter = expected_counter + 1;

        let mut request = self.client.update_item();
        // DynamoDB rejects attribute names the expressions never reference
        if expected_counter == 0 {
            request = request.expression_attribute_names("#key", LEASE_KEY);
        }

        request
            .table_name(&self.table_name)
            .key(LEASE_KEY, self.key_attr(shard_id))
            .update_expression("SET #owner = :owner, #counter = :new, #expires = :expires")
            .condition_expression(condition)
            .expression_attribute_names("#owner", LEASE_OWNER)
            .expression_attribute_names("#counter", LEASE_COUNTER)
            .expression_attribute_names("#expires", EXPIRES_AT)
            .expression_attribute_values(":owner", AttributeValue::S(worker_id.to_string()))
            .expression_attribute_values(":expected", number(expected_counter))
            .expression_attribute_values(":new", number(new_counter))
            .expression_attribute_values(":now", number(self.now_millis()))
            .expression_attribute_values(":expires", number(self.expiry_millis()))
            .send()
            .await
            .map_err(|e| classify(shard_id, e, |e| e.is_conditional_check_failed_exception()))?;

        Ok(new_counter)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn renew(&self, shard_id: &str, worker_id: &str, counter: u64) -> StoreResult<u64> {
        let new_counter = counter + 1;

        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(LEASE_KEY, self.key_attr(shard_id))
            .update_expression("SET #counter = :new, #expires = :expires")
            .condition_expression("#counter = :expected AND #owner = :owner")
            .expression_attribute_names("#owner", LEASE_OWNER)
            .expression_attribute_names("#counter", LEASE_COUNTER)
            .expression_attribute_names("#expires", EXPIRES_AT)
            .expression_attribute_values(":owner", AttributeValue::S(worker_id.to_string()))
            .expression_attribute_values(":expected", number(counter))
            .expression_attribute_values(":new", number(new_counter))
            .expression_attribute_values(":expires", number(self.expiry_millis()))
            .send()
            .await
            .map_err(|e| classify(shard_id, e, |e| e.is_conditional_check_failed_exception()))?;

        Ok(new_counter)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn release(&self, shard_id: &str, worker_id: &str, counter: u64) -> StoreResult<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(LEASE_KEY, self.key_attr(shard_id))
            .update_expression("REMOVE #owner, #expires")
            .condition_expression("#counter = :expected AND #owner = :owner")
            .expression_attribute_names("#owner", LEASE_OWNER)
            .expression_attribute_names("#counter", LEASE_COUNTER)
            .expression_attribute_names("#expires", EXPIRES_AT)
            .expression_attribute_values(":owner", AttributeValue::S(worker_id.to_string()))
            .expression_attribute_values(":expected", number(counter))
            .send()
            .await
            .map_err(|e| classify(shard_id, e, |e| e.is_conditional_check_failed_exception()))?;

        debug!(shard_id = %shard_id, "Released lease in DynamoDB");
        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamoDbLeaseStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    key_prefix: Option<String>,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for DynamoDbLeaseStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbLeaseStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            table_name: None,
            key_prefix: None,
            lease_duration: Duration::from_secs(30),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Lease tables are namespaced by application, so this is usually the
    /// application name
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbLeaseStore> {
        Ok(DynamoDbLeaseStore {
            client: self.client.ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self.table_name.ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            key_prefix: self.key_prefix.unwrap_or_default(),
            lease_duration: self.lease_duration,
            clock: self.clock,
        })
    }
}
