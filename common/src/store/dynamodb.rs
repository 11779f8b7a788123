//! DynamoDB-backed schedule state store.
//!
//! ## Item layout
//! ```text
//! key            S     "{groupName}#{scheduleName}" (partition key)
//! groupName      S
//! executionTime  S     ISO-8601 UTC, only when resolved
//! deleted        BOOL  only on tombstones
//! expiresAt      N     epoch seconds (table TTL attribute)
//! lastEventTime  N     epoch milliseconds of the applied notification
//! ```
//!
//! Writes are full-item `PutItem` calls guarded by
//! `attribute_not_exists(lastEventTime) OR lastEventTime < :candidate`.

use super::StateStore;
use crate::errors::StoreError;
use crate::models::{ApplyOutcome, ScheduleKey, ScheduleRecord};
use crate::schedule::format_utc;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::{debug, error, instrument};

const ATTR_KEY: &str = "key";
const ATTR_GROUP_NAME: &str = "groupName";
const ATTR_EXECUTION_TIME: &str = "executionTime";
const ATTR_DELETED: &str = "deleted";
const ATTR_EXPIRES_AT: &str = "expiresAt";
const ATTR_LAST_EVENT_TIME: &str = "lastEventTime";

const NEWER_EVENT_CONDITION: &str =
    "attribute_not_exists(lastEventTime) OR lastEventTime < :candidateEventTime";

#[derive(Clone)]
pub struct DynamoStateStore {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoStateStore {
    pub fn new(client: DynamoDbClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Build a store from the shared AWS configuration
    ///
    /// ## Arguments
    /// * `region` - AWS region (e.g., "us-east-1")
    /// * `table_name` - DynamoDB table name
    /// * `endpoint_url` - Optional endpoint URL (for DynamoDB Local testing)
    pub async fn from_region(
        region: String,
        table_name: String,
        endpoint_url: Option<String>,
    ) -> Self {
        let mut config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        // Set endpoint URL if provided (for local testing)
        if let Some(endpoint) = endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }

        let config = config_builder.load().await;
        Self::new(DynamoDbClient::new(&config), table_name)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

/// Render a record as a DynamoDB item
pub fn record_to_item(record: &ScheduleRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert(ATTR_KEY.to_string(), AttributeValue::S(record.key.to_string()));
    item.insert(
        ATTR_GROUP_NAME.to_string(),
        AttributeValue::S(record.group_name.clone()),
    );
    if let Some(execution_time) = &record.execution_time {
        item.insert(
            ATTR_EXECUTION_TIME.to_string(),
            AttributeValue::S(format_utc(execution_time)),
        );
    }
    if record.is_tombstone() {
        item.insert(ATTR_DELETED.to_string(), AttributeValue::Bool(true));
    }
    item.insert(
        ATTR_EXPIRES_AT.to_string(),
        AttributeValue::N(record.expires_at.to_string()),
    );
    item.insert(
        ATTR_LAST_EVENT_TIME.to_string(),
        AttributeValue::N(record.last_event_time.timestamp_millis().to_string()),
    );
    item
}

/// Parse a DynamoDB item back into a record
pub fn item_to_record(item: &HashMap<String, AttributeValue>) -> Result<ScheduleRecord, StoreError> {
    let raw_key = string_attr(item, ATTR_KEY, "<unknown>")?;
    let key: ScheduleKey = raw_key.parse()?;
    let malformed = |reason: String| StoreError::MalformedRecord {
        key: raw_key.clone(),
        reason,
    };

    let group_name = string_attr(item, ATTR_GROUP_NAME, &raw_key)?;

    let execution_time = match item.get(ATTR_EXECUTION_TIME) {
        Some(AttributeValue::S(value)) => Some(
            DateTime::parse_from_rfc3339(value)
                .map_err(|e| malformed(format!("executionTime: {}", e)))?
                .with_timezone(&Utc),
        ),
        Some(_) => return Err(malformed("executionTime is not a string".to_string())),
        None => None,
    };

    let deleted = match item.get(ATTR_DELETED) {
        Some(AttributeValue::Bool(true)) => Some(true),
        Some(AttributeValue::Bool(false)) | None => None,
        Some(_) => return Err(malformed("deleted is not a boolean".to_string())),
    };

    let expires_at = number_attr(item, ATTR_EXPIRES_AT, &raw_key)?;
    let last_event_millis = number_attr(item, ATTR_LAST_EVENT_TIME, &raw_key)?;
    let last_event_time = Utc
        .timestamp_millis_opt(last_event_millis)
        .single()
        .ok_or_else(|| malformed(format!("lastEventTime {} out of range", last_event_millis)))?;

    Ok(ScheduleRecord {
        key,
        group_name,
        execution_time,
        deleted,
        expires_at,
        last_event_time,
    })
}

fn string_attr(
    item: &HashMap<String, AttributeValue>,
    name: &str,
    key: &str,
) -> Result<String, StoreError> {
    match item.get(name) {
        Some(AttributeValue::S(value)) => Ok(value.clone()),
        _ => Err(StoreError::MalformedRecord {
            key: key.to_string(),
            reason: format!("{} missing or not a string", name),
        }),
    }
}

fn number_attr(
    item: &HashMap<String, AttributeValue>,
    name: &str,
    key: &str,
) -> Result<i64, StoreError> {
    match item.get(name) {
        Some(AttributeValue::N(value)) => value.parse().map_err(|_| StoreError::MalformedRecord {
            key: key.to_string(),
            reason: format!("{} '{}' is not an integer", name, value),
        }),
        _ => Err(StoreError::MalformedRecord {
            key: key.to_string(),
            reason: format!("{} missing or not a number", name),
        }),
    }
}

#[async_trait]
impl StateStore for DynamoStateStore {
    #[instrument(skip(self, candidate), fields(schedule = %candidate.key, table_name = %self.table_name))]
    async fn apply_if_newer(&self, candidate: &ScheduleRecord) -> Result<ApplyOutcome, StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(record_to_item(candidate)))
            .condition_expression(NEWER_EVENT_CONDITION)
            .expression_attribute_values(
                ":candidateEventTime",
                AttributeValue::N(candidate.last_event_time.timestamp_millis().to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!("Conditional put applied");
                Ok(ApplyOutcome::Applied)
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_conditional_check_failed_exception() {
                    debug!("Conditional put rejected, a newer event already won");
                    Ok(ApplyOutcome::Superseded)
                } else {
                    error!(error = %service_error, "DynamoDB put_item failed");
                    Err(StoreError::Unavailable(format!(
                        "DynamoDB put_item failed: {}",
                        service_error
                    )))
                }
            }
        }
    }

    #[instrument(skip(self), fields(schedule = %key))]
    async fn get(&self, key: &ScheduleKey) -> Result<Option<ScheduleRecord>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_KEY, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "DynamoDB get_item failed: {}",
                    e.into_service_error()
                ))
            })?;

        output.item().map(item_to_record).transpose()
    }

    #[instrument(skip(self), fields(table_name = %self.table_name))]
    async fn health_check(&self) -> Result<(), StoreError> {
        self.client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "DynamoDB describe_table failed: {}",
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }
}
