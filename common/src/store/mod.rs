// State store seam
//
// Records are only ever written through a conditional put: the write lands
// if the stored record has no lastEventTime yet, or an older one. A rejected
// condition is reported as `ApplyOutcome::Superseded`, never as an error.

pub mod dynamodb;
pub mod memory;
pub mod postgres;

pub use dynamodb::DynamoStateStore;
pub use memory::MemoryStateStore;
pub use postgres::PostgresStateStore;

use crate::errors::StoreError;
use crate::models::{ApplyOutcome, ScheduleKey, ScheduleRecord};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the stored record with `candidate` if the stored
    /// `last_event_time` is absent or strictly older
    async fn apply_if_newer(&self, candidate: &ScheduleRecord) -> Result<ApplyOutcome, StoreError>;

    /// Read the current record for a key
    async fn get(&self, key: &ScheduleKey) -> Result<Option<ScheduleRecord>, StoreError>;

    /// Verify the backing store is reachable
    async fn health_check(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn apply_if_newer(&self, candidate: &ScheduleRecord) -> Result<ApplyOutcome, StoreError> {
        (**self).apply_if_newer(candidate).await
    }

    async fn get(&self, key: &ScheduleKey) -> Result<Option<ScheduleRecord>, StoreError> {
        (**self).get(key).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        (**self).health_check().await
    }
}
