// In-process state store
//
// The conditional put is simulated with read-compare-write under a single
// mutex. That is only atomic inside this process: two processes sharing a
// logical key space get no last-writer-wins guarantee from it.

use super::StateStore;
use crate::errors::StoreError;
use crate::models::{ApplyOutcome, ScheduleKey, ScheduleRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<ScheduleKey, ScheduleRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored record, ordered by key
    pub fn snapshot(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        let records = self.lock()?;
        let mut all: Vec<ScheduleRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ScheduleKey, ScheduleRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn apply_if_newer(&self, candidate: &ScheduleRecord) -> Result<ApplyOutcome, StoreError> {
        let mut records = self.lock()?;

        if let Some(stored) = records.get(&candidate.key) {
            if stored.last_event_time >= candidate.last_event_time {
                debug!(
                    schedule = %candidate.key,
                    stored_event_time = %stored.last_event_time,
                    candidate_event_time = %candidate.last_event_time,
                    "Conditional put rejected"
                );
                return Ok(ApplyOutcome::Superseded);
            }
        }

        records.insert(candidate.key.clone(), candidate.clone());
        Ok(ApplyOutcome::Applied)
    }

    async fn get(&self, key: &ScheduleKey) -> Result<Option<ScheduleRecord>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}
