// Event reconciliation engine
//
// Applies batches of unordered, possibly duplicated change notifications to
// the state store. Convergence comes entirely from the store's conditional
// put keyed on the notification's event time; sorting a batch first only
// cuts down on rejected writes.

use crate::errors::StoreError;
use crate::models::{ApplyOutcome, ChangeKind, ChangeNotification, ScheduleRecord};
use crate::notification::{parse_notification, RawNotification};
use crate::schedule;
use crate::store::StateStore;
use crate::telemetry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Default pause between successive store writes within a batch
pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

/// Source of processing time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a single instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Pause inserted between successive applies within one batch
    pub pacing: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            pacing: DEFAULT_PACING,
        }
    }
}

/// What happened to one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDisposition {
    Applied,
    /// Rejected by the conditional put; a newer event already won
    Superseded,
    /// Neither an execution time nor a tombstone
    Skipped,
    /// Permanently unwritable, such as a malformed key; redelivery cannot help
    Rejected,
    /// Transient store error; the write may succeed on redelivery
    Failed,
}

impl RecordDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordDisposition::Applied => "applied",
            RecordDisposition::Superseded => "superseded",
            RecordDisposition::Skipped => "skipped",
            RecordDisposition::Rejected => "rejected",
            RecordDisposition::Failed => "failed",
        }
    }
}

/// Per-batch tallies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub received: usize,
    pub parse_failures: usize,
    pub applied: usize,
    pub superseded: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl BatchReport {
    /// True when at least one write failed transiently; replaying the batch
    /// is safe since already-applied events are superseded. Rejected
    /// notifications never count.
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    fn record(&mut self, disposition: RecordDisposition) {
        match disposition {
            RecordDisposition::Applied => self.applied += 1,
            RecordDisposition::Superseded => self.superseded += 1,
            RecordDisposition::Skipped => self.skipped += 1,
            RecordDisposition::Rejected => self.rejected += 1,
            RecordDisposition::Failed => self.failed += 1,
        }
    }
}

/// Build the record a notification would leave in the store.
///
/// Unresolvable schedule expressions yield no execution time; the caller
/// decides whether the candidate is worth applying.
pub fn build_candidate(
    notification: &ChangeNotification,
    processed_at: DateTime<Utc>,
) -> Result<ScheduleRecord, StoreError> {
    let key = notification.key()?;

    let execution_time = match (&notification.kind, &notification.schedule_expression) {
        (ChangeKind::Delete, _) | (_, None) => None,
        (_, Some(expression)) => {
            match schedule::resolve_execution_time(
                expression,
                notification.schedule_expression_timezone.as_deref(),
            ) {
                Ok(instant) => Some(instant),
                Err(e) => {
                    debug!(schedule = %key, error = %e, "Schedule expression not resolvable");
                    None
                }
            }
        }
    };

    let deleted = (notification.kind == ChangeKind::Delete).then_some(true);

    Ok(ScheduleRecord {
        group_name: notification.group_name.clone(),
        key,
        execution_time,
        deleted,
        expires_at: schedule::expires_at(execution_time, processed_at),
        last_event_time: notification.event_time,
    })
}

/// Batch reconciler over an injected state store
pub struct Reconciler<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl<S: StateStore> Reconciler<S> {
    pub fn new(store: S, config: ReconcilerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: ReconcilerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Parse raw notification bodies and reconcile the ones that parse.
    /// Unparsable bodies are logged, counted and dropped.
    #[instrument(skip_all, fields(batch_size = raw.len()))]
    pub async fn reconcile_raw(&self, raw: &[RawNotification]) -> BatchReport {
        let mut notifications = Vec::with_capacity(raw.len());
        let mut parse_failures = 0;

        for item in raw {
            match parse_notification(&item.body) {
                Ok(notification) => notifications.push(notification),
                Err(e) => {
                    warn!(
                        message_id = item.message_id.as_deref().unwrap_or("-"),
                        error = %e,
                        "Dropping unparsable notification"
                    );
                    telemetry::record_reconcile_result("parse_failed");
                    parse_failures += 1;
                }
            }
        }

        let mut report = self.reconcile_batch(notifications).await;
        report.received += parse_failures;
        report.parse_failures = parse_failures;
        report
    }

    /// Apply a batch of notifications in ascending event-time order
    #[instrument(skip_all, fields(batch_size = notifications.len()))]
    pub async fn reconcile_batch(&self, mut notifications: Vec<ChangeNotification>) -> BatchReport {
        telemetry::record_batch_size(notifications.len());
        let mut report = BatchReport {
            received: notifications.len(),
            ..BatchReport::default()
        };

        notifications.sort_by_key(|n| n.event_time);

        let mut writes = 0usize;
        for notification in &notifications {
            let candidate = match build_candidate(notification, self.clock.now()) {
                Ok(candidate) => candidate,
                Err(e) => {
                    error!(
                        schedule = %notification.schedule_name,
                        group = %notification.group_name,
                        error = %e,
                        "Cannot build record for notification, rejecting"
                    );
                    report.record(RecordDisposition::Rejected);
                    telemetry::record_reconcile_result(RecordDisposition::Rejected.as_str());
                    continue;
                }
            };

            if !candidate.is_actionable() {
                info!(
                    schedule = %candidate.key,
                    event_name = %notification.kind,
                    expression = notification.schedule_expression.as_deref().unwrap_or("-"),
                    "No execution time and not a deletion, skipping"
                );
                report.record(RecordDisposition::Skipped);
                telemetry::record_reconcile_result(RecordDisposition::Skipped.as_str());
                continue;
            }

            if writes > 0 && !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }
            writes += 1;

            let disposition = self.apply(notification, &candidate).await;
            report.record(disposition);
            telemetry::record_reconcile_result(disposition.as_str());
        }

        info!(
            received = report.received,
            applied = report.applied,
            superseded = report.superseded,
            skipped = report.skipped,
            rejected = report.rejected,
            failed = report.failed,
            "Batch reconciled"
        );
        report
    }

    async fn apply(
        &self,
        notification: &ChangeNotification,
        candidate: &ScheduleRecord,
    ) -> RecordDisposition {
        match self.store.apply_if_newer(candidate).await {
            Ok(ApplyOutcome::Applied) => {
                info!(
                    schedule = %candidate.key,
                    event_name = %notification.kind,
                    event_time = %notification.event_time,
                    deleted = candidate.is_tombstone(),
                    "Record updated"
                );
                RecordDisposition::Applied
            }
            Ok(ApplyOutcome::Superseded) => {
                info!(
                    schedule = %candidate.key,
                    event_name = %notification.kind,
                    event_time = %notification.event_time,
                    "Newer event already applied, skipping"
                );
                RecordDisposition::Superseded
            }
            Err(e) => {
                error!(
                    schedule = %candidate.key,
                    event_name = %notification.kind,
                    transient = e.is_transient(),
                    error = %e,
                    "Failed to apply record"
                );
                if e.is_transient() {
                    RecordDisposition::Failed
                } else {
                    RecordDisposition::Rejected
                }
            }
        }
    }
}
