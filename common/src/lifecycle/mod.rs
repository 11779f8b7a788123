// Schedule lifecycle client
//
// Drives create/update/delete against the external scheduler service. Create
// and update fall back to each other on existence conflicts so either call
// converges on "this schedule exists with this state"; rate limiting is
// ridden out with a fixed-delay retry budget. Nothing escapes as an error:
// every path ends in a `LifecycleResult`.

pub mod eventbridge;

pub use eventbridge::EventBridgeScheduler;

use crate::errors::SchedulerApiError;
use crate::models::ScheduleRequest;
use crate::retry::{FixedDelay, RetryStrategy};
use crate::telemetry;
use async_trait::async_trait;
use std::fmt;
use tracing::{info, instrument, warn};

/// Default number of create/update switches allowed within one call
pub const DEFAULT_MAX_CONFLICT_FALLBACKS: u32 = 3;

/// The scheduler service seen through the three by-name operations it offers
#[async_trait]
pub trait SchedulerService: Send + Sync {
    async fn create_schedule(&self, request: &ScheduleRequest) -> Result<(), SchedulerApiError>;

    async fn update_schedule(&self, request: &ScheduleRequest) -> Result<(), SchedulerApiError>;

    async fn delete_schedule(&self, name: &str, group_name: &str)
        -> Result<(), SchedulerApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// The operation a conflict response redirects to, if any
    fn fallback_for(&self, error: &SchedulerApiError) -> Option<Operation> {
        match (self, error) {
            (Operation::Create, SchedulerApiError::AlreadyExists) => Some(Operation::Update),
            (Operation::Update, SchedulerApiError::NotFound) => Some(Operation::Create),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a lifecycle call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Succeeded,
    /// Create and update kept redirecting to each other
    FailedConflictExhausted,
    /// Still rate limited after the retry budget was spent
    FailedRateLimitExhausted,
    FailedOther(String),
}

impl LifecycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Succeeded => "succeeded",
            LifecycleOutcome::FailedConflictExhausted => "failed_conflict_exhausted",
            LifecycleOutcome::FailedRateLimitExhausted => "failed_rate_limit_exhausted",
            LifecycleOutcome::FailedOther(_) => "failed_other",
        }
    }
}

/// Result of a lifecycle call, with enough bookkeeping to tell what happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleResult {
    pub outcome: LifecycleOutcome,
    /// The operation requested by the caller
    pub requested: Operation,
    /// The operation that produced the terminal response
    pub last_operation: Operation,
    /// Number of calls made against the service
    pub attempts: u32,
    /// Number of fixed-delay waits after rate-limited responses
    pub backoff_waits: u32,
    /// Number of create/update switches taken
    pub fallbacks: u32,
}

impl LifecycleResult {
    pub fn is_success(&self) -> bool {
        self.outcome == LifecycleOutcome::Succeeded
    }

    /// Failure cause, if any
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            LifecycleOutcome::Succeeded => None,
            LifecycleOutcome::FailedConflictExhausted => {
                Some("create/update conflict fallbacks exhausted".to_string())
            }
            LifecycleOutcome::FailedRateLimitExhausted => {
                Some("rate limit retries exhausted".to_string())
            }
            LifecycleOutcome::FailedOther(cause) => Some(cause.clone()),
        }
    }
}

/// Retry and fallback limits for the lifecycle client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub rate_limit: FixedDelay,
    pub max_conflict_fallbacks: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            rate_limit: FixedDelay::default(),
            max_conflict_fallbacks: DEFAULT_MAX_CONFLICT_FALLBACKS,
        }
    }
}

/// Lifecycle client over an injected scheduler service.
///
/// Calls on different schedule names never interact. Concurrent calls on the
/// same name are not serialized here; the service's conflict responses drive
/// convergence.
pub struct ScheduleLifecycleClient<S> {
    service: S,
    config: LifecycleConfig,
}

impl<S: SchedulerService> ScheduleLifecycleClient<S> {
    pub fn new(service: S) -> Self {
        Self::with_config(service, LifecycleConfig::default())
    }

    pub fn with_config(service: S, config: LifecycleConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Ensure the schedule exists with the requested state, creating it first
    #[instrument(skip(self, request), fields(schedule = %request.name, group = %request.group_name))]
    pub async fn create(&self, request: &ScheduleRequest) -> LifecycleResult {
        self.converge(Operation::Create, request).await
    }

    /// Ensure the schedule exists with the requested state, updating it first
    #[instrument(skip(self, request), fields(schedule = %request.name, group = %request.group_name))]
    pub async fn update(&self, request: &ScheduleRequest) -> LifecycleResult {
        self.converge(Operation::Update, request).await
    }

    /// Delete a schedule by name. Single attempt: no retry, no fallback.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str, group_name: &str) -> LifecycleResult {
        let outcome = match self.service.delete_schedule(name, group_name).await {
            Ok(()) => {
                info!("Schedule deleted");
                LifecycleOutcome::Succeeded
            }
            Err(e) => {
                warn!(error = %e, error_kind = e.kind(), "Schedule delete failed");
                LifecycleOutcome::FailedOther(e.to_string())
            }
        };

        let result = LifecycleResult {
            outcome,
            requested: Operation::Delete,
            last_operation: Operation::Delete,
            attempts: 1,
            backoff_waits: 0,
            fallbacks: 0,
        };
        telemetry::record_lifecycle_result(&result);
        result
    }

    /// Bounded state machine shared by create and update.
    ///
    /// The rate-limit budget and the fallback budget are both per call and
    /// shared across the create/update switches made within it.
    async fn converge(&self, requested: Operation, request: &ScheduleRequest) -> LifecycleResult {
        let mut operation = requested;
        let mut attempts = 0u32;
        let mut backoff_waits = 0u32;
        let mut fallbacks = 0u32;

        let outcome = loop {
            attempts += 1;
            let response = match operation {
                Operation::Create => self.service.create_schedule(request).await,
                _ => self.service.update_schedule(request).await,
            };

            let error = match response {
                Ok(()) => {
                    info!(operation = %operation, attempts, "Schedule converged");
                    break LifecycleOutcome::Succeeded;
                }
                Err(e) => e,
            };

            if let Some(next) = operation.fallback_for(&error) {
                if fallbacks >= self.config.max_conflict_fallbacks {
                    warn!(operation = %operation, fallbacks, "Conflict fallbacks exhausted");
                    break LifecycleOutcome::FailedConflictExhausted;
                }
                info!(
                    from = %operation,
                    to = %next,
                    error_kind = error.kind(),
                    "Existence conflict, switching operation"
                );
                fallbacks += 1;
                operation = next;
                continue;
            }

            if error == SchedulerApiError::RateLimited {
                match self.config.rate_limit.next_delay(backoff_waits) {
                    Some(delay) => {
                        warn!(
                            operation = %operation,
                            retry = backoff_waits + 1,
                            delay_ms = delay.as_millis() as u64,
                            "Rate limited, backing off"
                        );
                        telemetry::record_lifecycle_backoff(operation.as_str());
                        tokio::time::sleep(delay).await;
                        backoff_waits += 1;
                        continue;
                    }
                    None => {
                        warn!(operation = %operation, backoff_waits, "Rate limit retries exhausted");
                        break LifecycleOutcome::FailedRateLimitExhausted;
                    }
                }
            }

            warn!(
                operation = %operation,
                error = %error,
                error_kind = error.kind(),
                "Schedule operation failed"
            );
            break LifecycleOutcome::FailedOther(error.to_string());
        };

        let result = LifecycleResult {
            outcome,
            requested,
            last_operation: operation,
            attempts,
            backoff_waits,
            fallbacks,
        };
        telemetry::record_lifecycle_result(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mockall::mock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    mock! {
        pub Scheduler {}

        #[async_trait]
        impl SchedulerService for Scheduler {
            async fn create_schedule(&self, request: &ScheduleRequest) -> Result<(), SchedulerApiError>;
            async fn update_schedule(&self, request: &ScheduleRequest) -> Result<(), SchedulerApiError>;
            async fn delete_schedule(&self, name: &str, group_name: &str) -> Result<(), SchedulerApiError>;
        }
    }

    fn request() -> ScheduleRequest {
        ScheduleRequest::builder("S1", "g")
            .payload(r#"{"hello":"world"}"#)
            .target("arn:aws:sqs:us-east-1:1:q", "arn:aws:iam::1:role/r")
            .fire_time(
                NaiveDate::from_ymd_opt(2025, 5, 1)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            rate_limit: FixedDelay::new(Duration::from_millis(1), 3),
            max_conflict_fallbacks: 3,
        }
    }

    #[tokio::test]
    async fn test_create_success() {
        let mut service = MockScheduler::new();
        service.expect_create_schedule().times(1).returning(|_| Ok(()));
        service.expect_update_schedule().never();

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.create(&request()).await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.last_operation, Operation::Create);
    }

    #[tokio::test]
    async fn test_create_already_exists_falls_back_to_update() {
        let expected = request();
        let mut service = MockScheduler::new();
        service
            .expect_create_schedule()
            .times(1)
            .returning(|_| Err(SchedulerApiError::AlreadyExists));
        let same_request = expected.clone();
        service
            .expect_update_schedule()
            .withf(move |r| *r == same_request)
            .times(1)
            .returning(|_| Ok(()));

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.create(&expected).await;

        assert_eq!(result.outcome, LifecycleOutcome::Succeeded);
        assert_eq!(result.requested, Operation::Create);
        assert_eq!(result.last_operation, Operation::Update);
        assert_eq!(result.fallbacks, 1);
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn test_update_not_found_falls_back_to_create() {
        let mut service = MockScheduler::new();
        service
            .expect_update_schedule()
            .times(1)
            .returning(|_| Err(SchedulerApiError::NotFound));
        service.expect_create_schedule().times(1).returning(|_| Ok(()));

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.update(&request()).await;

        assert!(result.is_success());
        assert_eq!(result.last_operation, Operation::Create);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_rate_limited_twice_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut service = MockScheduler::new();
        service.expect_create_schedule().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SchedulerApiError::RateLimited)
            } else {
                Ok(())
            }
        });

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.create(&request()).await;

        assert!(result.is_success());
        assert_eq!(result.backoff_waits, 2);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_budget_exhausted() {
        let mut service = MockScheduler::new();
        // One initial attempt plus three retries
        service
            .expect_update_schedule()
            .times(4)
            .returning(|_| Err(SchedulerApiError::RateLimited));

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.update(&request()).await;

        assert_eq!(result.outcome, LifecycleOutcome::FailedRateLimitExhausted);
        assert_eq!(result.backoff_waits, 3);
        assert!(result.error().is_some());
    }

    #[tokio::test]
    async fn test_conflict_ping_pong_is_bounded() {
        let mut service = MockScheduler::new();
        service
            .expect_create_schedule()
            .returning(|_| Err(SchedulerApiError::AlreadyExists));
        service
            .expect_update_schedule()
            .returning(|_| Err(SchedulerApiError::NotFound));

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.create(&request()).await;

        assert_eq!(result.outcome, LifecycleOutcome::FailedConflictExhausted);
        assert_eq!(result.fallbacks, 3);
        assert_eq!(result.attempts, 4);
    }

    #[tokio::test]
    async fn test_other_error_is_terminal() {
        let mut service = MockScheduler::new();
        service
            .expect_create_schedule()
            .times(1)
            .returning(|_| Err(SchedulerApiError::Other("validation failed".into())));

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.create(&request()).await;

        assert_eq!(
            result.outcome,
            LifecycleOutcome::FailedOther("Scheduler service error: validation failed".into())
        );
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_update_conflict_without_fallback_is_terminal() {
        let mut service = MockScheduler::new();
        service
            .expect_update_schedule()
            .times(1)
            .returning(|_| Err(SchedulerApiError::AlreadyExists));
        service.expect_create_schedule().never();

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.update(&request()).await;

        assert!(matches!(result.outcome, LifecycleOutcome::FailedOther(_)));
    }

    #[tokio::test]
    async fn test_delete_is_single_attempt() {
        let mut service = MockScheduler::new();
        service
            .expect_delete_schedule()
            .withf(|name, group| name == "S1" && group == "g")
            .times(1)
            .returning(|_, _| Err(SchedulerApiError::RateLimited));

        let client = ScheduleLifecycleClient::with_config(service, fast_config());
        let result = client.delete("S1", "g").await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.backoff_waits, 0);
    }
}
