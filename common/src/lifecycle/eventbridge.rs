// EventBridge Scheduler adapter for the lifecycle client

use super::SchedulerService;
use crate::errors::SchedulerApiError;
use crate::models::{ScheduleRequest, MAX_EVENT_AGE_SECONDS, MAX_EVENT_RETRIES_LIMIT};
use crate::schedule::at_expression;
use async_trait::async_trait;
use aws_sdk_scheduler::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_scheduler::operation::create_schedule::CreateScheduleError;
use aws_sdk_scheduler::operation::delete_schedule::DeleteScheduleError;
use aws_sdk_scheduler::operation::update_schedule::UpdateScheduleError;
use aws_sdk_scheduler::types::{
    ActionAfterCompletion, DeadLetterConfig, FlexibleTimeWindow, FlexibleTimeWindowMode,
    RetryPolicy, Target,
};
use aws_sdk_scheduler::Client;
use tracing::{debug, instrument};

/// Scheduler service backed by Amazon EventBridge Scheduler
#[derive(Clone)]
pub struct EventBridgeScheduler {
    client: Client,
}

impl EventBridgeScheduler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the shared AWS configuration
    pub async fn from_region(region: String, endpoint_url: Option<String>) -> Self {
        let mut config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(endpoint) = endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }

        let config = config_builder.load().await;
        Self::new(Client::new(&config))
    }

    fn flexible_time_window() -> Result<FlexibleTimeWindow, SchedulerApiError> {
        FlexibleTimeWindow::builder()
            .mode(FlexibleTimeWindowMode::Off)
            .build()
            .map_err(|e| SchedulerApiError::Other(format!("invalid time window: {}", e)))
    }

    fn target(request: &ScheduleRequest) -> Result<Target, SchedulerApiError> {
        let max_retries = i32::try_from(request.max_event_retries)
            .ok()
            .filter(|_| request.max_event_retries <= MAX_EVENT_RETRIES_LIMIT)
            .ok_or_else(|| {
                SchedulerApiError::Other(format!(
                    "max event retries {} exceeds {}",
                    request.max_event_retries, MAX_EVENT_RETRIES_LIMIT
                ))
            })?;

        let retry_policy = RetryPolicy::builder()
            .maximum_retry_attempts(max_retries)
            .maximum_event_age_in_seconds(MAX_EVENT_AGE_SECONDS as i32)
            .build();

        let dead_letter_config = request
            .dead_letter_arn
            .as_ref()
            .map(|arn| DeadLetterConfig::builder().arn(arn).build());

        Target::builder()
            .arn(&request.target_arn)
            .role_arn(&request.role_arn)
            .input(&request.payload)
            .retry_policy(retry_policy)
            .set_dead_letter_config(dead_letter_config)
            .build()
            .map_err(|e| SchedulerApiError::Other(format!("invalid target: {}", e)))
    }
}

fn map_create_error(err: SdkError<CreateScheduleError>) -> SchedulerApiError {
    match err.into_service_error() {
        e if e.is_conflict_exception() => SchedulerApiError::AlreadyExists,
        e if e.is_throttling_exception() => SchedulerApiError::RateLimited,
        e if e.is_resource_not_found_exception() => SchedulerApiError::NotFound,
        e => SchedulerApiError::Other(describe(e.code(), e.message())),
    }
}

fn map_update_error(err: SdkError<UpdateScheduleError>) -> SchedulerApiError {
    match err.into_service_error() {
        e if e.is_resource_not_found_exception() => SchedulerApiError::NotFound,
        e if e.is_throttling_exception() => SchedulerApiError::RateLimited,
        e if e.is_conflict_exception() => SchedulerApiError::AlreadyExists,
        e => SchedulerApiError::Other(describe(e.code(), e.message())),
    }
}

fn map_delete_error(err: SdkError<DeleteScheduleError>) -> SchedulerApiError {
    match err.into_service_error() {
        e if e.is_resource_not_found_exception() => SchedulerApiError::NotFound,
        e if e.is_throttling_exception() => SchedulerApiError::RateLimited,
        e => SchedulerApiError::Other(describe(e.code(), e.message())),
    }
}

fn describe(code: Option<&str>, message: Option<&str>) -> String {
    format!(
        "{}: {}",
        code.unwrap_or("Unknown"),
        message.unwrap_or("no error message")
    )
}

#[async_trait]
impl SchedulerService for EventBridgeScheduler {
    #[instrument(skip(self, request), fields(schedule = %request.name, group = %request.group_name))]
    async fn create_schedule(&self, request: &ScheduleRequest) -> Result<(), SchedulerApiError> {
        let expression = at_expression(&request.fire_time);
        debug!(expression = %expression, timezone = %request.timezone.name(), "Creating schedule");

        self.client
            .create_schedule()
            .name(&request.name)
            .group_name(&request.group_name)
            .schedule_expression(expression)
            .schedule_expression_timezone(request.timezone.name())
            .flexible_time_window(Self::flexible_time_window()?)
            .target(Self::target(request)?)
            .action_after_completion(ActionAfterCompletion::Delete)
            .send()
            .await
            .map_err(map_create_error)?;

        Ok(())
    }

    #[instrument(skip(self, request), fields(schedule = %request.name, group = %request.group_name))]
    async fn update_schedule(&self, request: &ScheduleRequest) -> Result<(), SchedulerApiError> {
        let expression = at_expression(&request.fire_time);
        debug!(expression = %expression, timezone = %request.timezone.name(), "Updating schedule");

        self.client
            .update_schedule()
            .name(&request.name)
            .group_name(&request.group_name)
            .schedule_expression(expression)
            .schedule_expression_timezone(request.timezone.name())
            .flexible_time_window(Self::flexible_time_window()?)
            .target(Self::target(request)?)
            .action_after_completion(ActionAfterCompletion::Delete)
            .send()
            .await
            .map_err(map_update_error)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_schedule(&self, name: &str, group_name: &str) -> Result<(), SchedulerApiError> {
        self.client
            .delete_schedule()
            .name(name)
            .group_name(group_name)
            .send()
            .await
            .map_err(map_delete_error)?;

        Ok(())
    }
}
