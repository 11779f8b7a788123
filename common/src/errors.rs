// Error handling framework
// Lifecycle client, reconciliation engine, state stores and notification queue

use thiserror::Error;

/// Responses from the external scheduler service that are not a success.
///
/// `AlreadyExists` and `NotFound` are conflicts that drive the create/update
/// fallback; `RateLimited` is retried with a fixed backoff. Everything else is
/// terminal for the current call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerApiError {
    #[error("Schedule already exists")]
    AlreadyExists,

    #[error("Schedule not found")]
    NotFound,

    #[error("Request was rate limited by the scheduler service")]
    RateLimited,

    #[error("Scheduler service error: {0}")]
    Other(String),
}

impl SchedulerApiError {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerApiError::AlreadyExists => "already_exists",
            SchedulerApiError::NotFound => "not_found",
            SchedulerApiError::RateLimited => "rate_limited",
            SchedulerApiError::Other(_) => "other",
        }
    }
}

/// Schedule expression and timezone errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Local time {local} does not exist in timezone {timezone}")]
    NonexistentLocalTime { local: String, timezone: String },
}

/// State store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid schedule key: {0}")]
    InvalidKey(String),

    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("State store query failed: {0}")]
    QueryFailed(String),

    #[error("Malformed stored record for {key}: {reason}")]
    MalformedRecord { key: String, reason: String },
}

/// Change notification parsing errors
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Invalid notification JSON: {0}")]
    InvalidJson(String),

    #[error("Unsupported event name: {0}")]
    UnsupportedEvent(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid event time '{value}': {reason}")]
    InvalidEventTime { value: String, reason: String },
}

/// Validation errors for lifecycle requests and configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Failed to create consumer: {0}")]
    ConsumerCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Failed to consume message: {0}")]
    ConsumeFailed(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::InvalidJson(err.to_string())
    }
}

impl StoreError {
    /// Whether retrying the same write may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::QueryFailed(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

impl From<ScheduleError> for ValidationError {
    fn from(err: ScheduleError) -> Self {
        ValidationError::InvalidFieldValue {
            field: "timezone".to_string(),
            reason: err.to_string(),
        }
    }
}
