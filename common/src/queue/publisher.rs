// Notification publisher for NATS JetStream

use crate::errors::QueueError;
use crate::models::ChangeNotification;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::context::PublishAckFuture;
use chrono::SecondsFormat;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Render a notification as the audit envelope the reconciler consumes
pub fn to_envelope(notification: &ChangeNotification) -> serde_json::Value {
    let mut params = serde_json::Map::new();
    params.insert("name".into(), json!(notification.schedule_name));
    params.insert("groupName".into(), json!(notification.group_name));
    if let Some(expression) = &notification.schedule_expression {
        params.insert("scheduleExpression".into(), json!(expression));
    }
    if let Some(timezone) = &notification.schedule_expression_timezone {
        params.insert("scheduleExpressionTimezone".into(), json!(timezone));
    }
    if let Some(token) = &notification.client_token {
        params.insert("clientToken".into(), json!(token));
    }
    if let Some(action) = &notification.action_after_completion {
        params.insert("actionAfterCompletion".into(), json!(action));
    }

    json!({
        "source": "aws.scheduler",
        "detail-type": "AWS API Call via CloudTrail",
        "detail": {
            "eventSource": "scheduler.amazonaws.com",
            "eventName": notification.kind.event_name(),
            "eventTime": notification
                .event_time
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            "requestParameters": params,
        }
    })
}

/// JetStream deduplication id: one per schedule, event kind and event time
pub fn dedup_id(notification: &ChangeNotification) -> String {
    format!(
        "{}#{}#{}:{}",
        notification.group_name,
        notification.schedule_name,
        notification.kind.event_name(),
        notification.event_time.timestamp_millis()
    )
}

/// Publishes change notification envelopes onto the stream
#[async_trait::async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, notification: &ChangeNotification) -> Result<(), QueueError>;
}

/// NATS-based notification publisher
pub struct NatsNotificationPublisher {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsNotificationPublisher {
    pub fn new(client: NatsClient) -> Self {
        Self {
            client,
            publish_timeout: Duration::from_secs(5),
        }
    }

    /// Create a publisher with a custom acknowledgment timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn subject(&self, group_name: &str) -> String {
        format!("{}.{}", self.client.subject_prefix(), group_name)
    }
}

#[async_trait::async_trait]
impl NotificationPublisher for NatsNotificationPublisher {
    #[instrument(skip(self, notification), fields(
        schedule = %notification.schedule_name,
        group = %notification.group_name,
        event_name = %notification.kind
    ))]
    async fn publish(&self, notification: &ChangeNotification) -> Result<(), QueueError> {
        let payload = to_envelope(notification).to_string();
        let subject = self.subject(&notification.group_name);

        // Duplicate audit events inside the stream's dedup window are dropped
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", dedup_id(notification).as_str());
        headers.insert("Publish-Id", Uuid::new_v4().to_string().as_str());

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(_ack)) => {
                debug!(subject = %subject, "Notification published");
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}
