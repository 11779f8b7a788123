// Change notification parsing
//
// The audit bridge wraps every scheduler API call in an envelope whose
// `detail` carries the event name, event time and the request parameters of
// the call. Queue deliveries arrive as batches of such envelopes.

use crate::errors::NotificationError;
use crate::models::{ChangeKind, ChangeNotification, DEFAULT_GROUP_NAME};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Envelope {
    detail: Detail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Detail {
    event_name: Option<String>,
    event_time: Option<String>,
    #[serde(default)]
    request_parameters: Option<RequestParameters>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestParameters {
    name: Option<String>,
    group_name: Option<String>,
    schedule_expression: Option<String>,
    schedule_expression_timezone: Option<String>,
    client_token: Option<String>,
    action_after_completion: Option<String>,
}

/// Queue-style batch: `{"Records": [{"messageId": ..., "body": "<envelope json>"}]}`
#[derive(Debug, Deserialize)]
struct QueueBatch {
    #[serde(rename = "Records")]
    records: Vec<QueueRecord>,
}

#[derive(Debug, Deserialize)]
struct QueueRecord {
    #[serde(rename = "messageId", default)]
    message_id: Option<String>,
    body: String,
}

/// One raw notification body together with its transport id, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub message_id: Option<String>,
    pub body: String,
}

impl RawNotification {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: None,
            body: body.into(),
        }
    }
}

/// Parse one envelope into a change notification
pub fn parse_notification(body: &str) -> Result<ChangeNotification, NotificationError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    let detail = envelope.detail;

    let event_name = detail
        .event_name
        .ok_or_else(|| NotificationError::MissingField("detail.eventName".to_string()))?;
    let kind: ChangeKind = event_name
        .parse()
        .map_err(NotificationError::UnsupportedEvent)?;

    let raw_time = detail
        .event_time
        .ok_or_else(|| NotificationError::MissingField("detail.eventTime".to_string()))?;
    let event_time = DateTime::parse_from_rfc3339(&raw_time)
        .map_err(|e| NotificationError::InvalidEventTime {
            value: raw_time.clone(),
            reason: e.to_string(),
        })?
        .with_timezone(&Utc)
        // Every store compares lastEventTime at millisecond precision
        .trunc_subsecs(3);

    let params = detail.request_parameters.unwrap_or_default();
    let schedule_name = params
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| NotificationError::MissingField("requestParameters.name".to_string()))?;
    let group_name = params
        .group_name
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());

    Ok(ChangeNotification {
        kind,
        event_time,
        group_name,
        schedule_name,
        schedule_expression: params.schedule_expression,
        schedule_expression_timezone: params.schedule_expression_timezone,
        client_token: params.client_token,
        action_after_completion: params.action_after_completion,
    })
}

/// Split a delivered payload into individual notification bodies.
///
/// Accepts a queue batch (`{"Records": [...]}`), a JSON array of envelopes,
/// or a single envelope.
pub fn split_batch_payload(payload: &str) -> Result<Vec<RawNotification>, NotificationError> {
    let value: serde_json::Value = serde_json::from_str(payload)?;

    if value.get("Records").is_some() {
        let batch: QueueBatch = serde_json::from_value(value)?;
        return Ok(batch
            .records
            .into_iter()
            .map(|r| RawNotification {
                message_id: r.message_id,
                body: r.body,
            })
            .collect());
    }

    match value {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| RawNotification::new(item.to_string()))
            .collect()),
        single => Ok(vec![RawNotification::new(single.to_string())]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_name: &str, event_time: &str, params: serde_json::Value) -> String {
        json!({
            "version": "0",
            "source": "aws.scheduler",
            "detail-type": "AWS API Call via CloudTrail",
            "detail": {
                "eventSource": "scheduler.amazonaws.com",
                "eventName": event_name,
                "eventTime": event_time,
                "requestParameters": params
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_create_notification() {
        let body = envelope(
            "CreateSchedule",
            "2025-04-01T10:00:00Z",
            json!({
                "name": "S1",
                "groupName": "g",
                "scheduleExpression": "at(2025-04-02T09:00:00)",
                "scheduleExpressionTimezone": "Europe/Paris",
                "flexibleTimeWindow": {"mode": "OFF"},
                "clientToken": "tok-1",
                "actionAfterCompletion": "DELETE"
            }),
        );

        let notification = parse_notification(&body).unwrap();
        assert_eq!(notification.kind, ChangeKind::Create);
        assert_eq!(notification.schedule_name, "S1");
        assert_eq!(notification.group_name, "g");
        assert_eq!(
            notification.schedule_expression.as_deref(),
            Some("at(2025-04-02T09:00:00)")
        );
        assert_eq!(
            notification.schedule_expression_timezone.as_deref(),
            Some("Europe/Paris")
        );
        assert_eq!(notification.client_token.as_deref(), Some("tok-1"));
        assert_eq!(notification.key().unwrap().to_string(), "g#S1");
    }

    #[test]
    fn test_parse_delete_notification_defaults_group() {
        let body = envelope("DeleteSchedule", "2025-04-01T10:00:00Z", json!({"name": "S1"}));
        let notification = parse_notification(&body).unwrap();
        assert_eq!(notification.kind, ChangeKind::Delete);
        assert_eq!(notification.group_name, "default");
        assert!(notification.schedule_expression.is_none());
    }

    #[test]
    fn test_event_time_is_truncated_to_millis() {
        let body = envelope(
            "UpdateSchedule",
            "2025-04-01T10:00:00.123456789Z",
            json!({"name": "S1", "scheduleExpression": "at(2025-04-02T09:00:00)"}),
        );
        let notification = parse_notification(&body).unwrap();
        assert_eq!(notification.event_time.timestamp_millis(), 1_743_501_600_123);
        assert_eq!(notification.event_time.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_parse_rejects_unrelated_events() {
        let body = envelope("TagResource", "2025-04-01T10:00:00Z", json!({"name": "S1"}));
        assert!(matches!(
            parse_notification(&body),
            Err(NotificationError::UnsupportedEvent(name)) if name == "TagResource"
        ));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let no_name = envelope("CreateSchedule", "2025-04-01T10:00:00Z", json!({}));
        assert!(matches!(
            parse_notification(&no_name),
            Err(NotificationError::MissingField(_))
        ));

        let bad_time = envelope("CreateSchedule", "yesterday", json!({"name": "S1"}));
        assert!(matches!(
            parse_notification(&bad_time),
            Err(NotificationError::InvalidEventTime { .. })
        ));

        assert!(matches!(
            parse_notification("{\"no_detail\": true}"),
            Err(NotificationError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_split_queue_batch() {
        let body = envelope("DeleteSchedule", "2025-04-01T10:00:00Z", json!({"name": "S1"}));
        let payload = json!({
            "Records": [
                {"messageId": "m-1", "body": body},
                {"messageId": "m-2", "body": "not json"}
            ]
        })
        .to_string();

        let records = split_batch_payload(&payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message_id.as_deref(), Some("m-1"));
        assert!(parse_notification(&records[0].body).is_ok());
        assert!(parse_notification(&records[1].body).is_err());
    }

    #[test]
    fn test_split_array_and_single_envelope() {
        let body = envelope("DeleteSchedule", "2025-04-01T10:00:00Z", json!({"name": "S1"}));
        let array = format!("[{},{}]", body, body);
        assert_eq!(split_batch_payload(&array).unwrap().len(), 2);

        let single = split_batch_payload(&body).unwrap();
        assert_eq!(single.len(), 1);
        assert!(parse_notification(&single[0].body).is_ok());
    }
}
