use crate::errors::{StoreError, ValidationError};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Default number of delivery attempts the scheduler makes against the target
pub const DEFAULT_MAX_EVENT_RETRIES: u32 = 5;

/// Upper bound the scheduler service accepts for target retry attempts
pub const MAX_EVENT_RETRIES_LIMIT: u32 = 185;

/// Maximum age of an undelivered event before the scheduler gives up on it
pub const MAX_EVENT_AGE_SECONDS: u32 = 900;

/// Group used by the scheduler service when a request omits one
pub const DEFAULT_GROUP_NAME: &str = "default";

const KEY_SEPARATOR: char = '#';

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(tz.name())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

// ============================================================================
// State Store Models
// ============================================================================

/// Composite `groupName#scheduleName` key of a schedule record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleKey {
    group_name: String,
    schedule_name: String,
}

impl ScheduleKey {
    /// Build a key from its parts. Neither part may be empty or contain `#`.
    pub fn new(
        group_name: impl Into<String>,
        schedule_name: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let group_name = group_name.into();
        let schedule_name = schedule_name.into();

        for (part, value) in [("group name", &group_name), ("schedule name", &schedule_name)] {
            if value.is_empty() {
                return Err(StoreError::InvalidKey(format!("{} is empty", part)));
            }
            if value.contains(KEY_SEPARATOR) {
                return Err(StoreError::InvalidKey(format!(
                    "{} '{}' contains '{}'",
                    part, value, KEY_SEPARATOR
                )));
            }
        }

        Ok(Self {
            group_name,
            schedule_name,
        })
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn schedule_name(&self) -> &str {
        &self.schedule_name
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.group_name, KEY_SEPARATOR, self.schedule_name)
    }
}

impl FromStr for ScheduleKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, name) = s
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| StoreError::InvalidKey(format!("'{}' has no separator", s)))?;
        Self::new(group, name)
    }
}

impl TryFrom<String> for ScheduleKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleKey> for String {
    fn from(key: ScheduleKey) -> Self {
        key.to_string()
    }
}

/// Last known state of a schedule as persisted in the state store.
///
/// A record is always written whole: the candidate built from the newest
/// notification replaces whatever was stored before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub key: ScheduleKey,
    pub group_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    /// Epoch seconds after which the store may garbage-collect the record
    pub expires_at: i64,
    pub last_event_time: DateTime<Utc>,
}

impl ScheduleRecord {
    pub fn is_tombstone(&self) -> bool {
        self.deleted == Some(true)
    }

    /// A candidate carries state worth applying only if it resolved an
    /// execution time or marks a deletion
    pub fn is_actionable(&self) -> bool {
        self.execution_time.is_some() || self.is_tombstone()
    }
}

/// Outcome of a conditional write against the state store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The candidate replaced the stored record (or created it)
    Applied,
    /// The stored record already reflects an equal or newer event
    Superseded,
}

// ============================================================================
// Change Notification Models
// ============================================================================

/// Lifecycle change reported by the scheduler's audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "CreateSchedule")]
    Create,
    #[serde(rename = "UpdateSchedule")]
    Update,
    #[serde(rename = "DeleteSchedule")]
    Delete,
}

impl ChangeKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            ChangeKind::Create => "CreateSchedule",
            ChangeKind::Update => "UpdateSchedule",
            ChangeKind::Delete => "DeleteSchedule",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CreateSchedule" => Ok(ChangeKind::Create),
            "UpdateSchedule" => Ok(ChangeKind::Update),
            "DeleteSchedule" => Ok(ChangeKind::Delete),
            other => Err(other.to_string()),
        }
    }
}

/// A single parsed change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub kind: ChangeKind,
    pub event_time: DateTime<Utc>,
    pub group_name: String,
    pub schedule_name: String,
    pub schedule_expression: Option<String>,
    pub schedule_expression_timezone: Option<String>,
    pub client_token: Option<String>,
    pub action_after_completion: Option<String>,
}

impl ChangeNotification {
    pub fn key(&self) -> Result<ScheduleKey, StoreError> {
        ScheduleKey::new(self.group_name.clone(), self.schedule_name.clone())
    }
}

// ============================================================================
// Lifecycle Models
// ============================================================================

/// Parameters for creating or updating a one-shot schedule.
///
/// Built by the caller, consumed by the lifecycle client and then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub name: String,
    pub group_name: String,
    /// JSON document delivered to the target when the schedule fires
    pub payload: String,
    pub target_arn: String,
    pub role_arn: String,
    #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
    pub timezone: Tz,
    /// Local wall-clock fire time in `timezone`, second precision
    pub fire_time: NaiveDateTime,
    pub max_event_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_arn: Option<String>,
}

impl ScheduleRequest {
    pub fn builder(name: impl Into<String>, group_name: impl Into<String>) -> ScheduleRequestBuilder {
        ScheduleRequestBuilder {
            name: name.into(),
            group_name: group_name.into(),
            payload: "{}".to_string(),
            target_arn: String::new(),
            role_arn: String::new(),
            timezone: Tz::UTC,
            fire_time: None,
            max_event_retries: DEFAULT_MAX_EVENT_RETRIES,
            dead_letter_arn: None,
        }
    }

    pub fn key(&self) -> Result<ScheduleKey, StoreError> {
        ScheduleKey::new(self.group_name.clone(), self.name.clone())
    }
}

/// Builder for [`ScheduleRequest`] with validation on `build`
#[derive(Debug, Clone)]
pub struct ScheduleRequestBuilder {
    name: String,
    group_name: String,
    payload: String,
    target_arn: String,
    role_arn: String,
    timezone: Tz,
    fire_time: Option<NaiveDateTime>,
    max_event_retries: u32,
    dead_letter_arn: Option<String>,
}

impl ScheduleRequestBuilder {
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn target(mut self, target_arn: impl Into<String>, role_arn: impl Into<String>) -> Self {
        self.target_arn = target_arn.into();
        self.role_arn = role_arn.into();
        self
    }

    pub fn timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn fire_time(mut self, fire_time: NaiveDateTime) -> Self {
        self.fire_time = Some(fire_time);
        self
    }

    pub fn max_event_retries(mut self, max_event_retries: u32) -> Self {
        self.max_event_retries = max_event_retries;
        self
    }

    pub fn dead_letter_arn(mut self, dead_letter_arn: Option<String>) -> Self {
        self.dead_letter_arn = dead_letter_arn;
        self
    }

    pub fn build(self) -> Result<ScheduleRequest, ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingField("name".to_string()));
        }
        if self.group_name.is_empty() {
            return Err(ValidationError::MissingField("group_name".to_string()));
        }
        if self.target_arn.is_empty() {
            return Err(ValidationError::MissingField("target_arn".to_string()));
        }
        if self.role_arn.is_empty() {
            return Err(ValidationError::MissingField("role_arn".to_string()));
        }
        if self.max_event_retries > MAX_EVENT_RETRIES_LIMIT {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_event_retries".to_string(),
                reason: format!("must be at most {}", MAX_EVENT_RETRIES_LIMIT),
            });
        }
        let fire_time = self
            .fire_time
            .ok_or_else(|| ValidationError::MissingField("fire_time".to_string()))?;

        Ok(ScheduleRequest {
            name: self.name,
            group_name: self.group_name,
            payload: self.payload,
            target_arn: self.target_arn,
            role_arn: self.role_arn,
            timezone: self.timezone,
            fire_time,
            max_event_retries: self.max_event_retries,
            dead_letter_arn: self.dead_letter_arn,
        })
    }
}
