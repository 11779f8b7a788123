// Lifecycle demonstration: create a handful of one-shot schedules, wait,
// reschedule the first and cancel the second.

use crate::config::{SchedulerConfig, SeederConfig};
use crate::errors::ValidationError;
use crate::lifecycle::{LifecycleResult, ScheduleLifecycleClient, SchedulerService};
use crate::models::ScheduleRequest;
use crate::schedule;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// One lifecycle call made during seeding
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedStep {
    pub schedule_name: String,
    pub operation: &'static str,
    pub outcome: &'static str,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SeedStep {
    fn from_result(schedule_name: &str, result: &LifecycleResult) -> Self {
        Self {
            schedule_name: schedule_name.to_string(),
            operation: result.requested.as_str(),
            outcome: result.outcome.as_str(),
            attempts: result.attempts,
            error: result.error(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything the seeder did, in call order
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub steps: Vec<SeedStep>,
}

impl SeedReport {
    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|s| s.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.steps.len() - self.succeeded()
    }

    /// 200 unless every operation failed
    pub fn status_code(&self) -> u16 {
        if !self.steps.is_empty() && self.succeeded() == 0 {
            500
        } else {
            200
        }
    }

    /// `{statusCode, body}` result printed by the seeder entry point
    pub fn to_response(&self) -> serde_json::Value {
        json!({
            "statusCode": self.status_code(),
            "body": {
                "succeeded": self.succeeded(),
                "failed": self.failed(),
                "steps": self.steps,
            }
        })
    }
}

/// Schedule name for the `index`-th seeded schedule (1-based)
pub fn schedule_name(prefix: &str, index: usize) -> String {
    format!("{}-{}", prefix, index)
}

fn fire_time(
    now: DateTime<Utc>,
    offset_minutes: i64,
    timezone: chrono_tz::Tz,
) -> NaiveDateTime {
    (now + ChronoDuration::minutes(offset_minutes))
        .with_timezone(&timezone)
        .naive_local()
}

fn build_request(
    name: &str,
    scheduler: &SchedulerConfig,
    timezone: chrono_tz::Tz,
    fire_at: NaiveDateTime,
) -> Result<ScheduleRequest, ValidationError> {
    let payload = json!({
        "scheduleName": name,
        "fireTime": schedule::at_expression(&fire_at),
        "timezone": timezone.name(),
    });

    ScheduleRequest::builder(name, scheduler.group_name.clone())
        .payload(payload.to_string())
        .target(scheduler.target_arn.clone(), scheduler.role_arn.clone())
        .timezone(timezone)
        .fire_time(fire_at)
        .max_event_retries(scheduler.max_event_retries)
        .dead_letter_arn(scheduler.dead_letter_arn.clone())
        .build()
}

/// Create `schedule_count` schedules, wait, update the first and delete the
/// second. Individual failures are recorded and do not stop the sequence.
#[instrument(skip_all, fields(group = %scheduler.group_name, count = seeder.schedule_count))]
pub async fn seed_lifecycle<S: SchedulerService>(
    client: &ScheduleLifecycleClient<S>,
    seeder: &SeederConfig,
    scheduler: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<SeedReport, ValidationError> {
    let timezone = schedule::parse_timezone(Some(&scheduler.timezone))?;
    let mut report = SeedReport::default();

    let names: Vec<String> = (1..=seeder.schedule_count)
        .map(|i| schedule_name(&seeder.name_prefix, i))
        .collect();

    let initial_fire = fire_time(now, seeder.first_fire_offset_minutes, timezone);
    for name in &names {
        let request = build_request(name, scheduler, timezone, initial_fire)?;
        let result = client.create(&request).await;
        report.steps.push(SeedStep::from_result(name, &result));
    }

    if seeder.wait_seconds > 0 {
        info!(wait_seconds = seeder.wait_seconds, "Waiting before update and delete");
        tokio::time::sleep(Duration::from_secs(seeder.wait_seconds)).await;
    }

    if let Some(name) = names.first() {
        let later_fire = fire_time(now, seeder.update_fire_offset_minutes, timezone);
        let request = build_request(name, scheduler, timezone, later_fire)?;
        let result = client.update(&request).await;
        report.steps.push(SeedStep::from_result(name, &result));
    }

    match names.get(1) {
        Some(name) => {
            let result = client.delete(name, &scheduler.group_name).await;
            report.steps.push(SeedStep::from_result(name, &result));
        }
        None => warn!("Fewer than two schedules seeded, skipping delete"),
    }

    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "Seeding finished"
    );
    Ok(report)
}
