// Seeder binary entry point
// Creates a few one-shot schedules, waits, reschedules one and cancels another

use anyhow::Result;
use chrono::Utc;
use common::config::Settings;
use common::lifecycle::{EventBridgeScheduler, ScheduleLifecycleClient};
use common::seed::seed_lifecycle;
use common::telemetry;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the configured level applies
    let settings = Settings::load().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    telemetry::init_logging(
        "seeder",
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!("Starting schedule seeder");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    info!(
        region = %settings.aws.region,
        group = %settings.scheduler.group_name,
        count = settings.seeder.schedule_count,
        "Configuration loaded"
    );

    let scheduler = EventBridgeScheduler::from_region(
        settings.aws.region.clone(),
        settings.aws.endpoint_url.clone(),
    )
    .await;
    let client =
        ScheduleLifecycleClient::with_config(scheduler, settings.scheduler.lifecycle_config());

    let response = match seed_lifecycle(&client, &settings.seeder, &settings.scheduler, Utc::now())
        .await
    {
        Ok(report) => report.to_response(),
        Err(e) => {
            error!(error = %e, "Seed requests could not be built");
            serde_json::json!({ "statusCode": 500, "body": { "error": e.to_string() } })
        }
    };

    println!("{}", response);

    telemetry::shutdown_tracer();
    info!("Seeder finished");
    Ok(())
}
