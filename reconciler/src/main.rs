// Reconciler binary entry point
//
// `reconciler <payload.json>` reconciles one delivered batch and prints a
// status/body result. Without arguments it consumes the notification stream
// until Ctrl+C.

use anyhow::Result;
use chrono::Utc;
use common::config::{Settings, StoreBackend};
use common::notification::{split_batch_payload, RawNotification};
use common::queue::{BatchConsumer, BatchHandler, NatsBatchConsumer, NatsClient};
use common::reconcile::Reconciler;
use common::store::{DynamoStateStore, MemoryStateStore, PostgresStateStore, StateStore};
use common::telemetry;
use futures::FutureExt;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

type SharedStore = Arc<dyn StateStore>;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    telemetry::init_logging(
        "schedule-reconciler",
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!("Starting schedule reconciler");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    let store = build_store(&settings).await.map_err(|e| {
        error!(error = %e, "Failed to initialize state store");
        e
    })?;
    let reconciler = Arc::new(Reconciler::new(
        store,
        settings.reconciler.reconciler_config(),
    ));

    match std::env::args().nth(1) {
        Some(path) => {
            let response = run_once(reconciler.as_ref(), Path::new(&path)).await;
            println!("{}", response);
        }
        None => run_consumer(&settings, reconciler).await?,
    }

    telemetry::shutdown_tracer();
    info!("Reconciler shutdown complete");
    Ok(())
}

async fn build_store(settings: &Settings) -> Result<SharedStore> {
    let store: SharedStore = match settings.store.backend {
        StoreBackend::Dynamodb => Arc::new(
            DynamoStateStore::from_region(
                settings.aws.region.clone(),
                settings.store.table_name.clone(),
                settings.aws.endpoint_url.clone(),
            )
            .await,
        ),
        StoreBackend::Postgres => {
            let store = PostgresStateStore::connect(&settings.database).await?;
            store.ensure_schema().await?;
            // Postgres has no native TTL; drop expired records on startup
            let purged = store.purge_expired(Utc::now()).await?;
            info!(purged, "Expired records purged");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state is lost on exit");
            Arc::new(MemoryStateStore::new())
        }
    };

    info!(backend = ?settings.store.backend, "State store initialized");
    Ok(store)
}

/// Reconcile one batch read from a payload file.
///
/// 503 when the store is unreachable, 400 when the payload is not a batch,
/// 200 otherwise with the batch report as body.
async fn run_once<S: StateStore>(reconciler: &Reconciler<S>, path: &Path) -> serde_json::Value {
    if let Err(e) = reconciler.store().health_check().await {
        error!(error = %e, "State store health check failed");
        return json!({ "statusCode": 503, "body": { "error": e.to_string() } });
    }

    let payload = match tokio::fs::read_to_string(path).await {
        Ok(payload) => payload,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read payload");
            return json!({ "statusCode": 400, "body": { "error": e.to_string() } });
        }
    };

    let raw = match split_batch_payload(&payload) {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, "Payload is not a notification batch");
            return json!({ "statusCode": 400, "body": { "error": e.to_string() } });
        }
    };

    let report = reconciler.reconcile_raw(&raw).await;
    json!({ "statusCode": 200, "body": report })
}

async fn run_consumer(settings: &Settings, reconciler: Arc<Reconciler<SharedStore>>) -> Result<()> {
    if let Err(e) = telemetry::init_metrics(settings.observability.metrics_port) {
        warn!(error = %e, "Metrics exporter not started");
    }

    let nats_client = NatsClient::new(settings.nats.clone()).await.map_err(|e| {
        error!(error = %e, "Failed to initialize NATS client");
        e
    })?;
    nats_client.initialize_stream().await?;

    let handler: BatchHandler = Arc::new(move |raw: Vec<RawNotification>| {
        let reconciler = reconciler.clone();
        async move {
            let report = reconciler.reconcile_raw(&raw).await;
            if report.has_failures() {
                anyhow::bail!("{} notification(s) could not be written", report.failed);
            }
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    });

    let consumer = Arc::new(NatsBatchConsumer::connect(&nats_client, handler).await?);

    let consumer_task = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer.start().await {
                error!(error = %e, "Notification consumer error");
            }
        })
    };

    info!("Reconciler is running. Press Ctrl+C to shutdown gracefully");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    consumer.shutdown();
    info!("Waiting for in-flight batches to complete");
    let _ = consumer_task.await;
    Ok(())
}
