// Telemetry: JSON logs, optional OTLP trace export and Prometheus metrics

use crate::lifecycle::LifecycleResult;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber for a binary.
///
/// `RUST_LOG` wins over `log_level` when set. Span context is attached to
/// every JSON line; with `tracing_endpoint` spans are also exported over
/// OTLP under `service_name`.
#[tracing::instrument(skip_all)]
pub fn init_logging(
    service_name: &'static str,
    log_level: &str,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => log_filter(log_level)?,
    };

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let otel_layer = match tracing_endpoint {
        Some(endpoint) => {
            let tracer = init_tracer(service_name, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!(
        service = service_name,
        log_level = log_level,
        otlp = tracing_endpoint.is_some(),
        "Logging initialized"
    );
    Ok(())
}

/// Parse configured filter directives, rejecting any invalid directive
fn log_filter(log_level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(log_level)
        .map_err(|e| anyhow::anyhow!("Invalid log filter '{}': {}", log_level, e))
}

fn init_tracer(service_name: &'static str, endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build OTLP span exporter: {}", e))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(service_name))
}

/// Flush pending spans. Call once before the process exits
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter
///
/// This function sets up the Prometheus metrics exporter and registers all metrics:
/// - lifecycle_operations_total: Counter of lifecycle calls by operation and outcome
/// - lifecycle_backoff_total: Counter of rate-limit backoff waits
/// - reconcile_records_total: Counter of reconciled notifications by result
/// - reconcile_batch_size: Histogram of received batch sizes
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    // Build and install the Prometheus exporter
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "lifecycle_operations_total",
        "Total number of schedule lifecycle calls by operation and outcome"
    );
    describe_counter!(
        "lifecycle_backoff_total",
        "Total number of rate-limit backoff waits"
    );
    describe_counter!(
        "reconcile_records_total",
        "Total number of change notifications reconciled, by result"
    );
    describe_histogram!(
        "reconcile_batch_size",
        "Number of notifications per reconciled batch"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Record the terminal state of a lifecycle call
#[inline]
pub fn record_lifecycle_result(result: &LifecycleResult) {
    counter!(
        "lifecycle_operations_total",
        "operation" => result.requested.as_str(),
        "outcome" => result.outcome.as_str()
    )
    .increment(1);
}

/// Record one rate-limit backoff wait
#[inline]
pub fn record_lifecycle_backoff(operation: &'static str) {
    counter!("lifecycle_backoff_total", "operation" => operation).increment(1);
}

/// Record how a single notification was reconciled
///
/// `result` is one of: applied, superseded, skipped, rejected, failed, parse_failed
#[inline]
pub fn record_reconcile_result(result: &'static str) {
    counter!("reconcile_records_total", "result" => result).increment(1);
}

/// Record the size of a received batch
#[inline]
pub fn record_batch_size(size: usize) {
    histogram!("reconcile_batch_size").record(size as f64);
}
