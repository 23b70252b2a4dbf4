//! Observability: tracing, metrics, and the Prometheus exporter.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the tracing stack.
///
/// The `RUST_LOG` environment variable overrides the configured level.
pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}

/// Install the Prometheus recorder and return the handle used by the
/// `/metrics` endpoint.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::register_metrics();
    Ok(handle)
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{
        counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    };

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Counters
        describe_counter!(
            "chronicle_events_appended_total",
            "Total number of events appended to the stream"
        );
        describe_counter!(
            "chronicle_events_rejected_total",
            "Total number of events rejected by validation"
        );
        describe_counter!(
            "chronicle_blobs_stored_total",
            "Total number of blobs written"
        );
        describe_counter!(
            "chronicle_blobs_pruned_total",
            "Total number of expired blobs removed by the sweep"
        );
        describe_counter!(
            "chronicle_replays_total",
            "Total number of replay reconstructions"
        );
        describe_counter!(
            "chronicle_errors_total",
            "Total number of errors by code and category"
        );

        // Gauges
        describe_gauge!(
            "chronicle_projection_lag_events",
            "Events queued but not yet applied to projections"
        );
        describe_gauge!(
            "chronicle_export_jobs_active",
            "Export jobs currently running"
        );

        // Histograms
        describe_histogram!(
            "chronicle_append_duration_seconds",
            "Event append duration in seconds"
        );
        describe_histogram!(
            "chronicle_query_duration_seconds",
            "Event query duration in seconds"
        );
        describe_histogram!(
            "chronicle_replay_duration_seconds",
            "Replay reconstruction duration in seconds"
        );
    }

    /// Record a successful append.
    pub fn record_append(event_type: &str, duration_secs: f64) {
        counter!("chronicle_events_appended_total", "type" => event_type.to_string()).increment(1);
        histogram!("chronicle_append_duration_seconds").record(duration_secs);
    }

    /// Record a validation rejection.
    pub fn record_rejection(event_type: &str) {
        counter!("chronicle_events_rejected_total", "type" => event_type.to_string()).increment(1);
    }

    /// Record a blob write.
    pub fn record_blob_stored(bytes: u64) {
        counter!("chronicle_blobs_stored_total").increment(1);
        counter!("chronicle_blob_bytes_total").increment(bytes);
    }

    /// Record pruned blobs from a retention sweep.
    pub fn record_blobs_pruned(count: u64) {
        counter!("chronicle_blobs_pruned_total").increment(count);
    }

    /// Update the async projection backlog.
    pub fn set_projection_lag(depth: u64) {
        gauge!("chronicle_projection_lag_events").set(depth as f64);
    }

    /// Record a completed replay.
    pub fn record_replay(event_count: u64, missing_blobs: u64, duration_secs: f64) {
        counter!("chronicle_replays_total").increment(1);
        counter!("chronicle_replay_events_total").increment(event_count);
        histogram!("chronicle_replay_duration_seconds").record(duration_secs);
        if missing_blobs > 0 {
            counter!("chronicle_replay_missing_blobs_total").increment(missing_blobs);
        }
    }

    /// Record a query's duration.
    pub fn record_query(duration_secs: f64) {
        histogram!("chronicle_query_duration_seconds").record(duration_secs);
    }
}
