//! Prometheus metrics exporter and metric descriptions.
//!
//! Components record through the `metrics` facade unconditionally. Without an
//! installed recorder those calls are no-ops, so the exporter is only set up
//! when `metrics.enabled` is true.

use std::collections::HashMap;
use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Address the `/metrics` scrape endpoint listens on
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Histogram buckets for flush durations, in seconds
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: default_listen_address(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}

/// Install the Prometheus exporter if enabled. Must run inside a tokio runtime.
///
/// Returns whether an exporter was installed.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<bool> {
    if !config.enabled {
        return Ok(false);
    }

    let mut builder = PrometheusBuilder::new()
        .with_http_listener(config.listen_address)
        .set_buckets(&config.duration_buckets)?;
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder.install()?;

    describe_metrics();
    tracing::info!(listen_address = %config.listen_address, "Metrics exporter listening");
    Ok(true)
}

fn describe_metrics() {
    describe_counter!("pulse_answers_buffered_total", "Answers accepted into the buffer");
    describe_counter!("pulse_answers_stale_total", "Buffered answers targeting a round that was not active");
    describe_counter!("pulse_answers_flushed_total", "Answers persisted by flush cycles");
    describe_counter!("pulse_answers_dropped_total", "Answers dropped because a bulk write failed");
    describe_gauge!("pulse_answers_pending", "Answers waiting for the next flush");
    describe_histogram!(
        "pulse_answer_flush_duration_seconds",
        Unit::Seconds,
        "Duration of the bulk write in a flush cycle"
    );

    describe_counter!("pulse_round_transitions_total", "Round transitions by kind");
    describe_gauge!("pulse_timers_pending", "Armed timers per registry");

    describe_counter!("pulse_feedback_votes_total", "Feedback votes by value");
    describe_counter!("pulse_feedback_evicted_total", "Feedback votes evicted by cleanup");
    describe_gauge!("pulse_feedback_rooms", "Rooms holding feedback votes");
    describe_gauge!("pulse_sessions_active", "Bound client sessions");

    describe_counter!("pulse_events_published_total", "Notifications queued for delivery");
    describe_counter!("pulse_events_dropped_total", "Notifications dropped on a full channel");
    describe_counter!("pulse_events_failed_total", "Notifications the sink failed to deliver");
    describe_counter!("pulse_errors_total", "Errors by code, category and severity");
}
