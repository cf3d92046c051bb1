//! Telemetry: structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use pulse_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! init_telemetry(&TelemetryConfig::default())?;
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig};

use serde::Deserialize;

/// Logging and metrics settings together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Initialize logging, then metrics. Call once at startup, inside the runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_logging(&config.logging)?;
    let exporting = init_metrics(&config.metrics)?;
    if !exporting {
        tracing::debug!("Metrics exporter disabled");
    }
    Ok(())
}
