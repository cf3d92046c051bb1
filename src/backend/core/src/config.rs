//! Configuration management.
//!
//! Values come from `PULSE__`-prefixed environment variables, optionally
//! layered over a config file. Every section has defaults, so an empty
//! environment yields a working configuration.
//!
//! ```text
//! PULSE__ENGINE__FLUSH_INTERVAL=2s
//! PULSE__ENGINE__FEEDBACK_MAX_AGE=10m
//! PULSE__LOGGING__FORMAT=pretty
//! PULSE__METRICS__ENABLED=true
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{PulseError, Result};
use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};

const ENV_PREFIX: &str = "PULSE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Timing and capacity settings of the live engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Period of the answer flush cycle
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Period of the feedback cleanup cycle
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Age after which non-away feedback votes are evicted
    #[serde(default = "default_feedback_max_age", with = "humantime_serde")]
    pub feedback_max_age: Duration,

    /// Undelivered notifications kept before new ones are dropped
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Clear a room's feedback when a round ends, unless it runs a quick survey
    #[serde(default = "default_reset_feedback_on_round_end")]
    pub reset_feedback_on_round_end: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            cleanup_interval: default_cleanup_interval(),
            feedback_max_age: default_feedback_max_age(),
            event_channel_capacity: default_event_channel_capacity(),
            reset_feedback_on_round_end: default_reset_feedback_on_round_end(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the background loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(PulseError::configuration("engine.flush_interval must be positive"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(PulseError::configuration("engine.cleanup_interval must be positive"));
        }
        if self.event_channel_capacity == 0 {
            return Err(PulseError::configuration("engine.event_channel_capacity must be positive"));
        }
        Ok(())
    }
}

fn default_flush_interval() -> Duration { Duration::from_secs(5) }
fn default_cleanup_interval() -> Duration { Duration::from_secs(5) }
fn default_feedback_max_age() -> Duration { Duration::from_secs(5 * 60) }
fn default_event_channel_capacity() -> usize { 4096 }
fn default_reset_feedback_on_round_end() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        Self::finish(config)
    }

    /// Load from a config file, with the environment taking precedence.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        Self::finish(config)
    }

    /// The logging and metrics sections.
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn finish(config: config::Config) -> Result<Self> {
        let cfg: Config = config.try_deserialize()?;
        cfg.engine.validate()?;
        Ok(cfg)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
