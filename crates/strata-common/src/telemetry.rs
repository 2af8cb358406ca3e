//! Telemetry initialization
//!
//! Provides structured JSON logging on stderr, filtered by `RUST_LOG`.
//! Stdout is left free for the dataplane message stream.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,strata=debug,strata_calc=info";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter {filter:?}: {message}")]
    InvalidFilter {
        /// The rejected directive
        filter: String,
        /// Parser message
        message: String,
    },

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Explicit filter directive; falls back to `RUST_LOG`, then [`DEFAULT_FILTER`]
    pub filter: Option<String>,

    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "strata".to_string(),
            filter: None,
            json: true,
        }
    }
}

/// Initialize the global tracing subscriber
///
/// # Example
///
/// ```ignore
/// use strata_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::default())?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = build_filter(config.filter.as_deref())?;

    let (json_layer, text_layer) = if config.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr);
        (Some(layer), None)
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);
        (None, Some(layer))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}

/// Build the env filter from an explicit directive, `RUST_LOG`, or the default
fn build_filter(explicit: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    match explicit {
        Some(filter) => {
            EnvFilter::try_new(filter).map_err(|e| TelemetryError::InvalidFilter {
                filter: filter.to_string(),
                message: e.to_string(),
            })
        }
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}
