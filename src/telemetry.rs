//! Logging initialization
//!
//! Structured logging through `tracing`. The filter comes from `RUST_LOG` when
//! set; output is JSON for log collectors or plain text for terminals.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,machine_lb_controller=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs
    pub service_name: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// Filter to use when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            json: true,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Build the filter: `RUST_LOG` wins, otherwise `fallback`
pub fn env_filter(fallback: &str) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(fallback).map_err(|e| TelemetryError::Filter(e.to_string())),
    }
}

/// Install the global subscriber
///
/// # Example
///
/// ```ignore
/// use machine_lb_controller::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig { json: false, ..Default::default() })?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = env_filter(&config.default_filter)?;

    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let text_layer = (!config.json).then(|| fmt::layer().with_target(true));

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
