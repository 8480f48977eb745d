//! Logging setup for Conduit
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a `fmt`
//! layer in either text or JSON form.

use conduit_config::{LogFormat, TelemetryConfig};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Guard returned by [`init`]; hold it for the lifetime of the application
#[derive(Debug)]
pub struct TelemetryGuard {
    format: LogFormat,
}

impl TelemetryGuard {
    /// Output format the subscriber was installed with
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

/// Initialize logging from configuration
///
/// `RUST_LOG` takes precedence over the configured filter; `default_filter`
/// applies when neither is usable.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(config: Option<&TelemetryConfig>, default_filter: &str) -> anyhow::Result<TelemetryGuard> {
    let configured = config.map_or(default_filter, |c| c.log_filter.as_str());
    let format = config.map(|c| c.format).unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(TelemetryGuard { format })
}
