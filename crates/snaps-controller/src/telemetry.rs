//! Structured telemetry for hosts embedding the controller.
//!
//! Hosts call [`initialise`] once with their [`LoggingConfig`]. The
//! controller reports its own startup through [`report_startup`], so every
//! host sees the effective limits under [`TELEMETRY_TARGET`] regardless of
//! how it configured its filter for the rest of the crate.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use snaps_config::{ControllerConfig, LogFormat, LoggingConfig};
use tracing::{Subscriber, info, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter};

/// Target of controller lifecycle reports.
pub const TELEMETRY_TARGET: &str = "snaps_controller::telemetry";

static INSTALLED_FORMAT: OnceCell<LogFormat> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format of the subscriber that is actually installed.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global subscriber on the first call.
///
/// Later calls leave the global state alone and return the handle of the
/// first installation, whatever configuration they are given.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable filter and
/// [`TelemetryError::Subscriber`] when another subscriber is already
/// installed.
pub fn initialise(config: &LoggingConfig) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED_FORMAT
        .get_or_try_init(|| {
            let subscriber = build_subscriber(config, io::stderr, io::stderr().is_terminal())?;
            tracing::subscriber::set_global_default(subscriber)
                .map_err(TelemetryError::Subscriber)?;
            Ok(config.log_format())
        })
        .map(|format| TelemetryHandle { format: *format })
}

/// Reports a freshly built controller with the limits it runs under.
pub(crate) fn report_startup(config: &ControllerConfig, snaps: usize, preinstalled: usize) {
    info!(
        target: TELEMETRY_TARGET,
        snaps,
        preinstalled,
        max_idle_time_ms = config.max_idle_time_ms,
        idle_check_interval_ms = config.idle_check_interval_ms,
        max_request_time_ms = config.max_request_time_ms,
        max_queue_size = config.max_queue_size,
        require_allowlist = config.require_allowlist,
        "snap controller started"
    );
}

fn build_subscriber<W>(
    config: &LoggingConfig,
    writer: W,
    ansi: bool,
) -> Result<Box<dyn Subscriber + Send + Sync>, TelemetryError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    Ok(match config.log_format() {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    })
}
