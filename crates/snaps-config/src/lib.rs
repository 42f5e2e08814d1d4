//! Shared configuration for the snaps execution layer and controller.
//!
//! Every struct deserialises with `#[serde(default)]`, so hosts can feed a
//! partial document from whatever source they use (a settings file, a
//! remote feature-flag payload, environment-derived JSON) and only override
//! the values they care about. Durations are carried as milliseconds on the
//! wire and exposed as [`Duration`] through accessors.
//!
//! Call [`SnapsConfig::validate`] once after loading; the controller and the
//! execution service assume a validated configuration.

mod defaults;
mod logging;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_IDLE_CHECK_INTERVAL_MS, DEFAULT_INIT_TIMEOUT_MS, DEFAULT_LOG_FILTER,
    DEFAULT_MAX_IDLE_TIME_MS, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_REQUEST_TIME_MS,
    DEFAULT_PING_TIMEOUT_MS, DEFAULT_STATE_KEY_ITERATIONS, DEFAULT_TERMINATION_TIMEOUT_MS,
    default_log_filter_string,
};
pub use logging::{LogFormat, LogFormatParseError, LoggingConfig};

/// Timeouts and switches for the execution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Budget for creating a job and executing the snap source.
    pub init_timeout_ms: u64,
    /// Budget for the liveness ping sent after the job is created.
    pub ping_timeout_ms: u64,
    /// Budget for a sandbox to acknowledge `terminate`.
    pub termination_timeout_ms: u64,
    /// Whether a ping round-trip is performed before `executeSnap`.
    pub use_ping: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            termination_timeout_ms: DEFAULT_TERMINATION_TIMEOUT_MS,
            use_ping: true,
        }
    }
}

impl ExecutionConfig {
    /// Budget for creating a job and executing the snap source.
    #[must_use]
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Budget for the liveness ping.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Budget for a graceful terminate.
    #[must_use]
    pub const fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }
}

/// Lifecycle and policy settings for the snap controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Idle time after which a running snap with no pending work is stopped.
    pub max_idle_time_ms: u64,
    /// Interval between idle sweeps.
    pub idle_check_interval_ms: u64,
    /// Default per-request execution budget.
    pub max_request_time_ms: u64,
    /// Ceiling of callers per origin waiting on one in-flight start.
    pub max_queue_size: usize,
    /// Reject snaps the registry does not explicitly verify.
    pub require_allowlist: bool,
    /// Permissions snaps may not request, mapped to the message shown on rejection.
    pub excluded_permissions: BTreeMap<String, String>,
    /// PBKDF2 iteration count for newly encrypted snap state.
    pub state_key_iterations: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_idle_time_ms: DEFAULT_MAX_IDLE_TIME_MS,
            idle_check_interval_ms: DEFAULT_IDLE_CHECK_INTERVAL_MS,
            max_request_time_ms: DEFAULT_MAX_REQUEST_TIME_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            require_allowlist: false,
            excluded_permissions: BTreeMap::new(),
            state_key_iterations: DEFAULT_STATE_KEY_ITERATIONS,
        }
    }
}

impl ControllerConfig {
    /// Idle time after which a quiescent snap is stopped.
    #[must_use]
    pub const fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    /// Interval between idle sweeps.
    #[must_use]
    pub const fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    /// Default per-request execution budget.
    #[must_use]
    pub const fn max_request_time(&self) -> Duration {
        Duration::from_millis(self.max_request_time_ms)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapsConfig {
    /// Execution service settings.
    pub execution: ExecutionConfig,
    /// Controller settings.
    pub controller: ControllerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl SnapsConfig {
    /// Checks invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroDuration`] when a timeout or interval is
    /// zero, [`ConfigError::ZeroQueueSize`] when no caller could ever wait
    /// on a start, and [`ConfigError::ZeroIterations`] when state keys would
    /// be derived without stretching.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("execution.init_timeout_ms", self.execution.init_timeout_ms),
            ("execution.ping_timeout_ms", self.execution.ping_timeout_ms),
            (
                "execution.termination_timeout_ms",
                self.execution.termination_timeout_ms,
            ),
            ("controller.max_idle_time_ms", self.controller.max_idle_time_ms),
            (
                "controller.idle_check_interval_ms",
                self.controller.idle_check_interval_ms,
            ),
            (
                "controller.max_request_time_ms",
                self.controller.max_request_time_ms,
            ),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroDuration {
                field: (*field).to_owned(),
            });
        }
        if self.controller.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.controller.state_key_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        Ok(())
    }
}

/// Errors raised by [`SnapsConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A duration field was zero.
    #[error("configuration field '{field}' must be greater than zero")]
    ZeroDuration {
        /// Dotted path of the offending field.
        field: String,
    },
    /// The start queue ceiling was zero.
    #[error("controller.max_queue_size must be greater than zero")]
    ZeroQueueSize,
    /// The key-derivation iteration count was zero.
    #[error("controller.state_key_iterations must be greater than zero")]
    ZeroIterations,
}
