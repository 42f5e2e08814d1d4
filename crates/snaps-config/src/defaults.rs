//! Default values shared by the execution layer and the controller.

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Time allowed for a sandbox to come up and execute a snap's source.
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 60_000;

/// Time allowed for the liveness ping after a job is created.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 2_000;

/// Time allowed for a sandbox to acknowledge a `terminate` command.
pub const DEFAULT_TERMINATION_TIMEOUT_MS: u64 = 1_000;

/// Idle time after which a running snap is stopped.
pub const DEFAULT_MAX_IDLE_TIME_MS: u64 = 30_000;

/// Interval between two idle sweeps.
pub const DEFAULT_IDLE_CHECK_INTERVAL_MS: u64 = 5_000;

/// Time a single handler invocation may take unless its permission says otherwise.
pub const DEFAULT_MAX_REQUEST_TIME_MS: u64 = 60_000;

/// Number of callers per origin that may wait on one in-flight start.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 5;

/// PBKDF2 iteration count used for newly written encrypted state.
pub const DEFAULT_STATE_KEY_ITERATIONS: u32 = 600_000;

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}
