//! Error types for the execution layer.

use thiserror::Error;

use crate::jsonrpc::JsonRpcError;
use crate::types::{JobId, SnapId};

/// Errors raised while creating, commanding, or tearing down execution jobs.
///
/// The type is `Clone` so a single failure can be handed to every caller
/// waiting on a shared start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// No job with the given identifier is tracked.
    #[error("job {job_id} not found")]
    JobNotFound {
        /// The unknown job.
        job_id: JobId,
    },

    /// The snap has no running job.
    #[error("snap \"{snap_id}\" is not running")]
    SnapNotRunning {
        /// The snap without a job.
        snap_id: SnapId,
    },

    /// The snap already has a job.
    #[error("snap \"{snap_id}\" is already being executed")]
    AlreadyRunning {
        /// The snap with an existing job.
        snap_id: SnapId,
    },

    /// The transport did not produce a stream within the start budget.
    #[error("timed out waiting for the execution environment of job {job_id} to start")]
    StartTimeout {
        /// The job that never started.
        job_id: JobId,
    },

    /// The sandbox did not answer the liveness ping in time.
    #[error("snap \"{snap_id}\" did not respond to ping in time")]
    PingTimeout {
        /// The unresponsive snap.
        snap_id: SnapId,
    },

    /// The snap source did not finish executing within the start budget.
    #[error("snap \"{snap_id}\" took too long to execute")]
    ExecuteTimeout {
        /// The slow snap.
        snap_id: SnapId,
    },

    /// The transport collaborator failed.
    #[error("transport error: {message}")]
    Transport {
        /// Description reported by the transport.
        message: String,
    },

    /// A message could not be encoded or decoded.
    #[error("JSON codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// The sandbox answered with a JSON-RPC error.
    #[error("sandbox returned error: {0}")]
    Rpc(#[from] JsonRpcError),

    /// The job's stream closed before a response arrived.
    #[error("execution channel closed")]
    Disconnected,
}

impl From<serde_json::Error> for ExecutionError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec {
            message: error.to_string(),
        }
    }
}
