//! Errors raised by controller operations.
//!
//! The enum is `Clone` so a shared install or start can hand one failure to
//! every caller waiting on it. Collaborator failures are rendered to strings
//! for the same reason.

use semver::{Version, VersionReq};
use snaps_execution::{ExecutionError, HandlerType, JsonRpcError, SnapId};
use thiserror::Error;

use crate::fsm::FsmError;
use crate::request_queue::RequestQueueError;

/// Errors arising from snap controller operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapControllerError {
    /// The identifier lacks a known source prefix.
    #[error("invalid snap id \"{snap_id}\"")]
    InvalidSnapId {
        /// The rejected identifier.
        snap_id: SnapId,
    },

    /// No snap with the identifier is installed.
    #[error("snap \"{snap_id}\" not found")]
    NotFound {
        /// The unknown snap.
        snap_id: SnapId,
    },

    /// The snap was never instantiated since startup.
    #[error("no runtime for snap \"{snap_id}\"")]
    NoRuntime {
        /// The snap without a runtime.
        snap_id: SnapId,
    },

    /// The snap is already executing.
    #[error("snap \"{snap_id}\" is already running")]
    AlreadyRunning {
        /// The running snap.
        snap_id: SnapId,
    },

    /// The snap is disabled.
    #[error("snap \"{snap_id}\" is disabled")]
    SnapDisabled {
        /// The disabled snap.
        snap_id: SnapId,
    },

    /// The snap is blocked by the registry.
    #[error("snap \"{snap_id}\" is blocked")]
    SnapBlocked {
        /// The blocked snap.
        snap_id: SnapId,
    },

    /// The snap has not finished installing.
    #[error("snap \"{snap_id}\" is currently being installed")]
    SnapInstalling {
        /// The installing snap.
        snap_id: SnapId,
    },

    /// The snap is restarting into a new version.
    #[error("snap \"{snap_id}\" is currently being updated")]
    SnapUpdating {
        /// The updating snap.
        snap_id: SnapId,
    },

    /// The snap may not be removed.
    #[error("snap \"{snap_id}\" is not removable")]
    NotRemovable {
        /// The protected snap.
        snap_id: SnapId,
    },

    /// Preinstalled snaps only change with the host.
    #[error("snap \"{snap_id}\" is preinstalled and cannot be updated manually")]
    PreinstalledUpdate {
        /// The preinstalled snap.
        snap_id: SnapId,
    },

    /// An update of the snap is already in progress.
    #[error("snap \"{snap_id}\" is already being updated")]
    AlreadyUpdating {
        /// The snap being updated.
        snap_id: SnapId,
    },

    /// There is no pending update to roll back.
    #[error("no rollback snapshot for snap \"{snap_id}\"")]
    NoRollbackSnapshot {
        /// The snap without a snapshot.
        snap_id: SnapId,
    },

    /// The requested version range does not parse.
    #[error("invalid version range \"{range}\"")]
    InvalidVersionRange {
        /// The rejected range.
        range: String,
    },

    /// The fetched version does not satisfy the requested range.
    #[error("snap \"{snap_id}\" version {version} does not satisfy \"{range}\"")]
    VersionMismatch {
        /// The fetched snap.
        snap_id: SnapId,
        /// Fetched version.
        version: Version,
        /// Requested range.
        range: VersionReq,
    },

    /// The fetched version is not newer than the installed one.
    #[error("snap \"{snap_id}\" version {requested} is not greater than installed {installed}")]
    VersionNotGreater {
        /// The snap.
        snap_id: SnapId,
        /// Installed version.
        installed: Version,
        /// Fetched version.
        requested: Version,
    },

    /// The package could not be fetched.
    #[error("failed to fetch snap \"{snap_id}\": {message}")]
    Fetch {
        /// The snap.
        snap_id: SnapId,
        /// Location failure.
        message: String,
    },

    /// The package contents do not match the manifest checksum.
    #[error("checksum mismatch for snap \"{snap_id}\"")]
    ChecksumMismatch {
        /// The snap.
        snap_id: SnapId,
    },

    /// The registry refused the snap.
    #[error("snap \"{snap_id}\" rejected by registry: {reason}")]
    RegistryRejected {
        /// The snap.
        snap_id: SnapId,
        /// Why it was refused.
        reason: String,
    },

    /// The registry could not be queried.
    #[error("snaps registry unavailable: {message}")]
    Registry {
        /// Registry failure.
        message: String,
    },

    /// The manifest asks for a permission the host does not allow.
    #[error("snap \"{snap_id}\" requests excluded permission \"{permission}\": {message}")]
    ExcludedPermission {
        /// The snap.
        snap_id: SnapId,
        /// The excluded permission.
        permission: String,
        /// Host-supplied explanation.
        message: String,
    },

    /// The user rejected the install or update.
    #[error("installation of snap \"{snap_id}\" was rejected")]
    ApprovalRejected {
        /// The snap.
        snap_id: SnapId,
    },

    /// The snap lacks the permission backing a handler.
    #[error("snap \"{snap_id}\" is not permitted to use handler {handler}")]
    HandlerNotPermitted {
        /// The snap.
        snap_id: SnapId,
        /// The handler.
        handler: HandlerType,
    },

    /// The origin may not call the handler.
    #[error("origin \"{origin}\" may not call {handler} of snap \"{snap_id}\"")]
    OriginNotAllowed {
        /// The snap.
        snap_id: SnapId,
        /// The caller.
        origin: String,
        /// The handler.
        handler: HandlerType,
    },

    /// Too many callers are waiting for the snap to start.
    #[error(transparent)]
    QueueExhausted(#[from] RequestQueueError),

    /// The snap did not answer within the request budget.
    #[error("{handler} request to snap \"{snap_id}\" timed out")]
    RequestTimeout {
        /// The snap.
        snap_id: SnapId,
        /// The handler.
        handler: HandlerType,
    },

    /// The snap answered with a value the handler does not allow.
    #[error("invalid {handler} result from snap \"{snap_id}\": {message}")]
    InvalidResult {
        /// The snap.
        snap_id: SnapId,
        /// The handler.
        handler: HandlerType,
        /// What was wrong.
        message: String,
    },

    /// The snap reported an error it handled itself.
    #[error("snap error: {0}")]
    Snap(JsonRpcError),

    /// The encrypted state could not be decrypted.
    #[error("state of snap \"{snap_id}\" is corrupted")]
    StateCorrupted {
        /// The snap.
        snap_id: SnapId,
    },

    /// The state document is not valid JSON.
    #[error("state of snap \"{snap_id}\" is invalid: {message}")]
    InvalidState {
        /// The snap.
        snap_id: SnapId,
        /// Parse failure.
        message: String,
    },

    /// Active references would drop below zero.
    #[error("snap \"{snap_id}\" has no active references")]
    NoActiveReferences {
        /// The snap.
        snap_id: SnapId,
    },

    /// The execution layer failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The lifecycle machine rejected an operation.
    #[error(transparent)]
    Fsm(#[from] FsmError),
}

impl SnapControllerError {
    /// Rendering used when a failure crosses an RPC boundary.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Snap(error) | Self::Execution(ExecutionError::Rpc(error)) => error.clone(),
            other => JsonRpcError::internal(other.to_string()),
        }
    }
}
