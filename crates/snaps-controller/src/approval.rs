//! Install and update approvals.
//!
//! The controller opens an approval before fetching, fills it in once the
//! package is known, waits for the decision, and finally marks the approval
//! succeeded or failed. The approval UI lives behind [`ApprovalController`].

use semver::Version;
use snaps_execution::SnapId;
use tokio::sync::oneshot;

use crate::permissions::{Connections, PermissionSet, PermissionsChange};

/// What is being approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    /// A fresh install.
    Install,
    /// An update of an installed snap.
    Update,
}

/// Request opened with the approval collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    /// Origin asking for the snap.
    pub origin: String,
    /// The snap.
    pub snap_id: SnapId,
    /// Install or update.
    pub kind: ApprovalKind,
}

/// Content surfaced to the user once the package is known.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalUpdate {
    /// A fresh install is ready to be reviewed.
    Install {
        /// Permissions the snap asks for.
        permissions: PermissionSet,
        /// Origins the snap asks to be connected to.
        connections: Connections,
    },
    /// An update is ready to be reviewed.
    Update {
        /// Installed version.
        current_version: Version,
        /// Incoming version.
        new_version: Version,
        /// Permission difference between the two manifests.
        permissions: PermissionsChange,
        /// Origins the incoming version asks to be connected to.
        connections: Connections,
    },
    /// The snap is installed and running.
    Succeeded,
    /// The install or update failed.
    Failed {
        /// Rendered failure.
        error: String,
    },
}

/// The user's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    /// Whether the user approved.
    pub approved: bool,
    /// Permissions the user agreed to grant.
    pub permissions: PermissionSet,
}

impl ApprovalDecision {
    /// Approves with `permissions`.
    #[must_use]
    pub const fn approve(permissions: PermissionSet) -> Self {
        Self {
            approved: true,
            permissions,
        }
    }

    /// Rejects the request.
    #[must_use]
    pub const fn reject() -> Self {
        Self {
            approved: false,
            permissions: PermissionSet::new(),
        }
    }
}

/// Handle of an open approval.
#[derive(Debug)]
pub struct PendingApproval {
    /// Identifier used for later state updates.
    pub id: String,
    /// Resolves with the user's decision. A dropped sender counts as a
    /// rejection.
    pub decision: oneshot::Receiver<ApprovalDecision>,
}

/// Approval UI contract.
pub trait ApprovalController: Send + Sync {
    /// Opens an approval.
    fn add_request(&self, request: ApprovalRequest) -> PendingApproval;

    /// Updates what the approval with `id` shows.
    fn update_request_state(&self, id: &str, update: ApprovalUpdate);
}
