//! Undo information for an update in progress.

use std::collections::BTreeSet;

use semver::Version;

use crate::permissions::PermissionSet;
use crate::store::InversePatch;

/// Everything needed to restore a snap to its pre-update state.
///
/// Created when an update batch starts and filled in as the update applies
/// its changes. Committing the batch discards it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollbackSnapshot {
    /// Restores the replaced record.
    pub patch: Option<InversePatch>,
    /// Permissions granted by the update, to revoke.
    pub granted_permissions: PermissionSet,
    /// Permissions revoked by the update, to grant again.
    pub revoked_permissions: PermissionSet,
    /// Origins connected by the update, to disconnect.
    pub granted_connections: BTreeSet<String>,
    /// Origins disconnected by the update, to connect again.
    pub revoked_connections: BTreeSet<String>,
    /// Version the update installed.
    pub new_version: Option<Version>,
}

impl RollbackSnapshot {
    /// Returns `true` when the update replaced the record.
    #[must_use]
    pub const fn has_patch(&self) -> bool {
        self.patch.is_some()
    }
}
