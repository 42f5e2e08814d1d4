//! Updates and rollbacks.

use std::sync::Arc;

use semver::VersionReq;
use snaps_execution::SnapId;
use tracing::{info, warn};

use super::install::await_decision;
use super::{CONTROLLER_TARGET, SnapController, now_millis};
use crate::approval::{ApprovalKind, ApprovalRequest, ApprovalUpdate, PendingApproval};
use crate::error::SnapControllerError;
use crate::events::ControllerEvent;
use crate::fsm::{SnapStatus, StatusEvent};
use crate::location::{SnapLocation, fetch_snap};
use crate::permissions::{PermissionSet, calculate_connections_change, calculate_permissions_change};
use crate::snap::{FetchedSnap, Snap, TruncatedSnap, VersionHistoryEntry};

impl SnapController {
    /// Replaces the installed version of `snap_id` with the package served
    /// by `location`.
    ///
    /// Changes are recorded in the snap's rollback snapshot, when one
    /// exists, so a failing batch can undo them. `emit_event` controls
    /// whether `SnapUpdated` is published here or left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::PreinstalledUpdate`],
    /// [`SnapControllerError::VersionNotGreater`],
    /// [`SnapControllerError::VersionMismatch`], registry and permission
    /// failures, [`SnapControllerError::ApprovalRejected`], or the failure
    /// to start the new version.
    pub async fn update_snap(
        &self,
        origin: &str,
        snap_id: &SnapId,
        location: Arc<dyn SnapLocation>,
        version_range: &VersionReq,
        emit_event: bool,
    ) -> Result<TruncatedSnap, SnapControllerError> {
        let existing = self.get_expect(snap_id)?;
        if existing.preinstalled {
            return Err(SnapControllerError::PreinstalledUpdate {
                snap_id: snap_id.clone(),
            });
        }
        let approval = self.approvals.add_request(ApprovalRequest {
            origin: origin.to_owned(),
            snap_id: snap_id.clone(),
            kind: ApprovalKind::Update,
        });
        let approval_id = approval.id.clone();

        let result = self
            .apply_update(origin, &existing, location.as_ref(), version_range, emit_event, approval)
            .await;
        match &result {
            Ok(snap) => {
                self.approvals
                    .update_request_state(&approval_id, ApprovalUpdate::Succeeded);
                info!(
                    target: CONTROLLER_TARGET,
                    %snap_id,
                    from = %existing.version,
                    to = %snap.version,
                    "snap updated"
                );
            }
            Err(error) => {
                self.approvals.update_request_state(
                    &approval_id,
                    ApprovalUpdate::Failed {
                        error: error.to_string(),
                    },
                );
            }
        }
        result
    }

    async fn apply_update(
        &self,
        origin: &str,
        existing: &Snap,
        location: &dyn SnapLocation,
        version_range: &VersionReq,
        emit_event: bool,
        approval: PendingApproval,
    ) -> Result<TruncatedSnap, SnapControllerError> {
        let snap_id = &existing.id;
        let fetched = fetch_snap(snap_id, location).await?;
        let new_version = fetched.manifest.version.clone();
        if new_version <= existing.version {
            return Err(SnapControllerError::VersionNotGreater {
                snap_id: snap_id.clone(),
                installed: existing.version.clone(),
                requested: new_version,
            });
        }
        if !version_range.matches(&new_version) {
            return Err(SnapControllerError::VersionMismatch {
                snap_id: snap_id.clone(),
                version: new_version,
                range: version_range.clone(),
            });
        }
        self.verify_with_registry(snap_id, &fetched).await?;
        self.check_excluded_permissions(snap_id, &fetched.manifest)?;

        let granted = self.permissions.granted(snap_id);
        let permissions_change =
            calculate_permissions_change(&fetched.manifest.initial_permissions, &granted);
        let connections_change = calculate_connections_change(
            &existing.initial_connections,
            &fetched.manifest.initial_connections,
        );
        if let Some(snapshot) = self.lock().rollbacks.get_mut(snap_id) {
            snapshot.new_version = Some(new_version.clone());
        }

        self.approvals.update_request_state(
            &approval.id,
            ApprovalUpdate::Update {
                current_version: existing.version.clone(),
                new_version: new_version.clone(),
                permissions: permissions_change.clone(),
                connections: fetched.manifest.initial_connections.clone(),
            },
        );
        let decision = await_decision(snap_id, approval.decision).await?;

        self.stop_if_running(snap_id).await?;
        let patch = {
            let mut state = self.lock();
            state.transition(snap_id, StatusEvent::Update)?;
            let status = state
                .runtimes
                .get(snap_id)
                .map_or(SnapStatus::Updating, crate::runtime::SnapRuntime::status);
            let FetchedSnap {
                manifest,
                source_code,
                auxiliary_files,
                localization_files,
            } = fetched;
            state.store.update(snap_id, |draft| {
                if let Some(snap) = draft.as_mut() {
                    snap.status = status;
                    snap.version = manifest.version.clone();
                    snap.version_history.push(VersionHistoryEntry {
                        version: manifest.version.clone(),
                        date: now_millis(),
                        origin: origin.to_owned(),
                    });
                    snap.initial_permissions = manifest.initial_permissions.clone();
                    snap.initial_connections = manifest.initial_connections.clone();
                    snap.source_code = source_code;
                    snap.auxiliary_files = auxiliary_files;
                    snap.localization_files = localization_files;
                    snap.manifest = manifest;
                }
            })
        };

        let revoked: Vec<String> = permissions_change.unused.keys().cloned().collect();
        self.permissions.revoke(snap_id, &revoked);
        self.permissions.grant(snap_id, &decision.permissions);
        for connection in &connections_change.unused {
            self.permissions.revoke_connection(connection, snap_id);
        }
        for connection in &connections_change.new {
            self.permissions.grant_connection(connection, snap_id);
        }

        let newly_granted: PermissionSet = decision
            .permissions
            .into_iter()
            .filter(|(name, permission)| granted.get(name) != Some(permission))
            .collect();
        {
            let mut state = self.lock();
            if let Some(snapshot) = state.rollbacks.get_mut(snap_id) {
                snapshot.patch = Some(patch);
                snapshot.granted_permissions = newly_granted;
                snapshot.revoked_permissions = permissions_change.unused;
                snapshot.granted_connections = connections_change.new;
                snapshot.revoked_connections = connections_change.unused;
            }
        }

        if emit_event {
            let snap = self.get_truncated_expect(snap_id)?;
            self.events.publish(ControllerEvent::SnapUpdated {
                snap,
                old_version: existing.version.clone(),
                origin: origin.to_owned(),
                preinstalled: false,
            });
        }

        self.start_snap(snap_id).await?;
        self.get_truncated_expect(snap_id)
    }

    /// Undoes the pending update of `snap_id`: restores the record, the
    /// permissions and the connections, and leaves the snap stopped.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NoRollbackSnapshot`] when no update is
    /// pending.
    pub async fn rollback_snap(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        let snapshot = self
            .lock()
            .rollbacks
            .get(snap_id)
            .cloned()
            .ok_or_else(|| SnapControllerError::NoRollbackSnapshot {
                snap_id: snap_id.clone(),
            })?;

        if self.lock().runtimes.contains(snap_id) {
            self.stop_snap(snap_id, StatusEvent::Stop).await?;
        }
        {
            let mut state = self.lock();
            if let Some(patch) = snapshot.patch.clone() {
                state.store.apply_inverse(patch);
            }
            state.force_status(snap_id, SnapStatus::Stopped);
        }

        let granted: Vec<String> = snapshot.granted_permissions.keys().cloned().collect();
        self.permissions.revoke(snap_id, &granted);
        self.permissions.grant(snap_id, &snapshot.revoked_permissions);
        for connection in &snapshot.granted_connections {
            self.permissions.revoke_connection(connection, snap_id);
        }
        for connection in &snapshot.revoked_connections {
            self.permissions.grant_connection(connection, snap_id);
        }

        if snapshot.has_patch()
            && let Some(failed_version) = snapshot.new_version
            && let Some(snap) = self.get(snap_id)
        {
            warn!(target: CONTROLLER_TARGET, %snap_id, %failed_version, "snap update rolled back");
            self.events.publish(ControllerEvent::SnapRolledBack {
                snap: snap.truncated(),
                failed_version,
            });
        }
        self.lock().rollbacks.remove(snap_id);
        Ok(())
    }

    /// Rolls back every snap in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// See [`SnapController::rollback_snap`].
    pub async fn rollback_snaps(&self, snap_ids: &[SnapId]) -> Result<(), SnapControllerError> {
        for snap_id in snap_ids {
            self.rollback_snap(snap_id).await?;
        }
        Ok(())
    }
}
