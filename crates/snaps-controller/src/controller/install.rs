//! Install batches and fresh installs.
//!
//! A batch installs or updates several snaps for one origin. Fresh installs
//! are memoized per snap as the runtime's install task, so concurrent
//! batches asking for the same snap share one fetch and one store. When any
//! snap of a batch fails, fresh installs of the batch are removed and
//! updates are rolled back before the error is returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use semver::{Version, VersionReq};
use snaps_execution::{HandlerType, JsonRpcRequest, SnapId};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{CONTROLLER_TARGET, HandleRequest, SnapController, now_millis};
use crate::approval::{
    ApprovalDecision, ApprovalKind, ApprovalRequest, ApprovalUpdate, PendingApproval,
};
use crate::error::SnapControllerError;
use crate::events::ControllerEvent;
use crate::fsm::SnapStatus;
use crate::handlers::LIFECYCLE_HOOKS_PERMISSION;
use crate::location::{SnapLocation, fetch_snap};
use crate::registry::{RegistryQuery, RegistryVerdict};
use crate::rollback::RollbackSnapshot;
use crate::runtime::{InstallTask, SnapRuntime};
use crate::snap::{FetchedSnap, Snap, SnapManifest, TruncatedSnap, VersionHistoryEntry};

/// Range used when a request names no version.
const DEFAULT_VERSION_RANGE: &str = "*";

/// Snaps touched by a batch so far.
#[derive(Debug, Default)]
struct Batch {
    installs: Vec<SnapId>,
    updates: Vec<(SnapId, Version)>,
}

impl SnapController {
    /// Installs or updates every requested snap on behalf of `origin`.
    ///
    /// `requested` maps snap ids to optional version ranges. Snaps already
    /// installed within their range are returned as they are.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the batch after undoing the batch's
    /// fresh installs and updates.
    pub async fn install_snaps(
        self: &Arc<Self>,
        origin: &str,
        requested: BTreeMap<SnapId, Option<String>>,
    ) -> Result<BTreeMap<SnapId, TruncatedSnap>, SnapControllerError> {
        let mut batch = Batch::default();
        let mut installed = BTreeMap::new();

        for (snap_id, range) in requested {
            match self
                .install_requested(origin, &snap_id, range.as_deref(), &mut batch)
                .await
            {
                Ok(snap) => {
                    installed.insert(snap_id, snap);
                }
                Err(error) => {
                    warn!(target: CONTROLLER_TARGET, %snap_id, %error, "install batch failed");
                    self.undo_batch(&batch).await;
                    return Err(error);
                }
            }
        }

        for (snap_id, snap) in &installed {
            if let Some((_, old_version)) = batch.updates.iter().find(|(id, _)| id == snap_id) {
                self.events.publish(ControllerEvent::SnapUpdated {
                    snap: snap.clone(),
                    old_version: old_version.clone(),
                    origin: origin.to_owned(),
                    preinstalled: false,
                });
            } else if batch.installs.contains(snap_id) {
                self.events.publish(ControllerEvent::SnapInstalled {
                    snap: snap.clone(),
                    origin: origin.to_owned(),
                    preinstalled: false,
                });
            }
        }
        {
            let mut state = self.lock();
            for (snap_id, _) in &batch.updates {
                state.rollbacks.remove(snap_id);
            }
        }

        let hooks = batch
            .installs
            .iter()
            .map(|snap_id| (snap_id, HandlerType::OnInstall))
            .chain(
                batch
                    .updates
                    .iter()
                    .map(|(snap_id, _)| (snap_id, HandlerType::OnUpdate)),
            );
        for (snap_id, handler) in hooks {
            self.run_lifecycle_hook(origin, snap_id, handler).await;
        }

        Ok(installed)
    }

    async fn install_requested(
        self: &Arc<Self>,
        origin: &str,
        snap_id: &SnapId,
        range: Option<&str>,
        batch: &mut Batch,
    ) -> Result<TruncatedSnap, SnapControllerError> {
        if !snap_id.is_valid() {
            return Err(SnapControllerError::InvalidSnapId {
                snap_id: snap_id.clone(),
            });
        }
        let range = range.unwrap_or(DEFAULT_VERSION_RANGE);
        let version_range =
            VersionReq::parse(range).map_err(|_| SnapControllerError::InvalidVersionRange {
                range: range.to_owned(),
            })?;
        let location = self
            .locations
            .detect(snap_id, &version_range)
            .map_err(|error| SnapControllerError::Fetch {
                snap_id: snap_id.clone(),
                message: error.message,
            })?;

        let existing = self.get(snap_id);
        let is_update = existing.is_some() && !location.should_always_reload();
        match existing {
            Some(existing) if is_update && !version_range.matches(&existing.version) => {
                let mut state = self.lock();
                if state.rollbacks.contains_key(snap_id) {
                    return Err(SnapControllerError::AlreadyUpdating {
                        snap_id: snap_id.clone(),
                    });
                }
                state
                    .rollbacks
                    .insert(snap_id.clone(), RollbackSnapshot::default());
                batch
                    .updates
                    .push((snap_id.clone(), existing.version.clone()));
            }
            _ if !is_update => batch.installs.push(snap_id.clone()),
            _ => {}
        }

        self.process_requested_snap(origin, snap_id, &version_range, location)
            .await
    }

    /// Resolves one requested snap: keeps it, updates it, or installs it.
    ///
    /// # Errors
    ///
    /// Propagates install and update failures.
    pub async fn process_requested_snap(
        self: &Arc<Self>,
        origin: &str,
        snap_id: &SnapId,
        version_range: &VersionReq,
        location: Arc<dyn SnapLocation>,
    ) -> Result<TruncatedSnap, SnapControllerError> {
        let force_reload = location.should_always_reload();
        if !force_reload && let Some(existing) = self.get(snap_id) {
            if version_range.matches(&existing.version) {
                debug!(target: CONTROLLER_TARGET, %snap_id, version = %existing.version, "snap already installed");
                return Ok(existing.truncated());
            }
            return self
                .update_snap(origin, snap_id, location, version_range, false)
                .await;
        }

        let task = {
            let mut state = self.lock();
            let runtime = state
                .runtimes
                .ensure(&self.machine, snap_id, SnapStatus::Installing)?;
            match &runtime.install_task {
                Some(task) => {
                    debug!(target: CONTROLLER_TARGET, %snap_id, "joining install in progress");
                    task.clone()
                }
                None => {
                    let task = self.install_task(origin, snap_id, version_range, location, force_reload);
                    runtime.install_task = Some(task.clone());
                    task
                }
            }
        };

        let result = task.clone().await;
        if let Some(runtime) = self.lock().runtimes.get_mut(snap_id)
            && runtime
                .install_task
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&task))
        {
            runtime.install_task = None;
        }
        result
    }

    fn install_task(
        self: &Arc<Self>,
        origin: &str,
        snap_id: &SnapId,
        version_range: &VersionReq,
        location: Arc<dyn SnapLocation>,
        force_reload: bool,
    ) -> InstallTask {
        let controller = Arc::clone(self);
        let origin = origin.to_owned();
        let snap_id = snap_id.clone();
        let version_range = version_range.clone();
        async move {
            controller
                .install_fresh(&origin, &snap_id, &version_range, location.as_ref(), force_reload)
                .await
        }
        .boxed()
        .shared()
    }

    async fn install_fresh(
        &self,
        origin: &str,
        snap_id: &SnapId,
        version_range: &VersionReq,
        location: &dyn SnapLocation,
        force_reload: bool,
    ) -> Result<TruncatedSnap, SnapControllerError> {
        let PendingApproval { id, decision } = self.approvals.add_request(ApprovalRequest {
            origin: origin.to_owned(),
            snap_id: snap_id.clone(),
            kind: ApprovalKind::Install,
        });
        self.events.publish(ControllerEvent::SnapInstallStarted {
            snap_id: snap_id.clone(),
            origin: origin.to_owned(),
        });

        let result = self
            .add_and_start(origin, snap_id, version_range, location, force_reload, (id.as_str(), decision))
            .await;
        match &result {
            Ok(snap) => {
                self.approvals
                    .update_request_state(&id, ApprovalUpdate::Succeeded);
                info!(target: CONTROLLER_TARGET, %snap_id, version = %snap.version, "snap installed");
            }
            Err(error) => {
                self.approvals.update_request_state(
                    &id,
                    ApprovalUpdate::Failed {
                        error: error.to_string(),
                    },
                );
                self.events.publish(ControllerEvent::SnapInstallFailed {
                    snap_id: snap_id.clone(),
                    origin: origin.to_owned(),
                    error: error.to_string(),
                });
            }
        }
        result
    }

    async fn add_and_start(
        &self,
        origin: &str,
        snap_id: &SnapId,
        version_range: &VersionReq,
        location: &dyn SnapLocation,
        force_reload: bool,
        (approval_id, decision): (&str, oneshot::Receiver<ApprovalDecision>),
    ) -> Result<TruncatedSnap, SnapControllerError> {
        if force_reload {
            self.stop_if_running(snap_id).await?;
            self.permissions.revoke_all(snap_id);
        }

        let fetched = fetch_snap(snap_id, location).await?;
        if !version_range.matches(&fetched.manifest.version) {
            return Err(SnapControllerError::VersionMismatch {
                snap_id: snap_id.clone(),
                version: fetched.manifest.version,
                range: version_range.clone(),
            });
        }
        self.verify_with_registry(snap_id, &fetched).await?;
        self.check_excluded_permissions(snap_id, &fetched.manifest)?;

        let permissions = fetched.manifest.initial_permissions.clone();
        let connections = fetched.manifest.initial_connections.clone();
        self.store_fetched(origin, snap_id, fetched);

        self.approvals.update_request_state(
            approval_id,
            ApprovalUpdate::Install {
                permissions,
                connections: connections.clone(),
            },
        );
        let decision = await_decision(snap_id, decision).await?;
        self.permissions.grant(snap_id, &decision.permissions);
        for connection in connections.keys() {
            self.permissions.grant_connection(connection, snap_id);
        }

        self.start_snap(snap_id).await?;
        self.get_truncated_expect(snap_id)
    }

    /// Writes a freshly fetched package as the record of `snap_id`, keeping
    /// the version history of a record it replaces.
    fn store_fetched(&self, origin: &str, snap_id: &SnapId, fetched: FetchedSnap) {
        let FetchedSnap {
            manifest,
            source_code,
            auxiliary_files,
            localization_files,
        } = fetched;
        let mut state = self.lock();
        let status = state
            .runtimes
            .get(snap_id)
            .map_or(SnapStatus::Installing, SnapRuntime::status);
        state.store.update(snap_id, |draft| {
            let mut version_history = draft
                .take()
                .map(|previous| previous.version_history)
                .unwrap_or_default();
            version_history.push(VersionHistoryEntry {
                version: manifest.version.clone(),
                date: now_millis(),
                origin: origin.to_owned(),
            });
            *draft = Some(Snap {
                id: snap_id.clone(),
                status,
                version: manifest.version.clone(),
                version_history,
                enabled: true,
                blocked: false,
                block_information: None,
                removable: true,
                preinstalled: false,
                hidden: false,
                initial_permissions: manifest.initial_permissions.clone(),
                initial_connections: manifest.initial_connections.clone(),
                source_code,
                manifest,
                auxiliary_files,
                localization_files,
            });
        });
    }

    /// Rejects packages the registry blocks, and unverified packages when
    /// an allowlist is required.
    pub(super) async fn verify_with_registry(
        &self,
        snap_id: &SnapId,
        fetched: &FetchedSnap,
    ) -> Result<(), SnapControllerError> {
        let query = RegistryQuery {
            snap_id: snap_id.clone(),
            version: fetched.manifest.version.clone(),
            checksum: fetched.manifest.source.shasum.clone(),
        };
        let verdicts = self
            .registry
            .get(vec![query])
            .await
            .map_err(|error| SnapControllerError::Registry {
                message: error.message,
            })?;
        match verdicts.get(snap_id) {
            Some(RegistryVerdict::Blocked { reason }) => Err(SnapControllerError::RegistryRejected {
                snap_id: snap_id.clone(),
                reason: reason
                    .as_ref()
                    .and_then(|reason| reason.explanation.clone())
                    .unwrap_or_else(|| "blocked".to_owned()),
            }),
            Some(RegistryVerdict::Unverified) | None if self.config.require_allowlist => {
                Err(SnapControllerError::RegistryRejected {
                    snap_id: snap_id.clone(),
                    reason: "not on the allowlist".to_owned(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Rejects manifests asking for a permission the host excludes.
    pub(super) fn check_excluded_permissions(
        &self,
        snap_id: &SnapId,
        manifest: &SnapManifest,
    ) -> Result<(), SnapControllerError> {
        match self
            .config
            .excluded_permissions
            .iter()
            .find(|(permission, _)| manifest.initial_permissions.contains_key(*permission))
        {
            Some((permission, message)) => Err(SnapControllerError::ExcludedPermission {
                snap_id: snap_id.clone(),
                permission: permission.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn undo_batch(&self, batch: &Batch) {
        for snap_id in &batch.installs {
            let result = if self.has(snap_id) {
                self.remove_unchecked(snap_id).await
            } else {
                self.lock().runtimes.remove(snap_id);
                Ok(())
            };
            if let Err(error) = result {
                warn!(target: CONTROLLER_TARGET, %snap_id, %error, "failed to remove snap of failed batch");
            }
        }
        for (snap_id, _) in &batch.updates {
            if let Err(error) = self.rollback_snap(snap_id).await {
                warn!(target: CONTROLLER_TARGET, %snap_id, %error, "failed to roll back snap of failed batch");
            }
        }
    }

    async fn run_lifecycle_hook(self: &Arc<Self>, origin: &str, snap_id: &SnapId, handler: HandlerType) {
        if !self
            .permissions
            .has_permission(snap_id, LIFECYCLE_HOOKS_PERMISSION)
        {
            return;
        }
        let request = HandleRequest {
            snap_id: snap_id.clone(),
            origin: origin.to_owned(),
            handler,
            request: JsonRpcRequest::new(handler.to_string(), None),
        };
        if let Err(error) = self.handle_request(request).await {
            warn!(target: CONTROLLER_TARGET, %snap_id, %handler, %error, "lifecycle hook failed");
        }
    }
}

/// Waits for the user. A dropped approval counts as a rejection.
pub(super) async fn await_decision(
    snap_id: &SnapId,
    decision: oneshot::Receiver<ApprovalDecision>,
) -> Result<ApprovalDecision, SnapControllerError> {
    match decision.await {
        Ok(decision) if decision.approved => Ok(decision),
        _ => Err(SnapControllerError::ApprovalRejected {
            snap_id: snap_id.clone(),
        }),
    }
}
