//! Starting, stopping, enabling, blocking and removing snaps.

use futures::future::join_all;
use snaps_execution::{ExecutionEnvironment, ExecutionError, SnapExecutionData, SnapId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CONTROLLER_TARGET, SnapController, now_millis};
use crate::error::SnapControllerError;
use crate::events::ControllerEvent;
use crate::fsm::{SnapStatus, StatusEvent, TransitionOutcome};
use crate::handlers::endowments;
use crate::registry::{RegistryQuery, RegistryVerdict};
use crate::snap::{BlockReason, Snap, VersionHistoryEntry};

/// Origin recorded for snaps shipped with the host.
pub const PREINSTALLED_ORIGIN: &str = "preinstalled";

impl SnapController {
    /// Boots `snap_id` in the execution layer.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`],
    /// [`SnapControllerError::SnapDisabled`] or
    /// [`SnapControllerError::AlreadyRunning`] before touching the execution
    /// layer, [`SnapControllerError::AlreadyRunning`] while another start is
    /// in flight, and [`SnapControllerError::Execution`] when the boot fails.
    /// A snap disabled while booting has its job discarded and yields
    /// [`SnapControllerError::SnapDisabled`].
    pub async fn start_snap(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        let data = {
            let mut state = self.lock();
            let snap = state
                .store
                .get(snap_id)
                .ok_or_else(|| SnapControllerError::NotFound {
                    snap_id: snap_id.clone(),
                })?;
            if !snap.enabled {
                return Err(SnapControllerError::SnapDisabled {
                    snap_id: snap_id.clone(),
                });
            }
            let runtime = state.runtimes.ensure(&self.machine, snap_id, snap.status)?;
            if runtime.is_running() || runtime.starting {
                return Err(SnapControllerError::AlreadyRunning {
                    snap_id: snap_id.clone(),
                });
            }
            runtime.starting = true;
            SnapExecutionData {
                snap_id: snap_id.clone(),
                source_code: snap.source_code.clone(),
                endowments: endowments(self.permissions.granted(snap_id).keys()),
            }
        };

        let executed = self.execution.execute_snap(data).await;

        let outcome = {
            let mut state = self.lock();
            if let Some(runtime) = state.runtimes.get_mut(snap_id) {
                runtime.starting = false;
            }
            if let Err(error) = executed {
                warn!(target: CONTROLLER_TARGET, %snap_id, %error, "snap failed to start");
                return Err(match error {
                    ExecutionError::AlreadyRunning { snap_id } => {
                        SnapControllerError::AlreadyRunning { snap_id }
                    }
                    other => other.into(),
                });
            }
            let outcome = state.transition(snap_id, StatusEvent::Start);
            if let Ok(TransitionOutcome::Changed { .. }) = outcome
                && let Some(runtime) = state.runtimes.get_mut(snap_id)
            {
                runtime.last_request = Some(Instant::now());
            }
            outcome
        };

        // A refused start still holds a job.
        let error = match outcome {
            Ok(TransitionOutcome::Changed { .. }) => {
                info!(target: CONTROLLER_TARGET, %snap_id, "snap started");
                return Ok(());
            }
            Ok(TransitionOutcome::Unchanged) => SnapControllerError::SnapDisabled {
                snap_id: snap_id.clone(),
            },
            Err(error) => error,
        };
        warn!(target: CONTROLLER_TARGET, %snap_id, %error, "discarding job of refused start");
        terminate_quietly(self.execution.as_ref(), snap_id).await;
        Err(error)
    }

    /// Stops `snap_id` and moves it through `event`, normally
    /// [`StatusEvent::Stop`] or [`StatusEvent::Crash`].
    ///
    /// Stopping a snap that is already being stopped does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NoRuntime`] for snaps never
    /// instantiated since startup.
    pub async fn stop_snap(&self, snap_id: &SnapId, event: StatusEvent) -> Result<(), SnapControllerError> {
        let running = {
            let mut state = self.lock();
            let runtime = state
                .runtimes
                .get_mut(snap_id)
                .ok_or_else(|| SnapControllerError::NoRuntime {
                    snap_id: snap_id.clone(),
                })?;
            if runtime.stopping {
                debug!(target: CONTROLLER_TARGET, %snap_id, "snap already stopping");
                return Ok(());
            }
            runtime.stopping = true;
            runtime.is_running()
        };

        if running {
            terminate_quietly(self.execution.as_ref(), snap_id).await;
        }

        let mut state = self.lock();
        if let Some(runtime) = state.runtimes.get_mut(snap_id) {
            runtime.reset_requests();
            runtime.stopping = false;
            runtime.starting = false;
        }
        let outcome = state.transition(snap_id, event)?;
        let snap = state.store.get(snap_id);
        drop(state);

        if let Some(snap) = snap {
            self.events.publish(ControllerEvent::SnapTerminated {
                snap: snap.truncated(),
            });
        }
        if let TransitionOutcome::Changed { to, .. } = outcome {
            info!(target: CONTROLLER_TARGET, %snap_id, status = %to, "snap stopped");
        }
        Ok(())
    }

    /// Stops every snap that has been idle longer than the configured
    /// maximum and holds no references or pending requests.
    pub async fn stop_idle_snaps(&self) {
        let max_idle = self.config.max_idle_time();
        let idle: Vec<SnapId> = {
            let state = self.lock();
            state
                .runtimes
                .iter()
                .filter(|(_, runtime)| {
                    runtime.active_references == 0
                        && runtime.pending_inbound.is_empty()
                        && runtime
                            .last_request
                            .is_some_and(|last| last.elapsed() > max_idle)
                })
                .map(|(snap_id, _)| snap_id.clone())
                .collect()
        };
        if idle.is_empty() {
            return;
        }
        debug!(target: CONTROLLER_TARGET, count = idle.len(), "stopping idle snaps");
        let results = join_all(
            idle.iter()
                .map(|snap_id| self.stop_snap(snap_id, StatusEvent::Stop)),
        )
        .await;
        for (snap_id, result) in idle.iter().zip(results) {
            if let Err(error) = result {
                warn!(target: CONTROLLER_TARGET, %snap_id, %error, "failed to stop idle snap");
            }
        }
    }

    /// Stops `snap_id` when it is running.
    pub(crate) async fn stop_if_running(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        if self.is_running(snap_id) {
            self.stop_snap(snap_id, StatusEvent::Stop).await?;
        }
        Ok(())
    }

    /// Allows `snap_id` to run again.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`] or
    /// [`SnapControllerError::SnapBlocked`].
    pub fn enable_snap(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        let snap = {
            let mut state = self.lock();
            let snap = state
                .store
                .get(snap_id)
                .ok_or_else(|| SnapControllerError::NotFound {
                    snap_id: snap_id.clone(),
                })?;
            if snap.blocked {
                return Err(SnapControllerError::SnapBlocked {
                    snap_id: snap_id.clone(),
                });
            }
            state.store.modify(snap_id, |snap| snap.enabled = true);
            state.store.get(snap_id)
        };
        if let Some(snap) = snap {
            self.events.publish(ControllerEvent::SnapEnabled {
                snap: snap.truncated(),
            });
        }
        Ok(())
    }

    /// Prevents `snap_id` from running, stopping it first.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`] for unknown snaps.
    pub async fn disable_snap(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        if !self.has(snap_id) {
            return Err(SnapControllerError::NotFound {
                snap_id: snap_id.clone(),
            });
        }
        self.stop_if_running(snap_id).await?;
        let snap = {
            let mut state = self.lock();
            state.store.modify(snap_id, |snap| snap.enabled = false);
            state.store.get(snap_id)
        };
        if let Some(snap) = snap {
            self.events.publish(ControllerEvent::SnapDisabled {
                snap: snap.truncated(),
            });
        }
        Ok(())
    }

    /// Marks `snap_id` blocked and disables it. Unknown snaps are ignored.
    ///
    /// # Errors
    ///
    /// Propagates failures to stop the snap.
    pub async fn block_snap(
        &self,
        snap_id: &SnapId,
        reason: Option<BlockReason>,
    ) -> Result<(), SnapControllerError> {
        if !self.has(snap_id) {
            return Ok(());
        }
        let explanation = reason.as_ref().and_then(|reason| reason.explanation.clone());
        self.lock().store.modify(snap_id, |snap| {
            snap.blocked = true;
            snap.block_information = reason;
        });
        self.disable_snap(snap_id).await?;
        warn!(target: CONTROLLER_TARGET, %snap_id, "snap blocked");
        self.events.publish(ControllerEvent::SnapBlocked {
            snap_id: snap_id.clone(),
            explanation,
        });
        Ok(())
    }

    /// Lifts a block. The snap stays disabled until enabled again.
    pub fn unblock_snap(&self, snap_id: &SnapId) {
        let changed = self
            .lock()
            .store
            .modify(snap_id, |snap| {
                snap.blocked = false;
                snap.block_information = None;
            })
            .is_some();
        if changed {
            info!(target: CONTROLLER_TARGET, %snap_id, "snap unblocked");
            self.events.publish(ControllerEvent::SnapUnblocked {
                snap_id: snap_id.clone(),
            });
        }
    }

    /// Asks the registry about every installed snap and blocks or unblocks
    /// each accordingly.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::Registry`] when the registry fails.
    pub async fn update_blocked_snaps(&self) -> Result<(), SnapControllerError> {
        let snaps = self.lock().store.snaps();
        let queries = snaps
            .iter()
            .map(|snap| RegistryQuery {
                snap_id: snap.id.clone(),
                version: snap.version.clone(),
                checksum: snap.manifest.source.shasum.clone(),
            })
            .collect();
        let verdicts = self
            .registry
            .get(queries)
            .await
            .map_err(|error| SnapControllerError::Registry {
                message: error.message,
            })?;
        for snap in snaps {
            match verdicts.get(&snap.id) {
                Some(RegistryVerdict::Blocked { reason }) => {
                    self.block_snap(&snap.id, reason.clone()).await?;
                }
                _ if snap.blocked => self.unblock_snap(&snap.id),
                _ => {}
            }
        }
        Ok(())
    }

    /// Removes one snap.
    ///
    /// # Errors
    ///
    /// See [`SnapController::remove_snaps`].
    pub async fn remove_snap(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        self.remove_snaps(std::slice::from_ref(snap_id)).await
    }

    /// Removes snaps with their permissions, connections, runtimes and
    /// states. Nothing is removed unless every snap exists and is
    /// removable.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`] or
    /// [`SnapControllerError::NotRemovable`].
    pub async fn remove_snaps(&self, snap_ids: &[SnapId]) -> Result<(), SnapControllerError> {
        {
            let state = self.lock();
            for snap_id in snap_ids {
                let snap = state
                    .store
                    .get(snap_id)
                    .ok_or_else(|| SnapControllerError::NotFound {
                        snap_id: snap_id.clone(),
                    })?;
                if !snap.removable {
                    return Err(SnapControllerError::NotRemovable {
                        snap_id: snap_id.clone(),
                    });
                }
            }
        }
        for snap_id in snap_ids {
            self.remove_unchecked(snap_id).await?;
        }
        Ok(())
    }

    /// Removes a snap without the removability check. Used to undo fresh
    /// installs of a failed batch.
    pub(crate) async fn remove_unchecked(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        if self.lock().runtimes.contains(snap_id) {
            self.stop_if_running(snap_id).await?;
        }
        self.permissions.revoke_all(snap_id);
        self.permissions.remove_connections(snap_id);
        let removed = {
            let mut state = self.lock();
            state.runtimes.remove(snap_id);
            state.rollbacks.remove(snap_id);
            let removed = state.store.get(snap_id);
            state.store.remove(snap_id);
            removed
        };
        if let Some(snap) = removed {
            info!(target: CONTROLLER_TARGET, %snap_id, "snap removed");
            if snap.status != SnapStatus::Installing {
                self.events.publish(ControllerEvent::SnapUninstalled {
                    snap: snap.truncated(),
                });
            }
        }
        Ok(())
    }

    /// Marks `snap_id` as in use, which keeps the idle sweep away.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NoRuntime`].
    pub fn increment_active_references(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        let mut state = self.lock();
        let runtime = state
            .runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapControllerError::NoRuntime {
                snap_id: snap_id.clone(),
            })?;
        runtime.active_references = runtime.active_references.saturating_add(1);
        Ok(())
    }

    /// Releases a reference taken with
    /// [`SnapController::increment_active_references`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NoRuntime`] or
    /// [`SnapControllerError::NoActiveReferences`] at zero.
    pub fn decrement_active_references(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        let mut state = self.lock();
        let runtime = state
            .runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapControllerError::NoRuntime {
                snap_id: snap_id.clone(),
            })?;
        runtime.active_references = runtime
            .active_references
            .checked_sub(1)
            .ok_or_else(|| SnapControllerError::NoActiveReferences {
                snap_id: snap_id.clone(),
            })?;
        Ok(())
    }

    /// Stores every preinstalled snap not already present at an equal or
    /// newer version and grants what its manifest asks for.
    pub(super) fn apply_preinstalled(&self) -> Result<(), SnapControllerError> {
        for preinstalled in &self.preinstalled {
            let snap_id = &preinstalled.snap_id;
            let manifest = &preinstalled.manifest;
            let (snap, old_version) = {
                let mut state = self.lock();
                let existing = state.store.get(snap_id);
                if existing
                    .as_ref()
                    .is_some_and(|snap| snap.version >= manifest.version)
                {
                    continue;
                }
                state.store.update(snap_id, |draft| {
                    let mut version_history = draft
                        .take()
                        .map(|snap| snap.version_history)
                        .unwrap_or_default();
                    version_history.push(VersionHistoryEntry {
                        version: manifest.version.clone(),
                        date: now_millis(),
                        origin: PREINSTALLED_ORIGIN.to_owned(),
                    });
                    *draft = Some(Snap {
                        id: snap_id.clone(),
                        status: SnapStatus::Stopped,
                        version: manifest.version.clone(),
                        version_history,
                        enabled: true,
                        blocked: false,
                        block_information: None,
                        removable: preinstalled.removable,
                        preinstalled: true,
                        hidden: preinstalled.hidden,
                        initial_permissions: manifest.initial_permissions.clone(),
                        initial_connections: manifest.initial_connections.clone(),
                        source_code: preinstalled.source_code.clone(),
                        manifest: manifest.clone(),
                        auxiliary_files: preinstalled.auxiliary_files.clone(),
                        localization_files: preinstalled.localization_files.clone(),
                    });
                });
                state.force_status(snap_id, SnapStatus::Stopped);
                state
                    .runtimes
                    .ensure(&self.machine, snap_id, SnapStatus::Stopped)?;
                (
                    state.store.get(snap_id),
                    existing.map(|snap| snap.version.clone()),
                )
            };

            self.permissions.grant(snap_id, &manifest.initial_permissions);
            for origin in manifest.initial_connections.keys() {
                self.permissions.grant_connection(origin, snap_id);
            }

            let Some(snap) = snap else { continue };
            info!(target: CONTROLLER_TARGET, %snap_id, version = %snap.version, "preinstalled snap applied");
            let event = match old_version {
                Some(old_version) => ControllerEvent::SnapUpdated {
                    snap: snap.truncated(),
                    old_version,
                    origin: PREINSTALLED_ORIGIN.to_owned(),
                    preinstalled: true,
                },
                None => ControllerEvent::SnapInstalled {
                    snap: snap.truncated(),
                    origin: PREINSTALLED_ORIGIN.to_owned(),
                    preinstalled: true,
                },
            };
            self.events.publish(event);
        }
        Ok(())
    }
}

/// Terminates the job of `snap_id`, logging failures.
async fn terminate_quietly(execution: &dyn ExecutionEnvironment, snap_id: &SnapId) {
    if let Err(error) = execution.terminate_snap(snap_id).await {
        warn!(target: CONTROLLER_TARGET, %snap_id, %error, "failed to terminate snap job");
    }
}
