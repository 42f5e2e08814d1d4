//! The snap orchestrator.
//!
//! [`SnapController`] owns the snap store, the runtime registry and the
//! rollback snapshots behind a single mutex that is never held across an
//! `.await`. Everything that suspends (the execution layer, approvals,
//! package fetches, key derivation, timers) runs with the lock released and
//! re-validates what it needs afterwards.
//!
//! Two background tasks run for the controller's lifetime: the idle sweep,
//! and a listener that turns execution events into timer pauses and
//! crashes. Both hold only a weak reference, so dropping the last
//! [`Arc<SnapController>`] ends them.

mod install;
mod lifecycle;
mod rpc;
mod state;
mod update;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use snaps_config::ControllerConfig;
use snaps_execution::{ExecutionEnvironment, ExecutionEvent, SnapId};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::approval::ApprovalController;
use crate::encryption::EntropySource;
use crate::error::SnapControllerError;
use crate::events::{ControllerEvent, EventBus};
use crate::fsm::{Machine, SnapStatus, StatusEvent, TransitionOutcome};
use crate::location::LocationResolver;
use crate::permissions::PermissionController;
use crate::registry::SnapsRegistry;
use crate::rollback::RollbackSnapshot;
use crate::runtime::RuntimeRegistry;
use crate::snap::{PersistedSnapsState, Snap, SnapFile, SnapManifest, TruncatedSnap};
use crate::store::{SnapStore, lifecycle_machine};
use crate::telemetry;

pub use self::lifecycle::PREINSTALLED_ORIGIN;
pub use self::rpc::HandleRequest;

/// Log target for controller operations.
pub(crate) const CONTROLLER_TARGET: &str = "snaps_controller::controller";

/// A snap shipped with the host and installed without approval.
#[derive(Debug, Clone, PartialEq)]
pub struct PreinstalledSnap {
    /// Identifier.
    pub snap_id: SnapId,
    /// Package manifest.
    pub manifest: SnapManifest,
    /// Bundle source.
    pub source_code: String,
    /// Auxiliary files.
    pub auxiliary_files: Vec<SnapFile>,
    /// Localization files.
    pub localization_files: Vec<SnapFile>,
    /// Whether users may uninstall it.
    pub removable: bool,
    /// Whether it is hidden from listings.
    pub hidden: bool,
}

/// Collaborators and settings of a [`SnapController`].
pub struct SnapControllerOptions {
    /// Lifecycle and policy settings.
    pub config: ControllerConfig,
    /// Execution layer running the snaps.
    pub execution: Arc<dyn ExecutionEnvironment>,
    /// Capability store.
    pub permissions: Arc<dyn PermissionController>,
    /// Approval UI.
    pub approvals: Arc<dyn ApprovalController>,
    /// Package sources.
    pub locations: Arc<dyn LocationResolver>,
    /// Verification and block lists.
    pub registry: Arc<dyn SnapsRegistry>,
    /// Master secret for state encryption.
    pub entropy: Arc<dyn EntropySource>,
    /// Previously persisted state, if any.
    pub persisted: Option<PersistedSnapsState>,
    /// Snaps shipped with the host.
    pub preinstalled: Vec<PreinstalledSnap>,
}

#[derive(Default)]
pub(crate) struct ControllerState {
    pub(crate) store: SnapStore,
    pub(crate) runtimes: RuntimeRegistry,
    pub(crate) rollbacks: HashMap<SnapId, RollbackSnapshot>,
}

impl ControllerState {
    /// Feeds `event` to the interpreter of `snap_id`.
    pub(crate) fn transition(
        &mut self,
        snap_id: &SnapId,
        event: StatusEvent,
    ) -> Result<TransitionOutcome, SnapControllerError> {
        let Self {
            store, runtimes, ..
        } = self;
        let runtime = runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapControllerError::NoRuntime {
                snap_id: snap_id.clone(),
            })?;
        let outcome = runtime.interpreter.send(store, event)?;
        match outcome {
            TransitionOutcome::Changed { from, to } => {
                debug!(target: CONTROLLER_TARGET, %snap_id, %event, %from, %to, "snap status changed");
            }
            TransitionOutcome::Unchanged => {
                debug!(
                    target: CONTROLLER_TARGET,
                    %snap_id,
                    %event,
                    status = %runtime.status(),
                    "status event ignored"
                );
            }
        }
        Ok(outcome)
    }

    /// Forces the interpreter and record of `snap_id` to `status`.
    pub(crate) fn force_status(&mut self, snap_id: &SnapId, status: SnapStatus) {
        let Self {
            store, runtimes, ..
        } = self;
        match runtimes.get_mut(snap_id) {
            Some(runtime) => runtime.interpreter.force(store, status),
            None => store.set_status(snap_id, status),
        }
    }

    pub(crate) fn is_running(&self, snap_id: &SnapId) -> bool {
        self.runtimes
            .get(snap_id)
            .is_some_and(crate::runtime::SnapRuntime::is_running)
    }
}

/// Orchestrates installation, execution, updates and removal of snaps.
pub struct SnapController {
    config: ControllerConfig,
    machine: Arc<Machine<SnapStore>>,
    state: Mutex<ControllerState>,
    execution: Arc<dyn ExecutionEnvironment>,
    permissions: Arc<dyn PermissionController>,
    approvals: Arc<dyn ApprovalController>,
    locations: Arc<dyn LocationResolver>,
    registry: Arc<dyn SnapsRegistry>,
    entropy: Arc<dyn EntropySource>,
    preinstalled: Vec<PreinstalledSnap>,
    events: EventBus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SnapController {
    /// Builds a controller, loads persisted snaps as stopped, applies
    /// preinstalled snaps, and starts the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::Fsm`] when the lifecycle machine is
    /// incomplete.
    pub fn new(options: SnapControllerOptions) -> Result<Arc<Self>, SnapControllerError> {
        let SnapControllerOptions {
            config,
            execution,
            permissions,
            approvals,
            locations,
            registry,
            entropy,
            persisted,
            preinstalled,
        } = options;
        let machine = Arc::new(lifecycle_machine()?);

        let mut state = ControllerState {
            store: persisted.map(SnapStore::from_persisted).unwrap_or_default(),
            ..ControllerState::default()
        };
        for snap_id in state.store.ids() {
            state.force_status(&snap_id, SnapStatus::Stopped);
            state
                .runtimes
                .ensure(&machine, &snap_id, SnapStatus::Stopped)?;
        }

        let controller = Arc::new(Self {
            config,
            machine,
            state: Mutex::new(state),
            execution,
            permissions,
            approvals,
            locations,
            registry,
            entropy,
            preinstalled,
            events: EventBus::default(),
            tasks: Mutex::new(Vec::new()),
        });
        controller.apply_preinstalled()?;
        controller.spawn_background_tasks();
        let snaps = controller.lock().store.ids().len();
        telemetry::report_startup(&controller.config, snaps, controller.preinstalled.len());
        Ok(controller)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to controller events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Settings the controller runs with.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Snapshot of the record of `snap_id`.
    #[must_use]
    pub fn get(&self, snap_id: &SnapId) -> Option<Arc<Snap>> {
        self.lock().store.get(snap_id)
    }

    /// Snapshot of the record of `snap_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`] for unknown snaps.
    pub fn get_expect(&self, snap_id: &SnapId) -> Result<Arc<Snap>, SnapControllerError> {
        self.get(snap_id).ok_or_else(|| SnapControllerError::NotFound {
            snap_id: snap_id.clone(),
        })
    }

    /// Returns `true` when `snap_id` is installed.
    #[must_use]
    pub fn has(&self, snap_id: &SnapId) -> bool {
        self.lock().store.contains(snap_id)
    }

    /// Public summary of `snap_id`.
    #[must_use]
    pub fn get_truncated(&self, snap_id: &SnapId) -> Option<TruncatedSnap> {
        self.get(snap_id).map(|snap| snap.truncated())
    }

    /// Public summary of `snap_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`] for unknown snaps.
    pub fn get_truncated_expect(&self, snap_id: &SnapId) -> Result<TruncatedSnap, SnapControllerError> {
        self.get_expect(snap_id).map(|snap| snap.truncated())
    }

    /// Summaries of every snap as persisted, so every status reads
    /// [`SnapStatus::Stopped`].
    #[must_use]
    pub fn get_all_snaps(&self) -> Vec<TruncatedSnap> {
        self.persisted_state()
            .snaps
            .values()
            .map(Snap::truncated)
            .collect()
    }

    /// Snaps that may be started: enabled and not blocked.
    #[must_use]
    pub fn get_runnable_snaps(&self) -> Vec<Arc<Snap>> {
        self.lock()
            .store
            .snaps()
            .into_iter()
            .filter(|snap| snap.enabled && !snap.blocked)
            .collect()
    }

    /// Runnable snaps `origin` is connected to.
    #[must_use]
    pub fn get_permitted_snaps(&self, origin: &str) -> BTreeMap<SnapId, TruncatedSnap> {
        let connected = self.permissions.connected_snaps(origin);
        let state = self.lock();
        connected
            .into_iter()
            .filter_map(|snap_id| state.store.get(&snap_id))
            .filter(|snap| snap.enabled && !snap.blocked)
            .map(|snap| (snap.id.clone(), snap.truncated()))
            .collect()
    }

    /// Durable projection of the controller.
    #[must_use]
    pub fn persisted_state(&self) -> PersistedSnapsState {
        self.lock().store.persisted()
    }

    /// Returns `true` when `snap_id` is executing.
    #[must_use]
    pub fn is_running(&self, snap_id: &SnapId) -> bool {
        self.lock().is_running(snap_id)
    }

    /// Terminates every snap, revokes every snap's permissions, and resets
    /// the controller to its preinstalled snaps.
    ///
    /// # Errors
    ///
    /// Propagates failures to re-apply preinstalled snaps.
    pub async fn clear_state(&self) -> Result<(), SnapControllerError> {
        self.execution.terminate_all_snaps().await;
        let snap_ids = self.lock().store.ids();
        for snap_id in &snap_ids {
            self.permissions.revoke_all(snap_id);
            self.permissions.remove_connections(snap_id);
        }
        {
            let mut state = self.lock();
            state.runtimes.clear();
            state.rollbacks.clear();
            state.store.clear();
        }
        info!(target: CONTROLLER_TARGET, cleared = snap_ids.len(), "controller state cleared");
        self.apply_preinstalled()
    }

    /// Stops the background tasks and terminates every snap.
    pub async fn destroy(&self) {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        self.execution.terminate_all_snaps().await;
        let snap_ids: Vec<SnapId> = {
            let state = self.lock();
            state
                .runtimes
                .iter()
                .filter(|(_, runtime)| runtime.is_running())
                .map(|(snap_id, _)| snap_id.clone())
                .collect()
        };
        let mut state = self.lock();
        for snap_id in snap_ids {
            if let Some(runtime) = state.runtimes.get_mut(&snap_id) {
                runtime.reset_requests();
            }
            if let Err(error) = state.transition(&snap_id, StatusEvent::Stop) {
                debug!(target: CONTROLLER_TARGET, %snap_id, %error, "snap not stopped on destroy");
            }
        }
        info!(target: CONTROLLER_TARGET, "snap controller destroyed");
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let idle = tokio::spawn(run_idle_sweep(
            Arc::downgrade(self),
            self.config.idle_check_interval(),
        ));
        let listener = tokio::spawn(run_event_listener(
            Arc::downgrade(self),
            self.execution.subscribe(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([idle, listener]);
    }

    fn handle_execution_event(self: &Arc<Self>, event: ExecutionEvent) {
        match event {
            ExecutionEvent::OutboundRequest { snap_id } => {
                if let Some(runtime) = self.lock().runtimes.get_mut(&snap_id) {
                    runtime.begin_outbound();
                }
            }
            ExecutionEvent::OutboundResponse { snap_id } => {
                if let Some(runtime) = self.lock().runtimes.get_mut(&snap_id) {
                    runtime.finish_outbound();
                }
            }
            ExecutionEvent::UnhandledError { snap_id, error } => {
                warn!(target: CONTROLLER_TARGET, %snap_id, %error, "snap crashed");
                let controller = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(error) = controller.stop_snap(&snap_id, StatusEvent::Crash).await {
                        warn!(target: CONTROLLER_TARGET, %snap_id, %error, "failed to stop crashed snap");
                    }
                });
            }
        }
    }
}

impl fmt::Debug for SnapController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapController")
            .field("config", &self.config)
            .field("snaps", &self.lock().store.ids())
            .finish_non_exhaustive()
    }
}

async fn run_idle_sweep(controller: Weak<SnapController>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.stop_idle_snaps().await;
    }
}

async fn run_event_listener(
    controller: Weak<SnapController>,
    mut events: tokio::sync::broadcast::Receiver<ExecutionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: CONTROLLER_TARGET, skipped, "execution events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_execution_event(event);
    }
}

/// Milliseconds since the Unix epoch, for version history entries.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}
