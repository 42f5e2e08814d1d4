//! Shared harness for controller tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use snaps_config::{ControllerConfig, ExecutionConfig};
use snaps_execution::test_support::SimulatedTransport;
use snaps_execution::{ExecutionService, HandlerType, JsonRpcRequest, NoProvider, SnapId};
use tokio::sync::broadcast;

use crate::controller::{HandleRequest, PreinstalledSnap, SnapController, SnapControllerOptions};
use crate::error::SnapControllerError;
use crate::events::ControllerEvent;
use crate::handlers::{RPC_ORIGIN_CAVEAT, RPC_PERMISSION};
use crate::permissions::{Caveat, Permission};
use crate::registry::{EmptyRegistry, SnapsRegistry};
use crate::snap::{PersistedSnapsState, TruncatedSnap};
use crate::test_support::{
    AutoApprover, InMemoryPermissions, StaticEntropy, StaticLocation, StaticResolver, snap_record,
};

pub(super) const ORIGIN: &str = "https://dapp.example";
pub(super) const SOURCE: &str = "module.exports.onRpcRequest = handle;";

pub(super) fn execution_config() -> ExecutionConfig {
    ExecutionConfig {
        init_timeout_ms: 1_000,
        ping_timeout_ms: 100,
        termination_timeout_ms: 50,
        use_ping: true,
    }
}

pub(super) fn controller_config() -> ControllerConfig {
    ControllerConfig {
        max_idle_time_ms: 30_000,
        idle_check_interval_ms: 5_000,
        max_request_time_ms: 1_000,
        max_queue_size: 5,
        state_key_iterations: 1_000,
        ..ControllerConfig::default()
    }
}

/// `endowment:rpc` open to dapps and snaps.
pub(super) fn rpc_permission() -> Permission {
    Permission::with_caveats(vec![Caveat::new(
        RPC_ORIGIN_CAVEAT,
        json!({ "dapps": true, "snaps": true }),
    )])
}

/// A package serving RPC requests.
pub(super) fn package(version: &str, source: &str) -> StaticLocation {
    StaticLocation::new(version, source).with_permission(RPC_PERMISSION, rpc_permission())
}

/// A snap shipped with the host, not removable.
pub(super) fn preinstalled(snap_id: &str, version: &str) -> PreinstalledSnap {
    let record = snap_record(snap_id, version);
    let mut manifest = record.manifest;
    manifest
        .initial_permissions
        .insert(RPC_PERMISSION.to_owned(), rpc_permission());
    PreinstalledSnap {
        snap_id: record.id,
        manifest,
        source_code: record.source_code,
        auxiliary_files: Vec::new(),
        localization_files: Vec::new(),
        removable: false,
        hidden: false,
    }
}

/// Collaborators to build a [`Harness`] from.
pub(super) struct Setup {
    pub(super) config: ControllerConfig,
    pub(super) approvals: AutoApprover,
    pub(super) registry: Arc<dyn SnapsRegistry>,
    pub(super) persisted: Option<PersistedSnapsState>,
    pub(super) preinstalled: Vec<PreinstalledSnap>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: controller_config(),
            approvals: AutoApprover::approving(),
            registry: Arc::new(EmptyRegistry),
            persisted: None,
            preinstalled: Vec::new(),
        }
    }
}

impl Setup {
    /// Builds the controller. Must run inside a Tokio runtime.
    pub(super) fn build(self) -> Harness {
        let transport = Arc::new(SimulatedTransport::new());
        let execution = Arc::new(ExecutionService::new(
            Arc::clone(&transport),
            Arc::new(NoProvider),
            execution_config(),
        ));
        let permissions = Arc::new(InMemoryPermissions::default());
        let approvals = Arc::new(self.approvals);
        let resolver = Arc::new(StaticResolver::default());
        let controller = SnapController::new(SnapControllerOptions {
            config: self.config,
            execution,
            permissions: Arc::clone(&permissions) as _,
            approvals: Arc::clone(&approvals) as _,
            locations: Arc::clone(&resolver) as _,
            registry: self.registry,
            entropy: Arc::new(StaticEntropy::default()),
            persisted: self.persisted,
            preinstalled: self.preinstalled,
        })
        .expect("controller");
        Harness {
            controller,
            transport,
            permissions,
            approvals,
            resolver,
        }
    }
}

/// A controller wired to in-memory collaborators.
pub(super) struct Harness {
    pub(super) controller: Arc<SnapController>,
    pub(super) transport: Arc<SimulatedTransport>,
    pub(super) permissions: Arc<InMemoryPermissions>,
    pub(super) approvals: Arc<AutoApprover>,
    pub(super) resolver: Arc<StaticResolver>,
}

pub(super) fn harness() -> Harness {
    Setup::default().build()
}

impl Harness {
    /// Serves `snap_id` from `location` and returns a handle to it.
    pub(super) fn serve(&self, snap_id: &str, location: StaticLocation) -> Arc<StaticLocation> {
        let location = Arc::new(location);
        self.resolver.insert(snap_id, Arc::clone(&location));
        location
    }

    pub(super) async fn install(
        &self,
        snap_id: &str,
        range: Option<&str>,
    ) -> Result<TruncatedSnap, SnapControllerError> {
        let id = SnapId::from(snap_id);
        let mut installed = self
            .controller
            .install_snaps(ORIGIN, BTreeMap::from([(id.clone(), range.map(str::to_owned))]))
            .await?;
        Ok(installed.remove(&id).expect("installed snap in result"))
    }

    /// Serves and installs `snap_id` at `version`.
    pub(super) async fn installed(&self, snap_id: &str, version: &str) -> TruncatedSnap {
        self.serve(snap_id, package(version, SOURCE));
        self.install(snap_id, None).await.expect("install")
    }

    pub(super) async fn request(
        &self,
        snap_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SnapControllerError> {
        self.controller
            .handle_request(HandleRequest {
                snap_id: SnapId::from(snap_id),
                origin: ORIGIN.to_owned(),
                handler: HandlerType::OnRpcRequest,
                request: JsonRpcRequest::new(method, params),
            })
            .await
    }

    pub(super) fn status(&self, snap_id: &str) -> crate::fsm::SnapStatus {
        self.controller
            .get(&SnapId::from(snap_id))
            .expect("snap record")
            .status
    }
}

/// Events received so far.
pub(super) fn drain(events: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}
