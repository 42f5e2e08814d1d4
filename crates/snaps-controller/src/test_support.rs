//! In-memory collaborators for driving the controller in tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use semver::{Version, VersionReq};
use serde_json::json;
use snaps_execution::SnapId;
use tokio::sync::oneshot;
use tracing::trace;

use crate::approval::{ApprovalController, ApprovalDecision, ApprovalRequest, ApprovalUpdate, PendingApproval};
use crate::encryption::EntropySource;
use crate::fsm::SnapStatus;
use crate::location::{LocationError, LocationResolver, SnapLocation, checksum};
use crate::permissions::{Permission, PermissionController, PermissionSet};
use crate::snap::{ManifestSource, Snap, SnapFile, SnapManifest};

const BUNDLE_PATH: &str = "dist/bundle.js";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_version(version: &str) -> Version {
    Version::parse(version).unwrap_or_else(|_| Version::new(0, 0, 0))
}

/// A stopped, enabled snap record with an empty manifest.
#[must_use]
pub fn snap_record(snap_id: &str, version: &str) -> Snap {
    let version = parse_version(version);
    let source_code = "module.exports = {};".to_owned();
    let manifest = SnapManifest {
        version: version.clone(),
        proposed_name: snap_id.to_owned(),
        source: ManifestSource {
            shasum: checksum(&source_code, &[], &[]),
            location: BUNDLE_PATH.to_owned(),
            files: Vec::new(),
            locales: Vec::new(),
        },
        initial_permissions: PermissionSet::new(),
        initial_connections: BTreeMap::new(),
    };
    Snap {
        id: SnapId::from(snap_id),
        status: SnapStatus::Stopped,
        version,
        version_history: Vec::new(),
        enabled: true,
        blocked: false,
        block_information: None,
        removable: true,
        preinstalled: false,
        hidden: false,
        initial_permissions: PermissionSet::new(),
        initial_connections: BTreeMap::new(),
        source_code,
        manifest,
        auxiliary_files: Vec::new(),
        localization_files: Vec::new(),
    }
}

/// A package served from memory.
///
/// The manifest checksum is computed from the contents unless overridden
/// with [`StaticLocation::with_shasum`].
#[derive(Debug)]
pub struct StaticLocation {
    manifest: SnapManifest,
    files: BTreeMap<String, String>,
    shasum: Option<String>,
    fetch_delay: Duration,
    always_reload: bool,
    fetches: AtomicUsize,
}

impl StaticLocation {
    /// A package at `version` whose bundle is `source_code`.
    #[must_use]
    pub fn new(version: &str, source_code: &str) -> Self {
        let manifest = SnapManifest {
            version: parse_version(version),
            proposed_name: "Static snap".to_owned(),
            source: ManifestSource {
                shasum: String::new(),
                location: BUNDLE_PATH.to_owned(),
                files: Vec::new(),
                locales: Vec::new(),
            },
            initial_permissions: PermissionSet::new(),
            initial_connections: BTreeMap::new(),
        };
        Self {
            manifest,
            files: BTreeMap::from([(BUNDLE_PATH.to_owned(), source_code.to_owned())]),
            shasum: None,
            fetch_delay: Duration::ZERO,
            always_reload: false,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Adds an auxiliary file.
    #[must_use]
    pub fn with_auxiliary_file(mut self, path: &str, value: &str) -> Self {
        self.manifest.source.files.push(path.to_owned());
        self.files.insert(path.to_owned(), value.to_owned());
        self
    }

    /// Overrides the manifest checksum.
    #[must_use]
    pub fn with_shasum(mut self, shasum: &str) -> Self {
        self.shasum = Some(shasum.to_owned());
        self
    }

    /// Requests `name` in the manifest.
    #[must_use]
    pub fn with_permission(mut self, name: &str, permission: Permission) -> Self {
        self.manifest
            .initial_permissions
            .insert(name.to_owned(), permission);
        self
    }

    /// Requests a connection to `origin` in the manifest.
    #[must_use]
    pub fn with_connection(mut self, origin: &str) -> Self {
        self.manifest
            .initial_connections
            .insert(origin.to_owned(), json!({}));
        self
    }

    /// Delays every manifest read.
    #[must_use]
    pub const fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Forces every install to refetch.
    #[must_use]
    pub const fn always_reload(mut self) -> Self {
        self.always_reload = true;
        self
    }

    /// How many times the manifest was read.
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn file(&self, path: &str) -> Option<SnapFile> {
        self.files.get(path).map(|value| SnapFile {
            path: path.to_owned(),
            value: value.clone(),
        })
    }
}

#[async_trait]
impl SnapLocation for StaticLocation {
    async fn manifest(&self) -> Result<SnapManifest, LocationError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let mut manifest = self.manifest.clone();
        manifest.source.shasum = match &self.shasum {
            Some(shasum) => shasum.clone(),
            None => {
                let source = self
                    .files
                    .get(BUNDLE_PATH)
                    .map_or("", String::as_str);
                let auxiliary: Vec<SnapFile> = manifest
                    .source
                    .files
                    .iter()
                    .filter_map(|path| self.file(path))
                    .collect();
                checksum(source, &auxiliary, &[])
            }
        };
        Ok(manifest)
    }

    async fn fetch(&self, path: &str) -> Result<SnapFile, LocationError> {
        self.file(path)
            .ok_or_else(|| LocationError::new(format!("no file at {path}")))
    }

    fn should_always_reload(&self) -> bool {
        self.always_reload
    }
}

/// Resolves snap ids to registered [`StaticLocation`]s.
#[derive(Debug, Default)]
pub struct StaticResolver {
    locations: Mutex<BTreeMap<SnapId, Arc<StaticLocation>>>,
}

impl StaticResolver {
    /// Serves `snap_id` from `location`, replacing any previous package.
    pub fn insert(&self, snap_id: &str, location: Arc<StaticLocation>) {
        lock(&self.locations).insert(SnapId::from(snap_id), location);
    }
}

impl LocationResolver for StaticResolver {
    fn detect(
        &self,
        snap_id: &SnapId,
        _version_range: &VersionReq,
    ) -> Result<Arc<dyn SnapLocation>, LocationError> {
        lock(&self.locations)
            .get(snap_id)
            .map(|location| Arc::clone(location) as Arc<dyn SnapLocation>)
            .ok_or_else(|| LocationError::new(format!("no package for {snap_id}")))
    }
}

/// Permission store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryPermissions {
    granted: Mutex<BTreeMap<SnapId, PermissionSet>>,
    connections: Mutex<BTreeMap<String, BTreeSet<SnapId>>>,
}

impl InMemoryPermissions {
    /// Origins connected to `snap_id`.
    #[must_use]
    pub fn origins(&self, snap_id: &SnapId) -> BTreeSet<String> {
        lock(&self.connections)
            .iter()
            .filter(|(_, snaps)| snaps.contains(snap_id))
            .map(|(origin, _)| origin.clone())
            .collect()
    }
}

impl PermissionController for InMemoryPermissions {
    fn granted(&self, snap_id: &SnapId) -> PermissionSet {
        lock(&self.granted).get(snap_id).cloned().unwrap_or_default()
    }

    fn grant(&self, snap_id: &SnapId, permissions: &PermissionSet) {
        if permissions.is_empty() {
            return;
        }
        lock(&self.granted)
            .entry(snap_id.clone())
            .or_default()
            .extend(permissions.iter().map(|(name, permission)| (name.clone(), permission.clone())));
    }

    fn revoke(&self, snap_id: &SnapId, names: &[String]) {
        if let Some(held) = lock(&self.granted).get_mut(snap_id) {
            for name in names {
                held.remove(name);
            }
        }
    }

    fn revoke_all(&self, snap_id: &SnapId) {
        lock(&self.granted).remove(snap_id);
    }

    fn grant_connection(&self, origin: &str, snap_id: &SnapId) {
        lock(&self.connections)
            .entry(origin.to_owned())
            .or_default()
            .insert(snap_id.clone());
    }

    fn revoke_connection(&self, origin: &str, snap_id: &SnapId) {
        if let Some(snaps) = lock(&self.connections).get_mut(origin) {
            snaps.remove(snap_id);
        }
    }

    fn remove_connections(&self, snap_id: &SnapId) {
        for snaps in lock(&self.connections).values_mut() {
            snaps.remove(snap_id);
        }
    }

    fn connected_snaps(&self, origin: &str) -> BTreeSet<SnapId> {
        lock(&self.connections)
            .get(origin)
            .cloned()
            .unwrap_or_default()
    }
}

/// Approval UI that answers as soon as an approval shows its content.
///
/// Installs are approved with every requested permission; updates with the
/// permissions the update adds.
#[derive(Debug, Default)]
pub struct AutoApprover {
    reject: bool,
    next_id: AtomicUsize,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    requests: Mutex<Vec<ApprovalRequest>>,
    updates: Mutex<Vec<ApprovalUpdate>>,
}

impl AutoApprover {
    /// Approves everything.
    #[must_use]
    pub fn approving() -> Self {
        Self::default()
    }

    /// Rejects everything.
    #[must_use]
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    /// Approvals opened so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ApprovalRequest> {
        lock(&self.requests).clone()
    }

    /// Content updates received so far.
    #[must_use]
    pub fn updates(&self) -> Vec<ApprovalUpdate> {
        lock(&self.updates).clone()
    }

    fn decide(&self, update: &ApprovalUpdate) -> Option<ApprovalDecision> {
        let permissions = match update {
            ApprovalUpdate::Install { permissions, .. } => permissions.clone(),
            ApprovalUpdate::Update { permissions, .. } => permissions.new.clone(),
            ApprovalUpdate::Succeeded | ApprovalUpdate::Failed { .. } => return None,
        };
        Some(if self.reject {
            ApprovalDecision::reject()
        } else {
            ApprovalDecision::approve(permissions)
        })
    }
}

impl ApprovalController for AutoApprover {
    fn add_request(&self, request: ApprovalRequest) -> PendingApproval {
        let id = format!("approval-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, decision) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), sender);
        lock(&self.requests).push(request);
        PendingApproval { id, decision }
    }

    fn update_request_state(&self, id: &str, update: ApprovalUpdate) {
        if let Some(decision) = self.decide(&update)
            && let Some(sender) = lock(&self.pending).remove(id)
            && sender.send(decision).is_err()
        {
            trace!(target: "snaps_controller::test_support", id, "approval abandoned");
        }
        lock(&self.updates).push(update);
    }
}

/// Fixed master secret.
#[derive(Debug, Clone)]
pub struct StaticEntropy(pub Vec<u8>);

impl Default for StaticEntropy {
    fn default() -> Self {
        Self(b"static master secret for tests".to_vec())
    }
}

impl EntropySource for StaticEntropy {
    fn master_secret(&self) -> Vec<u8> {
        self.0.clone()
    }
}
