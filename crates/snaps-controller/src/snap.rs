//! Snap records, manifests, and their public projections.

use std::collections::BTreeMap;

use semver::Version;
use serde::{Deserialize, Serialize};
use snaps_execution::SnapId;

use crate::fsm::SnapStatus;
use crate::permissions::{Connections, PermissionSet};

/// Where a manifest's bundle and extra files live, plus their checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSource {
    /// Base64 SHA-256 over the bundle, auxiliary files, and locales.
    pub shasum: String,
    /// Path of the bundle within the package.
    pub location: String,
    /// Paths of auxiliary files.
    #[serde(default)]
    pub files: Vec<String>,
    /// Paths of localization files.
    #[serde(default)]
    pub locales: Vec<String>,
}

/// Package manifest of a snap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapManifest {
    /// Package version.
    pub version: Version,
    /// Display name.
    pub proposed_name: String,
    /// Package contents and checksum.
    pub source: ManifestSource,
    /// Permissions the snap requests.
    #[serde(default)]
    pub initial_permissions: PermissionSet,
    /// Origins the snap asks to be connected to.
    #[serde(default)]
    pub initial_connections: Connections,
}

/// A file shipped alongside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapFile {
    /// Path within the package.
    pub path: String,
    /// File contents.
    pub value: String,
}

/// A package as fetched from a location, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSnap {
    /// Parsed manifest.
    pub manifest: SnapManifest,
    /// Bundle source.
    pub source_code: String,
    /// Auxiliary files, in manifest order.
    pub auxiliary_files: Vec<SnapFile>,
    /// Localization files, in manifest order.
    pub localization_files: Vec<SnapFile>,
}

/// Why a snap was blocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockReason {
    /// Link to a public explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_url: Option<String>,
    /// Short explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// One entry of a snap's install history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryEntry {
    /// Installed version.
    pub version: Version,
    /// Install time, milliseconds since the Unix epoch.
    pub date: u64,
    /// Origin that requested the install.
    pub origin: String,
}

/// Full record of an installed snap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snap {
    /// Identifier.
    pub id: SnapId,
    /// Running status.
    pub status: SnapStatus,
    /// Installed version.
    pub version: Version,
    /// Versions installed so far, oldest first.
    pub version_history: Vec<VersionHistoryEntry>,
    /// Whether the snap may run.
    pub enabled: bool,
    /// Whether the registry blocked the snap.
    pub blocked: bool,
    /// Registry explanation for a block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_information: Option<BlockReason>,
    /// Whether users may uninstall the snap.
    pub removable: bool,
    /// Whether the snap ships with the host.
    pub preinstalled: bool,
    /// Whether the snap is hidden from listings.
    pub hidden: bool,
    /// Permissions requested by the installed manifest.
    pub initial_permissions: PermissionSet,
    /// Connections requested by the installed manifest.
    pub initial_connections: Connections,
    /// Bundle source.
    pub source_code: String,
    /// Installed manifest.
    pub manifest: SnapManifest,
    /// Auxiliary files.
    pub auxiliary_files: Vec<SnapFile>,
    /// Localization files.
    pub localization_files: Vec<SnapFile>,
}

impl Snap {
    /// Public summary of the record.
    #[must_use]
    pub fn truncated(&self) -> TruncatedSnap {
        TruncatedSnap {
            id: self.id.clone(),
            version: self.version.clone(),
            enabled: self.enabled,
            blocked: self.blocked,
            status: self.status,
            initial_permissions: self.initial_permissions.clone(),
        }
    }
}

/// Public summary of a snap, returned by install and listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncatedSnap {
    /// Identifier.
    pub id: SnapId,
    /// Installed version.
    pub version: Version,
    /// Whether the snap may run.
    pub enabled: bool,
    /// Whether the snap is blocked.
    pub blocked: bool,
    /// Running status.
    pub status: SnapStatus,
    /// Permissions requested by the installed manifest.
    pub initial_permissions: PermissionSet,
}

/// Durable projection of the controller.
///
/// Every snap is written as [`SnapStatus::Stopped`]: nothing is running when
/// the state is loaded again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapsState {
    /// Snap records.
    pub snaps: BTreeMap<SnapId, Snap>,
    /// Encrypted state envelopes.
    pub snap_states: BTreeMap<SnapId, String>,
    /// Plain state documents.
    pub unencrypted_snap_states: BTreeMap<SnapId, String>,
}
