//! Where snap packages come from, and how fetched packages are verified.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use semver::VersionReq;
use sha2::{Digest, Sha256};
use snaps_execution::SnapId;
use thiserror::Error;
use tracing::debug;

use crate::error::SnapControllerError;
use crate::snap::{FetchedSnap, SnapFile, SnapManifest};

/// A location could not serve a package or file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LocationError {
    /// Description of the failure.
    pub message: String,
}

impl LocationError {
    /// Creates an error with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A resolved package source.
#[async_trait]
pub trait SnapLocation: Send + Sync {
    /// Reads the package manifest.
    async fn manifest(&self) -> Result<SnapManifest, LocationError>;

    /// Reads a file of the package by path.
    async fn fetch(&self, path: &str) -> Result<SnapFile, LocationError>;

    /// Whether every install must refetch the package, e.g. local
    /// development builds.
    fn should_always_reload(&self) -> bool {
        false
    }
}

/// Maps snap identifiers to package sources.
pub trait LocationResolver: Send + Sync {
    /// Returns the location serving `snap_id` within `version_range`.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError`] when no source can serve the snap.
    fn detect(
        &self,
        snap_id: &SnapId,
        version_range: &VersionReq,
    ) -> Result<Arc<dyn SnapLocation>, LocationError>;
}

/// Checksum over everything a manifest covers: bundle, auxiliary files and
/// locales, in manifest order.
#[must_use]
pub fn checksum(source_code: &str, auxiliary_files: &[SnapFile], localization_files: &[SnapFile]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_code.as_bytes());
    for file in auxiliary_files.iter().chain(localization_files) {
        hasher.update(file.path.as_bytes());
        hasher.update(file.value.as_bytes());
    }
    STANDARD.encode(hasher.finalize())
}

/// Fetches every file the manifest names and verifies the checksum.
///
/// # Errors
///
/// Returns [`SnapControllerError::Fetch`] when the location fails and
/// [`SnapControllerError::ChecksumMismatch`] when contents do not match.
pub async fn fetch_snap(
    snap_id: &SnapId,
    location: &dyn SnapLocation,
) -> Result<FetchedSnap, SnapControllerError> {
    let fetch_error = |error: LocationError| SnapControllerError::Fetch {
        snap_id: snap_id.clone(),
        message: error.message,
    };

    let manifest = location.manifest().await.map_err(fetch_error)?;
    let source_code = location
        .fetch(&manifest.source.location)
        .await
        .map_err(fetch_error)?
        .value;

    let mut auxiliary_files = Vec::with_capacity(manifest.source.files.len());
    for path in &manifest.source.files {
        auxiliary_files.push(location.fetch(path).await.map_err(fetch_error)?);
    }
    let mut localization_files = Vec::with_capacity(manifest.source.locales.len());
    for path in &manifest.source.locales {
        localization_files.push(location.fetch(path).await.map_err(fetch_error)?);
    }

    if checksum(&source_code, &auxiliary_files, &localization_files) != manifest.source.shasum {
        return Err(SnapControllerError::ChecksumMismatch {
            snap_id: snap_id.clone(),
        });
    }
    debug!(
        target: "snaps_controller::location",
        %snap_id,
        version = %manifest.version,
        "fetched snap package"
    );

    Ok(FetchedSnap {
        manifest,
        source_code,
        auxiliary_files,
        localization_files,
    })
}
