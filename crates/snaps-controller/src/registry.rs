//! Verification and block lists for snaps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use semver::Version;
use snaps_execution::SnapId;
use thiserror::Error;

use crate::snap::BlockReason;

/// One snap to look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryQuery {
    /// The snap.
    pub snap_id: SnapId,
    /// Version to check.
    pub version: Version,
    /// Package checksum.
    pub checksum: String,
}

/// Registry verdict for one snap version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryVerdict {
    /// Reviewed and allowed.
    Verified,
    /// Known to be harmful.
    Blocked {
        /// Published explanation.
        reason: Option<BlockReason>,
    },
    /// Not reviewed.
    Unverified,
}

/// The registry could not be reached or answered nonsense.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RegistryError {
    /// Description of the failure.
    pub message: String,
}

/// Source of verification and block verdicts.
#[async_trait]
pub trait SnapsRegistry: Send + Sync {
    /// Looks up every query. Snaps missing from the answer are treated as
    /// unverified.
    async fn get(
        &self,
        queries: Vec<RegistryQuery>,
    ) -> Result<BTreeMap<SnapId, RegistryVerdict>, RegistryError>;
}

/// Registry that has never heard of any snap.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyRegistry;

#[async_trait]
impl SnapsRegistry for EmptyRegistry {
    async fn get(
        &self,
        _queries: Vec<RegistryQuery>,
    ) -> Result<BTreeMap<SnapId, RegistryVerdict>, RegistryError> {
        Ok(BTreeMap::new())
    }
}
