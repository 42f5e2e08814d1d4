//! Identifiers and payloads shared between the execution layer and its callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::jsonrpc::JsonRpcRequest;

/// Prefixes accepted in snap identifiers.
const SNAP_ID_PREFIXES: [&str; 2] = ["npm:", "local:"];

/// Identifier of an installed snap, e.g. `npm:@acme/wallet-snap`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapId(String);

impl SnapId {
    /// Wraps a raw identifier without validating it.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` when the identifier carries a known source prefix
    /// followed by a non-empty name.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        SNAP_ID_PREFIXES.iter().any(|prefix| {
            self.0
                .strip_prefix(prefix)
                .is_some_and(|name| !name.trim().is_empty())
        })
    }

    /// Returns `true` for snaps loaded from the local filesystem.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with("local:")
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SnapId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of one execution job. Never reused once terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random job identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Entry points a snap may export.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum HandlerType {
    /// JSON-RPC requests from dapps or other snaps.
    OnRpcRequest,
    /// Transaction insight.
    OnTransaction,
    /// Signature insight.
    OnSignature,
    /// Scheduled background jobs.
    OnCronjob,
    /// Domain or address resolution.
    OnNameLookup,
    /// Home page rendering.
    OnHomePage,
    /// Keyring account management.
    OnKeyringRequest,
    /// Runs once after a fresh install.
    OnInstall,
    /// Runs once after an update.
    OnUpdate,
}

/// Everything the execution layer needs to boot a snap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapExecutionData {
    /// Snap to execute.
    pub snap_id: SnapId,
    /// Bundled source of the snap.
    pub source_code: String,
    /// Global APIs exposed inside the sandbox.
    pub endowments: Vec<String>,
}

/// A handler invocation routed to a running snap.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapRpcRequest {
    /// Origin of the caller.
    pub origin: String,
    /// Exported handler to invoke.
    pub handler: HandlerType,
    /// Request forwarded to the handler.
    pub request: JsonRpcRequest,
}
