//! Message-style entry point to the controller.
//!
//! Callers that only hold a handle to the controller, such as an RPC
//! bridge, describe what they want as a [`ControllerAction`] and receive an
//! [`ActionResponse`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use snaps_execution::SnapId;

use crate::controller::{HandleRequest, SnapController};
use crate::error::SnapControllerError;
use crate::snap::{Snap, TruncatedSnap};

/// An operation on the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    /// Reads a snap record.
    Get {
        /// The snap.
        snap_id: SnapId,
    },
    /// Checks whether a snap is installed.
    Has {
        /// The snap.
        snap_id: SnapId,
    },
    /// Lists every snap as persisted.
    GetAll,
    /// Installs or updates snaps.
    Install {
        /// Requesting origin.
        origin: String,
        /// Snap ids with optional version ranges.
        snaps: BTreeMap<SnapId, Option<String>>,
    },
    /// Removes snaps.
    Remove {
        /// The snaps.
        snap_ids: Vec<SnapId>,
    },
    /// Enables a snap.
    Enable {
        /// The snap.
        snap_id: SnapId,
    },
    /// Disables a snap.
    Disable {
        /// The snap.
        snap_id: SnapId,
    },
    /// Invokes a snap handler.
    HandleRequest(HandleRequest),
    /// Reads snap state.
    GetState {
        /// The snap.
        snap_id: SnapId,
        /// Encrypted or plain state.
        encrypted: bool,
    },
    /// Replaces snap state.
    UpdateState {
        /// The snap.
        snap_id: SnapId,
        /// New state.
        state: Value,
        /// Encrypted or plain state.
        encrypted: bool,
    },
    /// Deletes snap state.
    ClearState {
        /// The snap.
        snap_id: SnapId,
        /// Encrypted or plain state.
        encrypted: bool,
    },
    /// Takes a reference on a snap.
    IncrementActiveReferences {
        /// The snap.
        snap_id: SnapId,
    },
    /// Releases a reference on a snap.
    DecrementActiveReferences {
        /// The snap.
        snap_id: SnapId,
    },
}

/// Result of a [`ControllerAction`].
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResponse {
    /// A snap record, if installed.
    Snap(Option<Snap>),
    /// A yes/no answer.
    Bool(bool),
    /// Snap summaries.
    Snaps(Vec<TruncatedSnap>),
    /// Summaries of installed snaps by id.
    Installed(BTreeMap<SnapId, TruncatedSnap>),
    /// A handler result.
    Value(Value),
    /// Snap state, if any.
    State(Option<Value>),
    /// The action completed without a result.
    Done,
}

impl SnapController {
    /// Performs `action`.
    ///
    /// # Errors
    ///
    /// Propagates the failure of the underlying operation.
    pub async fn call(self: &Arc<Self>, action: ControllerAction) -> Result<ActionResponse, SnapControllerError> {
        let response = match action {
            ControllerAction::Get { snap_id } => {
                ActionResponse::Snap(self.get(&snap_id).map(|snap| Snap::clone(&snap)))
            }
            ControllerAction::Has { snap_id } => ActionResponse::Bool(self.has(&snap_id)),
            ControllerAction::GetAll => ActionResponse::Snaps(self.get_all_snaps()),
            ControllerAction::Install { origin, snaps } => {
                ActionResponse::Installed(self.install_snaps(&origin, snaps).await?)
            }
            ControllerAction::Remove { snap_ids } => {
                self.remove_snaps(&snap_ids).await?;
                ActionResponse::Done
            }
            ControllerAction::Enable { snap_id } => {
                self.enable_snap(&snap_id)?;
                ActionResponse::Done
            }
            ControllerAction::Disable { snap_id } => {
                self.disable_snap(&snap_id).await?;
                ActionResponse::Done
            }
            ControllerAction::HandleRequest(request) => {
                ActionResponse::Value(self.handle_request(request).await?)
            }
            ControllerAction::GetState { snap_id, encrypted } => {
                ActionResponse::State(self.get_snap_state(&snap_id, encrypted).await?)
            }
            ControllerAction::UpdateState {
                snap_id,
                state,
                encrypted,
            } => {
                self.update_snap_state(&snap_id, &state, encrypted).await?;
                ActionResponse::Done
            }
            ControllerAction::ClearState { snap_id, encrypted } => {
                self.clear_snap_state(&snap_id, encrypted)?;
                ActionResponse::Done
            }
            ControllerAction::IncrementActiveReferences { snap_id } => {
                self.increment_active_references(&snap_id)?;
                ActionResponse::Done
            }
            ControllerAction::DecrementActiveReferences { snap_id } => {
                self.decrement_active_references(&snap_id)?;
                ActionResponse::Done
            }
        };
        Ok(response)
    }
}
