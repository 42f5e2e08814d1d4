//! Events published by the controller.

use semver::Version;
use snaps_execution::SnapId;
use tokio::sync::broadcast;
use tracing::trace;

use crate::snap::TruncatedSnap;

const EVENT_CAPACITY: usize = 128;

/// Something observable happened to a snap.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A fresh install or preinstall completed.
    SnapInstalled {
        /// The installed snap.
        snap: TruncatedSnap,
        /// Origin that requested it.
        origin: String,
        /// Whether it ships with the host.
        preinstalled: bool,
    },
    /// A newer version replaced the installed one.
    SnapUpdated {
        /// The updated snap.
        snap: TruncatedSnap,
        /// Version before the update.
        old_version: Version,
        /// Origin that requested it.
        origin: String,
        /// Whether it ships with the host.
        preinstalled: bool,
    },
    /// The snap was removed.
    SnapUninstalled {
        /// The removed snap.
        snap: TruncatedSnap,
    },
    /// The snap was enabled.
    SnapEnabled {
        /// The enabled snap.
        snap: TruncatedSnap,
    },
    /// The snap was disabled.
    SnapDisabled {
        /// The disabled snap.
        snap: TruncatedSnap,
    },
    /// The registry blocked the snap.
    SnapBlocked {
        /// The blocked snap.
        snap_id: SnapId,
        /// Explanation, when the registry gave one.
        explanation: Option<String>,
    },
    /// The registry lifted a block.
    SnapUnblocked {
        /// The unblocked snap.
        snap_id: SnapId,
    },
    /// A failed update was undone.
    SnapRolledBack {
        /// The restored snap.
        snap: TruncatedSnap,
        /// Version that was rolled back.
        failed_version: Version,
    },
    /// The snap stopped executing.
    SnapTerminated {
        /// The stopped snap.
        snap: TruncatedSnap,
    },
    /// A fresh install began.
    SnapInstallStarted {
        /// The snap being installed.
        snap_id: SnapId,
        /// Origin that requested it.
        origin: String,
    },
    /// A fresh install failed.
    SnapInstallFailed {
        /// The snap that failed.
        snap_id: SnapId,
        /// Origin that requested it.
        origin: String,
        /// Rendered failure.
        error: String,
    },
}

/// Broadcast channel of [`ControllerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ControllerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    /// Publishes `event` to current subscribers.
    pub fn publish(&self, event: ControllerEvent) {
        if self.sender.send(event).is_err() {
            trace!(target: "snaps_controller::events", "no event subscribers");
        }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }
}
