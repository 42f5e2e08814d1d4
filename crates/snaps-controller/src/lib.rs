//! Host-side orchestration of snaps.
//!
//! The [`SnapController`] installs snaps from package locations, keeps their
//! records in a copy-on-write [`SnapStore`], and runs them through an
//! [`ExecutionEnvironment`](snaps_execution::ExecutionEnvironment):
//!
//! - every snap moves through the lifecycle machine in [`fsm`];
//! - install batches are atomic: fresh installs are removed and updates are
//!   rolled back from a [`RollbackSnapshot`] when any snap fails;
//! - requests are authorized against handler permissions, raced against a
//!   pausable timer, and crash the snap when it fails unexpectedly;
//! - idle snaps are stopped by a background sweep;
//! - snap state is stored plain or sealed with a per-snap key.
//!
//! Permissions, approvals, package sources, the registry, and the master
//! secret are collaborators behind traits.

pub mod actions;
pub mod approval;
mod controller;
pub mod encryption;
pub mod error;
pub mod events;
pub mod fsm;
pub mod handlers;
pub mod location;
pub mod permissions;
pub mod registry;
pub mod request_queue;
pub mod rollback;
pub(crate) mod runtime;
pub mod snap;
pub mod store;
pub mod telemetry;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[cfg(test)]
mod tests;

pub use self::actions::{ActionResponse, ControllerAction};
pub use self::controller::{
    HandleRequest, PREINSTALLED_ORIGIN, PreinstalledSnap, SnapController, SnapControllerOptions,
};
pub use self::error::SnapControllerError;
pub use self::events::{ControllerEvent, EventBus};
pub use self::fsm::{SnapStatus, StatusEvent};
pub use self::rollback::RollbackSnapshot;
pub use self::snap::{PersistedSnapsState, Snap, SnapManifest, TruncatedSnap};
pub use self::store::SnapStore;
