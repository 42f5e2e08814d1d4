//! Copy-on-write storage of snap records and states.
//!
//! Readers receive `Arc<Snap>` snapshots and never observe a half-applied
//! change. Writers go through [`SnapStore::update`], which replaces the
//! record wholesale and returns an [`InversePatch`] that restores it.

use std::collections::BTreeMap;
use std::sync::Arc;

use snaps_execution::SnapId;

use crate::fsm::{Action, ActionFn, FsmError, Guard, GuardFn, Machine, SnapStatus};
use crate::snap::{PersistedSnapsState, Snap};

/// Undoes one [`SnapStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct InversePatch {
    snap_id: SnapId,
    previous: Option<Arc<Snap>>,
}

impl InversePatch {
    /// Record the patch restores, `None` when the record did not exist.
    #[must_use]
    pub fn previous(&self) -> Option<&Snap> {
        self.previous.as_deref()
    }
}

/// Snap records plus their encrypted and plain state documents.
#[derive(Debug, Clone, Default)]
pub struct SnapStore {
    snaps: BTreeMap<SnapId, Arc<Snap>>,
    snap_states: BTreeMap<SnapId, String>,
    unencrypted_snap_states: BTreeMap<SnapId, String>,
}

impl SnapStore {
    /// Loads a store from its persisted projection.
    #[must_use]
    pub fn from_persisted(state: PersistedSnapsState) -> Self {
        Self {
            snaps: state
                .snaps
                .into_iter()
                .map(|(id, snap)| (id, Arc::new(snap)))
                .collect(),
            snap_states: state.snap_states,
            unencrypted_snap_states: state.unencrypted_snap_states,
        }
    }

    /// Snapshot of the record of `snap_id`.
    #[must_use]
    pub fn get(&self, snap_id: &SnapId) -> Option<Arc<Snap>> {
        self.snaps.get(snap_id).cloned()
    }

    /// Returns `true` when `snap_id` has a record.
    #[must_use]
    pub fn contains(&self, snap_id: &SnapId) -> bool {
        self.snaps.contains_key(snap_id)
    }

    /// Snapshots of every record, ordered by id.
    #[must_use]
    pub fn snaps(&self) -> Vec<Arc<Snap>> {
        self.snaps.values().cloned().collect()
    }

    /// Identifiers of every record.
    #[must_use]
    pub fn ids(&self) -> Vec<SnapId> {
        self.snaps.keys().cloned().collect()
    }

    /// Returns `true` when the record exists and is enabled.
    #[must_use]
    pub fn is_enabled(&self, snap_id: &SnapId) -> bool {
        self.snaps.get(snap_id).is_some_and(|snap| snap.enabled)
    }

    /// Applies `change` to a copy of the record of `snap_id` and swaps it in.
    ///
    /// `change` receives `None` when no record exists; leaving `None` in
    /// place deletes the record.
    pub fn update(&mut self, snap_id: &SnapId, change: impl FnOnce(&mut Option<Snap>)) -> InversePatch {
        let previous = self.snaps.get(snap_id).cloned();
        let mut draft = previous.as_deref().cloned();
        change(&mut draft);
        match draft {
            Some(snap) => {
                self.snaps.insert(snap_id.clone(), Arc::new(snap));
            }
            None => {
                self.snaps.remove(snap_id);
            }
        }
        InversePatch {
            snap_id: snap_id.clone(),
            previous,
        }
    }

    /// Applies `change` to an existing record. Returns `None` when there is
    /// no record.
    pub fn modify(&mut self, snap_id: &SnapId, change: impl FnOnce(&mut Snap)) -> Option<InversePatch> {
        if !self.contains(snap_id) {
            return None;
        }
        Some(self.update(snap_id, |draft| {
            if let Some(snap) = draft.as_mut() {
                change(snap);
            }
        }))
    }

    /// Restores the record captured by `patch`.
    pub fn apply_inverse(&mut self, patch: InversePatch) {
        let InversePatch { snap_id, previous } = patch;
        match previous {
            Some(snap) => {
                self.snaps.insert(snap_id, snap);
            }
            None => {
                self.snaps.remove(&snap_id);
            }
        }
    }

    /// Deletes the record and both state documents of `snap_id`.
    pub fn remove(&mut self, snap_id: &SnapId) -> Option<InversePatch> {
        self.snap_states.remove(snap_id);
        self.unencrypted_snap_states.remove(snap_id);
        self.contains(snap_id)
            .then(|| self.update(snap_id, |draft| *draft = None))
    }

    /// Writes `status` into the record, if it exists.
    pub fn set_status(&mut self, snap_id: &SnapId, status: SnapStatus) {
        self.modify(snap_id, |snap| snap.status = status);
    }

    /// Stored state document of `snap_id`.
    #[must_use]
    pub fn state(&self, snap_id: &SnapId, encrypted: bool) -> Option<&str> {
        self.states(encrypted).get(snap_id).map(String::as_str)
    }

    /// Replaces the state document of `snap_id`.
    pub fn set_state(&mut self, snap_id: &SnapId, encrypted: bool, value: String) {
        self.states_mut(encrypted).insert(snap_id.clone(), value);
    }

    /// Deletes the state document of `snap_id`.
    pub fn clear_state(&mut self, snap_id: &SnapId, encrypted: bool) {
        self.states_mut(encrypted).remove(snap_id);
    }

    /// Drops every record and state.
    pub fn clear(&mut self) {
        self.snaps.clear();
        self.snap_states.clear();
        self.unencrypted_snap_states.clear();
    }

    /// Durable projection, with every snap reported as stopped.
    #[must_use]
    pub fn persisted(&self) -> PersistedSnapsState {
        PersistedSnapsState {
            snaps: self
                .snaps
                .iter()
                .map(|(id, snap)| {
                    let mut snap = Snap::clone(snap);
                    snap.status = SnapStatus::Stopped;
                    (id.clone(), snap)
                })
                .collect(),
            snap_states: self.snap_states.clone(),
            unencrypted_snap_states: self.unencrypted_snap_states.clone(),
        }
    }

    const fn states(&self, encrypted: bool) -> &BTreeMap<SnapId, String> {
        if encrypted {
            &self.snap_states
        } else {
            &self.unencrypted_snap_states
        }
    }

    const fn states_mut(&mut self, encrypted: bool) -> &mut BTreeMap<SnapId, String> {
        if encrypted {
            &mut self.snap_states
        } else {
            &mut self.unencrypted_snap_states
        }
    }
}

fn snap_enabled(store: &SnapStore, snap_id: &SnapId) -> bool {
    store.is_enabled(snap_id)
}

fn persist_status(store: &mut SnapStore, snap_id: &SnapId, status: SnapStatus) {
    store.set_status(snap_id, status);
}

/// The lifecycle machine bound to a [`SnapStore`].
///
/// # Errors
///
/// Propagates table validation failures.
pub fn lifecycle_machine() -> Result<Machine<SnapStore>, FsmError> {
    Machine::new(
        [(Guard::Enabled, snap_enabled as GuardFn<SnapStore>)],
        [(Action::PersistStatus, persist_status as ActionFn<SnapStore>)],
    )
}
