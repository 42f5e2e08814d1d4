//! Snap state documents, plain and encrypted.

use serde_json::Value;
use snaps_execution::SnapId;
use tracing::debug;

use super::{CONTROLLER_TARGET, SnapController};
use crate::encryption::{KeyMetadata, StateEnvelope, StateKey, random_salt};
use crate::error::SnapControllerError;

impl SnapController {
    /// Reads the state of `snap_id`, `None` when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`],
    /// [`SnapControllerError::InvalidState`] for plain state that is not
    /// JSON, and [`SnapControllerError::StateCorrupted`] for encrypted state
    /// that cannot be opened.
    pub async fn get_snap_state(
        &self,
        snap_id: &SnapId,
        encrypted: bool,
    ) -> Result<Option<Value>, SnapControllerError> {
        let Some(raw) = self.stored_state(snap_id, encrypted)? else {
            return Ok(None);
        };
        if !encrypted {
            return serde_json::from_str(&raw).map(Some).map_err(|error| {
                SnapControllerError::InvalidState {
                    snap_id: snap_id.clone(),
                    message: error.to_string(),
                }
            });
        }

        let corrupted = || SnapControllerError::StateCorrupted {
            snap_id: snap_id.clone(),
        };
        let envelope = StateEnvelope::parse(&raw).map_err(|_| corrupted())?;
        let salt = envelope.salt_bytes().map_err(|_| corrupted())?;
        let key = match self.cached_key(snap_id, |key| key.matches(&salt, envelope.metadata())) {
            Some(key) => key,
            None => self.derive_key(snap_id, salt, envelope.metadata()).await?,
        };
        let plaintext = key.decrypt(&envelope).map_err(|_| corrupted())?;
        serde_json::from_str(&plaintext)
            .map(Some)
            .map_err(|_| corrupted())
    }

    /// Replaces the state of `snap_id`.
    ///
    /// Encrypted state is always written with the configured key profile;
    /// state read with an older profile is migrated on its next write.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`], or
    /// [`SnapControllerError::InvalidState`] when sealing fails.
    pub async fn update_snap_state(
        &self,
        snap_id: &SnapId,
        value: &Value,
        encrypted: bool,
    ) -> Result<(), SnapControllerError> {
        self.expect_snap(snap_id)?;
        let plain = value.to_string();
        let stored = if encrypted {
            let profile = KeyMetadata::pbkdf2(self.config.state_key_iterations);
            let key = match self.cached_key(snap_id, |key| key.metadata() == profile) {
                Some(key) => key,
                None => self.derive_key(snap_id, random_salt(), profile).await?,
            };
            key.encrypt(&plain)
                .map_err(|error| SnapControllerError::InvalidState {
                    snap_id: snap_id.clone(),
                    message: error.to_string(),
                })?
        } else {
            plain
        };
        self.lock().store.set_state(snap_id, encrypted, stored);
        Ok(())
    }

    /// Deletes the state of `snap_id`. Clearing encrypted state also drops
    /// the cached key, so the next write uses a fresh salt.
    ///
    /// # Errors
    ///
    /// Returns [`SnapControllerError::NotFound`].
    pub fn clear_snap_state(&self, snap_id: &SnapId, encrypted: bool) -> Result<(), SnapControllerError> {
        self.expect_snap(snap_id)?;
        let mut state = self.lock();
        state.store.clear_state(snap_id, encrypted);
        if encrypted && let Some(runtime) = state.runtimes.get_mut(snap_id) {
            runtime.state_key = None;
        }
        Ok(())
    }

    fn expect_snap(&self, snap_id: &SnapId) -> Result<(), SnapControllerError> {
        if self.has(snap_id) {
            Ok(())
        } else {
            Err(SnapControllerError::NotFound {
                snap_id: snap_id.clone(),
            })
        }
    }

    fn stored_state(&self, snap_id: &SnapId, encrypted: bool) -> Result<Option<String>, SnapControllerError> {
        let state = self.lock();
        if !state.store.contains(snap_id) {
            return Err(SnapControllerError::NotFound {
                snap_id: snap_id.clone(),
            });
        }
        Ok(state.store.state(snap_id, encrypted).map(str::to_owned))
    }

    fn cached_key(&self, snap_id: &SnapId, usable: impl FnOnce(&StateKey) -> bool) -> Option<StateKey> {
        self.lock()
            .runtimes
            .get(snap_id)
            .and_then(|runtime| runtime.state_key.as_ref())
            .filter(|key| usable(*key))
            .cloned()
    }

    /// Derives a key off the async workers and caches it on the runtime.
    async fn derive_key(
        &self,
        snap_id: &SnapId,
        salt: Vec<u8>,
        metadata: KeyMetadata,
    ) -> Result<StateKey, SnapControllerError> {
        let master_secret = self.entropy.master_secret();
        let owned_id = snap_id.clone();
        let derived = tokio::task::spawn_blocking(move || {
            StateKey::derive(&master_secret, &owned_id, salt, metadata)
        })
        .await;
        let Ok(Ok(key)) = derived else {
            return Err(SnapControllerError::StateCorrupted {
                snap_id: snap_id.clone(),
            });
        };
        debug!(
            target: CONTROLLER_TARGET,
            %snap_id,
            iterations = metadata.params.iterations,
            "derived state key"
        );
        if let Some(runtime) = self.lock().runtimes.get_mut(snap_id) {
            runtime.state_key = Some(key.clone());
        }
        Ok(key)
    }
}
