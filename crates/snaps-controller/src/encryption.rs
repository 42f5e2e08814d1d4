//! Encryption of snap state at rest.
//!
//! Each snap gets its own key:
//!
//! 1. entropy = HMAC-SHA256(master secret, snap id);
//! 2. key = PBKDF2-HMAC-SHA256(entropy, random per-snap salt, iterations);
//! 3. state is sealed with AES-256-GCM under a fresh 96-bit nonce.
//!
//! The stored document is a JSON [`StateEnvelope`]. Envelopes written before
//! key metadata existed carry none and are read with
//! [`KeyMetadata::legacy`].

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snaps_execution::SnapId;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 32;
const ENTROPY_DOMAIN: &[u8] = b"snaps:state-encryption:";

/// PBKDF2 iteration count of envelopes without key metadata.
pub const LEGACY_ITERATIONS: u32 = 10_000;

/// Supplies the host's master secret.
pub trait EntropySource: Send + Sync {
    /// Secret all per-snap keys derive from.
    fn master_secret(&self) -> Vec<u8>;
}

/// Failures while sealing or opening state. Carries no cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncryptionError {
    /// A key could not be derived.
    #[error("key derivation failed")]
    Derivation,
    /// Sealing or opening failed.
    #[error("cipher operation failed")]
    Cipher,
    /// The stored document is not a valid envelope.
    #[error("malformed state envelope")]
    Envelope,
}

/// Key derivation function of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    /// PBKDF2 with HMAC-SHA256.
    #[serde(rename = "PBKDF2")]
    Pbkdf2,
}

/// Parameters of the key derivation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// PBKDF2 iterations.
    pub iterations: u32,
}

/// How the key of an envelope was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Derivation function.
    pub algorithm: KdfAlgorithm,
    /// Derivation parameters.
    pub params: KdfParams,
}

impl KeyMetadata {
    /// PBKDF2 with `iterations`.
    #[must_use]
    pub const fn pbkdf2(iterations: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2,
            params: KdfParams { iterations },
        }
    }

    /// Profile of envelopes written without metadata.
    #[must_use]
    pub const fn legacy() -> Self {
        Self::pbkdf2(LEGACY_ITERATIONS)
    }
}

/// Stored form of encrypted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEnvelope {
    /// Base64 ciphertext with the GCM tag.
    pub data: String,
    /// Base64 nonce.
    pub iv: String,
    /// Base64 PBKDF2 salt.
    pub salt: String,
    /// Derivation profile; absent on legacy envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_metadata: Option<KeyMetadata>,
}

impl StateEnvelope {
    /// Parses a stored document.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Envelope`] when `raw` is not an envelope.
    pub fn parse(raw: &str) -> Result<Self, EncryptionError> {
        serde_json::from_str(raw).map_err(|_| EncryptionError::Envelope)
    }

    /// Derivation profile, falling back to the legacy one.
    #[must_use]
    pub fn metadata(&self) -> KeyMetadata {
        self.key_metadata.unwrap_or_else(KeyMetadata::legacy)
    }

    /// Decoded salt.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Envelope`] for invalid base64.
    pub fn salt_bytes(&self) -> Result<Vec<u8>, EncryptionError> {
        decode(&self.salt)
    }
}

/// A derived per-snap key with the salt and profile it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct StateKey {
    key: [u8; KEY_LEN],
    salt: Vec<u8>,
    metadata: KeyMetadata,
}

impl StateKey {
    /// Derives the key for `snap_id`. CPU-bound; run it off the async
    /// workers.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Derivation`] when HMAC keying fails.
    pub fn derive(
        master_secret: &[u8],
        snap_id: &SnapId,
        salt: Vec<u8>,
        metadata: KeyMetadata,
    ) -> Result<Self, EncryptionError> {
        let entropy = snap_entropy(master_secret, snap_id)?;
        let key = match metadata.algorithm {
            KdfAlgorithm::Pbkdf2 => pbkdf2_sha256(&entropy, &salt, metadata.params.iterations)?,
        };
        Ok(Self {
            key,
            salt,
            metadata,
        })
    }

    /// Returns `true` when this key was derived with `salt` and `metadata`.
    #[must_use]
    pub fn matches(&self, salt: &[u8], metadata: KeyMetadata) -> bool {
        self.salt == salt && self.metadata == metadata
    }

    /// Derivation profile of the key.
    #[must_use]
    pub const fn metadata(&self) -> KeyMetadata {
        self.metadata
    }

    /// Seals `plaintext` into a serialized envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Cipher`] when sealing fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
        let mut iv = [0_u8; NONCE_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| EncryptionError::Cipher)?;
        let envelope = StateEnvelope {
            data: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(iv),
            salt: STANDARD.encode(&self.salt),
            key_metadata: Some(self.metadata),
        };
        serde_json::to_string(&envelope).map_err(|_| EncryptionError::Envelope)
    }

    /// Opens `envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Cipher`] for a wrong key or tampered data,
    /// and [`EncryptionError::Envelope`] for malformed fields.
    pub fn decrypt(&self, envelope: &StateEnvelope) -> Result<String, EncryptionError> {
        let iv = decode(&envelope.iv)?;
        if iv.len() != NONCE_LEN {
            return Err(EncryptionError::Envelope);
        }
        let data = decode(&envelope.data)?;
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&iv), data.as_slice())
            .map_err(|_| EncryptionError::Cipher)?;
        String::from_utf8(plaintext).map_err(|_| EncryptionError::Cipher)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateKey")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Fresh random salt for a snap without stored state.
#[must_use]
pub fn random_salt() -> Vec<u8> {
    let mut salt = vec![0_u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn decode(value: &str) -> Result<Vec<u8>, EncryptionError> {
    STANDARD.decode(value).map_err(|_| EncryptionError::Envelope)
}

fn snap_entropy(master_secret: &[u8], snap_id: &SnapId) -> Result<[u8; KEY_LEN], EncryptionError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master_secret)
        .map_err(|_| EncryptionError::Derivation)?;
    mac.update(ENTROPY_DOMAIN);
    mac.update(snap_id.as_str().as_bytes());
    Ok(mac.finalize().into_bytes().into())
}

fn pbkdf2_sha256(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<[u8; KEY_LEN], EncryptionError> {
    if iterations == 0 {
        return Err(EncryptionError::Derivation);
    }
    let mut derived = [0_u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut derived);
    Ok(derived)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SECRET: &[u8] = b"correct horse battery staple";

    fn key_for(snap: &str, salt: Vec<u8>) -> StateKey {
        StateKey::derive(SECRET, &SnapId::from(snap), salt, KeyMetadata::pbkdf2(2)).expect("derive")
    }

    #[rstest]
    #[case(1, "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b")]
    #[case(2, "ae4d0c95af6b46d32d0adff928f06dd02a303f8ef3c251dfd6e2d85a95474c43")]
    fn matches_pbkdf2_reference_vectors(#[case] iterations: u32, #[case] expected: &str) {
        let derived = pbkdf2_sha256(b"password", b"salt", iterations).expect("derive");
        let hex: String = derived.iter().map(|byte| format!("{byte:02x}")).collect();
        assert_eq!(hex, expected);
    }

    #[rstest]
    fn zero_iterations_are_refused() {
        assert_eq!(
            pbkdf2_sha256(b"password", b"salt", 0),
            Err(EncryptionError::Derivation)
        );
    }

    #[rstest]
    fn snap_entropy_is_keyed_by_the_master_secret() {
        let snap_id = SnapId::from("npm:vault");
        let entropy = snap_entropy(SECRET, &snap_id).expect("entropy");

        assert_eq!(snap_entropy(SECRET, &snap_id).expect("entropy"), entropy);
        assert_ne!(
            snap_entropy(SECRET, &SnapId::from("npm:other")).expect("entropy"),
            entropy
        );
        assert_ne!(snap_entropy(b"another secret", &snap_id).expect("entropy"), entropy);
    }

    #[rstest]
    fn round_trips_state() {
        let key = key_for("npm:vault", random_salt());
        let sealed = key.encrypt(r#"{"balance":1}"#).expect("encrypt");
        let envelope = StateEnvelope::parse(&sealed).expect("envelope");

        assert_eq!(envelope.metadata(), KeyMetadata::pbkdf2(2));
        assert_eq!(key.decrypt(&envelope).expect("decrypt"), r#"{"balance":1}"#);
    }

    #[rstest]
    fn keys_are_bound_to_the_snap() {
        let salt = random_salt();
        let sealed = key_for("npm:a", salt.clone()).encrypt("secret").expect("encrypt");
        let envelope = StateEnvelope::parse(&sealed).expect("envelope");

        assert_eq!(
            key_for("npm:b", salt).decrypt(&envelope),
            Err(EncryptionError::Cipher)
        );
    }

    #[rstest]
    fn envelopes_without_metadata_use_the_legacy_profile() {
        let envelope = StateEnvelope::parse(r#"{"data":"","iv":"","salt":""}"#).expect("envelope");
        assert_eq!(envelope.metadata(), KeyMetadata::legacy());
        assert_eq!(envelope.metadata().params.iterations, LEGACY_ITERATIONS);
    }

    #[rstest]
    fn cached_keys_match_only_their_profile() {
        let salt = random_salt();
        let key = key_for("npm:cache", salt.clone());
        assert!(key.matches(&salt, KeyMetadata::pbkdf2(2)));
        assert!(!key.matches(&salt, KeyMetadata::legacy()));
        assert!(!key.matches(&random_salt(), KeyMetadata::pbkdf2(2)));
    }

    #[rstest]
    fn rejects_garbage() {
        assert_eq!(StateEnvelope::parse("not json"), Err(EncryptionError::Envelope));
    }
}
