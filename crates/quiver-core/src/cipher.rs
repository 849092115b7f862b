//! Double Ratchet encryption over persisted sessions.
//!
//! Ratchet state lives sealed inside the session record; each call unseals
//! it, applies one value transition, and persists the successor with an
//! optimistic version check. Losing a version race re-reads and retries a
//! bounded number of times, so per-session mutation stays linearizable
//! without a lock. Encrypt persists *before* returning ciphertext: if the
//! write fails, no ciphertext for unpersisted state ever escapes.

use quiver_crypto::{RatchetMessage, RatchetState};
use rand::{CryptoRng, RngCore};

use crate::{
    clock::Clock,
    error::EngineError,
    records::{PeerAddress, SessionRecord, TrustLevel},
    store::{KeyStore, StoreError},
    trust,
    vault::{KeyVault, session_aad},
};

/// Attempts before a version race is reported as contention.
const MAX_PERSIST_ATTEMPTS: u32 = 3;

/// Encrypts and decrypts over established sessions.
pub struct RatchetCipher<S: KeyStore, C: Clock> {
    store: S,
    vault: KeyVault,
    clock: C,
}

impl<S: KeyStore, C: Clock> RatchetCipher<S, C> {
    /// Create a cipher over the given collaborators.
    pub fn new(store: S, vault: KeyVault, clock: C) -> Self {
        Self { store, vault, clock }
    }

    /// Encrypt `plaintext` to a peer, advancing and persisting the session.
    ///
    /// Blocked with [`EngineError::IdentityUntrusted`] while the peer's
    /// identity key is in the `Changed` state.
    pub fn encrypt(
        &self,
        owner: &str,
        peer: &PeerAddress,
        plaintext: &[u8],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<RatchetMessage, EngineError> {
        if trust::trust_level(&self.store, owner, peer)? == TrustLevel::Changed {
            return Err(EngineError::IdentityUntrusted { peer: peer.to_string() });
        }

        self.transition(owner, peer, rng, |state, rng| {
            state.encrypt(plaintext, rng).map_err(|_| EngineError::KeyGenerationFailure {
                reason: "message nonce randomness unavailable".into(),
            })
        })
    }

    /// Decrypt a message from a peer, advancing and persisting the session.
    ///
    /// Authentication failure yields [`EngineError::DecryptionFailure`] and
    /// leaves the persisted state untouched; a forged message can never
    /// move the ratchet.
    pub fn decrypt(
        &self,
        owner: &str,
        peer: &PeerAddress,
        message: &RatchetMessage,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<u8>, EngineError> {
        self.transition(owner, peer, rng, |state, rng| {
            state.decrypt(message, rng).map_err(|err| match err {
                quiver_crypto::CryptoError::RandomnessUnavailable => {
                    EngineError::KeyGenerationFailure {
                        reason: "ratchet randomness unavailable".into(),
                    }
                },
                _ => EngineError::DecryptionFailure,
            })
        })
    }

    /// Load, transition, and persist a session with version retry.
    fn transition<R: RngCore + CryptoRng, T>(
        &self,
        owner: &str,
        peer: &PeerAddress,
        rng: &mut R,
        step: impl Fn(&RatchetState, &mut R) -> Result<(RatchetState, T), EngineError>,
    ) -> Result<T, EngineError> {
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            let record = self
                .store
                .session(owner, peer)?
                .ok_or_else(|| EngineError::SessionNotFound { peer: peer.to_string() })?;

            let state = self.unseal_state(owner, peer, &record)?;
            let (next_state, output) = step(&state, rng)?;

            let mut encoded = Vec::new();
            ciborium::into_writer(&next_state, &mut encoded).map_err(|err| {
                EngineError::StorageFailure { detail: format!("ratchet state encoding: {err}") }
            })?;
            let ratchet_sealed = self.vault.seal(&session_aad(owner, peer), &encoded, rng)?;
            zeroize::Zeroize::zeroize(&mut encoded);

            let successor = SessionRecord {
                owner_user_id: record.owner_user_id.clone(),
                peer: record.peer.clone(),
                ratchet_sealed,
                version: record.version + 1,
                created_at_ms: record.created_at_ms,
                last_used_at_ms: self.clock.now_ms(),
            };

            match self.store.update_session(successor, record.version) {
                Ok(()) => return Ok(output),
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(owner, peer = %peer, "session version race, retrying");
                },
                Err(StoreError::NotFound { .. }) => {
                    return Err(EngineError::SessionNotFound { peer: peer.to_string() });
                },
                Err(err) => return Err(err.into()),
            }
        }

        Err(EngineError::StorageFailure {
            detail: format!("session update contention for {owner}->{peer}"),
        })
    }

    fn unseal_state(
        &self,
        owner: &str,
        peer: &PeerAddress,
        record: &SessionRecord,
    ) -> Result<RatchetState, EngineError> {
        let encoded = self.vault.open(&session_aad(owner, peer), &record.ratchet_sealed)?;
        ciborium::from_reader(encoded.as_slice()).map_err(|err| EngineError::StorageFailure {
            detail: format!("ratchet state corrupt for {owner}->{peer}: {err}"),
        })
    }
}
