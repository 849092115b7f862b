//! X3DH session establishment.
//!
//! The engine is the single custodian of every enrolled user's wrapped key
//! material, so one exchange establishes both half-sessions (the
//! initiator's and the recipient's) and commits them together with the
//! one-time-key consumption in a single store transaction. A crash can
//! never leave the key consumed without sessions or sessions stored without
//! the consumption.

use quiver_crypto::{DhKeyPair, PreKeyBundle, RatchetState, x3dh};
use rand::{CryptoRng, RngCore};

use crate::{
    clock::Clock,
    error::EngineError,
    identity::unseal_identity,
    prekeys::PreKeyManager,
    records::{PeerAddress, SessionRecord, TrustLevel},
    store::{KeyStore, StoreError},
    trust,
    vault::{KeyVault, one_time_pre_key_aad, session_aad, signed_pre_key_aad},
};

/// Outcome of an initiate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReceipt {
    /// The peer the session was established with.
    pub peer: PeerAddress,
    /// True when an existing session was returned instead of a new one.
    pub reused: bool,
    /// The one-time pre-key consumed, if the recipient had one available.
    pub one_time_pre_key_id: Option<u32>,
}

/// Performs X3DH and persists the resulting sessions.
pub struct KeyExchangeEngine<S: KeyStore, C: Clock> {
    store: S,
    vault: KeyVault,
    clock: C,
}

impl<S: KeyStore, C: Clock> KeyExchangeEngine<S, C> {
    /// Create an engine over the given collaborators.
    pub fn new(store: S, vault: KeyVault, clock: C) -> Self {
        Self { store, vault, clock }
    }

    /// Assemble a user's public pre-key bundle.
    ///
    /// Read-only: the one-time key included is not reserved here;
    /// consumption happens transactionally inside [`initiate`](Self::initiate).
    pub fn public_bundle(&self, user_id: &str) -> Result<PreKeyBundle, EngineError> {
        let identity = self
            .store
            .identity(user_id)?
            .ok_or_else(|| EngineError::KeysNotFound { user_id: user_id.to_string() })?;
        let signed = self
            .store
            .active_signed_pre_key(user_id)?
            .ok_or_else(|| EngineError::KeysNotFound { user_id: user_id.to_string() })?;

        let signature: [u8; 64] =
            signed.signature.clone().try_into().map_err(|_| EngineError::StorageFailure {
                detail: format!("signed pre-key {} has corrupt signature", signed.key_id),
            })?;

        let pre_keys = PreKeyManager::new(self.store.clone(), self.vault.clone(), self.clock.clone());
        let one_time = pre_keys.next_available(user_id)?.map(|k| (k.key_id, k.public));

        Ok(PreKeyBundle {
            identity_signing_key: identity.signing_public,
            identity_dh_key: identity.dh_public,
            registration_id: identity.registration_id,
            signed_pre_key_id: signed.key_id,
            signed_pre_key: signed.public,
            signed_pre_key_signature: signature,
            one_time_pre_key: one_time,
        })
    }

    /// Establish a session between `initiator` and `recipient`.
    ///
    /// Without `force`, an existing session is returned untouched (`reused`
    /// set on the receipt); re-initiating is idempotent. With `force`, both
    /// half-sessions are replaced: a full ratchet reset trading continuity
    /// for freshness.
    pub fn initiate(
        &self,
        initiator: &str,
        recipient: &PeerAddress,
        force: bool,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<ExchangeReceipt, EngineError> {
        if !force && self.store.session(initiator, recipient)?.is_some() {
            tracing::debug!(initiator, peer = %recipient, "session exists, returning it");
            return Ok(ExchangeReceipt {
                peer: recipient.clone(),
                reused: true,
                one_time_pre_key_id: None,
            });
        }

        let bundle = match self.public_bundle(&recipient.user_id) {
            Ok(bundle) => bundle,
            Err(EngineError::KeysNotFound { user_id }) => {
                return Err(EngineError::RecipientKeysNotFound { user_id });
            },
            Err(err) => return Err(err),
        };
        let recipient_identity = unseal_identity(&self.store, &self.vault, &recipient.user_id)?;
        if recipient_identity.record.device_id != recipient.device_id {
            return Err(EngineError::RecipientKeysNotFound {
                user_id: recipient.user_id.clone(),
            });
        }

        // MITM checks, both layers: the pinned-identity comparison and the
        // signature over the signed pre-key.
        let level =
            trust::observe_peer_identity(&self.store, initiator, recipient, bundle.identity_signing_key)?;
        if level == TrustLevel::Changed {
            return Err(EngineError::IdentityUntrusted { peer: recipient.to_string() });
        }
        let initiator_identity = unseal_identity(&self.store, &self.vault, initiator)?;

        let initiation = x3dh::initiate(&initiator_identity.dh, &bundle, rng).map_err(|err| {
            match err {
                quiver_crypto::CryptoError::SignatureInvalid => {
                    EngineError::SignatureVerificationFailure
                },
                _ => EngineError::KeyGenerationFailure {
                    reason: "handshake randomness unavailable".into(),
                },
            }
        })?;

        // Mirror the computation from the recipient's private halves.
        let signed_record = self
            .store
            .active_signed_pre_key(&recipient.user_id)?
            .ok_or_else(|| EngineError::RecipientKeysNotFound {
                user_id: recipient.user_id.clone(),
            })?;
        let signed_secret = self.vault.open_key(
            &signed_pre_key_aad(&recipient.user_id, signed_record.key_id),
            &signed_record.private_sealed,
        )?;
        let signed_pair = DhKeyPair::from_secret_bytes(*signed_secret);

        let one_time_pair = match bundle.one_time_pre_key {
            Some((key_id, _)) => {
                let records = self.store.one_time_pre_keys(&recipient.user_id)?;
                let record = records.iter().find(|k| k.key_id == key_id).ok_or(
                    EngineError::PreKeyAlreadyUsed { key_id },
                )?;
                let secret = self.vault.open_key(
                    &one_time_pre_key_aad(&recipient.user_id, key_id),
                    &record.private_sealed,
                )?;
                Some(DhKeyPair::from_secret_bytes(*secret))
            },
            None => None,
        };

        let recipient_secret = x3dh::respond(
            &recipient_identity.dh,
            &signed_pair,
            one_time_pair.as_ref(),
            &initiator_identity.dh.public_bytes(),
            &initiation.ephemeral_public,
        );

        let map_ratchet = |_| EngineError::KeyGenerationFailure {
            reason: "ratchet randomness unavailable".into(),
        };
        let initiator_state =
            RatchetState::initiator(&initiation.shared_secret, &bundle.signed_pre_key, rng)
                .map_err(map_ratchet)?;
        let recipient_state = RatchetState::responder(
            &recipient_secret,
            &signed_pair,
            &initiator_state.our_ratchet_public(),
            rng,
        )
        .map_err(map_ratchet)?;

        let initiator_addr =
            PeerAddress::new(initiator, initiator_identity.record.device_id);
        let now = self.clock.now_ms();
        let sessions = [
            self.seal_session(initiator, recipient, &initiator_state, now, rng)?,
            self.seal_session(&recipient.user_id, &initiator_addr, &recipient_state, now, rng)?,
        ];

        let consume = bundle.one_time_pre_key.map(|(key_id, _)| (recipient.user_id.as_str(), key_id));
        match self.store.commit_exchange(consume, now, sessions, force) {
            Ok(()) => {},
            Err(StoreError::AlreadyUsed { id, .. }) => {
                return Err(EngineError::PreKeyAlreadyUsed { key_id: id as u32 });
            },
            Err(StoreError::AlreadyExists { .. }) => {
                // Lost a race with a concurrent initiate for the same pair.
                return Err(EngineError::SessionAlreadyExists { peer: recipient.to_string() });
            },
            Err(err) => return Err(err.into()),
        }

        // The recipient pins the initiator's identity on first contact too.
        trust::observe_peer_identity(
            &self.store,
            &recipient.user_id,
            &initiator_addr,
            initiator_identity.record.signing_public,
        )?;

        tracing::info!(
            initiator,
            peer = %recipient,
            one_time_pre_key_id = ?consume.map(|(_, id)| id),
            force,
            "established session"
        );
        Ok(ExchangeReceipt {
            peer: recipient.clone(),
            reused: false,
            one_time_pre_key_id: consume.map(|(_, id)| id),
        })
    }

    fn seal_session(
        &self,
        owner: &str,
        peer: &PeerAddress,
        state: &RatchetState,
        now_ms: u64,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<SessionRecord, EngineError> {
        let mut encoded = Vec::new();
        ciborium::into_writer(state, &mut encoded).map_err(|err| {
            EngineError::StorageFailure { detail: format!("ratchet state encoding: {err}") }
        })?;
        let ratchet_sealed = self.vault.seal(&session_aad(owner, peer), &encoded, rng)?;
        zeroize::Zeroize::zeroize(&mut encoded);

        Ok(SessionRecord {
            owner_user_id: owner.to_string(),
            peer: peer.clone(),
            ratchet_sealed,
            version: 1,
            created_at_ms: now_ms,
            last_used_at_ms: now_ms,
        })
    }
}
