//! Signed and one-time pre-key management.
//!
//! One-time pre-key consumption is the most security-critical invariant in
//! the subsystem: a double-spent key would let two handshakes share DH
//! input. Consumption is a single compare-and-set in the store
//! ([`KeyStore::consume_one_time_pre_key`]); this manager never implements
//! its own check-then-act.

use quiver_crypto::DhKeyPair;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::{
    clock::Clock,
    error::EngineError,
    identity::unseal_identity,
    records::{OneTimePreKeyRecord, SignedPreKeyRecord},
    store::{KeyStore, StoreError},
    vault::{KeyVault, one_time_pre_key_aad, signed_pre_key_aad},
};

/// Default one-time pre-key batch size.
pub const DEFAULT_ONE_TIME_BATCH: u32 = 100;

/// Generates, stores, and atomically consumes pre-keys.
#[derive(Clone)]
pub struct PreKeyManager<S: KeyStore, C: Clock> {
    store: S,
    vault: KeyVault,
    clock: C,
}

impl<S: KeyStore, C: Clock> PreKeyManager<S, C> {
    /// Create a manager over the given collaborators.
    pub fn new(store: S, vault: KeyVault, clock: C) -> Self {
        Self { store, vault, clock }
    }

    /// Generate a new signed pre-key, sign it with the identity key, and
    /// activate it. The previous active key is deactivated (not deleted) in
    /// the same store transition and purged after its grace period.
    ///
    /// `lifetime_ms` is the purge horizon: rotation interval plus grace.
    pub fn generate_signed_pre_key(
        &self,
        user_id: &str,
        lifetime_ms: u64,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<SignedPreKeyRecord, EngineError> {
        let identity = unseal_identity(&self.store, &self.vault, user_id)?;

        let pair = DhKeyPair::generate(rng).map_err(|_| EngineError::KeyGenerationFailure {
            reason: "secure randomness unavailable".into(),
        })?;
        let public = pair.public_bytes();
        let signature = identity.signing.sign(&public);

        let key_id = self
            .store
            .signed_pre_keys(user_id)?
            .iter()
            .map(|k| k.key_id)
            .max()
            .unwrap_or(0)
            + 1;

        let now = self.clock.now_ms();
        let private_sealed = self.vault.seal(
            &signed_pre_key_aad(user_id, key_id),
            pair.secret_bytes().as_slice(),
            rng,
        )?;

        let record = SignedPreKeyRecord {
            user_id: user_id.to_string(),
            key_id,
            public,
            private_sealed,
            signature: signature.to_vec(),
            created_at_ms: now,
            is_active: true,
            expires_at_ms: now + lifetime_ms,
        };

        match self.store.put_signed_pre_key_active(record.clone()) {
            Ok(()) => {},
            Err(StoreError::AlreadyExists { .. }) => {
                // Duplicate rotation attempt (e.g. a timed-out caller
                // retrying); the transition already committed once.
                return Err(EngineError::KeyGenerationFailure {
                    reason: format!("signed pre-key {key_id} already generated for {user_id}"),
                });
            },
            Err(err) => return Err(err.into()),
        }

        tracing::info!(user_id, key_id, "rotated signed pre-key");
        Ok(record)
    }

    /// Generate a batch of one-time pre-keys with store-reserved sequential
    /// ids. Returns the assigned ids.
    pub fn generate_one_time_pre_keys(
        &self,
        user_id: &str,
        count: u32,
        lifetime_ms: u64,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<u32>, EngineError> {
        // Fails early if the user has no identity; one-time keys without an
        // identity would be unusable.
        let _ = unseal_identity(&self.store, &self.vault, user_id)?;

        let first_id = self.store.reserve_one_time_pre_key_ids(user_id, count)?;
        let now = self.clock.now_ms();

        let mut records = Vec::with_capacity(count as usize);
        for key_id in first_id..first_id + count {
            let pair = DhKeyPair::generate(rng).map_err(|_| {
                EngineError::KeyGenerationFailure {
                    reason: "secure randomness unavailable".into(),
                }
            })?;
            let private_sealed = self.vault.seal(
                &one_time_pre_key_aad(user_id, key_id),
                pair.secret_bytes().as_slice(),
                rng,
            )?;
            records.push(OneTimePreKeyRecord {
                user_id: user_id.to_string(),
                key_id,
                public: pair.public_bytes(),
                private_sealed,
                is_used: false,
                used_at_ms: None,
                expires_at_ms: now + lifetime_ms,
            });
        }

        let ids: Vec<u32> = records.iter().map(|r| r.key_id).collect();
        self.store.add_one_time_pre_keys(user_id, records)?;

        tracing::info!(user_id, count, first_id, "generated one-time pre-keys");
        Ok(ids)
    }

    /// Atomically consume a one-time pre-key and return its private half.
    ///
    /// At most one caller ever succeeds per key id; every later caller
    /// observes [`EngineError::PreKeyAlreadyUsed`].
    pub fn consume_one_time_pre_key(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> Result<Zeroizing<[u8; 32]>, EngineError> {
        let record =
            match self.store.consume_one_time_pre_key(user_id, key_id, self.clock.now_ms()) {
                Ok(record) => record,
                Err(StoreError::AlreadyUsed { .. }) => {
                    return Err(EngineError::PreKeyAlreadyUsed { key_id });
                },
                Err(StoreError::NotFound { .. }) => {
                    return Err(EngineError::KeysNotFound { user_id: user_id.to_string() });
                },
                Err(err) => return Err(err.into()),
            };

        self.vault.open_key(&one_time_pre_key_aad(user_id, key_id), &record.private_sealed)
    }

    /// Number of unused, unexpired one-time pre-keys.
    pub fn count_available(&self, user_id: &str) -> Result<u32, EngineError> {
        let now = self.clock.now_ms();
        let count = self
            .store
            .one_time_pre_keys(user_id)?
            .iter()
            .filter(|k| !k.is_used && k.expires_at_ms > now)
            .count();
        Ok(count as u32)
    }

    /// The first unused, unexpired one-time pre-key, for bundle assembly.
    pub(crate) fn next_available(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRecord>, EngineError> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .one_time_pre_keys(user_id)?
            .into_iter()
            .find(|k| !k.is_used && k.expires_at_ms > now))
    }

    /// Delete expired material: superseded signed pre-keys past their purge
    /// horizon and one-time pre-keys past expiry or already consumed and
    /// expired. Returns how many records were removed.
    pub fn purge_expired(&self, user_id: &str) -> Result<u32, EngineError> {
        let now = self.clock.now_ms();
        let mut removed = 0u32;

        for key in self.store.signed_pre_keys(user_id)? {
            if !key.is_active && key.expires_at_ms <= now {
                match self.store.remove_signed_pre_key(user_id, key.key_id) {
                    Ok(()) | Err(StoreError::NotFound { .. }) => removed += 1,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        for key in self.store.one_time_pre_keys(user_id)? {
            if key.expires_at_ms <= now {
                match self.store.remove_one_time_pre_key(user_id, key.key_id) {
                    Ok(()) | Err(StoreError::NotFound { .. }) => removed += 1,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if removed > 0 {
            tracing::debug!(user_id, removed, "purged expired pre-keys");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::{clock::ManualClock, identity::IdentityKeyManager, store::MemoryStore};

    const DAY_MS: u64 = 86_400_000;

    struct Fixture {
        pre_keys: PreKeyManager<MemoryStore, ManualClock>,
        store: MemoryStore,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let vault = KeyVault::new([5u8; 32]);
        let clock = ManualClock::at(1_000);

        IdentityKeyManager::new(store.clone(), vault.clone(), clock.clone())
            .generate("alice", 1, false, &mut OsRng)
            .unwrap();

        Fixture {
            pre_keys: PreKeyManager::new(store.clone(), vault, clock.clone()),
            store,
            clock,
        }
    }

    #[test]
    fn signed_pre_key_is_signed_by_identity() {
        let fx = fixture();
        let record = fx.pre_keys.generate_signed_pre_key("alice", 14 * DAY_MS, &mut OsRng).unwrap();

        let identity = fx.store.identity("alice").unwrap().unwrap();
        let signature: [u8; 64] = record.signature.clone().try_into().unwrap();
        quiver_crypto::verify_signature(&identity.signing_public, &record.public, &signature)
            .unwrap();
    }

    #[test]
    fn rotation_keeps_exactly_one_active() {
        let fx = fixture();
        fx.pre_keys.generate_signed_pre_key("alice", 14 * DAY_MS, &mut OsRng).unwrap();
        fx.pre_keys.generate_signed_pre_key("alice", 14 * DAY_MS, &mut OsRng).unwrap();
        fx.pre_keys.generate_signed_pre_key("alice", 14 * DAY_MS, &mut OsRng).unwrap();

        let keys = fx.store.signed_pre_keys("alice").unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys.iter().filter(|k| k.is_active).count(), 1);
        assert_eq!(keys.iter().map(|k| k.key_id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn one_time_batch_has_sequential_ids() {
        let fx = fixture();
        let ids = fx
            .pre_keys
            .generate_one_time_pre_keys("alice", 5, 30 * DAY_MS, &mut OsRng)
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let more =
            fx.pre_keys.generate_one_time_pre_keys("alice", 3, 30 * DAY_MS, &mut OsRng).unwrap();
        assert_eq!(more, vec![6, 7, 8]);
    }

    #[test]
    fn consume_returns_private_material_once() {
        let fx = fixture();
        fx.pre_keys.generate_one_time_pre_keys("alice", 2, 30 * DAY_MS, &mut OsRng).unwrap();

        let secret = fx.pre_keys.consume_one_time_pre_key("alice", 1).unwrap();
        let stored = fx.store.one_time_pre_keys("alice").unwrap();
        let consumed = stored.iter().find(|k| k.key_id == 1).unwrap();

        // The returned private half matches the stored public half.
        let pair = DhKeyPair::from_secret_bytes(*secret);
        assert_eq!(pair.public_bytes(), consumed.public);
        assert!(consumed.is_used);
        assert_eq!(consumed.used_at_ms, Some(1_000));

        let second = fx.pre_keys.consume_one_time_pre_key("alice", 1);
        assert!(matches!(second, Err(EngineError::PreKeyAlreadyUsed { key_id: 1 })));
    }

    #[test]
    fn count_excludes_used_and_expired() {
        let fx = fixture();
        fx.pre_keys.generate_one_time_pre_keys("alice", 10, DAY_MS, &mut OsRng).unwrap();
        assert_eq!(fx.pre_keys.count_available("alice").unwrap(), 10);

        fx.pre_keys.consume_one_time_pre_key("alice", 1).unwrap();
        assert_eq!(fx.pre_keys.count_available("alice").unwrap(), 9);

        fx.clock.advance(2 * DAY_MS);
        assert_eq!(fx.pre_keys.count_available("alice").unwrap(), 0);
    }

    #[test]
    fn purge_removes_superseded_past_grace_and_expired_one_time() {
        let fx = fixture();
        fx.pre_keys.generate_signed_pre_key("alice", 7 * DAY_MS, &mut OsRng).unwrap();
        fx.pre_keys.generate_one_time_pre_keys("alice", 4, 7 * DAY_MS, &mut OsRng).unwrap();

        fx.clock.advance(8 * DAY_MS);
        fx.pre_keys.generate_signed_pre_key("alice", 7 * DAY_MS, &mut OsRng).unwrap();

        let removed = fx.pre_keys.purge_expired("alice").unwrap();
        // Key 1 is superseded and past its horizon; the 4 one-time keys
        // expired.
        assert_eq!(removed, 5);

        let signed = fx.store.signed_pre_keys("alice").unwrap();
        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].key_id, 2);
        assert!(signed[0].is_active);
        assert!(fx.store.one_time_pre_keys("alice").unwrap().is_empty());
    }

    #[test]
    fn generation_without_identity_fails() {
        let store = MemoryStore::new();
        let manager =
            PreKeyManager::new(store, KeyVault::new([5u8; 32]), ManualClock::at(0));

        let result = manager.generate_signed_pre_key("ghost", DAY_MS, &mut OsRng);
        assert!(matches!(result, Err(EngineError::KeysNotFound { .. })));
    }
}
