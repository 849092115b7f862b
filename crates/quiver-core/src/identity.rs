//! Long-lived identity key management.

use quiver_crypto::{DhKeyPair, SigningKeyPair, generate_registration_id};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::{
    clock::Clock,
    error::EngineError,
    records::IdentityRecord,
    store::{KeyStore, StoreError},
    vault::{KeyVault, identity_aad},
};

/// Public view of an identity, safe to hand to any caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    /// Owning user.
    pub user_id: String,
    /// Device the identity belongs to.
    pub device_id: u32,
    /// 14-bit registration id.
    pub registration_id: u16,
    /// Ed25519 identity signing key.
    pub signing_key: [u8; 32],
    /// X25519 identity agreement key.
    pub dh_key: [u8; 32],
}

impl From<&IdentityRecord> for PublicIdentity {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            device_id: record.device_id,
            registration_id: record.registration_id,
            signing_key: record.signing_public,
            dh_key: record.dh_public,
        }
    }
}

/// Unsealed identity key pairs, scoped to one operation.
pub(crate) struct IdentityKeys {
    /// Ed25519 signing pair.
    pub signing: SigningKeyPair,
    /// X25519 agreement pair.
    pub dh: DhKeyPair,
    /// The stored record the keys came from.
    pub record: IdentityRecord,
}

/// Load and unseal a user's identity key pairs.
pub(crate) fn unseal_identity<S: KeyStore>(
    store: &S,
    vault: &KeyVault,
    user_id: &str,
) -> Result<IdentityKeys, EngineError> {
    let record = store
        .identity(user_id)?
        .ok_or_else(|| EngineError::KeysNotFound { user_id: user_id.to_string() })?;

    let secret = vault.open(&identity_aad(user_id), &record.private_sealed)?;
    if secret.len() != 64 {
        return Err(EngineError::StorageFailure {
            detail: format!("identity secret has wrong length for {user_id}"),
        });
    }
    let mut signing_seed = Zeroizing::new([0u8; 32]);
    let mut dh_secret = Zeroizing::new([0u8; 32]);
    signing_seed.copy_from_slice(&secret[..32]);
    dh_secret.copy_from_slice(&secret[32..]);

    Ok(IdentityKeys {
        signing: SigningKeyPair::from_secret_bytes(*signing_seed),
        dh: DhKeyPair::from_secret_bytes(*dh_secret),
        record,
    })
}

/// Owns identity key generation and lookup.
pub struct IdentityKeyManager<S: KeyStore, C: Clock> {
    store: S,
    vault: KeyVault,
    clock: C,
}

impl<S: KeyStore, C: Clock> IdentityKeyManager<S, C> {
    /// Create a manager over the given collaborators.
    pub fn new(store: S, vault: KeyVault, clock: C) -> Self {
        Self { store, vault, clock }
    }

    /// Generate and persist an identity key pair for (user, device).
    ///
    /// Fails if an identity already exists unless `overwrite` is explicit;
    /// a timed-out caller retrying the same generation sees the duplicate
    /// detected rather than a second identity.
    pub fn generate(
        &self,
        user_id: &str,
        device_id: u32,
        overwrite: bool,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<PublicIdentity, EngineError> {
        let map_gen = |_| EngineError::KeyGenerationFailure {
            reason: "secure randomness unavailable".into(),
        };
        let signing = SigningKeyPair::generate(rng).map_err(map_gen)?;
        let dh = DhKeyPair::generate(rng).map_err(map_gen)?;
        let registration_id = generate_registration_id(rng).map_err(map_gen)?;

        let mut secret = Zeroizing::new([0u8; 64]);
        secret[..32].copy_from_slice(signing.secret_bytes().as_slice());
        secret[32..].copy_from_slice(dh.secret_bytes().as_slice());
        let private_sealed = self.vault.seal(&identity_aad(user_id), secret.as_slice(), rng)?;

        let record = IdentityRecord {
            user_id: user_id.to_string(),
            device_id,
            registration_id,
            signing_public: signing.public_bytes(),
            dh_public: dh.public_bytes(),
            private_sealed,
            created_at_ms: self.clock.now_ms(),
        };
        let public = PublicIdentity::from(&record);

        match self.store.put_identity(record, overwrite) {
            Ok(()) => {},
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(EngineError::KeyGenerationFailure {
                    reason: format!("identity already exists for {user_id}"),
                });
            },
            Err(err) => return Err(err.into()),
        }

        tracing::info!(user_id, device_id, registration_id, "generated identity key pair");
        Ok(public)
    }

    /// Public identity for a user.
    pub fn public_identity(&self, user_id: &str) -> Result<PublicIdentity, EngineError> {
        self.store
            .identity(user_id)?
            .map(|record| PublicIdentity::from(&record))
            .ok_or_else(|| EngineError::KeysNotFound { user_id: user_id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};

    fn manager() -> IdentityKeyManager<MemoryStore, ManualClock> {
        IdentityKeyManager::new(
            MemoryStore::new(),
            KeyVault::new([3u8; 32]),
            ManualClock::at(1_000),
        )
    }

    #[test]
    fn generate_persists_and_returns_public_halves() {
        let manager = manager();
        let identity = manager.generate("alice", 1, false, &mut OsRng).unwrap();

        assert_eq!(identity.user_id, "alice");
        assert!(identity.registration_id >= 1 && identity.registration_id <= 0x3FFF);

        let loaded = manager.public_identity("alice").unwrap();
        assert_eq!(loaded, identity);
    }

    #[test]
    fn second_generate_without_overwrite_fails() {
        let manager = manager();
        manager.generate("alice", 1, false, &mut OsRng).unwrap();

        let result = manager.generate("alice", 1, false, &mut OsRng);
        assert!(matches!(result, Err(EngineError::KeyGenerationFailure { .. })));
    }

    #[test]
    fn overwrite_replaces_the_identity() {
        let manager = manager();
        let first = manager.generate("alice", 1, false, &mut OsRng).unwrap();
        let second = manager.generate("alice", 1, true, &mut OsRng).unwrap();

        assert_ne!(first.signing_key, second.signing_key);
        assert_eq!(manager.public_identity("alice").unwrap(), second);
    }

    #[test]
    fn missing_identity_reports_keys_not_found() {
        let manager = manager();
        let result = manager.public_identity("nobody");
        assert!(matches!(result, Err(EngineError::KeysNotFound { .. })));
    }

    #[test]
    fn unsealed_keys_match_stored_public_halves() {
        let manager = manager();
        let identity = manager.generate("alice", 1, false, &mut OsRng).unwrap();

        let keys =
            unseal_identity(&manager.store, &manager.vault, "alice").unwrap();
        assert_eq!(keys.signing.public_bytes(), identity.signing_key);
        assert_eq!(keys.dh.public_bytes(), identity.dh_key);
    }
}
