//! Passphrase-protected key backup and one-time restore.
//!
//! A backup is the user's full key bundle (identity, pre-keys, sessions)
//! with every secret unsealed, CBOR-encoded, hashed, then encrypted under a
//! key derived from the backup passphrase (Argon2id; independent of any
//! account credential). Restore verifies the hash, re-seals everything
//! under the *current* wrapping key, and replaces the user's records in one
//! store transaction. Each backup is redeemable exactly once, enforced by
//! the same compare-and-set discipline as one-time pre-keys.

use quiver_crypto::{aead, password};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    clock::Clock,
    error::EngineError,
    records::{
        BackupInfo, BackupRecord, IdentityRecord, OneTimePreKeyRecord, SessionRecord,
        SignedPreKeyRecord,
    },
    store::{KeyStore, StoreError},
    vault::{KeyVault, identity_aad, one_time_pre_key_aad, session_aad, signed_pre_key_aad},
};

/// Counts of records restored from a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Signed pre-keys restored.
    pub signed_pre_keys: u32,
    /// One-time pre-keys restored.
    pub one_time_pre_keys: u32,
    /// Sessions restored.
    pub sessions: u32,
}

/// A record paired with its unsealed secret. Exists only inside the
/// encrypted bundle, never at rest.
#[derive(Serialize, Deserialize)]
struct Unsealed<T> {
    record: T,
    secret: Vec<u8>,
}

/// The plaintext backup bundle.
#[derive(Serialize, Deserialize)]
struct KeyBundle {
    identity: Unsealed<IdentityRecord>,
    signed_pre_keys: Vec<Unsealed<SignedPreKeyRecord>>,
    one_time_pre_keys: Vec<Unsealed<OneTimePreKeyRecord>>,
    sessions: Vec<Unsealed<SessionRecord>>,
}

impl Drop for KeyBundle {
    fn drop(&mut self) {
        self.identity.secret.zeroize();
        for key in &mut self.signed_pre_keys {
            key.secret.zeroize();
        }
        for key in &mut self.one_time_pre_keys {
            key.secret.zeroize();
        }
        for session in &mut self.sessions {
            session.secret.zeroize();
        }
    }
}

/// Creates and restores passphrase-encrypted key backups.
pub struct BackupService<S: KeyStore, C: Clock> {
    store: S,
    vault: KeyVault,
    clock: C,
    expiry_ms: u64,
}

impl<S: KeyStore, C: Clock> BackupService<S, C> {
    /// Create a service over the given collaborators. `expiry_ms` is the
    /// restore window for new backups.
    pub fn new(store: S, vault: KeyVault, clock: C, expiry_ms: u64) -> Self {
        Self { store, vault, clock, expiry_ms }
    }

    /// Create a backup of the user's full key bundle.
    pub fn create(
        &self,
        user_id: &str,
        passphrase: &str,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<BackupInfo, EngineError> {
        let bundle = self.collect_bundle(user_id)?;

        let mut plaintext = Zeroizing::new(Vec::new());
        ciborium::into_writer(&bundle, &mut *plaintext).map_err(|err| {
            EngineError::StorageFailure { detail: format!("bundle encoding: {err}") }
        })?;
        drop(bundle);

        let bundle_hash: [u8; 32] = Sha256::digest(plaintext.as_slice()).into();

        let salt = password::generate_salt(rng).map_err(|_| EngineError::KeyGenerationFailure {
            reason: "backup salt randomness unavailable".into(),
        })?;
        let key = password::derive_backup_key(passphrase, &salt).map_err(|_| {
            EngineError::KeyGenerationFailure { reason: "backup key derivation failed".into() }
        })?;

        let backup_id = rng.next_u64();
        let aad = backup_aad(user_id, backup_id);
        let sealed = aead::seal(&key, aad.as_bytes(), plaintext.as_slice(), rng).map_err(
            |_| EngineError::KeyGenerationFailure {
                reason: "backup nonce randomness unavailable".into(),
            },
        )?;

        let mut sealed_bundle = Vec::with_capacity(password::SALT_LEN + sealed.len());
        sealed_bundle.extend_from_slice(&salt);
        sealed_bundle.extend_from_slice(&sealed);

        let now = self.clock.now_ms();
        let record = BackupRecord {
            owner_user_id: user_id.to_string(),
            backup_id,
            sealed_bundle,
            bundle_hash,
            created_at_ms: now,
            expires_at_ms: now + self.expiry_ms,
            is_used: false,
            used_at_ms: None,
        };
        let info = BackupInfo::from(&record);
        self.store.add_backup(record)?;

        tracing::info!(user_id, backup_id, "created key backup");
        Ok(info)
    }

    /// Restore a backup, replacing the user's key material.
    ///
    /// The backup is consumed *before* the records are written: under
    /// concurrent restores exactly one caller wins the compare-and-set and
    /// every other observes [`EngineError::BackupAlreadyUsed`].
    pub fn restore(
        &self,
        user_id: &str,
        backup_id: u64,
        passphrase: &str,
    ) -> Result<RestoreSummary, EngineError> {
        let record = self
            .store
            .backup(user_id, backup_id)?
            .ok_or_else(|| EngineError::KeysNotFound { user_id: user_id.to_string() })?;

        let now = self.clock.now_ms();
        if now >= record.expires_at_ms {
            return Err(EngineError::BackupExpired { backup_id });
        }
        if record.is_used {
            return Err(EngineError::BackupAlreadyUsed { backup_id });
        }
        if record.sealed_bundle.len() <= password::SALT_LEN {
            return Err(EngineError::StorageFailure {
                detail: format!("backup {backup_id} is truncated"),
            });
        }

        let (salt_bytes, sealed) = record.sealed_bundle.split_at(password::SALT_LEN);
        let mut salt = [0u8; password::SALT_LEN];
        salt.copy_from_slice(salt_bytes);

        let key = password::derive_backup_key(passphrase, &salt).map_err(|_| {
            EngineError::KeyGenerationFailure { reason: "backup key derivation failed".into() }
        })?;
        let aad = backup_aad(user_id, backup_id);
        let plaintext = Zeroizing::new(
            aead::open(&key, aad.as_bytes(), sealed)
                .map_err(|_| EngineError::BackupPasswordIncorrect)?,
        );

        let bundle_hash: [u8; 32] = Sha256::digest(plaintext.as_slice()).into();
        if bundle_hash != record.bundle_hash {
            return Err(EngineError::DecryptionFailure);
        }

        let bundle: KeyBundle = ciborium::from_reader(plaintext.as_slice()).map_err(|err| {
            EngineError::StorageFailure { detail: format!("bundle decoding: {err}") }
        })?;

        // Burn the backup first: single-use wins over crash-retry comfort.
        match self.store.consume_backup(user_id, backup_id, now) {
            Ok(_) => {},
            Err(StoreError::AlreadyUsed { .. }) => {
                return Err(EngineError::BackupAlreadyUsed { backup_id });
            },
            Err(err) => return Err(err.into()),
        }

        let summary = self.write_bundle(user_id, bundle)?;
        tracing::info!(
            user_id,
            backup_id,
            sessions = summary.sessions,
            "restored key backup"
        );
        Ok(summary)
    }

    /// Backup metadata for a user, oldest first. Never includes bundle
    /// contents.
    pub fn list(&self, user_id: &str) -> Result<Vec<BackupInfo>, EngineError> {
        Ok(self.store.backups(user_id)?.iter().map(BackupInfo::from).collect())
    }

    /// Gather and unseal the user's complete key material.
    fn collect_bundle(&self, user_id: &str) -> Result<KeyBundle, EngineError> {
        let identity = self
            .store
            .identity(user_id)?
            .ok_or_else(|| EngineError::KeysNotFound { user_id: user_id.to_string() })?;
        let identity_secret = self.vault.open(&identity_aad(user_id), &identity.private_sealed)?;

        let mut signed_pre_keys = Vec::new();
        for record in self.store.signed_pre_keys(user_id)? {
            let secret = self
                .vault
                .open(&signed_pre_key_aad(user_id, record.key_id), &record.private_sealed)?;
            signed_pre_keys.push(Unsealed { record, secret: secret.to_vec() });
        }

        let mut one_time_pre_keys = Vec::new();
        for record in self.store.one_time_pre_keys(user_id)? {
            let secret = self
                .vault
                .open(&one_time_pre_key_aad(user_id, record.key_id), &record.private_sealed)?;
            one_time_pre_keys.push(Unsealed { record, secret: secret.to_vec() });
        }

        let mut sessions = Vec::new();
        for record in self.store.sessions(user_id)? {
            let secret =
                self.vault.open(&session_aad(user_id, &record.peer), &record.ratchet_sealed)?;
            sessions.push(Unsealed { record, secret: secret.to_vec() });
        }

        Ok(KeyBundle {
            identity: Unsealed { record: identity, secret: identity_secret.to_vec() },
            signed_pre_keys,
            one_time_pre_keys,
            sessions,
        })
    }

    /// Re-seal a bundle under the current wrapping key and write it back.
    fn write_bundle(&self, user_id: &str, bundle: KeyBundle) -> Result<RestoreSummary, EngineError> {
        let mut rng = rand::rngs::OsRng;

        let mut identity = bundle.identity.record.clone();
        identity.private_sealed =
            self.vault.seal(&identity_aad(user_id), &bundle.identity.secret, &mut rng)?;

        let mut signed = Vec::with_capacity(bundle.signed_pre_keys.len());
        for unsealed in &bundle.signed_pre_keys {
            let mut record = unsealed.record.clone();
            record.private_sealed = self.vault.seal(
                &signed_pre_key_aad(user_id, record.key_id),
                &unsealed.secret,
                &mut rng,
            )?;
            signed.push(record);
        }

        let mut one_time = Vec::with_capacity(bundle.one_time_pre_keys.len());
        for unsealed in &bundle.one_time_pre_keys {
            let mut record = unsealed.record.clone();
            record.private_sealed = self.vault.seal(
                &one_time_pre_key_aad(user_id, record.key_id),
                &unsealed.secret,
                &mut rng,
            )?;
            one_time.push(record);
        }

        let mut sessions = Vec::with_capacity(bundle.sessions.len());
        for unsealed in &bundle.sessions {
            let mut record = unsealed.record.clone();
            record.ratchet_sealed = self.vault.seal(
                &session_aad(user_id, &record.peer),
                &unsealed.secret,
                &mut rng,
            )?;
            sessions.push(record);
        }

        let summary = RestoreSummary {
            signed_pre_keys: signed.len() as u32,
            one_time_pre_keys: one_time.len() as u32,
            sessions: sessions.len() as u32,
        };
        self.store.replace_user_records(user_id, identity, signed, one_time, sessions)?;
        Ok(summary)
    }
}

fn backup_aad(user_id: &str, backup_id: u64) -> String {
    format!("backup:{user_id}:{backup_id}")
}
