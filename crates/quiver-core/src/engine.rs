//! The engine facade.
//!
//! Composes the managers behind the exposed operation set: plain data in
//! and out, the closed [`EngineError`] taxonomy for every failure, exactly
//! one audit event per call, success or failure, with duration and
//! context but never key material, plaintext, or passphrases.

use std::{sync::Arc, time::Instant};

use quiver_crypto::{PreKeyBundle, RatchetMessage};
use rand::{CryptoRng, RngCore};

use crate::{
    audit::{AuditEvent, AuditEventKind, AuditSink},
    backup::{BackupService, RestoreSummary},
    cipher::RatchetCipher,
    clock::Clock,
    config::EngineConfig,
    error::EngineError,
    exchange::{ExchangeReceipt, KeyExchangeEngine},
    identity::{IdentityKeyManager, PublicIdentity},
    prekeys::PreKeyManager,
    records::{BackupInfo, PeerAddress, RotationEntry, SessionStatus, TrustLevel},
    rotation::RotationScheduler,
    store::KeyStore,
    trust,
    vault::KeyVault,
};

/// Context fields attached to an audit event.
#[derive(Default)]
struct AuditContext {
    peer: Option<String>,
    key_id: Option<u64>,
    count: Option<u64>,
}

/// The key-lifecycle and secure-session engine.
pub struct Engine<S: KeyStore, C: Clock> {
    identity: IdentityKeyManager<S, C>,
    pre_keys: PreKeyManager<S, C>,
    exchange: KeyExchangeEngine<S, C>,
    cipher: RatchetCipher<S, C>,
    rotation: RotationScheduler<S, C>,
    backup: BackupService<S, C>,
    store: S,
    clock: C,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl<S: KeyStore, C: Clock> Engine<S, C> {
    /// Assemble the engine from its collaborators.
    pub fn new(
        store: S,
        vault: KeyVault,
        clock: C,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            identity: IdentityKeyManager::new(store.clone(), vault.clone(), clock.clone()),
            pre_keys: PreKeyManager::new(store.clone(), vault.clone(), clock.clone()),
            exchange: KeyExchangeEngine::new(store.clone(), vault.clone(), clock.clone()),
            cipher: RatchetCipher::new(store.clone(), vault.clone(), clock.clone()),
            rotation: RotationScheduler::new(
                config.rotation.clone(),
                store.clone(),
                vault.clone(),
                clock.clone(),
            ),
            backup: BackupService::new(
                store.clone(),
                vault,
                clock.clone(),
                config.backup_expiry_ms,
            ),
            store,
            clock,
            audit,
            config,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A handle to the rotation scheduler, for mounting the background
    /// driver: `engine.rotation_scheduler().run(period)`.
    pub fn rotation_scheduler(&self) -> RotationScheduler<S, C> {
        self.rotation.clone()
    }

    /// Generate an identity key pair for (user, device).
    pub fn generate_identity(
        &self,
        user_id: &str,
        device_id: u32,
        overwrite: bool,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<PublicIdentity, EngineError> {
        self.audited(AuditEventKind::KeyGeneration, user_id, AuditContext::default(), || {
            self.identity.generate(user_id, device_id, overwrite, rng)
        })
    }

    /// Public identity for a user.
    pub fn get_public_identity(&self, user_id: &str) -> Result<PublicIdentity, EngineError> {
        self.identity.public_identity(user_id)
    }

    /// Assemble a user's public pre-key bundle.
    pub fn get_public_bundle(&self, user_id: &str) -> Result<PreKeyBundle, EngineError> {
        self.audited(AuditEventKind::BundleFetch, user_id, AuditContext::default(), || {
            self.exchange.public_bundle(user_id)
        })
    }

    /// Generate and activate a new signed pre-key.
    pub fn generate_signed_pre_key(
        &self,
        user_id: &str,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<u32, EngineError> {
        self.audited(
            AuditEventKind::SignedPreKeyGeneration,
            user_id,
            AuditContext::default(),
            || {
                let record = self.pre_keys.generate_signed_pre_key(
                    user_id,
                    self.config.rotation.signed_pre_key_lifetime_ms(),
                    rng,
                )?;
                Ok(record.key_id)
            },
        )
    }

    /// Generate a batch of one-time pre-keys. `count` defaults to the
    /// configured batch size when `None`.
    pub fn generate_one_time_pre_keys(
        &self,
        user_id: &str,
        count: Option<u32>,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<u32>, EngineError> {
        let count = count.unwrap_or(self.config.one_time_batch);
        let context = AuditContext { count: Some(u64::from(count)), ..AuditContext::default() };
        self.audited(AuditEventKind::OneTimePreKeyGeneration, user_id, context, || {
            self.pre_keys.generate_one_time_pre_keys(
                user_id,
                count,
                self.config.rotation.one_time_lifetime_ms,
                rng,
            )
        })
    }

    /// Number of unused, unexpired one-time pre-keys.
    pub fn count_available_pre_keys(&self, user_id: &str) -> Result<u32, EngineError> {
        self.pre_keys.count_available(user_id)
    }

    /// Establish a session with a peer. See
    /// [`KeyExchangeEngine::initiate`] for force semantics.
    pub fn initiate_exchange(
        &self,
        initiator: &str,
        recipient: &PeerAddress,
        force: bool,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<ExchangeReceipt, EngineError> {
        let context =
            AuditContext { peer: Some(recipient.to_string()), ..AuditContext::default() };
        self.audited(AuditEventKind::Exchange, initiator, context, || {
            self.exchange.initiate(initiator, recipient, force, rng)
        })
    }

    /// Encrypt a message to a peer over the established session.
    pub fn encrypt(
        &self,
        owner: &str,
        peer: &PeerAddress,
        plaintext: &[u8],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<RatchetMessage, EngineError> {
        let context = AuditContext {
            peer: Some(peer.to_string()),
            count: Some(plaintext.len() as u64),
            ..AuditContext::default()
        };
        self.audited(AuditEventKind::Encrypt, owner, context, || {
            self.cipher.encrypt(owner, peer, plaintext, rng)
        })
    }

    /// Decrypt a message from a peer over the established session.
    pub fn decrypt(
        &self,
        owner: &str,
        peer: &PeerAddress,
        message: &RatchetMessage,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<u8>, EngineError> {
        let context = AuditContext { peer: Some(peer.to_string()), ..AuditContext::default() };
        self.audited(AuditEventKind::Decrypt, owner, context, || {
            self.cipher.decrypt(owner, peer, message, rng)
        })
    }

    /// Status of the session with a peer.
    pub fn get_session_status(
        &self,
        owner: &str,
        peer: &PeerAddress,
    ) -> Result<SessionStatus, EngineError> {
        let record = self
            .store
            .session(owner, peer)?
            .ok_or_else(|| EngineError::SessionNotFound { peer: peer.to_string() })?;
        Ok(SessionStatus {
            peer: record.peer,
            created_at_ms: record.created_at_ms,
            last_used_at_ms: record.last_used_at_ms,
            version: record.version,
            trust: trust::trust_level(&self.store, owner, peer)?,
        })
    }

    /// Delete the session with a peer: the recovery path for a corrupted
    /// record. Returns whether one existed.
    pub fn delete_session(&self, owner: &str, peer: &PeerAddress) -> Result<bool, EngineError> {
        let context = AuditContext { peer: Some(peer.to_string()), ..AuditContext::default() };
        self.audited(AuditEventKind::SessionDelete, owner, context, || {
            Ok(self.store.remove_session(owner, peer)?)
        })
    }

    /// Owner's trust in a peer's identity key.
    pub fn peer_trust(&self, owner: &str, peer: &PeerAddress) -> Result<TrustLevel, EngineError> {
        trust::trust_level(&self.store, owner, peer)
    }

    /// Explicitly verify a peer's current identity key, unblocking
    /// encryption after a key change.
    pub fn mark_peer_verified(
        &self,
        owner: &str,
        peer: &PeerAddress,
    ) -> Result<(), EngineError> {
        let context = AuditContext { peer: Some(peer.to_string()), ..AuditContext::default() };
        self.audited(AuditEventKind::TrustVerification, owner, context, || {
            trust::mark_verified(&self.store, &self.clock, owner, peer)
        })
    }

    /// Create a passphrase-encrypted backup of the user's key bundle.
    pub fn create_backup(
        &self,
        user_id: &str,
        passphrase: &str,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<BackupInfo, EngineError> {
        self.audited(AuditEventKind::BackupCreate, user_id, AuditContext::default(), || {
            self.backup.create(user_id, passphrase, rng)
        })
    }

    /// Restore a backup. Redeemable exactly once.
    pub fn restore_backup(
        &self,
        user_id: &str,
        backup_id: u64,
        passphrase: &str,
    ) -> Result<RestoreSummary, EngineError> {
        let context = AuditContext { key_id: Some(backup_id), ..AuditContext::default() };
        self.audited(AuditEventKind::BackupRestore, user_id, context, || {
            self.backup.restore(user_id, backup_id, passphrase)
        })
    }

    /// Backup metadata for a user.
    pub fn list_backups(&self, user_id: &str) -> Result<Vec<BackupInfo>, EngineError> {
        self.backup.list(user_id)
    }

    /// Run a rotation tick for one user, or for every enrolled user.
    pub fn trigger_rotation(
        &self,
        user_id: Option<&str>,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<RotationEntry>, EngineError> {
        let audit_user = user_id.unwrap_or("*");
        self.audited(AuditEventKind::Rotation, audit_user, AuditContext::default(), || {
            self.rotation.run_tick(user_id, rng)
        })
    }

    /// Rotation history for a user, oldest first.
    pub fn rotation_history(&self, user_id: &str) -> Result<Vec<RotationEntry>, EngineError> {
        Ok(self.store.rotation_history(user_id)?)
    }

    /// Run `op`, then emit exactly one audit event for it.
    fn audited<T>(
        &self,
        kind: AuditEventKind,
        user_id: &str,
        context: AuditContext,
        op: impl FnOnce() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let started = Instant::now();
        let result = op();
        let duration_ms = started.elapsed().as_millis() as u64;

        let error_code = result.as_ref().err().map(|e| e.code().to_string());
        if let Some(code) = &error_code {
            tracing::warn!(?kind, user_id, code, duration_ms, "operation failed");
        } else {
            tracing::debug!(?kind, user_id, duration_ms, "operation complete");
        }

        self.audit.record(AuditEvent {
            kind,
            user_id: user_id.to_string(),
            success: result.is_ok(),
            error_code,
            duration_ms,
            peer: context.peer,
            key_id: context.key_id,
            count: context.count,
        });
        result
    }
}
