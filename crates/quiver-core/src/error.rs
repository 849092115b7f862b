//! The closed error taxonomy for engine operations.
//!
//! Every exposed operation reports failure through [`EngineError`] rather
//! than raw library errors. Expected outcomes (not found, already used) and
//! unexpected ones (I/O failure) are distinct variants, never conflated;
//! panics are reserved for genuinely unreachable conditions.
//!
//! Display strings are intentionally generic (safe to show a user) while
//! [`code`](EngineError::code) yields the stable taxonomy code for
//! administrative surfaces and audit events.

use thiserror::Error;

use crate::store::StoreError;

/// Failure taxonomy for all engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Key generation failed: randomness or storage unavailable, or an
    /// identity already exists without an explicit overwrite.
    #[error("key generation failed")]
    KeyGenerationFailure {
        /// Investigable detail, free of key material.
        reason: String,
    },

    /// The user has no stored key material for the requested operation.
    #[error("keys not found")]
    KeysNotFound {
        /// User whose keys were missing.
        user_id: String,
    },

    /// The exchange recipient has no published keys.
    #[error("recipient keys not found")]
    RecipientKeysNotFound {
        /// Recipient whose keys were missing.
        user_id: String,
    },

    /// The one-time pre-key was already consumed.
    #[error("pre-key already used")]
    PreKeyAlreadyUsed {
        /// Id of the contested key.
        key_id: u32,
    },

    /// A pre-key signature did not verify: possible MITM.
    ///
    /// Surfaced distinctly and never auto-retried: retry cannot fix a bad
    /// signature and may mask an attack.
    #[error("signature verification failed")]
    SignatureVerificationFailure,

    /// No session exists for the (owner, peer) pair.
    #[error("session invalid, reinitialize")]
    SessionNotFound {
        /// Peer address the session was looked up for.
        peer: String,
    },

    /// A session already exists and force was not requested.
    #[error("session already exists")]
    SessionAlreadyExists {
        /// Peer address of the existing session.
        peer: String,
    },

    /// Authentication failed during decryption, or decrypted content failed
    /// its integrity check.
    #[error("decryption failed")]
    DecryptionFailure,

    /// The peer's identity key changed since it was last verified;
    /// encryption is blocked until re-verified.
    #[error("peer identity not trusted")]
    IdentityUntrusted {
        /// Peer address whose identity changed.
        peer: String,
    },

    /// The backup was already restored once.
    #[error("backup already used")]
    BackupAlreadyUsed {
        /// Id of the contested backup.
        backup_id: u64,
    },

    /// The backup passed its expiry window.
    #[error("backup expired")]
    BackupExpired {
        /// Id of the expired backup.
        backup_id: u64,
    },

    /// The backup passphrase did not decrypt the bundle.
    #[error("backup password incorrect")]
    BackupPasswordIncorrect,

    /// The underlying store failed.
    ///
    /// Transient by nature; retried by the caller's policy, never looped
    /// internally.
    #[error("storage failure")]
    StorageFailure {
        /// Investigable detail, free of key material.
        detail: String,
    },
}

impl EngineError {
    /// Stable taxonomy code for audit events and administrative surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyGenerationFailure { .. } => "KEY_GENERATION_FAILURE",
            Self::KeysNotFound { .. } => "KEYS_NOT_FOUND",
            Self::RecipientKeysNotFound { .. } => "RECIPIENT_KEYS_NOT_FOUND",
            Self::PreKeyAlreadyUsed { .. } => "PRE_KEY_ALREADY_USED",
            Self::SignatureVerificationFailure => "SIGNATURE_VERIFICATION_FAILURE",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::SessionAlreadyExists { .. } => "SESSION_ALREADY_EXISTS",
            Self::DecryptionFailure => "DECRYPTION_FAILURE",
            Self::IdentityUntrusted { .. } => "IDENTITY_UNTRUSTED",
            Self::BackupAlreadyUsed { .. } => "BACKUP_ALREADY_USED",
            Self::BackupExpired { .. } => "BACKUP_EXPIRED",
            Self::BackupPasswordIncorrect => "BACKUP_PASSWORD_INCORRECT",
            Self::StorageFailure { .. } => "STORAGE_FAILURE",
        }
    }

    /// True for failures that indicate a possible attack rather than an
    /// operational problem. Never auto-retried.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Self::SignatureVerificationFailure
                | Self::DecryptionFailure
                | Self::IdentityUntrusted { .. }
                | Self::BackupPasswordIncorrect
        )
    }

    /// True for failures that may succeed on retry under the caller's
    /// retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageFailure { .. })
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::StorageFailure { detail: err.to_string() }
    }
}
