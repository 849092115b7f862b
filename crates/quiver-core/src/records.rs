//! Stored entity records.
//!
//! Every private field is a sealed blob produced by
//! [`KeyVault`](crate::vault::KeyVault); records never hold plaintext key
//! material, so they are safe to serialize, debug-print, and hand to any
//! store implementation. Optional context is explicit fields, with no free-form
//! metadata maps.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a peer device: user id plus device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Peer user id.
    pub user_id: String,
    /// Peer device id.
    pub device_id: u32,
}

impl PeerAddress {
    /// Convenience constructor.
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self { user_id: user_id.into(), device_id }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

/// How much the owner trusts a peer's current identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    /// First-seen key, never explicitly verified.
    Untrusted,
    /// Explicitly verified by the owner.
    Trusted,
    /// The peer's key differs from the one previously stored: the MITM
    /// detector. Encryption is blocked until re-verified.
    Changed,
}

/// A user's long-lived identity key pair, one per (user, device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Owning user.
    pub user_id: String,
    /// Device the identity belongs to.
    pub device_id: u32,
    /// 14-bit registration id.
    pub registration_id: u16,
    /// Ed25519 identity signing key, public half.
    pub signing_public: [u8; 32],
    /// X25519 identity agreement key, public half.
    pub dh_public: [u8; 32],
    /// Sealed signing seed and DH secret (64 bytes before sealing).
    pub private_sealed: Vec<u8>,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
}

/// A medium-lived signed pre-key. Exactly one is active per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Owning user.
    pub user_id: String,
    /// Sequential key id, unique per device.
    pub key_id: u32,
    /// X25519 public half.
    pub public: [u8; 32],
    /// Sealed X25519 secret.
    pub private_sealed: Vec<u8>,
    /// Ed25519 signature over `public` by the identity signing key.
    pub signature: Vec<u8>,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
    /// Whether this is the key currently published in bundles.
    pub is_active: bool,
    /// Purge deadline: superseded keys past this instant are deleted.
    pub expires_at_ms: u64,
}

/// A single-use pre-key consumed during a peer's first exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    /// Owning user.
    pub user_id: String,
    /// Sequential key id, unique per device.
    pub key_id: u32,
    /// X25519 public half.
    pub public: [u8; 32],
    /// Sealed X25519 secret.
    pub private_sealed: Vec<u8>,
    /// Set exactly once, atomically, when the key is consumed.
    pub is_used: bool,
    /// When the key was consumed, if it was.
    pub used_at_ms: Option<u64>,
    /// Unused keys past this instant are purged and never offered.
    pub expires_at_ms: u64,
}

/// Ratchet session state for one (owner, peer-device) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Owning user.
    pub owner_user_id: String,
    /// The peer this session encrypts to.
    pub peer: PeerAddress,
    /// Sealed, CBOR-encoded ratchet state.
    pub ratchet_sealed: Vec<u8>,
    /// Optimistic-concurrency version; bumped on every mutation.
    pub version: u64,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
    /// Last successful encrypt or decrypt, ms since epoch.
    pub last_used_at_ms: u64,
}

/// Pinned identity key and trust state for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// Owning user.
    pub owner_user_id: String,
    /// The peer this record tracks.
    pub peer: PeerAddress,
    /// The peer identity signing key pinned at first sight or last
    /// verification.
    pub peer_identity_key: [u8; 32],
    /// Current trust level.
    pub level: TrustLevel,
    /// When the owner last explicitly verified, if ever.
    pub verified_at_ms: Option<u64>,
}

/// A passphrase-encrypted key bundle, redeemable exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Owning user.
    pub owner_user_id: String,
    /// Random backup id.
    pub backup_id: u64,
    /// Argon2 salt followed by the sealed bundle.
    pub sealed_bundle: Vec<u8>,
    /// SHA-256 of the plaintext bundle, verified on restore.
    pub bundle_hash: [u8; 32],
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
    /// Restore deadline.
    pub expires_at_ms: u64,
    /// Set exactly once, atomically, when the backup is restored.
    pub is_used: bool,
    /// When the backup was restored, if it was.
    pub used_at_ms: Option<u64>,
}

/// Which maintenance action a rotation entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationKind {
    /// Signed pre-key was rotated.
    SignedPreKey,
    /// One-time pre-keys were replenished.
    OneTimePreKeys,
    /// Expired material was purged.
    Purge,
}

/// Append-only record of one rotation-scheduler action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEntry {
    /// User the action ran for.
    pub user_id: String,
    /// Action kind.
    pub kind: RotationKind,
    /// Whether the action completed.
    pub success: bool,
    /// Keys generated or purged, where applicable.
    pub count: Option<u32>,
    /// Taxonomy code if the action failed.
    pub error_code: Option<String>,
    /// When the action ran, ms since epoch.
    pub at_ms: u64,
}

/// Read-only view of a session for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// The peer the session encrypts to.
    pub peer: PeerAddress,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
    /// Last successful encrypt or decrypt, ms since epoch.
    pub last_used_at_ms: u64,
    /// Current optimistic-concurrency version.
    pub version: u64,
    /// Owner's trust in the peer's identity key.
    pub trust: TrustLevel,
}

/// Read-only view of a backup for listing; never contains bundle bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Backup id.
    pub backup_id: u64,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
    /// Restore deadline.
    pub expires_at_ms: u64,
    /// Whether the backup was already restored.
    pub is_used: bool,
}

impl From<&BackupRecord> for BackupInfo {
    fn from(record: &BackupRecord) -> Self {
        Self {
            backup_id: record.backup_id,
            created_at_ms: record.created_at_ms,
            expires_at_ms: record.expires_at_ms,
            is_used: record.is_used,
        }
    }
}
