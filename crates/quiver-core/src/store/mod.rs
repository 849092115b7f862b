//! Storage abstraction for key-lifecycle records.
//!
//! A single trait covers every stored entity. It is synchronous (storage
//! backends may block on I/O; the callers are already on blocking-capable
//! contexts) and must be `Clone + Send + Sync`: implementations share
//! internal state via `Arc`, so clones observe the same records.
//!
//! The trait carries the atomic conditional operations the protocol
//! invariants depend on: one-time-key consumption is a compare-and-set,
//! session updates are versioned, the active signed-pre-key swap and the
//! exchange commit are single transactions. Implementations must make each
//! of these linearizable; `MemoryStore` does so under one mutex.

mod error;
mod memory;

pub use error::StoreError;
pub use memory::MemoryStore;

use crate::records::{
    BackupRecord, IdentityRecord, OneTimePreKeyRecord, PeerAddress, RotationEntry,
    SessionRecord, SignedPreKeyRecord, TrustRecord,
};

/// Durable storage for every key-lifecycle entity.
pub trait KeyStore: Clone + Send + Sync + 'static {
    // ── Identities ──

    /// Insert an identity, or replace it when `overwrite` is set.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the user has an identity and `overwrite` is false.
    fn put_identity(&self, record: IdentityRecord, overwrite: bool) -> Result<(), StoreError>;

    /// Load a user's identity. `None` if never generated.
    fn identity(&self, user_id: &str) -> Result<Option<IdentityRecord>, StoreError>;

    /// All user ids with a stored identity, for rotation enumeration.
    fn list_users(&self) -> Result<Vec<String>, StoreError>;

    // ── Signed pre-keys ──

    /// Insert a new signed pre-key as active and deactivate the previous
    /// active key, in one atomic transition.
    ///
    /// # Invariants
    ///
    /// - Post: exactly one active signed pre-key exists for the user
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if `record.key_id` is already stored; duplicate
    /// rotation attempts are detected, not merged.
    fn put_signed_pre_key_active(&self, record: SignedPreKeyRecord) -> Result<(), StoreError>;

    /// The currently active signed pre-key, if any.
    fn active_signed_pre_key(&self, user_id: &str)
    -> Result<Option<SignedPreKeyRecord>, StoreError>;

    /// All signed pre-keys for a user, active and superseded.
    fn signed_pre_keys(&self, user_id: &str) -> Result<Vec<SignedPreKeyRecord>, StoreError>;

    /// Delete one signed pre-key.
    fn remove_signed_pre_key(&self, user_id: &str, key_id: u32) -> Result<(), StoreError>;

    // ── One-time pre-keys ──

    /// Atomically reserve `count` sequential key ids; returns the first.
    fn reserve_one_time_pre_key_ids(&self, user_id: &str, count: u32) -> Result<u32, StoreError>;

    /// Insert a batch of one-time pre-keys.
    fn add_one_time_pre_keys(
        &self,
        user_id: &str,
        records: Vec<OneTimePreKeyRecord>,
    ) -> Result<(), StoreError>;

    /// All one-time pre-keys for a user, used and unused.
    fn one_time_pre_keys(&self, user_id: &str) -> Result<Vec<OneTimePreKeyRecord>, StoreError>;

    /// Mark a one-time pre-key used and return it, as a single
    /// compare-and-set on `is_used`.
    ///
    /// # Errors
    ///
    /// `AlreadyUsed` for every caller after the first, under any
    /// concurrency. `NotFound` if the key id does not exist.
    fn consume_one_time_pre_key(
        &self,
        user_id: &str,
        key_id: u32,
        now_ms: u64,
    ) -> Result<OneTimePreKeyRecord, StoreError>;

    /// Delete one one-time pre-key.
    fn remove_one_time_pre_key(&self, user_id: &str, key_id: u32) -> Result<(), StoreError>;

    // ── Sessions ──

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the (owner, peer) pair already has one.
    fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// Load a session. `None` if the pair has none.
    fn session(&self, owner: &str, peer: &PeerAddress)
    -> Result<Option<SessionRecord>, StoreError>;

    /// All sessions owned by a user.
    fn sessions(&self, owner: &str) -> Result<Vec<SessionRecord>, StoreError>;

    /// Replace a session if its stored version equals `expected_version`.
    ///
    /// The caller supplies the successor record with its version already
    /// bumped. Losing callers see `VersionConflict` and re-read.
    fn update_session(
        &self,
        record: SessionRecord,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Delete a session. Returns whether one existed.
    fn remove_session(&self, owner: &str, peer: &PeerAddress) -> Result<bool, StoreError>;

    /// Commit a key exchange in one transaction: consume the recipient's
    /// one-time pre-key (if one was offered) and insert both half-sessions.
    ///
    /// A crash can never leave the key consumed without the sessions or the
    /// sessions stored without the consumption.
    ///
    /// # Errors
    ///
    /// `AlreadyUsed` if the one-time key lost its compare-and-set;
    /// `AlreadyExists` if either session exists and `replace_existing` is
    /// false. Nothing is written on error.
    fn commit_exchange(
        &self,
        consume: Option<(&str, u32)>,
        now_ms: u64,
        sessions: [SessionRecord; 2],
        replace_existing: bool,
    ) -> Result<(), StoreError>;

    // ── Identity trust ──

    /// Load the trust record for a peer. `None` if never observed.
    fn trust(&self, owner: &str, peer: &PeerAddress) -> Result<Option<TrustRecord>, StoreError>;

    /// Insert or replace a trust record.
    fn put_trust(&self, record: TrustRecord) -> Result<(), StoreError>;

    // ── Backups ──

    /// Insert a backup.
    fn add_backup(&self, record: BackupRecord) -> Result<(), StoreError>;

    /// Load one backup. `None` if the id is unknown for this user.
    fn backup(&self, owner: &str, backup_id: u64) -> Result<Option<BackupRecord>, StoreError>;

    /// All backups for a user, newest last.
    fn backups(&self, owner: &str) -> Result<Vec<BackupRecord>, StoreError>;

    /// Mark a backup used, as a single compare-and-set on `is_used`.
    ///
    /// # Errors
    ///
    /// `AlreadyUsed` for every caller after the first. `NotFound` if the id
    /// is unknown.
    fn consume_backup(
        &self,
        owner: &str,
        backup_id: u64,
        now_ms: u64,
    ) -> Result<BackupRecord, StoreError>;

    /// Replace a user's entire key material in one transaction, for backup
    /// restore: identity, signed pre-keys, one-time pre-keys, and sessions.
    fn replace_user_records(
        &self,
        user_id: &str,
        identity: IdentityRecord,
        signed_pre_keys: Vec<SignedPreKeyRecord>,
        one_time_pre_keys: Vec<OneTimePreKeyRecord>,
        sessions: Vec<SessionRecord>,
    ) -> Result<(), StoreError>;

    // ── Rotation history ──

    /// Append one rotation-history entry. The log is append-only.
    fn append_rotation(&self, entry: RotationEntry) -> Result<(), StoreError>;

    /// All rotation entries for a user, oldest first.
    fn rotation_history(&self, user_id: &str) -> Result<Vec<RotationEntry>, StoreError>;
}
