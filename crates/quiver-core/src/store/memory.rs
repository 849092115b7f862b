//! In-memory reference implementation of [`KeyStore`].
//!
//! Thread-safe via `Arc<Mutex<_>>`; clones share the same underlying maps.
//! Every multi-step invariant transition (active swap, consume, exchange
//! commit, restore) runs under the single mutex, which makes it trivially
//! linearizable; durable backends must reproduce this behavior with
//! their own transactions.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{KeyStore, StoreError};
use crate::records::{
    BackupRecord, IdentityRecord, OneTimePreKeyRecord, PeerAddress, RotationEntry,
    SessionRecord, SignedPreKeyRecord, TrustRecord,
};

type SessionKey = (String, String);

#[derive(Default)]
struct Inner {
    identities: HashMap<String, IdentityRecord>,
    signed_pre_keys: HashMap<String, BTreeMap<u32, SignedPreKeyRecord>>,
    one_time_pre_keys: HashMap<String, BTreeMap<u32, OneTimePreKeyRecord>>,
    one_time_id_counters: HashMap<String, u32>,
    sessions: HashMap<SessionKey, SessionRecord>,
    trust: HashMap<SessionKey, TrustRecord>,
    backups: HashMap<String, BTreeMap<u64, BackupRecord>>,
    rotation_log: Vec<RotationEntry>,
}

/// In-memory [`KeyStore`]. Clones access the same storage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("MemoryStore mutex poisoned")
    }
}

fn session_key(owner: &str, peer: &PeerAddress) -> SessionKey {
    (owner.to_string(), peer.to_string())
}

fn consume_one_time_locked(
    inner: &mut Inner,
    user_id: &str,
    key_id: u32,
    now_ms: u64,
) -> Result<OneTimePreKeyRecord, StoreError> {
    let record = inner
        .one_time_pre_keys
        .get_mut(user_id)
        .and_then(|keys| keys.get_mut(&key_id))
        .ok_or(StoreError::NotFound { entity: "one-time pre-key" })?;

    if record.is_used {
        return Err(StoreError::AlreadyUsed {
            entity: "one-time pre-key",
            id: u64::from(key_id),
        });
    }
    record.is_used = true;
    record.used_at_ms = Some(now_ms);
    Ok(record.clone())
}

impl KeyStore for MemoryStore {
    fn put_identity(&self, record: IdentityRecord, overwrite: bool) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !overwrite && inner.identities.contains_key(&record.user_id) {
            return Err(StoreError::AlreadyExists { entity: "identity" });
        }
        inner.identities.insert(record.user_id.clone(), record);
        Ok(())
    }

    fn identity(&self, user_id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.lock().identities.get(user_id).cloned())
    }

    fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let mut users: Vec<String> = self.lock().identities.keys().cloned().collect();
        users.sort();
        Ok(users)
    }

    fn put_signed_pre_key_active(&self, record: SignedPreKeyRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let keys = inner.signed_pre_keys.entry(record.user_id.clone()).or_default();

        if keys.contains_key(&record.key_id) {
            return Err(StoreError::AlreadyExists { entity: "signed pre-key" });
        }
        for existing in keys.values_mut() {
            existing.is_active = false;
        }
        keys.insert(record.key_id, record);
        Ok(())
    }

    fn active_signed_pre_key(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        Ok(self
            .lock()
            .signed_pre_keys
            .get(user_id)
            .and_then(|keys| keys.values().find(|k| k.is_active).cloned()))
    }

    fn signed_pre_keys(&self, user_id: &str) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        Ok(self
            .lock()
            .signed_pre_keys
            .get(user_id)
            .map(|keys| keys.values().cloned().collect())
            .unwrap_or_default())
    }

    fn remove_signed_pre_key(&self, user_id: &str, key_id: u32) -> Result<(), StoreError> {
        self.lock()
            .signed_pre_keys
            .get_mut(user_id)
            .and_then(|keys| keys.remove(&key_id))
            .map(|_| ())
            .ok_or(StoreError::NotFound { entity: "signed pre-key" })
    }

    fn reserve_one_time_pre_key_ids(
        &self,
        user_id: &str,
        count: u32,
    ) -> Result<u32, StoreError> {
        let mut inner = self.lock();
        let counter = inner.one_time_id_counters.entry(user_id.to_string()).or_insert(0);
        let first = *counter + 1;
        *counter += count;
        Ok(first)
    }

    fn add_one_time_pre_keys(
        &self,
        user_id: &str,
        records: Vec<OneTimePreKeyRecord>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let keys = inner.one_time_pre_keys.entry(user_id.to_string()).or_default();
        for record in records {
            if keys.contains_key(&record.key_id) {
                return Err(StoreError::AlreadyExists { entity: "one-time pre-key" });
            }
            keys.insert(record.key_id, record);
        }
        Ok(())
    }

    fn one_time_pre_keys(&self, user_id: &str) -> Result<Vec<OneTimePreKeyRecord>, StoreError> {
        Ok(self
            .lock()
            .one_time_pre_keys
            .get(user_id)
            .map(|keys| keys.values().cloned().collect())
            .unwrap_or_default())
    }

    fn consume_one_time_pre_key(
        &self,
        user_id: &str,
        key_id: u32,
        now_ms: u64,
    ) -> Result<OneTimePreKeyRecord, StoreError> {
        let mut inner = self.lock();
        consume_one_time_locked(&mut inner, user_id, key_id, now_ms)
    }

    fn remove_one_time_pre_key(&self, user_id: &str, key_id: u32) -> Result<(), StoreError> {
        self.lock()
            .one_time_pre_keys
            .get_mut(user_id)
            .and_then(|keys| keys.remove(&key_id))
            .map(|_| ())
            .ok_or(StoreError::NotFound { entity: "one-time pre-key" })
    }

    fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = session_key(&record.owner_user_id, &record.peer);
        if inner.sessions.contains_key(&key) {
            return Err(StoreError::AlreadyExists { entity: "session" });
        }
        inner.sessions.insert(key, record);
        Ok(())
    }

    fn session(
        &self,
        owner: &str,
        peer: &PeerAddress,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.lock().sessions.get(&session_key(owner, peer)).cloned())
    }

    fn sessions(&self, owner: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut sessions: Vec<SessionRecord> = self
            .lock()
            .sessions
            .values()
            .filter(|s| s.owner_user_id == owner)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.peer.to_string().cmp(&b.peer.to_string()));
        Ok(sessions)
    }

    fn update_session(
        &self,
        record: SessionRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = session_key(&record.owner_user_id, &record.peer);
        let stored = inner
            .sessions
            .get_mut(&key)
            .ok_or(StoreError::NotFound { entity: "session" })?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found: stored.version,
            });
        }
        *stored = record;
        Ok(())
    }

    fn remove_session(&self, owner: &str, peer: &PeerAddress) -> Result<bool, StoreError> {
        Ok(self.lock().sessions.remove(&session_key(owner, peer)).is_some())
    }

    fn commit_exchange(
        &self,
        consume: Option<(&str, u32)>,
        now_ms: u64,
        sessions: [SessionRecord; 2],
        replace_existing: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();

        // Validate everything before writing anything: the transaction
        // either fully applies or leaves the store untouched.
        if !replace_existing {
            for session in &sessions {
                let key = session_key(&session.owner_user_id, &session.peer);
                if inner.sessions.contains_key(&key) {
                    return Err(StoreError::AlreadyExists { entity: "session" });
                }
            }
        }
        if let Some((user_id, key_id)) = consume {
            consume_one_time_locked(&mut inner, user_id, key_id, now_ms)?;
        }
        for session in sessions {
            let key = session_key(&session.owner_user_id, &session.peer);
            inner.sessions.insert(key, session);
        }
        Ok(())
    }

    fn trust(&self, owner: &str, peer: &PeerAddress) -> Result<Option<TrustRecord>, StoreError> {
        Ok(self.lock().trust.get(&session_key(owner, peer)).cloned())
    }

    fn put_trust(&self, record: TrustRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = session_key(&record.owner_user_id, &record.peer);
        inner.trust.insert(key, record);
        Ok(())
    }

    fn add_backup(&self, record: BackupRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let backups = inner.backups.entry(record.owner_user_id.clone()).or_default();
        if backups.contains_key(&record.backup_id) {
            return Err(StoreError::AlreadyExists { entity: "backup" });
        }
        backups.insert(record.backup_id, record);
        Ok(())
    }

    fn backup(&self, owner: &str, backup_id: u64) -> Result<Option<BackupRecord>, StoreError> {
        Ok(self.lock().backups.get(owner).and_then(|b| b.get(&backup_id)).cloned())
    }

    fn backups(&self, owner: &str) -> Result<Vec<BackupRecord>, StoreError> {
        let mut backups: Vec<BackupRecord> = self
            .lock()
            .backups
            .get(owner)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default();
        backups.sort_by_key(|b| b.created_at_ms);
        Ok(backups)
    }

    fn consume_backup(
        &self,
        owner: &str,
        backup_id: u64,
        now_ms: u64,
    ) -> Result<BackupRecord, StoreError> {
        let mut inner = self.lock();
        let record = inner
            .backups
            .get_mut(owner)
            .and_then(|b| b.get_mut(&backup_id))
            .ok_or(StoreError::NotFound { entity: "backup" })?;

        if record.is_used {
            return Err(StoreError::AlreadyUsed { entity: "backup", id: backup_id });
        }
        record.is_used = true;
        record.used_at_ms = Some(now_ms);
        Ok(record.clone())
    }

    fn replace_user_records(
        &self,
        user_id: &str,
        identity: IdentityRecord,
        signed_pre_keys: Vec<SignedPreKeyRecord>,
        one_time_pre_keys: Vec<OneTimePreKeyRecord>,
        sessions: Vec<SessionRecord>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();

        inner.identities.insert(user_id.to_string(), identity);

        let signed: BTreeMap<u32, SignedPreKeyRecord> =
            signed_pre_keys.into_iter().map(|k| (k.key_id, k)).collect();
        inner.signed_pre_keys.insert(user_id.to_string(), signed);

        let one_time: BTreeMap<u32, OneTimePreKeyRecord> =
            one_time_pre_keys.into_iter().map(|k| (k.key_id, k)).collect();
        let max_id = one_time.keys().max().copied().unwrap_or(0);
        inner.one_time_pre_keys.insert(user_id.to_string(), one_time);
        let counter = inner.one_time_id_counters.entry(user_id.to_string()).or_insert(0);
        *counter = (*counter).max(max_id);

        inner.sessions.retain(|_, s| s.owner_user_id != user_id);
        for session in sessions {
            let key = session_key(&session.owner_user_id, &session.peer);
            inner.sessions.insert(key, session);
        }
        Ok(())
    }

    fn append_rotation(&self, entry: RotationEntry) -> Result<(), StoreError> {
        self.lock().rotation_log.push(entry);
        Ok(())
    }

    fn rotation_history(&self, user_id: &str) -> Result<Vec<RotationEntry>, StoreError> {
        Ok(self
            .lock()
            .rotation_log
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}
