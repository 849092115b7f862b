//! Scheduled key rotation and replenishment.
//!
//! Rotation is an explicit policy object plus a stateless per-tick
//! function, with no ambient timer state. Each tick walks every enrolled user: rotates
//! the signed pre-key past its interval, purges expired material, and
//! replenishes one-time pre-keys below the low-water mark. Per-user
//! failures are isolated; one user's broken state never blocks the batch.
//! An optional async driver loops the tick on a fixed period.

use std::time::Duration;

use rand::{CryptoRng, RngCore};

use crate::{
    clock::Clock,
    error::EngineError,
    prekeys::PreKeyManager,
    records::{RotationEntry, RotationKind},
    store::KeyStore,
    vault::KeyVault,
};

const DAY_MS: u64 = 86_400_000;

/// Rotation policy configuration.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Age at which the signed pre-key is rotated. Default: 7 days.
    pub signed_pre_key_interval_ms: u64,
    /// How long a superseded signed pre-key is kept to decrypt late
    /// handshakes. Default: 7 days.
    pub signed_pre_key_grace_ms: u64,
    /// Replenish one-time pre-keys when fewer than this remain. Default: 20.
    pub one_time_low_water: u32,
    /// Replenish back up to this count. Default: 100.
    pub one_time_target: u32,
    /// Unused one-time pre-keys expire after this long. Default: 30 days.
    pub one_time_lifetime_ms: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            signed_pre_key_interval_ms: 7 * DAY_MS,
            signed_pre_key_grace_ms: 7 * DAY_MS,
            one_time_low_water: 20,
            one_time_target: 100,
            one_time_lifetime_ms: 30 * DAY_MS,
        }
    }
}

impl RotationPolicy {
    /// Purge horizon for a signed pre-key: interval plus grace.
    pub fn signed_pre_key_lifetime_ms(&self) -> u64 {
        self.signed_pre_key_interval_ms + self.signed_pre_key_grace_ms
    }
}

/// Runs rotation ticks against the store.
#[derive(Clone)]
pub struct RotationScheduler<S: KeyStore, C: Clock> {
    policy: RotationPolicy,
    store: S,
    pre_keys: PreKeyManager<S, C>,
    clock: C,
}

impl<S: KeyStore, C: Clock> RotationScheduler<S, C> {
    /// Create a scheduler over the given collaborators.
    pub fn new(policy: RotationPolicy, store: S, vault: KeyVault, clock: C) -> Self {
        let pre_keys = PreKeyManager::new(store.clone(), vault, clock.clone());
        Self { policy, store, pre_keys, clock }
    }

    /// The active policy.
    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Run one rotation tick for every enrolled user, or a single user.
    ///
    /// Returns the history entries recorded this tick. Per-user failures
    /// are captured as failed entries and never abort the batch.
    pub fn run_tick(
        &self,
        only_user: Option<&str>,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<RotationEntry>, EngineError> {
        let users = match only_user {
            Some(user) => vec![user.to_string()],
            None => self.store.list_users()?,
        };

        let mut entries = Vec::new();
        for user in &users {
            self.run_user_tick(user, rng, &mut entries);
        }
        for entry in &entries {
            self.store.append_rotation(entry.clone())?;
        }

        tracing::debug!(users = users.len(), actions = entries.len(), "rotation tick complete");
        Ok(entries)
    }

    fn run_user_tick(
        &self,
        user_id: &str,
        rng: &mut (impl RngCore + CryptoRng),
        entries: &mut Vec<RotationEntry>,
    ) {
        let now = self.clock.now_ms();

        if let Some(entry) = self.rotate_signed_pre_key(user_id, now, rng) {
            entries.push(entry);
        }
        if let Some(entry) = self.purge(user_id, now) {
            entries.push(entry);
        }
        if let Some(entry) = self.replenish_one_time(user_id, now, rng) {
            entries.push(entry);
        }
    }

    /// Rotate the signed pre-key when missing or past the interval.
    fn rotate_signed_pre_key(
        &self,
        user_id: &str,
        now: u64,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Option<RotationEntry> {
        let due = match self.store.active_signed_pre_key(user_id) {
            Ok(None) => true,
            Ok(Some(active)) => {
                now.saturating_sub(active.created_at_ms) >= self.policy.signed_pre_key_interval_ms
            },
            Err(err) => {
                return Some(failed_entry(user_id, RotationKind::SignedPreKey, now, &err.into()));
            },
        };
        if !due {
            return None;
        }

        match self.pre_keys.generate_signed_pre_key(
            user_id,
            self.policy.signed_pre_key_lifetime_ms(),
            rng,
        ) {
            Ok(_) => Some(RotationEntry {
                user_id: user_id.to_string(),
                kind: RotationKind::SignedPreKey,
                success: true,
                count: Some(1),
                error_code: None,
                at_ms: now,
            }),
            Err(err) => {
                tracing::warn!(user_id, code = err.code(), "signed pre-key rotation failed");
                Some(failed_entry(user_id, RotationKind::SignedPreKey, now, &err))
            },
        }
    }

    /// Purge expired material; only records an entry when something moved.
    fn purge(&self, user_id: &str, now: u64) -> Option<RotationEntry> {
        match self.pre_keys.purge_expired(user_id) {
            Ok(0) => None,
            Ok(removed) => Some(RotationEntry {
                user_id: user_id.to_string(),
                kind: RotationKind::Purge,
                success: true,
                count: Some(removed),
                error_code: None,
                at_ms: now,
            }),
            Err(err) => {
                tracing::warn!(user_id, code = err.code(), "pre-key purge failed");
                Some(failed_entry(user_id, RotationKind::Purge, now, &err))
            },
        }
    }

    /// Replenish one-time pre-keys when below the low-water mark.
    fn replenish_one_time(
        &self,
        user_id: &str,
        now: u64,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Option<RotationEntry> {
        let available = match self.pre_keys.count_available(user_id) {
            Ok(available) => available,
            Err(err) => {
                return Some(failed_entry(user_id, RotationKind::OneTimePreKeys, now, &err));
            },
        };
        if available >= self.policy.one_time_low_water {
            return None;
        }

        let needed = self.policy.one_time_target - available;
        match self.pre_keys.generate_one_time_pre_keys(
            user_id,
            needed,
            self.policy.one_time_lifetime_ms,
            rng,
        ) {
            Ok(ids) => Some(RotationEntry {
                user_id: user_id.to_string(),
                kind: RotationKind::OneTimePreKeys,
                success: true,
                count: Some(ids.len() as u32),
                error_code: None,
                at_ms: now,
            }),
            Err(err) => {
                tracing::warn!(user_id, code = err.code(), "one-time replenishment failed");
                Some(failed_entry(user_id, RotationKind::OneTimePreKeys, now, &err))
            },
        }
    }

    /// Loop [`run_tick`](Self::run_tick) forever on a fixed period.
    ///
    /// Tick failures are logged and the loop continues; a broken store is a
    /// condition the next tick may not see.
    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.run_tick(None, &mut rand::rngs::OsRng) {
                tracing::warn!(code = err.code(), "rotation tick failed");
            }
        }
    }
}

fn failed_entry(
    user_id: &str,
    kind: RotationKind,
    now: u64,
    err: &EngineError,
) -> RotationEntry {
    RotationEntry {
        user_id: user_id.to_string(),
        kind,
        success: false,
        count: None,
        error_code: Some(err.code().to_string()),
        at_ms: now,
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::{clock::ManualClock, identity::IdentityKeyManager, store::MemoryStore};

    struct Fixture {
        scheduler: RotationScheduler<MemoryStore, ManualClock>,
        store: MemoryStore,
        clock: ManualClock,
    }

    fn fixture(users: &[&str]) -> Fixture {
        let store = MemoryStore::new();
        let vault = KeyVault::new([9u8; 32]);
        let clock = ManualClock::at(1_000);

        let identities =
            IdentityKeyManager::new(store.clone(), vault.clone(), clock.clone());
        for user in users {
            identities.generate(user, 1, false, &mut OsRng).unwrap();
        }

        Fixture {
            scheduler: RotationScheduler::new(
                RotationPolicy::default(),
                store.clone(),
                vault,
                clock.clone(),
            ),
            store,
            clock,
        }
    }

    #[test]
    fn first_tick_provisions_everything() {
        let fx = fixture(&["alice"]);
        let entries = fx.scheduler.run_tick(None, &mut OsRng).unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.kind == RotationKind::SignedPreKey && e.success));
        assert!(entries.iter().any(|e| {
            e.kind == RotationKind::OneTimePreKeys && e.success && e.count == Some(100)
        }));

        assert!(fx.store.active_signed_pre_key("alice").unwrap().is_some());
        assert_eq!(fx.store.one_time_pre_keys("alice").unwrap().len(), 100);
    }

    #[test]
    fn fresh_keys_are_left_alone() {
        let fx = fixture(&["alice"]);
        fx.scheduler.run_tick(None, &mut OsRng).unwrap();

        let entries = fx.scheduler.run_tick(None, &mut OsRng).unwrap();
        assert!(entries.is_empty(), "nothing is due immediately after provisioning");
    }

    #[test]
    fn signed_pre_key_rotates_after_interval() {
        let fx = fixture(&["alice"]);
        fx.scheduler.run_tick(None, &mut OsRng).unwrap();
        let first = fx.store.active_signed_pre_key("alice").unwrap().unwrap();

        fx.clock.advance(7 * DAY_MS);
        let entries = fx.scheduler.run_tick(None, &mut OsRng).unwrap();

        assert!(entries.iter().any(|e| e.kind == RotationKind::SignedPreKey && e.success));
        let second = fx.store.active_signed_pre_key("alice").unwrap().unwrap();
        assert_ne!(first.key_id, second.key_id);

        // The superseded key survives its grace period.
        let all = fx.store.signed_pre_keys("alice").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|k| k.is_active).count(), 1);
    }

    #[test]
    fn superseded_key_purged_after_grace() {
        let fx = fixture(&["alice"]);
        fx.scheduler.run_tick(None, &mut OsRng).unwrap();

        fx.clock.advance(7 * DAY_MS);
        fx.scheduler.run_tick(None, &mut OsRng).unwrap();

        // Past created + interval + grace for key 1.
        fx.clock.advance(8 * DAY_MS);
        let entries = fx.scheduler.run_tick(None, &mut OsRng).unwrap();
        assert!(entries.iter().any(|e| e.kind == RotationKind::Purge && e.success));

        let remaining: Vec<u32> = fx
            .store
            .signed_pre_keys("alice")
            .unwrap()
            .iter()
            .map(|k| k.key_id)
            .collect();
        assert!(!remaining.contains(&1));
    }

    #[test]
    fn replenishes_below_low_water_mark() {
        let fx = fixture(&["alice"]);
        fx.scheduler.run_tick(None, &mut OsRng).unwrap();

        // Consume down to 15 available.
        for key_id in 1..=85 {
            fx.store.consume_one_time_pre_key("alice", key_id, 2_000).unwrap();
        }

        let entries = fx.scheduler.run_tick(None, &mut OsRng).unwrap();
        let replenish = entries
            .iter()
            .find(|e| e.kind == RotationKind::OneTimePreKeys)
            .expect("replenishment entry");
        assert!(replenish.success);
        assert_eq!(replenish.count, Some(85));

        let history = fx.store.rotation_history("alice").unwrap();
        assert!(history.iter().any(|e| e.kind == RotationKind::OneTimePreKeys && e.success));
    }

    #[test]
    fn per_user_failure_does_not_block_the_batch() {
        let fx = fixture(&["alice", "carol"]);

        // Break carol: corrupt her sealed identity so key generation fails.
        let mut identity = fx.store.identity("carol").unwrap().unwrap();
        identity.private_sealed = vec![0u8; 8];
        fx.store.put_identity(identity, true).unwrap();

        let entries = fx.scheduler.run_tick(None, &mut OsRng).unwrap();

        let carol: Vec<&RotationEntry> =
            entries.iter().filter(|e| e.user_id == "carol").collect();
        assert!(!carol.is_empty());
        assert!(carol.iter().all(|e| !e.success));
        assert!(carol.iter().all(|e| e.error_code.is_some()));

        // Alice is fully provisioned despite carol's failure.
        assert!(entries.iter().filter(|e| e.user_id == "alice").all(|e| e.success));
        assert!(fx.store.active_signed_pre_key("alice").unwrap().is_some());
        assert_eq!(fx.store.one_time_pre_keys("alice").unwrap().len(), 100);
    }

    #[test]
    fn single_user_tick_ignores_others() {
        let fx = fixture(&["alice", "carol"]);
        let entries = fx.scheduler.run_tick(Some("alice"), &mut OsRng).unwrap();
        assert!(entries.iter().all(|e| e.user_id == "alice"));
        assert!(fx.store.active_signed_pre_key("carol").unwrap().is_none());
    }

    #[tokio::test]
    async fn driver_runs_ticks() {
        let fx = fixture(&["alice"]);
        let scheduler = RotationScheduler::new(
            RotationPolicy::default(),
            fx.store.clone(),
            KeyVault::new([9u8; 32]),
            fx.clock.clone(),
        );

        let handle = tokio::spawn(scheduler.run(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(fx.store.active_signed_pre_key("alice").unwrap().is_some());
    }
}
