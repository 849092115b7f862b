//! Backup round-trip, single-use restore, and expiry.

use std::sync::Arc;

use quiver_core::{
    Engine, EngineConfig, EngineError, KeyVault, ManualClock, MemoryAuditSink, MemoryStore,
    PeerAddress,
};
use rand::rngs::OsRng;

const DAY_MS: u64 = 86_400_000;

struct World {
    engine: Engine<MemoryStore, ManualClock>,
    clock: ManualClock,
}

fn world() -> World {
    let clock = ManualClock::at(1_000_000);
    let engine = Engine::new(
        MemoryStore::new(),
        KeyVault::new([0x17; 32]),
        clock.clone(),
        Arc::new(MemoryAuditSink::new()),
        EngineConfig::default(),
    );
    World { engine, clock }
}

/// Alice fully provisioned with an active session to Bob.
fn world_with_session() -> World {
    let world = world();
    world.engine.generate_identity("alice", 1, false, &mut OsRng).unwrap();
    world.engine.generate_signed_pre_key("alice", &mut OsRng).unwrap();
    world.engine.generate_one_time_pre_keys("alice", Some(10), &mut OsRng).unwrap();
    world.engine.generate_identity("bob", 1, false, &mut OsRng).unwrap();
    world
        .engine
        .initiate_exchange("bob", &PeerAddress::new("alice", 1), false, &mut OsRng)
        .unwrap();
    world
}

#[test]
fn restore_reproduces_the_bundle() {
    let world = world_with_session();
    let identity_before = world.engine.get_public_identity("alice").unwrap();
    let bundle_before = world.engine.get_public_bundle("alice").unwrap();

    let info = world.engine.create_backup("alice", "hunter2 but longer", &mut OsRng).unwrap();
    assert!(!info.is_used);

    let summary =
        world.engine.restore_backup("alice", info.backup_id, "hunter2 but longer").unwrap();
    assert_eq!(summary.signed_pre_keys, 1);
    assert_eq!(summary.one_time_pre_keys, 10);
    assert_eq!(summary.sessions, 1);

    // Identity and published bundle are bit-for-bit what they were.
    assert_eq!(world.engine.get_public_identity("alice").unwrap(), identity_before);
    assert_eq!(world.engine.get_public_bundle("alice").unwrap(), bundle_before);

    // The restored session still talks to Bob.
    let message = world
        .engine
        .encrypt("bob", &PeerAddress::new("alice", 1), b"post restore", &mut OsRng)
        .unwrap();
    let plaintext = world
        .engine
        .decrypt("alice", &PeerAddress::new("bob", 1), &message, &mut OsRng)
        .unwrap();
    assert_eq!(plaintext, b"post restore");
}

#[test]
fn wrong_passphrase_always_fails() {
    let world = world_with_session();
    let info = world.engine.create_backup("alice", "correct passphrase", &mut OsRng).unwrap();

    for wrong in ["correct passphrase ", "Correct passphrase", "", "x"] {
        let result = world.engine.restore_backup("alice", info.backup_id, wrong);
        assert_eq!(result, Err(EngineError::BackupPasswordIncorrect));
    }

    // Failed attempts do not consume the backup.
    let summary =
        world.engine.restore_backup("alice", info.backup_id, "correct passphrase").unwrap();
    assert_eq!(summary.sessions, 1);
}

#[test]
fn second_restore_fails_with_already_used() {
    let world = world_with_session();
    let info = world.engine.create_backup("alice", "one shot", &mut OsRng).unwrap();

    world.engine.restore_backup("alice", info.backup_id, "one shot").unwrap();
    let result = world.engine.restore_backup("alice", info.backup_id, "one shot");
    assert_eq!(result, Err(EngineError::BackupAlreadyUsed { backup_id: info.backup_id }));
}

#[test]
fn expired_backup_is_rejected() {
    let world = world_with_session();
    let info = world.engine.create_backup("alice", "slow to restore", &mut OsRng).unwrap();

    world.clock.advance(91 * DAY_MS);
    let result = world.engine.restore_backup("alice", info.backup_id, "slow to restore");
    assert_eq!(result, Err(EngineError::BackupExpired { backup_id: info.backup_id }));
}

#[test]
fn unknown_backup_id_is_not_found() {
    let world = world_with_session();
    let result = world.engine.restore_backup("alice", 12345, "whatever");
    assert!(matches!(result, Err(EngineError::KeysNotFound { .. })));
}

#[test]
fn backup_without_keys_fails() {
    let world = world();
    let result = world.engine.create_backup("ghost", "pw", &mut OsRng);
    assert!(matches!(result, Err(EngineError::KeysNotFound { .. })));
}

#[test]
fn list_backups_shows_metadata_only() {
    let world = world_with_session();
    let first = world.engine.create_backup("alice", "pw one", &mut OsRng).unwrap();
    world.clock.advance(1_000);
    let second = world.engine.create_backup("alice", "pw two", &mut OsRng).unwrap();

    world.engine.restore_backup("alice", first.backup_id, "pw one").unwrap();

    let listed = world.engine.list_backups("alice").unwrap();
    assert_eq!(listed.len(), 2);

    let first_listed = listed.iter().find(|b| b.backup_id == first.backup_id).unwrap();
    assert!(first_listed.is_used);
    let second_listed = listed.iter().find(|b| b.backup_id == second.backup_id).unwrap();
    assert!(!second_listed.is_used);
    assert_eq!(second_listed.expires_at_ms, second.expires_at_ms);
}

#[test]
fn restore_rolls_back_consumed_keys_to_snapshot_state() {
    let world = world_with_session();
    let available_before = world.engine.count_available_pre_keys("alice").unwrap();
    let info = world.engine.create_backup("alice", "snapshot", &mut OsRng).unwrap();

    // Another peer consumes a key after the snapshot.
    world.engine.generate_identity("carol", 1, false, &mut OsRng).unwrap();
    world
        .engine
        .initiate_exchange("carol", &PeerAddress::new("alice", 1), false, &mut OsRng)
        .unwrap();
    assert_eq!(
        world.engine.count_available_pre_keys("alice").unwrap(),
        available_before - 1
    );

    world.engine.restore_backup("alice", info.backup_id, "snapshot").unwrap();
    assert_eq!(world.engine.count_available_pre_keys("alice").unwrap(), available_before);
}
