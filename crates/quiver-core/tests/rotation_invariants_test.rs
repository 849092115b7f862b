//! Rotation scheduler invariants observed through the engine surface.

use std::sync::Arc;

use quiver_core::{
    Engine, EngineConfig, KeyVault, ManualClock, MemoryAuditSink, MemoryStore, RotationKind,
    store::KeyStore,
};
use rand::rngs::OsRng;

const DAY_MS: u64 = 86_400_000;

struct World {
    engine: Engine<MemoryStore, ManualClock>,
    store: MemoryStore,
    clock: ManualClock,
}

fn world() -> World {
    let store = MemoryStore::new();
    let clock = ManualClock::at(1_000_000);
    let engine = Engine::new(
        store.clone(),
        KeyVault::new([0x33; 32]),
        clock.clone(),
        Arc::new(MemoryAuditSink::new()),
        EngineConfig::default(),
    );
    World { engine, store, clock }
}

fn assert_exactly_one_active(store: &MemoryStore, user: &str) {
    let active = store
        .signed_pre_keys(user)
        .unwrap()
        .iter()
        .filter(|k| k.is_active)
        .count();
    assert_eq!(active, 1, "exactly one signed pre-key must be active for {user}");
}

#[test]
fn exactly_one_active_signed_pre_key_across_rotations() {
    let world = world();
    world.engine.generate_identity("alice", 1, false, &mut OsRng).unwrap();
    world.engine.trigger_rotation(Some("alice"), &mut OsRng).unwrap();
    assert_exactly_one_active(&world.store, "alice");

    // Sample the invariant immediately before and after each rotation.
    for _ in 0..6 {
        world.clock.advance(7 * DAY_MS);
        assert_exactly_one_active(&world.store, "alice");
        world.engine.trigger_rotation(Some("alice"), &mut OsRng).unwrap();
        assert_exactly_one_active(&world.store, "alice");
    }
}

#[test]
fn low_water_replenishment_records_history() {
    let world = world();
    world.engine.generate_identity("alice", 1, false, &mut OsRng).unwrap();
    world.engine.trigger_rotation(Some("alice"), &mut OsRng).unwrap();
    assert_eq!(world.engine.count_available_pre_keys("alice").unwrap(), 100);

    // Consume down to 15, below the low-water mark of 20.
    for key_id in 1..=85u32 {
        world.store.consume_one_time_pre_key("alice", key_id, 0).unwrap();
    }
    assert_eq!(world.engine.count_available_pre_keys("alice").unwrap(), 15);

    let entries = world.engine.trigger_rotation(Some("alice"), &mut OsRng).unwrap();
    let replenish = entries
        .iter()
        .find(|e| e.kind == RotationKind::OneTimePreKeys)
        .expect("replenishment must run below the low-water mark");
    assert!(replenish.success);
    assert_eq!(replenish.count, Some(85));
    assert!(world.engine.count_available_pre_keys("alice").unwrap() >= 100);

    let history = world.engine.rotation_history("alice").unwrap();
    assert!(
        history
            .iter()
            .any(|e| e.kind == RotationKind::OneTimePreKeys && e.success && e.count == Some(85))
    );
}

#[test]
fn rotation_does_not_disturb_live_sessions() {
    let world = world();
    world.engine.generate_identity("alice", 1, false, &mut OsRng).unwrap();
    world.engine.generate_identity("bob", 1, false, &mut OsRng).unwrap();
    world.engine.trigger_rotation(None, &mut OsRng).unwrap();

    let alice = quiver_core::PeerAddress::new("alice", 1);
    let bob = quiver_core::PeerAddress::new("bob", 1);
    world.engine.initiate_exchange("bob", &alice, false, &mut OsRng).unwrap();

    // A full rotation cycle, including purge of the superseded key, leaves
    // the established session working.
    world.clock.advance(7 * DAY_MS);
    world.engine.trigger_rotation(None, &mut OsRng).unwrap();
    world.clock.advance(8 * DAY_MS);
    world.engine.trigger_rotation(None, &mut OsRng).unwrap();

    let message = world.engine.encrypt("bob", &alice, b"still here", &mut OsRng).unwrap();
    let plaintext = world.engine.decrypt("alice", &bob, &message, &mut OsRng).unwrap();
    assert_eq!(plaintext, b"still here");
}

#[test]
fn history_is_append_only_across_ticks() {
    let world = world();
    world.engine.generate_identity("alice", 1, false, &mut OsRng).unwrap();

    world.engine.trigger_rotation(Some("alice"), &mut OsRng).unwrap();
    let after_first = world.engine.rotation_history("alice").unwrap();

    world.clock.advance(7 * DAY_MS);
    world.engine.trigger_rotation(Some("alice"), &mut OsRng).unwrap();
    let after_second = world.engine.rotation_history("alice").unwrap();

    assert!(after_second.len() > after_first.len());
    assert_eq!(&after_second[..after_first.len()], &after_first[..]);
}
