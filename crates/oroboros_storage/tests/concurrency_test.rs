//! # Concurrency & Change Tracking Tests
//!
//! Lock-free enabled bits, dependency waits before structural changes,
//! change versions and deferred command playback.
//!
//! Run with: cargo test -p oroboros_storage --test concurrency_test

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use oroboros_storage::{
    Component, Entity, EntityStore, StorageError, StoreConfig, TypeIndex, TypeRegistry,
};

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}
impl Component for Position {}

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Health(u32);
impl Component for Health {}

fn store() -> (EntityStore, TypeIndex, TypeIndex) {
    let mut types = TypeRegistry::new();
    let position = types.register::<Position>().unwrap();
    let health = types.register::<Health>().unwrap();
    let store = EntityStore::new(StoreConfig::default(), types.freeze()).unwrap();
    (store, position, health)
}

// ============================================================================
// ENABLED BITS
// ============================================================================

fn toggle_from_two_threads(first: usize, second: usize) {
    let (mut store, _, health) = store();
    let archetype = store.get_or_create_archetype(&[health]).unwrap();
    let entities = store.create_entities(archetype, 128).unwrap();
    let chunk = store.resolve(entities[0]).unwrap().chunk;

    let store = &store;
    thread::scope(|scope| {
        for index in [first, second] {
            let entity = entities[index];
            scope.spawn(move || {
                // The last round (9_999) disables.
                for round in 0..10_000 {
                    store
                        .set_component_enabled(entity, health, round % 2 == 0)
                        .unwrap();
                }
            });
        }
    });

    assert!(!store.is_component_enabled(entities[first], health).unwrap());
    assert!(!store.is_component_enabled(entities[second], health).unwrap());
    assert_eq!(store.chunk_disabled_count(chunk, health).unwrap(), 2);

    // Only slots holding an entity count; bits past the count are zero.
    let occupied = store.chunk_entities(chunk).unwrap().len();
    let words = store.chunk_enabled_bits(chunk, health).unwrap();
    let disabled: u32 = words
        .iter()
        .enumerate()
        .map(|(index, word)| {
            let live = occupied.saturating_sub(index * 64).min(64);
            let mask = if live == 64 { u64::MAX } else { (1u64 << live) - 1 };
            (!word & mask).count_ones()
        })
        .sum();
    assert_eq!(disabled, 2);
}

#[test]
fn test_concurrent_toggles_across_words() {
    toggle_from_two_threads(5, 70);
}

#[test]
fn test_concurrent_toggles_in_one_word() {
    toggle_from_two_threads(5, 6);
}

#[test]
fn test_enabled_snapshot_has_zero_tail() {
    let (mut store, _, health) = store();
    let archetype = store.get_or_create_archetype(&[health]).unwrap();
    let entities = store.create_entities(archetype, 70).unwrap();
    let chunk = store.resolve(entities[0]).unwrap().chunk;
    store.set_component_enabled(entities[65], health, false).unwrap();

    let words = store.chunk_enabled_bits(chunk, health).unwrap();
    assert_eq!(words[0], u64::MAX);
    assert_eq!(words[1], 0b11_1101);
    assert!(words[2..].iter().all(|&word| word == 0));
}

#[test]
fn test_toggle_reports_flip_once() {
    let (mut store, _, health) = store();
    let archetype = store.get_or_create_archetype(&[health]).unwrap();
    let entity = store.create_entity(archetype).unwrap();

    assert!(store.set_component_enabled(entity, health, false).unwrap());
    assert!(!store.set_component_enabled(entity, health, false).unwrap());
    assert!(store.set_component_enabled(entity, health, true).unwrap());
}

#[test]
fn test_disabled_bit_follows_moved_entity() {
    let (mut store, position, health) = store();
    let archetype = store.get_or_create_archetype(&[health]).unwrap();
    let entities = store.create_entities(archetype, 4).unwrap();
    let source = store.resolve(entities[0]).unwrap().chunk;
    store.set_component_enabled(entities[1], health, false).unwrap();
    store.set_component_enabled(entities[3], health, false).unwrap();

    store.add_component(entities[1], position).unwrap();

    assert!(!store.is_component_enabled(entities[1], health).unwrap());
    assert!(store.is_component_enabled(entities[1], position).unwrap());
    // entities[3] filled the gap at slot 1.
    assert_eq!(store.resolve(entities[3]).unwrap().index_in_chunk, 1);
    assert!(!store.is_component_enabled(entities[3], health).unwrap());
    assert_eq!(store.chunk_disabled_count(source, health).unwrap(), 1);
}

// ============================================================================
// DEPENDENCY WAITS
// ============================================================================

#[test]
fn test_structural_change_waits_for_readers() {
    let (mut store, position, health) = store();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entity = store.create_entity(archetype).unwrap();

    let tracker = Arc::clone(store.access_tracker());
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let job = {
        let (started, finished) = (Arc::clone(&started), Arc::clone(&finished));
        thread::spawn(move || {
            let _guard = tracker.read(position);
            started.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            finished.store(true, Ordering::SeqCst);
        })
    };
    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    store.add_component(entity, health).unwrap();
    assert!(finished.load(Ordering::SeqCst));
    job.join().unwrap();
    assert_eq!(store.access_tracker().outstanding(position), (0, 0));
}

#[test]
fn test_safety_handle_detects_structural_change() {
    let (mut store, position, health) = store();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entity = store.create_entity(archetype).unwrap();

    let handle = store.safety_handle(position);
    store.set_component(entity, Position { x: 1.0, y: 1.0, z: 1.0 }).unwrap();
    assert!(handle.validate(store.access_tracker()).is_ok());

    store.add_component(entity, health).unwrap();
    assert_eq!(
        handle.validate(store.access_tracker()),
        Err(StorageError::StaleAccess {
            type_index: position
        })
    );
}

// ============================================================================
// CHANGE VERSIONS
// ============================================================================

#[test]
fn test_change_detection_per_chunk() {
    let (mut store, position, health) = store();
    let archetype = store.get_or_create_archetype(&[position, health]).unwrap();
    let entities = store.create_entities(archetype, 10).unwrap();
    let chunk = store.resolve(entities[0]).unwrap().chunk;

    // A system that never ran sees everything as changed.
    assert!(store.did_change(chunk, position, 0).unwrap());

    let last_run = store.global_system_version();
    store.increment_global_system_version();
    assert!(!store.did_change(chunk, position, last_run).unwrap());
    assert!(!store.did_change(chunk, health, last_run).unwrap());

    for value in store.chunk_components_mut::<Health>(chunk).unwrap() {
        value.0 += 1;
    }
    assert!(store.did_change(chunk, health, last_run).unwrap());
    assert!(!store.did_change(chunk, position, last_run).unwrap());

    // Reads leave versions alone.
    let current = store.global_system_version();
    store.increment_global_system_version();
    let _ = store.chunk_components::<Position>(chunk).unwrap();
    assert!(!store.did_change(chunk, position, current).unwrap());
}

#[test]
fn test_moved_rows_stamp_destination() {
    let (mut store, position, health) = store();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entities = store.create_entities(archetype, 2).unwrap();
    let last_run = store.increment_global_system_version();
    let now = store.increment_global_system_version();

    store.add_component(entities[0], health).unwrap();
    let moved = store.resolve(entities[0]).unwrap().chunk;
    assert_eq!(store.chunk_change_version(moved, position).unwrap(), now);
    assert!(store.did_change(moved, position, last_run).unwrap());
}

// ============================================================================
// COMMAND PLAYBACK
// ============================================================================

#[test]
fn test_command_buffer_create_then_set() {
    let (mut store, position, health) = store();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();

    let mut commands = store.command_buffer();
    commands.record_create(Some(archetype));
    commands
        .record_set_component(Entity::NULL, Position { x: 1.0, y: 2.0, z: 3.0 })
        .unwrap();
    commands
        .record_add_component(Entity::NULL, Health(42))
        .unwrap();
    commands.record_create(Some(archetype));
    commands.record_destroy(Entity::NULL);
    commands.playback(&mut store).unwrap();

    assert_eq!(store.entity_count(), 1);
    let with_health = store
        .get_or_create_archetype(&[position, health])
        .unwrap();
    let chunk = store.archetype_chunks(with_health)[0];
    let entity = store.chunk_entities(chunk).unwrap()[0];
    assert_eq!(
        *store.component::<Position>(entity).unwrap(),
        Position { x: 1.0, y: 2.0, z: 3.0 }
    );
    assert_eq!(*store.component::<Health>(entity).unwrap(), Health(42));
}

#[test]
fn test_dropped_command_buffer_applies_nothing() {
    let (mut store, position, _) = store();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    {
        let mut commands = store.command_buffer();
        commands.record_create(Some(archetype));
        commands.record_create(Some(archetype));
        assert_eq!(commands.len(), 2);
    }
    let mut commands = store.command_buffer();
    commands.record_create(None);
    commands.dispose();
    assert_eq!(store.entity_count(), 0);
}
