//! # Structural Change Tests
//!
//! Chunk capacity, compaction after moves, identity patching and density
//! under randomized add/remove/destroy sequences.
//!
//! Run with: cargo test -p oroboros_storage --test structural_test

use std::collections::{HashMap, HashSet};

use bytemuck::{Pod, Zeroable};
use oroboros_storage::ecs::ArchetypeRegistry;
use oroboros_storage::{
    Component, Entity, EntityLocation, EntityStore, StorageError, StoreConfig, TypeIndex,
    TypeRegistry,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

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
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}
impl Component for Velocity {}

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Health(u32);
impl Component for Health {}

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default)]
struct Frozen;

struct World {
    store: EntityStore,
    position: TypeIndex,
    velocity: TypeIndex,
    health: TypeIndex,
    frozen: TypeIndex,
}

fn world() -> World {
    let mut types = TypeRegistry::new();
    let position = types.register::<Position>().unwrap();
    let velocity = types.register::<Velocity>().unwrap();
    let health = types.register::<Health>().unwrap();
    let frozen = types.register_tag::<Frozen>().unwrap();
    World {
        store: EntityStore::new(StoreConfig::default(), types.freeze()).unwrap(),
        position,
        velocity,
        health,
        frozen,
    }
}

// ============================================================================
// CAPACITY
// ============================================================================

#[test]
fn test_position_velocity_chunk_holds_677() {
    let World {
        mut store,
        position,
        velocity,
        ..
    } = world();
    let archetype = store
        .get_or_create_archetype(&[position, velocity])
        .unwrap();
    assert_eq!(store.archetype(archetype).unwrap().capacity, 677);

    let first = store.create_entities(archetype, 677).unwrap();
    assert_eq!(first.len(), 677);
    assert_eq!(store.chunk_count(), 1);
    assert!(store.chunk(store.archetype_chunks(archetype)[0]).unwrap().is_full());

    store.create_entity(archetype).unwrap();
    assert_eq!(store.chunk_count(), 2);
    assert_eq!(store.archetype_chunks(archetype).len(), 2);
}

#[test]
fn test_capacity_fits_data_area() {
    let World {
        mut store,
        position,
        velocity,
        health,
        frozen,
    } = world();
    let data_bytes = store.config().chunk_data_bytes();
    for types in [
        vec![position],
        vec![position, velocity, health],
        vec![frozen],
        vec![],
    ] {
        let archetype = store.get_or_create_archetype(&types).unwrap();
        let view = store.archetype(archetype).unwrap();
        for (offset, size) in view.offsets.iter().zip(view.sizes) {
            assert!(*offset as usize + *size as usize * view.capacity as usize <= data_bytes);
        }
    }
}

// ============================================================================
// MOVES
// ============================================================================

#[test]
fn test_add_component_patches_moved_entity() {
    let World {
        mut store,
        position,
        health,
        ..
    } = world();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entities = store.create_entities(archetype, 3).unwrap();
    for (i, &entity) in entities.iter().enumerate() {
        store
            .set_component(entity, Position { x: i as f32, y: 0.0, z: 0.0 })
            .unwrap();
    }
    let source = store.resolve(entities[0]).unwrap().chunk;

    store.add_component(entities[1], health).unwrap();

    assert_eq!(store.chunk_entities(source).unwrap(), &[entities[0], entities[2]]);
    assert_eq!(
        store.resolve(entities[2]),
        Some(EntityLocation {
            chunk: source,
            index_in_chunk: 1
        })
    );
    let moved = store.resolve(entities[1]).unwrap();
    assert_ne!(moved.chunk, source);
    assert_eq!(moved.index_in_chunk, 0);

    // Values travel with their entities.
    assert_eq!(store.component::<Position>(entities[1]).unwrap().x, 1.0);
    assert_eq!(store.component::<Position>(entities[2]).unwrap().x, 2.0);
    assert_eq!(*store.component::<Health>(entities[1]).unwrap(), Health(0));
}

#[test]
fn test_add_existing_type_is_noop() {
    let World {
        mut store,
        position,
        velocity,
        ..
    } = world();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entity = store.create_entity(archetype).unwrap();
    let before = store.resolve(entity);
    let handle = store.safety_handle(position);

    store.add_component(entity, position).unwrap();
    store.remove_components(entity, &[velocity]).unwrap();

    assert_eq!(store.resolve(entity), before);
    assert_eq!(store.entity_archetype(entity).unwrap(), archetype);
    assert!(handle.validate(store.access_tracker()).is_ok());
}

#[test]
fn test_bulk_move_keeps_relative_order_of_survivors() {
    let World {
        mut store,
        position,
        health,
        ..
    } = world();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entities = store.create_entities(archetype, 10).unwrap();
    let source = store.resolve(entities[0]).unwrap().chunk;

    let picked = [entities[2], entities[3], entities[4], entities[8]];
    store.add_components_to_entities(&picked, &[health]).unwrap();

    let survivors = store.chunk_entities(source).unwrap();
    assert_eq!(survivors.len(), 6);
    for (i, &entity) in survivors.iter().enumerate() {
        assert_eq!(store.resolve(entity).unwrap().index_in_chunk, i as u32);
    }
    for entity in picked {
        assert!(store
            .archetype(store.entity_archetype(entity).unwrap())
            .unwrap()
            .contains(health));
    }
}

#[test]
fn test_whole_archetype_shared_add_keeps_chunk() {
    #[allow(dead_code)]
    #[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
    struct Team(u8);
    impl oroboros_storage::SharedComponent for Team {}

    let mut types = TypeRegistry::new();
    let position = types.register::<Position>().unwrap();
    let team = types.register_shared::<Team>().unwrap();
    let mut store = EntityStore::new(StoreConfig::default(), types.freeze()).unwrap();

    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entities = store.create_entities(archetype, 4).unwrap();
    store
        .set_component(entities[3], Position { x: 9.0, y: 0.0, z: 0.0 })
        .unwrap();
    let chunk = store.archetype_chunks(archetype)[0];

    store
        .add_components_to_archetypes(&[archetype], &[team])
        .unwrap();

    assert!(store.archetype_chunks(archetype).is_empty());
    assert_eq!(store.resolve(entities[3]).unwrap().chunk, chunk);
    assert_eq!(store.component::<Position>(entities[3]).unwrap().x, 9.0);
    assert_eq!(*store.shared_component::<Team>(entities[0]).unwrap(), Team(0));
    assert_eq!(store.chunk_count(), 1);
}

#[test]
fn test_with_added_then_removed_round_trips() {
    let mut types = TypeRegistry::new();
    let position = types.register::<Position>().unwrap();
    let velocity = types.register::<Velocity>().unwrap();
    let health = types.register::<Health>().unwrap();
    let mut archetypes = ArchetypeRegistry::new(&StoreConfig::default(), types.freeze());

    let a = archetypes.get_or_create(&[position, health]).unwrap();
    let added = archetypes.with_added(a, &[velocity]).unwrap();
    assert_ne!(added, a);
    assert_eq!(archetypes.with_removed(added, &[velocity]).unwrap(), a);
    assert_eq!(archetypes.with_added(a, &[health]).unwrap(), a);
    assert_eq!(archetypes.with_removed(a, &[velocity]).unwrap(), a);
}

// ============================================================================
// IDENTITY
// ============================================================================

#[test]
fn test_generation_increases_on_reuse() {
    let World {
        mut store,
        health,
        ..
    } = world();
    let archetype = store.get_or_create_archetype(&[health]).unwrap();
    let first = store.create_entity(archetype).unwrap();
    store.destroy_entity(first).unwrap();
    let second = store.create_entity(archetype).unwrap();

    assert_eq!(second.index(), first.index());
    assert!(second.generation() > first.generation());
    assert!(!store.exists(first));
    assert!(store.exists(second));
    assert_eq!(
        store.component::<Health>(first),
        Err(StorageError::InvalidEntity(first))
    );
    assert_eq!(
        store.destroy_entity(first),
        Err(StorageError::InvalidEntity(first))
    );
}

#[test]
fn test_stale_entity_in_bulk_request_changes_nothing() {
    let World {
        mut store,
        position,
        health,
        ..
    } = world();
    let archetype = store.get_or_create_archetype(&[position]).unwrap();
    let entities = store.create_entities(archetype, 3).unwrap();
    store.destroy_entity(entities[1]).unwrap();

    let result = store.add_components_to_entities(&entities, &[health]);
    assert_eq!(result, Err(StorageError::InvalidEntity(entities[1])));
    assert_eq!(store.entity_archetype(entities[0]).unwrap(), archetype);
    assert_eq!(store.entity_archetype(entities[2]).unwrap(), archetype);

    let result = store.destroy_entities(&[entities[0], Entity::NULL]);
    assert_eq!(result, Err(StorageError::InvalidEntity(Entity::NULL)));
    assert!(store.exists(entities[0]));
}

#[test]
fn test_destroy_whole_chunk_releases_it() {
    let World {
        mut store,
        velocity,
        ..
    } = world();
    let archetype = store.get_or_create_archetype(&[velocity]).unwrap();
    let entities = store.create_entities(archetype, 100).unwrap();
    let chunk = store.archetype_chunks(archetype)[0];

    store.destroy_entities(&entities).unwrap();
    assert_eq!(store.chunk_count(), 0);
    assert!(store.chunk(chunk).is_none());
    assert!(store.chunk_entities(chunk).is_err());
    assert_eq!(store.entity_count(), 0);
}

// ============================================================================
// DENSITY UNDER RANDOM CHANGES
// ============================================================================

struct Expected {
    health: u32,
    enabled: bool,
}

fn check_density(store: &EntityStore, health: TypeIndex, expected: &HashMap<Entity, Expected>) {
    assert_eq!(store.entity_count(), expected.len());

    let archetypes: HashSet<_> = expected
        .keys()
        .map(|&entity| store.entity_archetype(entity).unwrap())
        .collect();
    let mut chunk_total = 0;
    let mut entity_total = 0;
    for archetype in archetypes {
        for &chunk in store.archetype_chunks(archetype) {
            chunk_total += 1;
            let entities = store.chunk_entities(chunk).unwrap();
            assert!(!entities.is_empty(), "empty chunks are released");
            assert!(entities.len() <= store.chunk(chunk).unwrap().capacity());
            entity_total += entities.len();

            let values = store.chunk_components::<Health>(chunk).unwrap();
            let mut disabled = 0;
            for (i, entity) in entities.iter().enumerate() {
                assert_eq!(
                    store.resolve(*entity),
                    Some(EntityLocation {
                        chunk,
                        index_in_chunk: i as u32
                    })
                );
                let want = &expected[entity];
                assert_eq!(values[i], Health(want.health));
                assert_eq!(
                    store.is_component_enabled(*entity, health).unwrap(),
                    want.enabled
                );
                disabled += u32::from(!want.enabled);
            }
            assert_eq!(store.chunk_disabled_count(chunk, health).unwrap(), disabled);

            let words = store.chunk_enabled_bits(chunk, health).unwrap();
            for slot in entities.len()..words.len() * 64 {
                let word = words[slot / 64];
                assert_eq!(word & (1 << (slot % 64)), 0, "bit past count at {slot}");
            }
        }
    }
    assert_eq!(chunk_total, store.chunk_count());
    assert_eq!(entity_total, expected.len());
}

#[test]
fn test_random_structural_sequence_stays_dense() {
    let World {
        mut store,
        position,
        velocity,
        health,
        frozen,
    } = world();
    let base = store.get_or_create_archetype(&[health]).unwrap();
    let optional = [position, velocity, frozen];

    let mut rng = StdRng::seed_from_u64(0x0B0B_0B05);
    let mut expected: HashMap<Entity, Expected> = HashMap::new();
    let mut live: Vec<Entity> = Vec::new();
    let mut serial = 0u32;

    for _ in 0..400 {
        match rng.gen_range(0..6) {
            0 => {
                let count = rng.gen_range(1..300);
                for entity in store.create_entities(base, count).unwrap() {
                    serial += 1;
                    store.set_component(entity, Health(serial)).unwrap();
                    expected.insert(
                        entity,
                        Expected {
                            health: serial,
                            enabled: true,
                        },
                    );
                    live.push(entity);
                }
            }
            1 | 2 if !live.is_empty() => {
                let picked: Vec<Entity> = (0..rng.gen_range(1..40))
                    .map(|_| live[rng.gen_range(0..live.len())])
                    .collect();
                let types = [optional[rng.gen_range(0..optional.len())]];
                if rng.gen_bool(0.5) {
                    store.add_components_to_entities(&picked, &types).unwrap();
                } else {
                    store.remove_components_from_entities(&picked, &types).unwrap();
                }
            }
            3 if !live.is_empty() => {
                let count = rng.gen_range(1..=live.len().min(30));
                let doomed: Vec<Entity> = (0..count)
                    .map(|_| live.swap_remove(rng.gen_range(0..live.len())))
                    .collect();
                store.destroy_entities(&doomed).unwrap();
                for entity in doomed {
                    expected.remove(&entity);
                }
            }
            4 if !live.is_empty() => {
                let entity = live[rng.gen_range(0..live.len())];
                let enabled = rng.gen_bool(0.5);
                store.set_component_enabled(entity, health, enabled).unwrap();
                if let Some(want) = expected.get_mut(&entity) {
                    want.enabled = enabled;
                }
            }
            _ if !live.is_empty() => {
                let archetype = store.entity_archetype(live[0]).unwrap();
                let types = [optional[rng.gen_range(0..optional.len())]];
                store
                    .add_components_to_archetypes(&[archetype], &types)
                    .unwrap();
            }
            _ => {}
        }
        check_density(&store, health, &expected);
    }
}
