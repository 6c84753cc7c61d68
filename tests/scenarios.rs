//! End-to-end scenarios, one per `#[test]`, covering the store's public
//! lifecycle and query surface the way the teacher's `tests/*.rs` files
//! exercise a `World` black-box rather than through its internals.

use fragment_ecs::{EcsError, QueryBuilder, World, WorldEvent, WorldEventKind};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pos {
    x: i64,
    y: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vel {
    x: i64,
    y: i64,
}

#[test]
fn migration_preserves_data() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();
    let vel = world.register_component::<Vel>(false, "Vel").unwrap();

    let h = world.create_entity(&[pos]).unwrap();
    world.set(h, pos, Pos { x: 7, y: 8 }).unwrap();
    world.add_component(h, &[vel]).unwrap();

    assert_eq!(world.get::<Pos>(h, pos).unwrap(), Some(&Pos { x: 7, y: 8 }));
}

#[test]
fn swap_remove_relocates_the_last_live_slot() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();

    let a = world.create_entity(&[pos]).unwrap();
    let b = world.create_entity(&[pos]).unwrap();
    let c = world.create_entity(&[pos]).unwrap();
    world.set(c, pos, Pos { x: 99, y: 99 }).unwrap();

    world.delete_entity(a).unwrap();

    // b is untouched; c now resolves to whatever slot it was relocated to
    // by the swap-remove, but its value must survive the move.
    assert_eq!(world.get::<Pos>(c, pos).unwrap(), Some(&Pos { x: 99, y: 99 }));
    assert!(world.get::<Pos>(b, pos).is_ok());
    assert_eq!(world.entity_count(), 2);
}

#[test]
fn dense_population_counts_match_archetype_split() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();
    let vel = world.register_component::<Vel>(false, "Vel").unwrap();

    world.create_entities(10_000, &[pos]).unwrap();
    world.create_entities(5_000, &[pos, vel]).unwrap();

    let pos_only = QueryBuilder::new().include(pos).build();
    let pos_and_vel = QueryBuilder::new().include(pos).include(vel).build();
    let pos_not_vel = QueryBuilder::new().include(pos).exclude(vel).build();

    assert_eq!(world.count(&pos_only), 15_000);
    assert_eq!(world.count(&pos_not_vel), 10_000);
    assert_eq!(world.count(&pos_and_vel), 5_000);
}

#[test]
fn sparse_entities_match_dense_population_counts() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();
    let vel = world.register_component::<Vel>(false, "Vel").unwrap();

    for _ in 0..10_000 {
        world.create_sparse_entity(&[pos]).unwrap();
    }
    for _ in 0..5_000 {
        world.create_sparse_entity(&[pos, vel]).unwrap();
    }

    let pos_only = QueryBuilder::new().include(pos).build();
    let pos_and_vel = QueryBuilder::new().include(pos).include(vel).build();
    let pos_not_vel = QueryBuilder::new().include(pos).exclude(vel).build();

    assert_eq!(world.count(&pos_only), 15_000);
    assert_eq!(world.count(&pos_not_vel), 10_000);
    assert_eq!(world.count(&pos_and_vel), 5_000);
}

#[test]
fn batch_migration_preserves_values_and_updates_every_handle() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();
    let vel = world.register_component::<Vel>(false, "Vel").unwrap();

    let handles = world.create_entities(128, &[pos]).unwrap();
    for (i, &h) in handles.iter().enumerate() {
        world.set(h, pos, Pos { x: i as i64, y: 0 }).unwrap();
    }

    let cb = world.create_command_buffer();
    for &h in &handles {
        world.migrate_entity_defer(h, &[vel], cb).unwrap();
    }
    world.flush(cb).unwrap();

    let target_sig = QueryBuilder::new().include(pos).include(vel).build();
    assert_eq!(world.count(&target_sig), 128);

    for (i, &h) in handles.iter().enumerate() {
        assert_eq!(world.get::<Pos>(h, pos).unwrap(), Some(&Pos { x: i as i64, y: 0 }));
    }
}

#[test]
fn deferred_delete_only_takes_effect_on_flush() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();
    let h = world.create_entity(&[pos]).unwrap();

    let cb = world.create_command_buffer();
    world.delete_entity_defer(h, cb).unwrap();

    let sig = QueryBuilder::new().include(pos).build();
    assert_eq!(world.count(&sig), 1);

    let processed = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let ops = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let (p2, o2) = (processed.clone(), ops.clone());
    world.subscribe(WorldEventKind::CommandBufferFlushed, move |ev| {
        if let WorldEvent::CommandBufferFlushed {
            entities_processed,
            operation_count,
            ..
        } = ev
        {
            p2.store(*entities_processed, std::sync::atomic::Ordering::SeqCst);
            o2.store(*operation_count, std::sync::atomic::Ordering::SeqCst);
        }
    });

    world.flush(cb).unwrap();

    assert_eq!(world.count(&sig), 0);
    assert_eq!(processed.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(ops.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn stale_handle_is_rejected_after_recycle() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();
    let a = world.create_entity(&[pos]).unwrap();
    world.delete_entity(a).unwrap();
    world.create_entity(&[pos]).unwrap();

    assert_eq!(world.get::<Pos>(a, pos), Err(EcsError::StaleHandle));
}

#[test]
fn change_tracking_yields_exactly_the_written_slots() {
    let mut world = World::new();
    let pos = world.register_component::<Pos>(false, "Pos").unwrap();
    let vel = world.register_component::<Vel>(true, "Vel").unwrap();

    let a = world.create_entity(&[pos, vel]).unwrap();
    let b = world.create_entity(&[pos, vel]).unwrap();
    world.set(a, vel, Vel { x: 1, y: 1 }).unwrap();

    let modified = QueryBuilder::new().include(pos).include(vel).modified(vel).build();
    assert_eq!(world.count(&modified), 1);

    world.clear_all_changes();
    assert_eq!(world.count(&modified), 0);

    let _ = b;
}
