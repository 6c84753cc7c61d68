#![allow(dead_code)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fragment_ecs::{QueryBuilder, World};

#[derive(Debug, Clone)]
struct Position(f32, f32, f32);

#[derive(Debug, Clone)]
struct Velocity(f32, f32, f32);

#[derive(Debug, Clone)]
struct Health(u32);

fn build_world(n: usize) -> (World, fragment_ecs::ComponentId, fragment_ecs::ComponentId) {
    let mut world = World::new();
    let pos = world.register_component::<Position>(false, "Position").unwrap();
    let vel = world.register_component::<Velocity>(true, "Velocity").unwrap();
    let health = world.register_component::<Health>(false, "Health").unwrap();

    for i in 0..n {
        if i % 3 == 0 {
            world.spawn((Position(1.0, 2.0, 3.0), Velocity(1.0, 0.0, 0.0)));
        } else {
            world.spawn((
                Position(1.0, 2.0, 3.0),
                Velocity(1.0, 0.0, 0.0),
                Health(100),
            ));
        }
    }
    let _ = health;
    (world, pos, vel)
}

fn query_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_bench");
    let (world, pos, vel) = build_world(10_000);

    group.bench_function("count_pos_and_vel", |b| {
        let sig = QueryBuilder::new().include(pos).include(vel).build();
        b.iter(|| black_box(world.count(&sig)));
    });

    group.bench_function("dense_iter_pos_and_vel", |b| {
        let sig = QueryBuilder::new().include(pos).include(vel).build();
        b.iter(|| {
            let mut total = 0u32;
            for m in world.dense_query(&sig) {
                for _ in m.slots() {
                    total += 1;
                }
            }
            black_box(total)
        });
    });

    group.bench_function("dense_iter_modified_vel", |b| {
        let sig = QueryBuilder::new().include(pos).include(vel).modified(vel).build();
        b.iter(|| {
            let mut total = 0u32;
            for m in world.dense_query(&sig) {
                total += m.popcount();
            }
            black_box(total)
        });
    });

    group.finish();
}

criterion_group!(benches, query_benchmark);
criterion_main!(benches);
