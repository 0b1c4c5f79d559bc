//! Tick-loop throughput benchmarks.
//!
//! Tunables (environment variables):
//! - `SWARMFLOW_BENCH_AGENTS`: population size (default 256)
//! - `SWARMFLOW_BENCH_TICKS`: ticks per measured batch (default 16)

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use swarmflow_core::{Position, SwarmConfig, WorldState};

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn bench_world(agents: usize) -> WorldState {
    let config = SwarmConfig {
        half_width: 20.0,
        half_depth: 20.0,
        rng_seed: Some(0xBEEF),
        record_interval: 0,
        ..SwarmConfig::default()
    };
    let mut world = WorldState::new(config).expect("bench config");
    world.add_beacon("north", Position::new(0.0, 15.0));
    world.add_beacon("south", Position::new(0.0, -15.0));
    world.populate(agents).expect("bench population");
    world
}

fn world_step(c: &mut Criterion) {
    let agents = env_usize("SWARMFLOW_BENCH_AGENTS", 256);
    let ticks = env_usize("SWARMFLOW_BENCH_TICKS", 16);
    let mut group = c.benchmark_group("world_step");
    group.bench_function(format!("agents_{agents}_ticks_{ticks}"), |b| {
        b.iter_batched(
            || bench_world(agents),
            |mut world| {
                for _ in 0..ticks {
                    world.step(0.05).expect("bench step");
                }
                world
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, world_step);
criterion_main!(benches);
