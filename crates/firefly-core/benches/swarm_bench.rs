use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use firefly_core::{IndexKind, SwarmConfig, SwarmState};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(fallback)
}

fn bench_swarm_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("swarm_step");
    group.sample_size(env_or("FF_BENCH_SAMPLES", 30_usize).max(10));
    group.warm_up_time(Duration::from_secs(env_or("FF_BENCH_WARMUP_SECS", 2)));
    group.measurement_time(Duration::from_secs(env_or("FF_BENCH_MEASURE_SECS", 5)));
    let steps: u64 = env_or("FF_BENCH_STEPS", 64_u64).max(1);
    let agents_list: Vec<usize> = std::env::var("FF_BENCH_AGENTS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![13_usize, 500, 5_000]);

    for &agents in &agents_list {
        for kind in [IndexKind::BruteForce, IndexKind::UniformGrid] {
            group.bench_function(format!("{kind:?}_agents{agents}_steps{steps}"), |b| {
                b.iter_batched(
                    || {
                        let config = SwarmConfig {
                            population_size: agents,
                            total_steps: steps,
                            // Keep plenty of agents lit so contagion dominates.
                            base_increment: 0.01,
                            sight_distance: 0.1,
                            neighbor_index: kind,
                            rng_seed: Some(0xBEEF),
                            ..SwarmConfig::default()
                        };
                        SwarmState::new(config).expect("swarm")
                    },
                    |mut swarm| {
                        swarm.run().expect("run");
                    },
                    BatchSize::LargeInput,
                );
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_swarm_steps);
criterion_main!(benches);
