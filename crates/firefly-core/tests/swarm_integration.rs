use firefly_core::{
    AgentId, Bounds, Firefly, IndexKind, Population, Position, SinkError, SnapshotSink,
    SwarmConfig, SwarmSnapshot, SwarmState, Tick, motion_step,
};
use rand::{SeedableRng, rngs::SmallRng};
use std::sync::{Arc, Mutex};

fn lively_config(seed: u64) -> SwarmConfig {
    SwarmConfig {
        population_size: 40,
        total_steps: 400,
        base_increment: 0.002,
        contagion_probability: 0.3,
        rng_seed: Some(seed),
        ..SwarmConfig::default()
    }
}

#[derive(Clone, Default)]
struct Recorder {
    frames: Arc<Mutex<Vec<SwarmSnapshot>>>,
}

impl SnapshotSink for Recorder {
    fn on_step(&mut self, snapshot: &SwarmSnapshot) -> Result<(), SinkError> {
        self.frames.lock().expect("recorder lock").push(snapshot.clone());
        Ok(())
    }
}

fn record_run(config: SwarmConfig) -> Vec<SwarmSnapshot> {
    let recorder = Recorder::default();
    let frames = Arc::clone(&recorder.frames);
    let mut swarm = SwarmState::with_sink(config, Box::new(recorder)).expect("swarm");
    swarm.run().expect("run");
    let frames = frames.lock().expect("recorder lock");
    frames.clone()
}

#[test]
fn seeded_swarm_advances_deterministically() {
    let a = record_run(lively_config(0xF1EF));
    let b = record_run(lively_config(0xF1EF));
    assert_eq!(a.len(), 400);
    assert_eq!(a, b);
}

#[test]
fn index_choice_does_not_change_outcome() {
    let grid = record_run(SwarmConfig {
        neighbor_index: IndexKind::UniformGrid,
        ..lively_config(21)
    });
    let brute = record_run(SwarmConfig {
        neighbor_index: IndexKind::BruteForce,
        ..lively_config(21)
    });
    assert_eq!(grid, brute);
}

#[test]
fn snapshots_are_ordered_by_agent_id() {
    let frames = record_run(SwarmConfig {
        total_steps: 5,
        ..lively_config(2)
    });
    for (step, frame) in frames.iter().enumerate() {
        assert_eq!(frame.tick, Tick(step as u64));
        let ids: Vec<AgentId> = frame.agents.iter().map(|a| a.id).collect();
        let expected: Vec<AgentId> = (0..40).map(AgentId).collect();
        assert_eq!(ids, expected);
    }
}

#[test]
fn positions_stay_in_bounds_for_a_full_run() {
    let frames = record_run(lively_config(77));
    let bounds = Bounds::unit();
    for frame in &frames {
        for agent in &frame.agents {
            assert!(
                bounds.contains(&agent.position),
                "agent {} escaped at step {}: {:?}",
                agent.id,
                frame.tick.0,
                agent.position
            );
        }
    }
}

#[test]
fn oversized_steps_expose_single_reflection_limit() {
    let bounds = Bounds::unit();
    let agents: Vec<Firefly> = (0..64)
        .map(|_| Firefly::new(Position::new(0.5, 0.5, 0.5), 0.5, 5.0, 30))
        .collect();
    let mut population = Population::new(agents);
    let mut rng = SmallRng::seed_from_u64(4);
    motion_step(&mut population, &bounds, &mut rng);
    let escaped = population
        .iter()
        .filter(|(_, agent)| !bounds.contains(&agent.position))
        .count();
    assert!(escaped > 0, "expected some agents outside after a huge step");
}

#[test]
fn flashes_last_exactly_the_configured_duration() {
    let config = lively_config(5);
    let duration = config.flash_duration_steps() as usize;
    let frames = record_run(config);
    let agents = frames[0].agents.len();

    for id in 0..agents {
        let lit: Vec<bool> = frames.iter().map(|f| f.agents[id].lit).collect();
        let mut run = 0usize;
        for (step, is_lit) in lit.iter().enumerate() {
            if *is_lit {
                run += 1;
            } else if run > 0 {
                // A flash may be re-triggered the step it ends, so runs are multiples.
                assert_eq!(run % duration, 0, "agent {id} flash ended early at {step}");
                run = 0;
            }
        }
    }
}

#[test]
fn reset_invariant_holds_on_every_ignition() {
    let mut swarm = SwarmState::new(lively_config(13)).expect("swarm");
    let duration = swarm.config().flash_duration_steps();
    let mut previous: Vec<bool> = swarm
        .population()
        .iter()
        .map(|(_, agent)| agent.lit)
        .collect();
    let mut ignitions = 0;
    for _ in 0..300 {
        let events = swarm.step().expect("step");
        for (id, agent) in swarm.population().iter() {
            if agent.lit && !previous[id.index()] {
                ignitions += 1;
                assert_eq!(agent.flash_probability, 0.0);
                assert_eq!(agent.remaining_lit_steps, duration);
                assert_eq!(agent.last_flash, events.tick);
            }
            if agent.lit {
                assert!((1..=duration).contains(&agent.remaining_lit_steps));
            }
        }
        previous = swarm
            .population()
            .iter()
            .map(|(_, agent)| agent.lit)
            .collect();
    }
    assert!(ignitions > 0, "expected at least one flash");
}

#[test]
fn contagion_only_swarm_stays_dark() {
    let config = SwarmConfig {
        base_increment: 0.0,
        total_steps: 200,
        ..lively_config(8)
    };
    let mut swarm = SwarmState::new(config).expect("swarm");
    let summary = swarm.run().expect("run");
    assert_eq!(summary.autonomous_flashes, 0);
    assert_eq!(summary.contagion_flashes, 0);
    assert_eq!(summary.peak_lit, 0);
}

#[test]
fn contagion_spreads_through_a_dense_cluster() {
    let agents: Vec<Firefly> = (0..10)
        .map(|i| {
            let offset = i as f32 * 0.01;
            Firefly::new(Position::new(0.5 + offset, 0.5, 0.5), 0.0, 0.0, 30)
        })
        .collect();
    let config = SwarmConfig {
        base_increment: 0.0,
        contagion_probability: 1.0,
        rng_seed: Some(3),
        ..SwarmConfig::default()
    };
    let mut swarm = SwarmState::with_population(config, agents).expect("swarm");
    if let Some(first) = swarm.population_mut().get_mut(AgentId(0)) {
        first.ignite(Tick(0), 30);
    }
    let events = swarm.step().expect("step");
    assert_eq!(events.contagion_flashes, 9);
    assert_eq!(events.lit_count, 10);
}

#[test]
fn config_round_trips_through_json_with_defaults() {
    let config: SwarmConfig =
        serde_json::from_str(r#"{"population_size": 5, "neighbor_index": "brute_force"}"#)
            .expect("parse config");
    assert_eq!(config.population_size, 5);
    assert_eq!(config.neighbor_index, IndexKind::BruteForce);
    assert_eq!(config.sight_distance, SwarmConfig::default().sight_distance);
}
