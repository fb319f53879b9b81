use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use firefly_app::{OutputPlan, load_config};
use firefly_core::{IndexKind, SwarmConfig, SwarmState};
use firefly_render::RenderOptions;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "firefly",
    version,
    about = "Simulate synchronized flashing in a swarm of fireflies"
)]
struct Cli {
    /// JSON configuration file; missing fields use the reference defaults.
    #[arg(short, long, env = "FIREFLY_CONFIG")]
    config: Option<PathBuf>,

    /// RNG seed for a reproducible run.
    #[arg(long, env = "FIREFLY_SEED")]
    seed: Option<u64>,

    /// Number of steps to simulate.
    #[arg(long)]
    steps: Option<u64>,

    /// Number of fireflies.
    #[arg(long)]
    population: Option<usize>,

    /// Radius within which a flash is visible.
    #[arg(long)]
    sight_distance: Option<f32>,

    /// Chance that a visible flash triggers a neighbor.
    #[arg(long)]
    contagion_probability: Option<f32>,

    /// Use the pairwise scan instead of the grid index.
    #[arg(long)]
    brute_force: bool,

    /// Directory receiving one PNG per step plus frames.json.
    #[arg(long)]
    frames: Option<PathBuf>,

    /// GIF assembled from the recorded frames at the end of the run.
    #[arg(long, requires = "frames")]
    animation: Option<PathBuf>,

    /// File receiving one JSON snapshot per line.
    #[arg(long)]
    snapshots: Option<PathBuf>,

    /// Frame width in pixels.
    #[arg(long, default_value_t = 1200)]
    width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value_t = 800)]
    height: u32,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn resolve_config(&self) -> Result<SwarmConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => SwarmConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.rng_seed = Some(seed);
        }
        if let Some(steps) = self.steps {
            config.total_steps = steps;
        }
        if let Some(population) = self.population {
            config.population_size = population;
        }
        if let Some(sight) = self.sight_distance {
            config.sight_distance = sight;
        }
        if let Some(probability) = self.contagion_probability {
            config.contagion_probability = probability;
        }
        if self.brute_force {
            config.neighbor_index = IndexKind::BruteForce;
        }
        Ok(config)
    }

    fn output_plan(&self) -> OutputPlan {
        OutputPlan {
            frames_dir: self.frames.clone(),
            animation_path: self.animation.clone(),
            snapshots_path: self.snapshots.clone(),
            render: RenderOptions {
                width: self.width,
                height: self.height,
                ..RenderOptions::default()
            },
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    if cli.print_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&config).context("serialize configuration")?
        );
        return Ok(());
    }

    let plan = cli.output_plan();
    let sink = plan.build_sink(&config)?;
    if sink.is_empty() {
        warn!("no --frames or --snapshots output requested; running headless");
    }

    let mut swarm =
        SwarmState::with_sink(config, Box::new(sink)).context("initialise firefly swarm")?;
    let summary = swarm.run().context("firefly run failed")?;

    let final_lit_fraction = swarm.history().last().map_or(0.0, |s| s.lit_fraction);
    info!(
        steps = summary.steps,
        autonomous = summary.autonomous_flashes,
        contagion = summary.contagion_flashes,
        peak_lit = summary.peak_lit,
        final_lit_fraction,
        "Simulation complete"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
