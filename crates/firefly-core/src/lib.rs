//! Core types and step pipeline for the firefly swarm simulation.

use firefly_index::{IndexError, NeighborhoodIndex, build_index};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

pub use firefly_index::IndexKind;

/// Index of an agent within the population; stable for the lifetime of a run.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct AgentId(pub usize);

impl AgentId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Simulation step counter.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Steps elapsed since `earlier`, saturating at zero.
    #[must_use]
    pub const fn since(self, earlier: Tick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Position inside the simulation volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub const fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    /// Squared Euclidean distance to `other`.
    #[must_use]
    pub fn distance_sq(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

/// Closed interval along one axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AxisRange {
    pub lower: f32,
    pub upper: f32,
}

impl AxisRange {
    #[must_use]
    pub const fn new(lower: f32, upper: f32) -> Self {
        Self { lower, upper }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        self.upper - self.lower
    }

    #[must_use]
    pub fn contains(&self, value: f32) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// Reflect `value` back across whichever limit it overshoots.
    #[must_use]
    pub fn reflect(&self, value: f32) -> f32 {
        reflect(value, self.lower, self.upper)
    }
}

impl Default for AxisRange {
    fn default() -> Self {
        Self::new(0.0, 1.0)
    }
}

/// Axis-aligned cuboid that confines every agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Bounds {
    pub x: AxisRange,
    pub y: AxisRange,
    pub z: AxisRange,
}

impl Bounds {
    /// The unit cube `[0, 1]^3`.
    #[must_use]
    pub const fn unit() -> Self {
        Self {
            x: AxisRange::new(0.0, 1.0),
            y: AxisRange::new(0.0, 1.0),
            z: AxisRange::new(0.0, 1.0),
        }
    }

    #[must_use]
    pub const fn axes(&self) -> [AxisRange; 3] {
        [self.x, self.y, self.z]
    }

    #[must_use]
    pub fn origin(&self) -> [f32; 3] {
        [self.x.lower, self.y.lower, self.z.lower]
    }

    #[must_use]
    pub fn extent(&self) -> [f32; 3] {
        [self.x.width(), self.y.width(), self.z.width()]
    }

    #[must_use]
    pub fn contains(&self, position: &Position) -> bool {
        self.x.contains(position.x) && self.y.contains(position.y) && self.z.contains(position.z)
    }

    /// Uniformly sample a position inside the bounds.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Position {
        Position::new(
            rng.gen_range(self.x.lower..self.x.upper),
            rng.gen_range(self.y.lower..self.y.upper),
            rng.gen_range(self.z.lower..self.z.upper),
        )
    }
}

/// Reflect a coordinate that left `[lower, upper]` back into the interval.
///
/// Only one reflection is applied: an overshoot wider than the interval lands
/// outside the opposite limit. Displacements are expected to be small relative
/// to the box, so callers may only assume the result is usually in range.
#[must_use]
pub fn reflect(position: f32, lower: f32, upper: f32) -> f32 {
    if position < lower {
        lower - (position - lower)
    } else if position > upper {
        upper - (position - upper)
    } else {
        position
    }
}

/// Outcome of a single autonomous flash update for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashTransition {
    /// Unlit agent fired on its own.
    Ignited,
    /// Unlit agent stayed dark and accumulated flash probability.
    Charged,
    /// Lit agent counted down and is still lit.
    Glowing,
    /// Lit agent finished its flash.
    Extinguished,
}

/// A single simulated firefly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Firefly {
    pub position: Position,
    pub lit: bool,
    /// Chance of firing on the next autonomous update; reset on every flash.
    pub flash_probability: f32,
    /// Step at which this agent last began flashing.
    pub last_flash: Tick,
    /// Scales accumulation speed, giving each agent its own tempo.
    pub rate_multiplier: f32,
    /// Steps left in the current flash; refilled when the flash ends.
    pub remaining_lit_steps: u32,
    /// Standard deviation of the per-axis random-walk displacement.
    pub step_size: f32,
}

impl Firefly {
    /// Creates an unlit agent with no flash history.
    #[must_use]
    pub const fn new(
        position: Position,
        rate_multiplier: f32,
        step_size: f32,
        flash_duration: u32,
    ) -> Self {
        Self {
            position,
            lit: false,
            flash_probability: 0.0,
            last_flash: Tick::zero(),
            rate_multiplier,
            remaining_lit_steps: flash_duration,
            step_size,
        }
    }

    /// Sample a fresh agent inside `config.bounds`.
    pub fn new_random<R: Rng + ?Sized>(config: &SwarmConfig, rng: &mut R) -> Self {
        let position = config.bounds.sample(rng);
        let rate_multiplier = rng.gen::<f32>();
        Self::new(
            position,
            rate_multiplier,
            config.step_size,
            config.flash_duration_steps(),
        )
    }

    /// Override the random-walk scale for this agent.
    #[must_use]
    pub const fn with_step_size(mut self, step_size: f32) -> Self {
        self.step_size = step_size;
        self
    }

    /// Begin a flash at `tick`.
    pub fn ignite(&mut self, tick: Tick, flash_duration: u32) {
        self.lit = true;
        self.last_flash = tick;
        self.flash_probability = 0.0;
        self.remaining_lit_steps = flash_duration;
    }

    /// Run the autonomous flash state machine for one step.
    pub fn advance_flash<R: Rng + ?Sized>(
        &mut self,
        tick: Tick,
        base_increment: f32,
        flash_duration: u32,
        rng: &mut R,
    ) -> FlashTransition {
        if self.lit {
            self.remaining_lit_steps = self.remaining_lit_steps.saturating_sub(1);
            if self.remaining_lit_steps == 0 {
                self.lit = false;
                self.remaining_lit_steps = flash_duration;
                return FlashTransition::Extinguished;
            }
            return FlashTransition::Glowing;
        }

        let draw: f32 = rng.gen();
        if draw < self.flash_probability {
            self.ignite(tick, flash_duration);
            FlashTransition::Ignited
        } else {
            self.flash_probability += rng.gen::<f32>() * base_increment * self.rate_multiplier;
            FlashTransition::Charged
        }
    }

    /// Whether contagion may target this agent at `tick`.
    ///
    /// Lit agents never qualify. During the first `refractory_period` steps the
    /// refractory check is waived.
    #[must_use]
    pub fn is_contagion_eligible(&self, tick: Tick, refractory_period: u64) -> bool {
        !self.lit
            && (tick.0 < refractory_period || tick.since(self.last_flash) > refractory_period)
    }

    /// Apply a displacement followed by one reflection per axis.
    pub fn displace(&mut self, delta: [f32; 3], bounds: &Bounds) {
        self.position.x = bounds.x.reflect(self.position.x + delta[0]);
        self.position.y = bounds.y.reflect(self.position.y + delta[1]);
        self.position.z = bounds.z.reflect(self.position.z + delta[2]);
    }
}

/// Fixed-size, index-addressed collection of agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Population {
    agents: Vec<Firefly>,
}

impl Population {
    #[must_use]
    pub fn new(agents: Vec<Firefly>) -> Self {
        Self { agents }
    }

    /// Create `config.population_size` agents with random positions and tempos.
    pub fn random<R: Rng + ?Sized>(config: &SwarmConfig, rng: &mut R) -> Self {
        let agents = (0..config.population_size)
            .map(|_| Firefly::new_random(config, rng))
            .collect();
        Self { agents }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: AgentId) -> Option<&Firefly> {
        self.agents.get(id.0)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut Firefly> {
        self.agents.get_mut(id.0)
    }

    /// Iterate agents in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (AgentId, &Firefly)> + '_ {
        self.agents
            .iter()
            .enumerate()
            .map(|(idx, agent)| (AgentId(idx), agent))
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Firefly] {
        &self.agents
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [Firefly] {
        &mut self.agents
    }

    #[must_use]
    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.agents.iter().map(|a| a.position.to_array()).collect()
    }

    #[must_use]
    pub fn lit_count(&self) -> usize {
        self.agents.iter().filter(|a| a.lit).count()
    }

    /// Read-only export of positions and lit flags.
    #[must_use]
    pub fn snapshot(&self, tick: Tick, bounds: Bounds) -> SwarmSnapshot {
        SwarmSnapshot {
            tick,
            bounds,
            agents: self
                .iter()
                .map(|(id, agent)| AgentSnapshot {
                    id,
                    position: agent.position,
                    lit: agent.lit,
                })
                .collect(),
        }
    }
}

/// Per-agent entry in a [`SwarmSnapshot`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub position: Position,
    pub lit: bool,
}

/// Full-population export emitted once per step, ordered by agent id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwarmSnapshot {
    pub tick: Tick,
    pub bounds: Bounds,
    pub agents: Vec<AgentSnapshot>,
}

impl SwarmSnapshot {
    pub fn lit_agents(&self) -> impl Iterator<Item = &AgentSnapshot> + '_ {
        self.agents.iter().filter(|agent| agent.lit)
    }
}

/// Errors returned by snapshot sinks.
pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Consumer of per-step snapshots (renderers, recorders).
pub trait SnapshotSink: Send {
    fn on_step(&mut self, snapshot: &SwarmSnapshot) -> Result<(), SinkError>;

    /// Called once after the final step of a run.
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Snapshot sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn on_step(&mut self, _snapshot: &SwarmSnapshot) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Errors that can occur when constructing or advancing a swarm.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The neighborhood index rejected its parameters.
    #[error("neighborhood index: {0}")]
    Index(#[from] IndexError),
    /// A snapshot sink failed; the run stops after the completed step.
    #[error("snapshot sink failed at step {tick}: {source}")]
    Sink {
        tick: u64,
        #[source]
        source: SinkError,
    },
}

/// Static configuration for a firefly swarm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Number of agents created at startup.
    pub population_size: usize,
    /// Number of steps executed by [`SwarmState::run`].
    pub total_steps: u64,
    /// Seconds an agent stays lit once triggered.
    pub light_time_secs: f32,
    /// Steps per simulated second (also the output frame rate).
    pub frame_rate: u32,
    /// Per-step base growth of flash probability.
    pub base_increment: f32,
    /// Radius within which a lit agent is visible.
    pub sight_distance: f32,
    /// Chance that a visible flash triggers a sympathetic one.
    pub contagion_probability: f32,
    /// Steps after a flash before an agent can be triggered by contagion again.
    /// Also the length of the warm-up window where that rule is waived.
    pub refractory_period: u64,
    /// Volume confining every agent.
    pub bounds: Bounds,
    /// Default random-walk scale applied to each new agent.
    pub step_size: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Neighborhood index used by the contagion stage.
    pub neighbor_index: IndexKind,
    /// Maximum number of recent step summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            population_size: 13,
            total_steps: 1_000,
            light_time_secs: 1.0,
            frame_rate: 30,
            base_increment: 0.000_03,
            sight_distance: 0.4,
            contagion_probability: 0.05,
            refractory_period: 100,
            bounds: Bounds::unit(),
            step_size: 0.01,
            rng_seed: None,
            neighbor_index: IndexKind::default(),
            history_capacity: 256,
        }
    }
}

impl SwarmConfig {
    /// Number of steps a flash lasts: `ceil(light_time_secs * frame_rate)`.
    #[must_use]
    pub fn flash_duration_steps(&self) -> u32 {
        let steps = (self.light_time_secs * self.frame_rate as f32).ceil();
        if steps.is_finite() && steps > 0.0 {
            steps.min(u32::MAX as f32) as u32
        } else {
            0
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.population_size == 0 {
            return Err(SwarmError::InvalidConfig(
                "population_size must be non-zero",
            ));
        }
        if !self.light_time_secs.is_finite() || self.flash_duration_steps() == 0 {
            return Err(SwarmError::InvalidConfig(
                "flash duration must be at least one step",
            ));
        }
        for axis in self.bounds.axes() {
            if !axis.lower.is_finite() || !axis.upper.is_finite() {
                return Err(SwarmError::InvalidConfig("bounds must be finite"));
            }
            if axis.lower >= axis.upper {
                return Err(SwarmError::InvalidConfig(
                    "bounds lower limit must be below upper limit",
                ));
            }
        }
        if !self.base_increment.is_finite() || self.base_increment < 0.0 {
            return Err(SwarmError::InvalidConfig(
                "base_increment must be finite and non-negative",
            ));
        }
        if !self.step_size.is_finite() || self.step_size < 0.0 {
            return Err(SwarmError::InvalidConfig(
                "step_size must be finite and non-negative",
            ));
        }
        if !self.sight_distance.is_finite() {
            return Err(SwarmError::InvalidConfig("sight_distance must be finite"));
        }
        if !(0.0..=1.0).contains(&self.contagion_probability) {
            return Err(SwarmError::InvalidConfig(
                "contagion_probability must lie in [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(SwarmError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Random-walk every agent, reflecting off the bounds.
///
/// Displacements are drawn sequentially so a seeded RNG gives the same walk
/// regardless of thread count; applying them runs in parallel.
pub fn motion_step<R: Rng + ?Sized>(population: &mut Population, bounds: &Bounds, rng: &mut R) {
    let displacements: Vec<[f32; 3]> = population
        .as_slice()
        .iter()
        .map(|agent| {
            let dx: f32 = rng.sample(StandardNormal);
            let dy: f32 = rng.sample(StandardNormal);
            let dz: f32 = rng.sample(StandardNormal);
            [
                dx * agent.step_size,
                dy * agent.step_size,
                dz * agent.step_size,
            ]
        })
        .collect();

    population
        .as_mut_slice()
        .par_iter_mut()
        .zip(displacements.par_iter())
        .for_each(|(agent, delta)| agent.displace(*delta, bounds));
}

/// Counts produced by [`autonomous_flash_step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashCounts {
    pub ignited: usize,
    pub extinguished: usize,
}

/// Autonomous accumulation, triggering and countdown for every agent.
pub fn autonomous_flash_step<R: Rng + ?Sized>(
    population: &mut Population,
    config: &SwarmConfig,
    tick: Tick,
    rng: &mut R,
) -> FlashCounts {
    let flash_duration = config.flash_duration_steps();
    let mut counts = FlashCounts::default();
    for agent in population.as_mut_slice() {
        match agent.advance_flash(tick, config.base_increment, flash_duration, rng) {
            FlashTransition::Ignited => counts.ignited += 1,
            FlashTransition::Extinguished => counts.extinguished += 1,
            FlashTransition::Charged | FlashTransition::Glowing => {}
        }
    }
    counts
}

/// An unlit agent claimed by the first lit agent that saw it this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContagionClaim {
    pub claimant: AgentId,
    pub candidate: AgentId,
}

/// First phase of contagion: decide which unlit agents each lit agent claims.
///
/// Lit agents are visited in ascending id order and each candidate is claimed
/// at most once, by the first lit agent that sees it. Within one claimant the
/// candidates are listed in ascending id order. The population is not mutated.
pub fn gather_contagion_claims(
    population: &Population,
    config: &SwarmConfig,
    tick: Tick,
    index: &mut dyn NeighborhoodIndex,
) -> Result<Vec<ContagionClaim>, SwarmError> {
    let sight = config.sight_distance;
    if sight.is_nan() || sight <= 0.0 {
        return Ok(Vec::new());
    }

    let agents = population.as_slice();
    let lit: Vec<usize> = agents
        .iter()
        .enumerate()
        .filter_map(|(idx, agent)| agent.lit.then_some(idx))
        .collect();
    let eligible: Vec<bool> = agents
        .iter()
        .map(|agent| agent.is_contagion_eligible(tick, config.refractory_period))
        .collect();
    if lit.is_empty() || !eligible.iter().any(|e| *e) {
        return Ok(Vec::new());
    }

    index.rebuild(&population.positions())?;
    let index: &dyn NeighborhoodIndex = index;
    let sight_sq = sight * sight;

    let sightings: Vec<Vec<usize>> = lit
        .par_iter()
        .map(|&lit_idx| {
            let mut seen = Vec::new();
            index.neighbors_within(
                lit_idx,
                sight_sq,
                &mut |other_idx, dist_sq: OrderedFloat<f32>| {
                    if eligible[other_idx] && dist_sq.into_inner() < sight_sq {
                        seen.push(other_idx);
                    }
                },
            );
            seen.sort_unstable();
            seen
        })
        .collect();

    let mut claimed = vec![false; agents.len()];
    let mut claims = Vec::new();
    for (&lit_idx, seen) in lit.iter().zip(&sightings) {
        for &candidate in seen {
            if !claimed[candidate] {
                claimed[candidate] = true;
                claims.push(ContagionClaim {
                    claimant: AgentId(lit_idx),
                    candidate: AgentId(candidate),
                });
            }
        }
    }
    Ok(claims)
}

/// Second phase of contagion: roll once per claim and ignite the winners.
pub fn apply_contagion_claims<R: Rng + ?Sized>(
    population: &mut Population,
    claims: &[ContagionClaim],
    config: &SwarmConfig,
    tick: Tick,
    rng: &mut R,
) -> usize {
    let flash_duration = config.flash_duration_steps();
    let mut ignited = 0;
    for claim in claims {
        let draw: f32 = rng.gen();
        if draw >= config.contagion_probability {
            continue;
        }
        if let Some(agent) = population.get_mut(claim.candidate) {
            if !agent.lit {
                agent.ignite(tick, flash_duration);
                ignited += 1;
            }
        }
    }
    ignited
}

/// Full contagion step: claims against a consistent lit/unlit snapshot, then triggers.
pub fn contagion_step<R: Rng + ?Sized>(
    population: &mut Population,
    config: &SwarmConfig,
    tick: Tick,
    index: &mut dyn NeighborhoodIndex,
    rng: &mut R,
) -> Result<ContagionOutcome, SwarmError> {
    let claims = gather_contagion_claims(population, config, tick, index)?;
    let ignited = apply_contagion_claims(population, &claims, config, tick, rng);
    Ok(ContagionOutcome {
        candidates: claims.len(),
        ignited,
    })
}

/// Counts produced by [`contagion_step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContagionOutcome {
    /// Unlit agents that were within sight of a lit agent and eligible.
    pub candidates: usize,
    /// Candidates that actually ignited.
    pub ignited: usize,
}

/// Events emitted after processing one step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StepEvents {
    /// Index of the step that was just processed.
    pub tick: Tick,
    pub autonomous_flashes: usize,
    pub contagion_candidates: usize,
    pub contagion_flashes: usize,
    pub extinguished: usize,
    /// Agents lit at the end of the step.
    pub lit_count: usize,
}

/// Per-step summary retained in the swarm history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub tick: Tick,
    pub lit_count: usize,
    pub lit_fraction: f32,
    pub mean_flash_probability: f32,
    pub autonomous_flashes: usize,
    pub contagion_flashes: usize,
}

/// Aggregate counters for a completed run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub steps: u64,
    pub autonomous_flashes: usize,
    pub contagion_flashes: usize,
    pub peak_lit: usize,
}

impl RunSummary {
    fn record(&mut self, events: &StepEvents) {
        self.steps += 1;
        self.autonomous_flashes += events.autonomous_flashes;
        self.contagion_flashes += events.contagion_flashes;
        self.peak_lit = self.peak_lit.max(events.lit_count);
    }
}

/// Simulation driver owning the population, RNG, index and snapshot sink.
pub struct SwarmState {
    config: SwarmConfig,
    tick: Tick,
    rng: SmallRng,
    population: Population,
    index: Box<dyn NeighborhoodIndex>,
    sink: Box<dyn SnapshotSink>,
    history: VecDeque<StepSummary>,
    totals: RunSummary,
}

impl fmt::Debug for SwarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.population.len())
            .field("lit_count", &self.population.lit_count())
            .finish()
    }
}

impl SwarmState {
    /// Instantiate a swarm with a random population and no snapshot sink.
    pub fn new(config: SwarmConfig) -> Result<Self, SwarmError> {
        Self::with_sink(config, Box::new(NullSink))
    }

    /// Instantiate a swarm with a random population emitting to `sink`.
    pub fn with_sink(
        config: SwarmConfig,
        sink: Box<dyn SnapshotSink>,
    ) -> Result<Self, SwarmError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let population = Population::random(&config, &mut rng);
        Ok(Self::assemble(config, rng, population, sink))
    }

    /// Instantiate a swarm around a caller-built population.
    ///
    /// `population_size` is taken from `agents`.
    pub fn with_population(
        mut config: SwarmConfig,
        agents: Vec<Firefly>,
    ) -> Result<Self, SwarmError> {
        config.population_size = agents.len();
        config.validate()?;
        let rng = config.seeded_rng();
        Ok(Self::assemble(
            config,
            rng,
            Population::new(agents),
            Box::new(NullSink),
        ))
    }

    fn assemble(
        config: SwarmConfig,
        rng: SmallRng,
        population: Population,
        sink: Box<dyn SnapshotSink>,
    ) -> Self {
        let cell_size = if config.sight_distance > 0.0 {
            config.sight_distance
        } else {
            config.bounds.extent().into_iter().fold(f32::MIN, f32::max)
        };
        let index = build_index(
            config.neighbor_index,
            cell_size,
            config.bounds.origin(),
            config.bounds.extent(),
        );
        let history_capacity = config.history_capacity;
        Self {
            config,
            tick: Tick::zero(),
            rng,
            population,
            index,
            sink,
            history: VecDeque::with_capacity(history_capacity),
            totals: RunSummary::default(),
        }
    }

    fn stage_motion(&mut self) {
        motion_step(&mut self.population, &self.config.bounds, &mut self.rng);
    }

    fn stage_autonomous(&mut self) -> FlashCounts {
        autonomous_flash_step(&mut self.population, &self.config, self.tick, &mut self.rng)
    }

    fn stage_contagion(&mut self) -> Result<ContagionOutcome, SwarmError> {
        contagion_step(
            &mut self.population,
            &self.config,
            self.tick,
            self.index.as_mut(),
            &mut self.rng,
        )
    }

    fn stage_history(&mut self, events: &StepEvents) {
        let count = self.population.len();
        let probability_sum: f32 = self
            .population
            .as_slice()
            .iter()
            .map(|agent| agent.flash_probability)
            .sum();
        let summary = StepSummary {
            tick: events.tick,
            lit_count: events.lit_count,
            lit_fraction: events.lit_count as f32 / count.max(1) as f32,
            mean_flash_probability: probability_sum / count.max(1) as f32,
            autonomous_flashes: events.autonomous_flashes,
            contagion_flashes: events.contagion_flashes,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    fn stage_emit(&mut self) -> Result<(), SwarmError> {
        let snapshot = self.snapshot();
        self.sink
            .on_step(&snapshot)
            .map_err(|source| SwarmError::Sink {
                tick: self.tick.0,
                source,
            })
    }

    /// Execute one step: motion, autonomous flashing, contagion, then emit a snapshot.
    pub fn step(&mut self) -> Result<StepEvents, SwarmError> {
        self.stage_motion();
        let flashes = self.stage_autonomous();
        let contagion = self.stage_contagion()?;

        let events = StepEvents {
            tick: self.tick,
            autonomous_flashes: flashes.ignited,
            contagion_candidates: contagion.candidates,
            contagion_flashes: contagion.ignited,
            extinguished: flashes.extinguished,
            lit_count: self.population.lit_count(),
        };
        debug!(
            tick = events.tick.0,
            lit = events.lit_count,
            autonomous = events.autonomous_flashes,
            contagion = events.contagion_flashes,
            candidates = events.contagion_candidates,
            "step complete"
        );

        self.stage_history(&events);
        self.totals.record(&events);
        let emitted = self.stage_emit();
        self.tick = self.tick.next();
        emitted?;
        Ok(events)
    }

    /// Run until `total_steps` steps have been processed, then finish the sink.
    pub fn run(&mut self) -> Result<RunSummary, SwarmError> {
        info!(
            agents = self.population.len(),
            steps = self.config.total_steps,
            flash_steps = self.config.flash_duration_steps(),
            "starting firefly run"
        );
        while self.tick.0 < self.config.total_steps {
            self.step()?;
        }
        let tick = self.tick.0;
        self.sink
            .finish()
            .map_err(|source| SwarmError::Sink { tick, source })?;
        info!(
            steps = self.totals.steps,
            autonomous = self.totals.autonomous_flashes,
            contagion = self.totals.contagion_flashes,
            peak_lit = self.totals.peak_lit,
            "firefly run finished"
        );
        Ok(self.totals)
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Index of the next step to be processed.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn population(&self) -> &Population {
        &self.population
    }

    #[must_use]
    pub fn population_mut(&mut self) -> &mut Population {
        &mut self.population
    }

    /// Iterate over retained step summaries.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }

    /// Counters accumulated since construction.
    #[must_use]
    pub const fn totals(&self) -> RunSummary {
        self.totals
    }

    /// Snapshot of the current population state.
    #[must_use]
    pub fn snapshot(&self) -> SwarmSnapshot {
        self.population.snapshot(self.tick, self.config.bounds)
    }
}
