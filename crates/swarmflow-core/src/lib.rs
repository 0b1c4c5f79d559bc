//! Core state and tick pipeline for the swarmflow simulator.
//!
//! A [`WorldState`] owns a population of agents laid out in
//! struct-of-arrays columns, a set of attention beacons, and a spatial
//! index from `swarmflow-index`. Each call to [`WorldState::step`] runs
//! a staged update: sense neighborhoods, steer (flocking, attention,
//! Brownian drift), integrate motion against the room boundary, then
//! record a summary. Stages read from a snapshot taken at the start of
//! the tick and write into staging buffers, so update order within a
//! tick never changes the outcome for a given seed.

use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::VecDeque;
use std::f32::consts::{PI, TAU};
use swarmflow_index::{IndexError, NeighborhoodIndex, UniformGridIndex, nearest_candidate};
use thiserror::Error;
use tracing::{debug, warn};

/// Magnitudes below this are treated as zero when normalizing.
const EPSILON: f32 = 1e-6;

/// Tolerance for the rule-weight normalization check.
const WEIGHT_TOLERANCE: f32 = 1e-3;

new_key_type! {
    /// Stable handle for an agent; survives swap-removal of other agents.
    pub struct AgentId;
}

/// Secondary storage keyed by [`AgentId`].
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Monotonic tick counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Tick {
        Tick(self.0 + 1)
    }
}

/// Errors surfaced by world construction and the tick pipeline.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Configuration values that cannot produce a runnable world.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Rule weights that do not sum to one within tolerance. Logged as a
    /// warning at construction, never fatal.
    #[error("rule weights sum to {sum} instead of 1.0")]
    InvalidWeights { sum: f32 },
    /// No beacon exists for the attention model to lock onto. The affected
    /// agent falls back to exploring; the tick loop keeps running.
    #[error("no beacon available for attention steering")]
    NoAttentionTarget,
    /// Rejection sampling ran out of attempts while placing a group.
    #[error("placed {placed} of {requested} agents before exhausting spawn attempts")]
    SpawnExhausted { placed: usize, requested: usize },
    /// Failure from the spatial index rebuild.
    #[error(transparent)]
    Index(#[from] IndexError),
}

// ---------------------------------------------------------------------------
// Planar math
// ---------------------------------------------------------------------------

/// Planar agent position. The vertical axis of the source scenes carries no
/// behavior, so the core works in the ground plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn as_pair(self) -> (f32, f32) {
        (self.x, self.y)
    }

    #[must_use]
    pub fn distance_sq_to(self, other: Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        dx * dx + dy * dy
    }

    #[must_use]
    pub fn distance_to(self, other: Position) -> f32 {
        self.distance_sq_to(other).sqrt()
    }
}

/// Planar velocity. Steering forces reuse this type since a steering force
/// is a velocity correction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    pub const ZERO: Velocity = Velocity { vx: 0.0, vy: 0.0 };

    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }

    #[must_use]
    pub fn magnitude_sq(self) -> f32 {
        self.vx * self.vx + self.vy * self.vy
    }

    #[must_use]
    pub fn magnitude(self) -> f32 {
        self.magnitude_sq().sqrt()
    }

    #[must_use]
    pub fn plus(self, other: Velocity) -> Velocity {
        Velocity::new(self.vx + other.vx, self.vy + other.vy)
    }

    #[must_use]
    pub fn scaled(self, factor: f32) -> Velocity {
        Velocity::new(self.vx * factor, self.vy * factor)
    }

    /// Clamp the magnitude by renormalizing and rescaling, never by
    /// truncating per axis.
    #[must_use]
    pub fn clamped(self, max: f32) -> Velocity {
        let mag = self.magnitude();
        if mag <= max || mag <= EPSILON {
            return self;
        }
        self.scaled(max / mag)
    }

    /// Bearing of this vector in radians, in `(-PI, PI]`.
    #[must_use]
    pub fn bearing(self) -> f32 {
        self.vy.atan2(self.vx)
    }
}

/// Wrap an angle into `(-PI, PI]`.
#[must_use]
pub fn wrap_signed_angle(angle: f32) -> f32 {
    let mut wrapped = angle % TAU;
    if wrapped > PI {
        wrapped -= TAU;
    } else if wrapped < -PI {
        wrapped += TAU;
    }
    wrapped
}

/// Hermite smoothstep on the unit interval; input is clamped to `[0, 1]`.
#[must_use]
pub fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Rotate `current` toward `target` by at most `max_step` radians.
#[must_use]
pub fn rotate_towards(current: f32, target: f32, max_step: f32) -> f32 {
    let delta = wrap_signed_angle(target - current);
    wrap_signed_angle(current + delta.clamp(-max_step, max_step))
}

/// Mirror a velocity across a unit boundary normal.
///
/// Applying the same normal twice returns the original vector.
#[must_use]
pub fn reflect(velocity: Velocity, normal: (f32, f32)) -> Velocity {
    let dot = velocity.vx * normal.0 + velocity.vy * normal.1;
    Velocity::new(
        velocity.vx - 2.0 * dot * normal.0,
        velocity.vy - 2.0 * dot * normal.1,
    )
}

// ---------------------------------------------------------------------------
// Noise
// ---------------------------------------------------------------------------

/// Seeded random source with a cached Gaussian spare.
///
/// Gaussian samples use the Marsaglia polar method, which produces pairs;
/// the second sample of each pair is kept and returned on the next call.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    rng: SmallRng,
    spare: Option<f32>,
}

impl NoiseSource {
    #[must_use]
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            spare: None,
        }
    }

    /// Uniform sample in `[0, 1)`.
    pub fn uniform(&mut self) -> f32 {
        self.rng.random::<f32>()
    }

    /// Uniform sample in `[low, high)`.
    pub fn range(&mut self, low: f32, high: f32) -> f32 {
        self.rng.random_range(low..high)
    }

    /// Gaussian sample with the given mean and standard deviation.
    pub fn gaussian(&mut self, mean: f32, std_dev: f32) -> f32 {
        if let Some(spare) = self.spare.take() {
            return mean + std_dev * spare;
        }
        loop {
            let u = self.range(-1.0, 1.0);
            let v = self.range(-1.0, 1.0);
            let s = u * u + v * v;
            if s > 0.0 && s < 1.0 {
                let scale = (-2.0 * s.ln() / s).sqrt();
                self.spare = Some(v * scale);
                return mean + std_dev * u * scale;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What happens when integration pushes an agent past a room wall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BoundaryPolicy {
    /// Clip each axis to the bound, nudged inward by a small uniform jitter
    /// so agents do not stick to the wall.
    Clamp { jitter: f32 },
    /// Set the crossed axis to the bound and mirror the velocity component
    /// across the wall normal.
    Reflect,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        BoundaryPolicy::Clamp { jitter: 0.01 }
    }
}

/// Per-rule sensing distances. Alignment looks within `visual`, cohesion
/// within `motor`, separation within `social`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InteractionRadii {
    pub visual: f32,
    pub motor: f32,
    pub social: f32,
}

impl InteractionRadii {
    #[must_use]
    pub fn max_radius(&self) -> f32 {
        self.visual.max(self.motor).max(self.social)
    }
}

impl Default for InteractionRadii {
    fn default() -> Self {
        Self {
            visual: 1.0,
            motor: 2.5,
            social: 0.5,
        }
    }
}

/// Blend weights for the three flocking rules, expected to sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleWeights {
    pub visual: f32,
    pub motor: f32,
    pub social: f32,
}

impl RuleWeights {
    #[must_use]
    pub fn sum(&self) -> f32 {
        self.visual + self.motor + self.social
    }

    /// Verify the weights sum to one within tolerance.
    pub fn checked(&self) -> Result<(), WorldError> {
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(WorldError::InvalidWeights { sum });
        }
        Ok(())
    }
}

impl Default for RuleWeights {
    fn default() -> Self {
        let third = 1.0 / 3.0;
        Self {
            visual: third,
            motor: third,
            social: third,
        }
    }
}

/// Speed and steering-force ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionLimits {
    pub max_speed: f32,
    pub max_force: f32,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            max_speed: 4.0,
            max_force: 2.0,
        }
    }
}

/// Constants driving the attention state machine and the drift-diffusion
/// approach toward an attended beacon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionProfile {
    /// Seconds an agent stays locked on a beacon before disengaging.
    pub span: f32,
    /// Seconds over which the self-attention weight ramps up or down.
    pub switching_time: f32,
    /// Beacons closer than this do not trigger attending.
    pub min_distance: f32,
    /// Beacons farther than this do not trigger attending.
    pub max_distance: f32,
    /// Drift rate toward the beacon, per unit distance per second.
    pub base_drift: f32,
    /// Standard deviation of the diffusion term, scaled by `sqrt(dt)`.
    pub noise_scale: f32,
    /// Maximum heading turn toward the beacon, radians per tick.
    pub rotation_speed: f32,
    /// Standard deviation of the heading random walk while not attending.
    pub wander_scale: f32,
}

impl Default for AttentionProfile {
    fn default() -> Self {
        Self {
            span: 4.0,
            switching_time: 1.0,
            min_distance: 0.5,
            max_distance: 20.0,
            base_drift: 0.5,
            noise_scale: 0.01,
            rotation_speed: 0.1,
            wander_scale: 0.5,
        }
    }
}

/// Constants for the free Brownian walker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrownianProfile {
    /// Constant drift rate toward the nearest beacon.
    pub drift: f32,
    /// Standard deviation of the diffusion term, scaled by `sqrt(dt)`.
    pub noise_scale: f32,
}

impl Default for BrownianProfile {
    fn default() -> Self {
        Self {
            drift: 1.0,
            noise_scale: 0.1,
        }
    }
}

/// Which steering behaviors contribute to an agent's update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorSet {
    pub flocking: bool,
    pub attention: bool,
    pub brownian: bool,
}

impl Default for BehaviorSet {
    fn default() -> Self {
        Self {
            flocking: true,
            attention: true,
            brownian: false,
        }
    }
}

/// World configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Room half-extent along x; the room spans `[-half_width, half_width]`.
    pub half_width: f32,
    /// Room half-extent along y.
    pub half_depth: f32,
    pub boundary: BoundaryPolicy,
    pub radii: InteractionRadii,
    pub weights: RuleWeights,
    pub limits: MotionLimits,
    pub behaviors: BehaviorSet,
    pub attention: AttentionProfile,
    pub brownian: BrownianProfile,
    /// Minimum pairwise distance when placing a group.
    pub spawn_separation: f32,
    /// Rejection-sampling attempts per agent before giving up.
    pub spawn_attempts: usize,
    /// Cell size of the uniform grid index.
    pub index_cell_size: f32,
    /// Seed for the world RNG; `None` seeds from entropy.
    pub rng_seed: Option<u64>,
    /// Bounded length of the in-memory tick summary history.
    pub history_capacity: usize,
    /// Emit a recorder batch every this many ticks; `0` disables batches.
    pub record_interval: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            half_width: 4.0,
            half_depth: 5.0,
            boundary: BoundaryPolicy::default(),
            radii: InteractionRadii::default(),
            weights: RuleWeights::default(),
            limits: MotionLimits::default(),
            behaviors: BehaviorSet::default(),
            attention: AttentionProfile::default(),
            brownian: BrownianProfile::default(),
            spawn_separation: 0.5,
            spawn_attempts: 64,
            index_cell_size: 1.0,
            rng_seed: None,
            history_capacity: 256,
            record_interval: 1,
        }
    }
}

impl SwarmConfig {
    /// Reject configurations that cannot produce a runnable world. Weight
    /// normalization is checked separately and only warned about.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.half_width > 0.0) || !(self.half_depth > 0.0) {
            return Err(WorldError::InvalidConfig(
                "room half extents must be positive",
            ));
        }
        if !(self.limits.max_speed > 0.0) || !(self.limits.max_force > 0.0) {
            return Err(WorldError::InvalidConfig(
                "max_speed and max_force must be positive",
            ));
        }
        if !(self.radii.visual > 0.0) || !(self.radii.motor > 0.0) || !(self.radii.social > 0.0) {
            return Err(WorldError::InvalidConfig(
                "interaction radii must be positive",
            ));
        }
        if !(self.attention.span > 0.0) || !(self.attention.switching_time > 0.0) {
            return Err(WorldError::InvalidConfig(
                "attention span and switching time must be positive",
            ));
        }
        if !(self.attention.min_distance >= 0.0)
            || self.attention.min_distance > self.attention.max_distance
        {
            return Err(WorldError::InvalidConfig(
                "attention distance band must satisfy 0 <= min <= max",
            ));
        }
        if !(self.spawn_separation >= 0.0) {
            return Err(WorldError::InvalidConfig(
                "spawn_separation must be non-negative",
            ));
        }
        if self.spawn_attempts == 0 {
            return Err(WorldError::InvalidConfig(
                "spawn_attempts must be at least 1",
            ));
        }
        if !(self.index_cell_size > 0.0) {
            return Err(WorldError::InvalidConfig(
                "index_cell_size must be positive",
            ));
        }
        Ok(())
    }

    /// Build the world RNG from the configured seed, or from entropy when
    /// no seed was given.
    #[must_use]
    pub fn noise_source(&self) -> NoiseSource {
        let seed = self.rng_seed.unwrap_or_else(rand::random::<u64>);
        NoiseSource::seed_from_u64(seed)
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Phase of the attention lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttentionPhase {
    /// No lock; heading performs a random walk.
    #[default]
    Exploring,
    /// Locked on a beacon; self-attention weight ramps toward one and the
    /// agent drifts toward the target.
    Attending,
    /// Lock released; self-attention weight decays back toward zero.
    Disengaging,
}

/// Per-agent attention bookkeeping.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AttentionState {
    target: Option<usize>,
    previous_target: Option<usize>,
    timer: f32,
    phase: AttentionPhase,
    self_weight: f32,
}

impl AttentionState {
    /// Beacon index currently attended or most recently considered.
    #[must_use]
    pub fn target(&self) -> Option<usize> {
        self.target
    }

    #[must_use]
    pub fn previous_target(&self) -> Option<usize> {
        self.previous_target
    }

    #[must_use]
    pub fn phase(&self) -> AttentionPhase {
        self.phase
    }

    #[must_use]
    pub fn is_attending(&self) -> bool {
        self.phase == AttentionPhase::Attending
    }

    /// Weight of self-directed (beacon-seeking) motion, in `[0, 1]`.
    #[must_use]
    pub fn self_weight(&self) -> f32 {
        self.self_weight
    }

    /// Weight of flock-following motion. Complements [`Self::self_weight`]
    /// so the two always sum to one.
    #[must_use]
    pub fn joint_weight(&self) -> f32 {
        1.0 - self.self_weight
    }
}

struct AttentionOutput {
    displacement: (f32, f32),
    heading: f32,
}

/// Advance one agent's attention state and produce its drift and heading.
///
/// Switches target to the nearest beacon, gates entry into `Attending` on
/// the distance band, ramps the self-attention weight with smoothstep over
/// the switching time, and emits either a drift-diffusion step toward the
/// beacon (attending) or a heading-only random walk (otherwise).
fn update_attention(
    state: &mut AttentionState,
    profile: &AttentionProfile,
    position: Position,
    heading: f32,
    beacons: &[(f32, f32)],
    dt: f32,
    noise: &mut NoiseSource,
) -> Result<AttentionOutput, WorldError> {
    let Ok(nearest) = nearest_candidate(position.as_pair(), beacons) else {
        return Err(WorldError::NoAttentionTarget);
    };
    match state.target {
        Some(current) if current == nearest => {}
        previous => {
            // Target switch: restart the lock on the new beacon.
            state.previous_target = previous;
            state.target = Some(nearest);
            state.timer = 0.0;
            state.phase = AttentionPhase::Attending;
        }
    }

    let beacon = Position::new(beacons[nearest].0, beacons[nearest].1);
    let distance = position.distance_to(beacon);
    if state.phase == AttentionPhase::Exploring
        && distance >= profile.min_distance
        && distance <= profile.max_distance
    {
        state.phase = AttentionPhase::Attending;
        state.timer = 0.0;
    }

    state.timer += dt;
    match state.phase {
        AttentionPhase::Attending => {
            state.self_weight = smoothstep(state.timer / profile.switching_time);
            if state.timer >= profile.span {
                state.phase = AttentionPhase::Disengaging;
                state.timer = 0.0;
            }
        }
        AttentionPhase::Disengaging => {
            state.self_weight = 1.0 - smoothstep(state.timer / profile.switching_time);
            if state.timer >= profile.switching_time {
                state.phase = AttentionPhase::Exploring;
                state.timer = 0.0;
                state.self_weight = 0.0;
            }
        }
        AttentionPhase::Exploring => state.self_weight = 0.0,
    }

    let output = if state.phase == AttentionPhase::Attending {
        // Euler-Maruyama step: deterministic drift toward the beacon plus
        // Gaussian diffusion scaled by sqrt(dt), per axis.
        let dir = if distance > EPSILON {
            (
                (beacon.x - position.x) / distance,
                (beacon.y - position.y) / distance,
            )
        } else {
            (0.0, 0.0)
        };
        let drift = profile.base_drift * distance * dt;
        let sqrt_dt = dt.sqrt();
        let dx = drift * dir.0 + profile.noise_scale * sqrt_dt * noise.gaussian(0.0, 1.0);
        let dy = drift * dir.1 + profile.noise_scale * sqrt_dt * noise.gaussian(0.0, 1.0);
        let heading = if distance > EPSILON {
            rotate_towards(heading, dir.1.atan2(dir.0), profile.rotation_speed)
        } else {
            heading
        };
        AttentionOutput {
            displacement: (dx, dy),
            heading,
        }
    } else {
        AttentionOutput {
            displacement: (0.0, 0.0),
            heading: wrap_signed_angle(heading + noise.gaussian(0.0, profile.wander_scale) * dt),
        }
    };
    Ok(output)
}

// ---------------------------------------------------------------------------
// Flocking rules
// ---------------------------------------------------------------------------

/// A sensed neighbor: column index plus squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborHit {
    pub idx: usize,
    pub dist_sq: f32,
}

/// Steer from the current velocity toward a desired direction at max speed,
/// clamped to the force ceiling. A near-zero desired vector yields no force.
fn steer_toward(desired: Velocity, velocity: Velocity, limits: &MotionLimits) -> Velocity {
    let mag = desired.magnitude();
    if mag <= EPSILON {
        return Velocity::ZERO;
    }
    desired
        .scaled(limits.max_speed / mag)
        .plus(velocity.scaled(-1.0))
        .clamped(limits.max_force)
}

/// Alignment: steer toward the average velocity of neighbors within the
/// visual radius. Zero neighbors contribute zero force.
#[must_use]
pub fn align_force(
    hits: &[NeighborHit],
    velocities: &[Velocity],
    velocity: Velocity,
    visual: f32,
    limits: &MotionLimits,
) -> Velocity {
    let visual_sq = visual * visual;
    let mut sum = Velocity::ZERO;
    let mut count = 0u32;
    for hit in hits {
        if hit.dist_sq < visual_sq {
            sum = sum.plus(velocities[hit.idx]);
            count += 1;
        }
    }
    if count == 0 {
        return Velocity::ZERO;
    }
    steer_toward(sum.scaled(1.0 / count as f32), velocity, limits)
}

/// Cohesion: steer toward the average position of neighbors within the
/// motor radius. Zero neighbors contribute zero force.
#[must_use]
pub fn amass_force(
    hits: &[NeighborHit],
    positions: &[Position],
    position: Position,
    velocity: Velocity,
    motor: f32,
    limits: &MotionLimits,
) -> Velocity {
    let motor_sq = motor * motor;
    let mut sum_x = 0.0f32;
    let mut sum_y = 0.0f32;
    let mut count = 0u32;
    for hit in hits {
        if hit.dist_sq < motor_sq {
            sum_x += positions[hit.idx].x;
            sum_y += positions[hit.idx].y;
            count += 1;
        }
    }
    if count == 0 {
        return Velocity::ZERO;
    }
    let inv = 1.0 / count as f32;
    let desired = Velocity::new(sum_x * inv - position.x, sum_y * inv - position.y);
    steer_toward(desired, velocity, limits)
}

/// Separation: steer away from neighbors within the social radius. Each
/// contribution is the offset away from the neighbor scaled by the radius.
/// Zero neighbors contribute zero force.
#[must_use]
pub fn avoid_force(
    hits: &[NeighborHit],
    positions: &[Position],
    position: Position,
    velocity: Velocity,
    social: f32,
    limits: &MotionLimits,
) -> Velocity {
    let social_sq = social * social;
    let mut sum = Velocity::ZERO;
    let mut count = 0u32;
    for hit in hits {
        if hit.dist_sq < social_sq {
            let away = Velocity::new(
                (position.x - positions[hit.idx].x) / social,
                (position.y - positions[hit.idx].y) / social,
            );
            sum = sum.plus(away);
            count += 1;
        }
    }
    if count == 0 {
        return Velocity::ZERO;
    }
    steer_toward(sum.scaled(1.0 / count as f32), velocity, limits)
}

/// Combined flocking acceleration for one agent: the three rules, each
/// clamped to the force ceiling, blended by the rule weights.
#[must_use]
pub fn flocking_acceleration(
    hits: &[NeighborHit],
    positions: &[Position],
    velocities: &[Velocity],
    position: Position,
    velocity: Velocity,
    radii: &InteractionRadii,
    weights: &RuleWeights,
    limits: &MotionLimits,
) -> Velocity {
    let align = align_force(hits, velocities, velocity, radii.visual, limits);
    let amass = amass_force(hits, positions, position, velocity, radii.motor, limits);
    let avoid = avoid_force(hits, positions, position, velocity, radii.social, limits);
    align
        .scaled(weights.visual)
        .plus(amass.scaled(weights.motor))
        .plus(avoid.scaled(weights.social))
}

/// Drift-diffusion step for a free Brownian walker: constant-rate drift
/// toward the nearest beacon plus Gaussian diffusion. With no beacons the
/// walker diffuses without drift.
fn brownian_displacement(
    profile: &BrownianProfile,
    position: Position,
    beacons: &[(f32, f32)],
    dt: f32,
    noise: &mut NoiseSource,
) -> (f32, f32) {
    let sqrt_dt = dt.sqrt();
    let mut dx = profile.noise_scale * sqrt_dt * noise.gaussian(0.0, 1.0);
    let mut dy = profile.noise_scale * sqrt_dt * noise.gaussian(0.0, 1.0);
    if let Ok(nearest) = nearest_candidate(position.as_pair(), beacons) {
        let beacon = Position::new(beacons[nearest].0, beacons[nearest].1);
        let distance = position.distance_to(beacon);
        if distance > EPSILON {
            dx += profile.drift * (beacon.x - position.x) / distance * dt;
            dy += profile.drift * (beacon.y - position.y) / distance * dt;
        }
    }
    (dx, dy)
}

// ---------------------------------------------------------------------------
// Agent storage
// ---------------------------------------------------------------------------

/// Kinematic state of a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentData {
    pub position: Position,
    pub velocity: Velocity,
    /// Facing direction in radians; follows velocity unless a behavior
    /// overrides it.
    pub heading: f32,
}

/// Struct-of-arrays storage for agent kinematics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    headings: Vec<f32>,
}

impl AgentColumns {
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    #[must_use]
    pub fn headings(&self) -> &[f32] {
        &self.headings
    }

    /// Positions as bare pairs, in column order, for index rebuilds.
    #[must_use]
    pub fn position_pairs(&self) -> Vec<(f32, f32)> {
        self.positions.iter().map(|p| p.as_pair()).collect()
    }

    fn push(&mut self, data: AgentData) {
        self.positions.push(data.position);
        self.velocities.push(data.velocity);
        self.headings.push(data.heading);
        self.debug_assert_coherent();
    }

    fn swap_remove(&mut self, idx: usize) -> AgentData {
        let data = AgentData {
            position: self.positions.swap_remove(idx),
            velocity: self.velocities.swap_remove(idx),
            heading: self.headings.swap_remove(idx),
        };
        self.debug_assert_coherent();
        data
    }

    fn get(&self, idx: usize) -> AgentData {
        AgentData {
            position: self.positions[idx],
            velocity: self.velocities[idx],
            heading: self.headings[idx],
        }
    }

    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.headings.len());
    }
}

/// Agent arena mapping stable handles to column slots.
///
/// Removal swap-removes the column row and patches the slot of the moved
/// agent, so handles stay valid across arbitrary removal order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl AgentArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: AgentData) -> AgentId {
        let idx = self.columns.len();
        let id = self.slots.insert(idx);
        self.handles.push(id);
        self.columns.push(data);
        id
    }

    pub fn remove(&mut self, id: AgentId) -> Option<AgentData> {
        let idx = self.slots.remove(id)?;
        let data = self.columns.swap_remove(idx);
        self.handles.swap_remove(idx);
        if idx < self.handles.len() {
            let moved = self.handles[idx];
            self.slots[moved] = idx;
        }
        Some(data)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Handles in column order.
    #[must_use]
    pub fn handles(&self) -> &[AgentId] {
        &self.handles
    }

    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Copy of one agent's kinematic state.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let idx = self.index_of(id)?;
        Some(self.columns.get(idx))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns = AgentColumns::default();
    }
}

/// Per-agent behavioral parameters, initialized from the world config and
/// overridable per agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentRuntime {
    pub radii: InteractionRadii,
    pub weights: RuleWeights,
    pub limits: MotionLimits,
    pub behaviors: BehaviorSet,
    pub attention: AttentionState,
}

impl AgentRuntime {
    #[must_use]
    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            radii: config.radii,
            weights: config.weights,
            limits: config.limits,
            behaviors: config.behaviors,
            attention: AttentionState::default(),
        }
    }
}

/// A named attention target at a fixed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub name: String,
    pub position: Position,
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// Aggregate measurements for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub agent_count: usize,
    pub mean_speed: f32,
    pub mean_self_weight: f32,
    /// Number of agents currently in the attending phase.
    pub attending: usize,
}

/// One agent's externally visible state at a recorded tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub data: AgentData,
    pub phase: AttentionPhase,
    pub self_weight: f32,
}

/// Full snapshot handed to a recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickBatch {
    pub summary: TickSummary,
    pub agents: Vec<AgentState>,
}

/// Sink for recorded tick batches. Implementations must not panic; a
/// recording failure is theirs to swallow or log.
pub trait WorldRecorder: Send {
    fn record_batch(&mut self, batch: &TickBatch);
}

/// Recorder that drops every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl WorldRecorder for NullRecorder {
    fn record_batch(&mut self, _batch: &TickBatch) {}
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

enum HeadingUpdate {
    FaceVelocity,
    Fixed(f32),
}

struct StagedUpdate {
    acceleration: Velocity,
    displacement: (f32, f32),
    heading: HeadingUpdate,
    max_speed: f32,
}

/// The simulation world: agents, beacons, index, and tick bookkeeping.
pub struct WorldState {
    config: SwarmConfig,
    tick: Tick,
    noise: NoiseSource,
    arena: AgentArena,
    runtime: AgentMap<AgentRuntime>,
    beacons: Vec<Beacon>,
    beacon_positions: Vec<(f32, f32)>,
    index: UniformGridIndex,
    recorder: Box<dyn WorldRecorder>,
    history: VecDeque<TickSummary>,
    missing_beacons_logged: bool,
}

impl WorldState {
    /// Build a world with the null recorder.
    pub fn new(config: SwarmConfig) -> Result<Self, WorldError> {
        Self::with_recorder(config, Box::new(NullRecorder))
    }

    /// Build a world that hands tick batches to the given recorder.
    pub fn with_recorder(
        config: SwarmConfig,
        recorder: Box<dyn WorldRecorder>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        if let Err(err) = config.weights.checked() {
            warn!(%err, "rule weights are not normalized; flocking forces will scale by their sum");
        }
        let noise = config.noise_source();
        let index = UniformGridIndex::new(config.index_cell_size, config.half_width, config.half_depth);
        Ok(Self {
            config,
            tick: Tick::default(),
            noise,
            arena: AgentArena::new(),
            runtime: AgentMap::default(),
            beacons: Vec::new(),
            beacon_positions: Vec::new(),
            index,
            recorder,
            history: VecDeque::new(),
            missing_beacons_logged: false,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn arena(&self) -> &AgentArena {
        &self.arena
    }

    #[must_use]
    pub fn beacons(&self) -> &[Beacon] {
        &self.beacons
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<TickSummary> {
        &self.history
    }

    pub fn set_recorder(&mut self, recorder: Box<dyn WorldRecorder>) {
        self.recorder = recorder;
    }

    /// Register an attention beacon; returns its index.
    pub fn add_beacon(&mut self, name: impl Into<String>, position: Position) -> usize {
        self.beacons.push(Beacon {
            name: name.into(),
            position,
        });
        self.beacon_positions.push(position.as_pair());
        self.beacons.len() - 1
    }

    /// Insert one agent with runtime parameters from the config. The
    /// attention target starts at the nearest beacon, when one exists.
    pub fn spawn_agent(&mut self, data: AgentData) -> AgentId {
        let mut runtime = AgentRuntime::from_config(&self.config);
        if let Ok(nearest) = nearest_candidate(data.position.as_pair(), &self.beacon_positions) {
            runtime.attention.target = Some(nearest);
            runtime.attention.previous_target = Some(nearest);
        }
        self.spawn_agent_with(data, runtime)
    }

    /// Insert one agent with explicit runtime parameters.
    pub fn spawn_agent_with(&mut self, data: AgentData, runtime: AgentRuntime) -> AgentId {
        let id = self.arena.insert(data);
        self.runtime.insert(id, runtime);
        id
    }

    pub fn remove_agent(&mut self, id: AgentId) -> Option<AgentData> {
        self.runtime.remove(id);
        self.arena.remove(id)
    }

    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentData> {
        self.arena.snapshot(id)
    }

    #[must_use]
    pub fn runtime(&self, id: AgentId) -> Option<&AgentRuntime> {
        self.runtime.get(id)
    }

    pub fn runtime_mut(&mut self, id: AgentId) -> Option<&mut AgentRuntime> {
        self.runtime.get_mut(id)
    }

    /// Place a group by rejection sampling: uniform positions in the room,
    /// re-drawn until each keeps the configured separation from everyone
    /// already placed. Spawned agents start at rest with a random heading.
    pub fn populate(&mut self, count: usize) -> Result<Vec<AgentId>, WorldError> {
        let min_sep_sq = self.config.spawn_separation * self.config.spawn_separation;
        let mut placed: Vec<Position> = self.arena.columns().positions().to_vec();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let mut position = None;
            for _ in 0..self.config.spawn_attempts {
                let candidate = Position::new(
                    self.noise.range(-self.config.half_width, self.config.half_width),
                    self.noise.range(-self.config.half_depth, self.config.half_depth),
                );
                if placed
                    .iter()
                    .all(|p| p.distance_sq_to(candidate) >= min_sep_sq)
                {
                    position = Some(candidate);
                    break;
                }
            }
            let Some(position) = position else {
                return Err(WorldError::SpawnExhausted {
                    placed: ids.len(),
                    requested: count,
                });
            };
            placed.push(position);
            let heading = self.noise.range(-PI, PI);
            let id = self.spawn_agent(AgentData {
                position,
                velocity: Velocity::ZERO,
                heading,
            });
            ids.push(id);
        }
        debug!(count = ids.len(), "populated agent group");
        Ok(ids)
    }

    /// Advance the world by one tick of `dt` seconds.
    pub fn step(&mut self, dt: f32) -> Result<TickSummary, WorldError> {
        if !(dt > 0.0) {
            return Err(WorldError::InvalidConfig("dt must be positive"));
        }
        let pairs = self.arena.columns().position_pairs();
        self.index.rebuild(&pairs)?;
        let hits = self.stage_sense();
        let staged = self.stage_steer(&hits, dt);
        self.stage_integrate(&staged, dt);
        let summary = self.stage_record();
        self.tick = self.tick.next();
        Ok(summary)
    }

    /// Collect each agent's neighbors within its widest interaction radius.
    /// Read-only over the rebuilt index, so agents fan out in parallel.
    fn stage_sense(&self) -> Vec<Vec<NeighborHit>> {
        let default_radius = self.config.radii.max_radius();
        let radii_sq: Vec<f32> = self
            .arena
            .handles()
            .iter()
            .map(|id| {
                let radius = self
                    .runtime
                    .get(*id)
                    .map_or(default_radius, |agent| agent.radii.max_radius());
                radius * radius
            })
            .collect();
        let index = &self.index;
        radii_sq
            .into_par_iter()
            .enumerate()
            .map(|(idx, radius_sq)| {
                let mut found = Vec::new();
                index.neighbors_within(idx, radius_sq, &mut |other, d_sq: OrderedFloat<f32>| {
                    found.push(NeighborHit {
                        idx: other,
                        dist_sq: d_sq.into_inner(),
                    });
                });
                found
            })
            .collect()
    }

    /// Compute every agent's staged update against the tick-start snapshot.
    /// Runs serially in handle order so RNG draws are reproducible.
    fn stage_steer(&mut self, hits: &[Vec<NeighborHit>], dt: f32) -> Vec<StagedUpdate> {
        let Self {
            config,
            noise,
            arena,
            runtime,
            beacon_positions,
            missing_beacons_logged,
            ..
        } = self;
        let positions = arena.columns().positions();
        let velocities = arena.columns().velocities();
        let headings = arena.columns().headings();

        let mut staged = Vec::with_capacity(arena.len());
        for (idx, id) in arena.handles().iter().enumerate() {
            let Some(agent) = runtime.get_mut(*id) else {
                staged.push(StagedUpdate {
                    acceleration: Velocity::ZERO,
                    displacement: (0.0, 0.0),
                    heading: HeadingUpdate::FaceVelocity,
                    max_speed: config.limits.max_speed,
                });
                continue;
            };
            let mut acceleration = Velocity::ZERO;
            let mut displacement = (0.0f32, 0.0f32);
            let mut heading = HeadingUpdate::FaceVelocity;
            let mut attention_live = false;

            if agent.behaviors.attention {
                match update_attention(
                    &mut agent.attention,
                    &config.attention,
                    positions[idx],
                    headings[idx],
                    beacon_positions,
                    dt,
                    noise,
                ) {
                    Ok(out) => {
                        attention_live = true;
                        displacement.0 += out.displacement.0;
                        displacement.1 += out.displacement.1;
                        heading = HeadingUpdate::Fixed(out.heading);
                    }
                    Err(_) => {
                        // No beacons: this agent degrades to flock-only
                        // behavior for the tick, the loop keeps running.
                        agent.attention = AttentionState::default();
                        if !*missing_beacons_logged {
                            debug!("attention enabled but no beacons registered");
                            *missing_beacons_logged = true;
                        }
                    }
                }
            }

            if agent.behaviors.flocking {
                let joint = if attention_live {
                    agent.attention.joint_weight()
                } else {
                    1.0
                };
                acceleration = flocking_acceleration(
                    &hits[idx],
                    positions,
                    velocities,
                    positions[idx],
                    velocities[idx],
                    &agent.radii,
                    &agent.weights,
                    &agent.limits,
                )
                .scaled(joint);
            }

            if agent.behaviors.brownian {
                let (dx, dy) = brownian_displacement(
                    &config.brownian,
                    positions[idx],
                    beacon_positions,
                    dt,
                    noise,
                );
                displacement.0 += dx;
                displacement.1 += dy;
            }

            staged.push(StagedUpdate {
                acceleration,
                displacement,
                heading,
                max_speed: agent.limits.max_speed,
            });
        }
        staged
    }

    /// Apply staged updates: move, bound, accelerate, clamp, face.
    fn stage_integrate(&mut self, staged: &[StagedUpdate], dt: f32) {
        let Self {
            config,
            noise,
            arena,
            ..
        } = self;
        let columns = &mut arena.columns;
        for (idx, update) in staged.iter().enumerate() {
            let position = &mut columns.positions[idx];
            let velocity = &mut columns.velocities[idx];

            position.x += velocity.vx * dt + update.displacement.0;
            position.y += velocity.vy * dt + update.displacement.1;
            apply_boundary(position, velocity, config, noise);

            *velocity = velocity
                .plus(update.acceleration.scaled(dt))
                .clamped(update.max_speed);

            match update.heading {
                HeadingUpdate::Fixed(heading) => columns.headings[idx] = wrap_signed_angle(heading),
                HeadingUpdate::FaceVelocity => {
                    if velocity.magnitude() > EPSILON {
                        columns.headings[idx] = velocity.bearing();
                    }
                }
            }
        }
        columns.debug_assert_coherent();
    }

    /// Summarize the tick, append to the bounded history, and hand a batch
    /// to the recorder on the configured interval.
    fn stage_record(&mut self) -> TickSummary {
        let count = self.arena.len();
        let mut speed_sum = 0.0f32;
        let mut weight_sum = 0.0f32;
        let mut attending = 0usize;
        for (idx, id) in self.arena.handles().iter().enumerate() {
            speed_sum += self.arena.columns().velocities()[idx].magnitude();
            if let Some(agent) = self.runtime.get(*id) {
                weight_sum += agent.attention.self_weight();
                if agent.attention.is_attending() {
                    attending += 1;
                }
            }
        }
        let inv = if count > 0 { 1.0 / count as f32 } else { 0.0 };
        let summary = TickSummary {
            tick: self.tick,
            agent_count: count,
            mean_speed: speed_sum * inv,
            mean_self_weight: weight_sum * inv,
            attending,
        };

        self.history.push_back(summary.clone());
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }

        if self.config.record_interval > 0 && self.tick.0 % self.config.record_interval == 0 {
            let agents = self
                .arena
                .handles()
                .iter()
                .enumerate()
                .map(|(idx, id)| {
                    let attention = self
                        .runtime
                        .get(*id)
                        .map(|agent| agent.attention)
                        .unwrap_or_default();
                    AgentState {
                        id: *id,
                        data: self.arena.columns().get(idx),
                        phase: attention.phase(),
                        self_weight: attention.self_weight(),
                    }
                })
                .collect();
            let batch = TickBatch {
                summary: summary.clone(),
                agents,
            };
            self.recorder.record_batch(&batch);
        }
        summary
    }
}

/// Confine a position to the room according to the boundary policy,
/// adjusting the velocity on reflection.
fn apply_boundary(
    position: &mut Position,
    velocity: &mut Velocity,
    config: &SwarmConfig,
    noise: &mut NoiseSource,
) {
    let hw = config.half_width;
    let hd = config.half_depth;
    match config.boundary {
        BoundaryPolicy::Clamp { jitter } => {
            if position.x > hw {
                position.x = hw - noise.range(0.0, jitter.max(EPSILON));
            } else if position.x < -hw {
                position.x = -hw + noise.range(0.0, jitter.max(EPSILON));
            }
            if position.y > hd {
                position.y = hd - noise.range(0.0, jitter.max(EPSILON));
            } else if position.y < -hd {
                position.y = -hd + noise.range(0.0, jitter.max(EPSILON));
            }
        }
        BoundaryPolicy::Reflect => {
            if position.x > hw {
                position.x = hw;
                *velocity = reflect(*velocity, (1.0, 0.0));
            } else if position.x < -hw {
                position.x = -hw;
                *velocity = reflect(*velocity, (1.0, 0.0));
            }
            if position.y > hd {
                position.y = hd;
                *velocity = reflect(*velocity, (0.0, 1.0));
            } else if position.y < -hd {
                position.y = -hd;
                *velocity = reflect(*velocity, (0.0, 1.0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MotionLimits {
        MotionLimits::default()
    }

    #[test]
    fn gaussian_moments_are_standard_normal() {
        let mut noise = NoiseSource::seed_from_u64(42);
        let samples: Vec<f32> = (0..100_000).map(|_| noise.gaussian(0.0, 1.0)).collect();
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>()
            / samples.len() as f32;
        assert!(mean.abs() < 0.02, "mean {mean} too far from 0");
        assert!((var.sqrt() - 1.0).abs() < 0.05, "std {} too far from 1", var.sqrt());
    }

    #[test]
    fn gaussian_draws_are_reproducible_per_seed() {
        let mut a = NoiseSource::seed_from_u64(7);
        let mut b = NoiseSource::seed_from_u64(7);
        for _ in 0..64 {
            assert_eq!(a.gaussian(2.0, 0.5).to_bits(), b.gaussian(2.0, 0.5).to_bits());
        }
    }

    #[test]
    fn smoothstep_hits_endpoints_and_midpoint() {
        assert_eq!(smoothstep(0.0), 0.0);
        assert_eq!(smoothstep(1.0), 1.0);
        assert_eq!(smoothstep(-3.0), 0.0);
        assert_eq!(smoothstep(2.0), 1.0);
        assert!((smoothstep(0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn rotate_towards_never_overshoots() {
        let turned = rotate_towards(0.0, 1.0, 0.1);
        assert!((turned - 0.1).abs() < 1e-6);
        let reached = rotate_towards(0.95, 1.0, 0.1);
        assert!((reached - 1.0).abs() < 1e-6);
        // Shortest path crosses the PI seam.
        let seam = rotate_towards(3.0, -3.0, 0.1);
        assert!(seam > 3.0);
    }

    #[test]
    fn reflect_is_involutive() {
        let v = Velocity::new(1.3, -0.7);
        let twice = reflect(reflect(v, (1.0, 0.0)), (1.0, 0.0));
        assert!((twice.vx - v.vx).abs() < 1e-6);
        assert!((twice.vy - v.vy).abs() < 1e-6);
        let mirrored = reflect(v, (1.0, 0.0));
        assert_eq!(mirrored.vx, -v.vx);
        assert_eq!(mirrored.vy, v.vy);
    }

    #[test]
    fn clamped_rescales_instead_of_truncating() {
        let v = Velocity::new(3.0, 4.0);
        let clamped = v.clamped(2.5);
        assert!((clamped.magnitude() - 2.5).abs() < 1e-5);
        // Direction preserved.
        assert!((clamped.vy / clamped.vx - v.vy / v.vx).abs() < 1e-5);
        let small = Velocity::new(0.1, 0.1);
        assert_eq!(small.clamped(2.5), small);
    }

    #[test]
    fn arena_swap_remove_keeps_handles_coherent() {
        let mut arena = AgentArena::new();
        let a = arena.insert(AgentData {
            position: Position::new(1.0, 0.0),
            ..AgentData::default()
        });
        let b = arena.insert(AgentData {
            position: Position::new(2.0, 0.0),
            ..AgentData::default()
        });
        let c = arena.insert(AgentData {
            position: Position::new(3.0, 0.0),
            ..AgentData::default()
        });
        assert_eq!(arena.len(), 3);
        let removed = arena.remove(a).unwrap();
        assert_eq!(removed.position.x, 1.0);
        assert!(!arena.contains(a));
        // c moved into a's slot.
        assert_eq!(arena.index_of(c), Some(0));
        assert_eq!(arena.snapshot(c).unwrap().position.x, 3.0);
        assert_eq!(arena.snapshot(b).unwrap().position.x, 2.0);
        assert!(arena.remove(a).is_none());
    }

    #[test]
    fn default_config_is_valid() {
        SwarmConfig::default().validate().unwrap();
    }

    #[test]
    fn config_rejects_bad_extents_and_limits() {
        let mut config = SwarmConfig {
            half_width: 0.0,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WorldError::InvalidConfig(_))
        ));
        config.half_width = 4.0;
        config.limits.max_speed = -1.0;
        assert!(matches!(
            config.validate(),
            Err(WorldError::InvalidConfig(_))
        ));
        config.limits = MotionLimits::default();
        config.attention.min_distance = 30.0;
        assert!(matches!(
            config.validate(),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn weights_checked_flags_bad_sum() {
        RuleWeights::default().checked().unwrap();
        let skewed = RuleWeights {
            visual: 0.5,
            motor: 0.5,
            social: 0.5,
        };
        match skewed.checked() {
            Err(WorldError::InvalidWeights { sum }) => assert!((sum - 1.5).abs() < 1e-6),
            other => panic!("expected InvalidWeights, got {other:?}"),
        }
    }

    #[test]
    fn rules_with_zero_neighbors_return_zero_force() {
        let positions = [Position::new(0.0, 0.0)];
        let velocities = [Velocity::new(1.0, 0.0)];
        let hits: Vec<NeighborHit> = Vec::new();
        let l = limits();
        assert_eq!(
            align_force(&hits, &velocities, velocities[0], 1.0, &l),
            Velocity::ZERO
        );
        assert_eq!(
            amass_force(&hits, &positions, positions[0], velocities[0], 2.5, &l),
            Velocity::ZERO
        );
        assert_eq!(
            avoid_force(&hits, &positions, positions[0], velocities[0], 0.5, &l),
            Velocity::ZERO
        );
    }

    #[test]
    fn avoid_ignores_neighbors_outside_social_distance() {
        let positions = [Position::new(0.0, 0.0), Position::new(1.0, 0.0)];
        let velocities = [Velocity::ZERO, Velocity::ZERO];
        let hits = [NeighborHit {
            idx: 1,
            dist_sq: positions[0].distance_sq_to(positions[1]),
        }];
        let force = avoid_force(&hits, &positions, positions[0], velocities[0], 0.5, &limits());
        assert_eq!(force, Velocity::ZERO);
    }

    #[test]
    fn avoid_pushes_away_from_close_neighbor() {
        let positions = [Position::new(0.0, 0.0), Position::new(0.3, 0.0)];
        let velocities = [Velocity::ZERO, Velocity::ZERO];
        let hits = [NeighborHit {
            idx: 1,
            dist_sq: positions[0].distance_sq_to(positions[1]),
        }];
        let l = limits();
        let force = avoid_force(&hits, &positions, positions[0], velocities[0], 0.5, &l);
        assert!(force.vx < 0.0, "force should point away from the neighbor");
        assert!(force.vy.abs() < 1e-6);
        assert!(force.magnitude() <= l.max_force + 1e-5);
    }

    #[test]
    fn align_steers_toward_average_neighbor_velocity() {
        let positions = [Position::new(0.0, 0.0), Position::new(0.5, 0.0)];
        let velocities = [Velocity::ZERO, Velocity::new(0.0, 2.0)];
        let hits = [NeighborHit {
            idx: 1,
            dist_sq: positions[0].distance_sq_to(positions[1]),
        }];
        let l = limits();
        let force = align_force(&hits, &velocities, velocities[0], 1.0, &l);
        assert!(force.vy > 0.0);
        assert!(force.vx.abs() < 1e-6);
        assert!(force.magnitude() <= l.max_force + 1e-5);
    }

    #[test]
    fn amass_steers_toward_neighbor_centroid() {
        let positions = [
            Position::new(0.0, 0.0),
            Position::new(1.0, 1.0),
            Position::new(1.0, -1.0),
        ];
        let velocities = [Velocity::ZERO; 3];
        let hits = [
            NeighborHit {
                idx: 1,
                dist_sq: positions[0].distance_sq_to(positions[1]),
            },
            NeighborHit {
                idx: 2,
                dist_sq: positions[0].distance_sq_to(positions[2]),
            },
        ];
        let l = limits();
        let force = amass_force(&hits, &positions, positions[0], velocities[0], 2.5, &l);
        // Centroid is at (1, 0).
        assert!(force.vx > 0.0);
        assert!(force.vy.abs() < 1e-5);
        assert!(force.magnitude() <= l.max_force + 1e-5);
    }

    #[test]
    fn attention_without_beacons_is_an_error() {
        let mut state = AttentionState::default();
        let mut noise = NoiseSource::seed_from_u64(1);
        let result = update_attention(
            &mut state,
            &AttentionProfile::default(),
            Position::new(0.0, 0.0),
            0.0,
            &[],
            0.1,
            &mut noise,
        );
        assert!(matches!(result, Err(WorldError::NoAttentionTarget)));
    }

    #[test]
    fn attention_locks_within_band_then_decays() {
        let profile = AttentionProfile {
            span: 4.0,
            switching_time: 1.0,
            min_distance: 5.0,
            max_distance: 20.0,
            ..AttentionProfile::default()
        };
        let mut state = AttentionState::default();
        state.target = Some(0);
        state.previous_target = Some(0);
        let beacons = [(10.0, 0.0)];
        let mut noise = NoiseSource::seed_from_u64(3);
        let position = Position::new(0.0, 0.0);
        let dt = 0.1;

        // Ramp-up: weight reaches 1 within switching_time.
        let mut ticks = 0;
        while ticks < 10 {
            update_attention(&mut state, &profile, position, 0.0, &beacons, dt, &mut noise)
                .unwrap();
            assert!((state.self_weight() + state.joint_weight() - 1.0).abs() < 1e-6);
            ticks += 1;
        }
        assert_eq!(state.phase(), AttentionPhase::Attending);
        assert!(state.self_weight() > 0.99);

        // Hold until the span elapses, then the weight decays.
        while state.phase() == AttentionPhase::Attending {
            update_attention(&mut state, &profile, position, 0.0, &beacons, dt, &mut noise)
                .unwrap();
        }
        assert_eq!(state.phase(), AttentionPhase::Disengaging);
        let mut previous = state.self_weight();
        for _ in 0..5 {
            update_attention(&mut state, &profile, position, 0.0, &beacons, dt, &mut noise)
                .unwrap();
            assert!(state.self_weight() <= previous + 1e-6);
            previous = state.self_weight();
        }
    }

    #[test]
    fn attention_ignores_beacons_outside_band() {
        let profile = AttentionProfile {
            min_distance: 5.0,
            max_distance: 20.0,
            ..AttentionProfile::default()
        };
        let mut state = AttentionState::default();
        state.target = Some(0);
        state.previous_target = Some(0);
        // Beacon closer than min_distance never triggers attending.
        let beacons = [(1.0, 0.0)];
        let mut noise = NoiseSource::seed_from_u64(5);
        for _ in 0..20 {
            update_attention(
                &mut state,
                &profile,
                Position::new(0.0, 0.0),
                0.0,
                &beacons,
                0.1,
                &mut noise,
            )
            .unwrap();
        }
        assert_eq!(state.phase(), AttentionPhase::Exploring);
        assert_eq!(state.self_weight(), 0.0);
    }

    #[test]
    fn attention_switch_resets_the_lock() {
        let profile = AttentionProfile {
            min_distance: 0.5,
            max_distance: 20.0,
            ..AttentionProfile::default()
        };
        let mut state = AttentionState::default();
        let near = (2.0, 0.0);
        let far = (9.0, 0.0);
        let mut noise = NoiseSource::seed_from_u64(9);
        // First beacon set: index 1 is nearest.
        update_attention(
            &mut state,
            &profile,
            Position::new(0.0, 0.0),
            0.0,
            &[far, near],
            0.1,
            &mut noise,
        )
        .unwrap();
        assert_eq!(state.target(), Some(1));
        // Agent teleported next to the other beacon: target switches and the
        // lock restarts.
        update_attention(
            &mut state,
            &profile,
            Position::new(8.0, 0.0),
            0.0,
            &[far, near],
            0.1,
            &mut noise,
        )
        .unwrap();
        assert_eq!(state.target(), Some(0));
        assert_eq!(state.previous_target(), Some(1));
        assert_eq!(state.phase(), AttentionPhase::Attending);
        assert!(state.timer <= 0.1 + 1e-6);
    }

    #[test]
    fn boundary_clamp_keeps_agent_inside_room() {
        let config = SwarmConfig::default();
        let mut noise = NoiseSource::seed_from_u64(11);
        let mut position = Position::new(7.5, -9.0);
        let mut velocity = Velocity::new(1.0, -1.0);
        apply_boundary(&mut position, &mut velocity, &config, &mut noise);
        assert!(position.x <= config.half_width && position.x > config.half_width - 0.011);
        assert!(position.y >= -config.half_depth && position.y < -config.half_depth + 0.011);
        // Clamp leaves velocity untouched.
        assert_eq!(velocity, Velocity::new(1.0, -1.0));
    }

    #[test]
    fn boundary_reflect_negates_normal_component() {
        let config = SwarmConfig {
            boundary: BoundaryPolicy::Reflect,
            ..SwarmConfig::default()
        };
        let mut noise = NoiseSource::seed_from_u64(13);
        let mut position = Position::new(4.09, 0.0);
        let mut velocity = Velocity::new(1.0, 0.5);
        apply_boundary(&mut position, &mut velocity, &config, &mut noise);
        assert_eq!(position.x, 4.0);
        assert_eq!(velocity.vx, -1.0);
        assert_eq!(velocity.vy, 0.5);
    }

    #[test]
    fn brownian_walker_drifts_toward_beacon() {
        let profile = BrownianProfile {
            drift: 1.0,
            noise_scale: 0.0,
        };
        let mut noise = NoiseSource::seed_from_u64(17);
        let (dx, dy) = brownian_displacement(
            &profile,
            Position::new(0.0, 0.0),
            &[(3.0, 4.0)],
            0.1,
            &mut noise,
        );
        // Unit direction (0.6, 0.8) times drift times dt.
        assert!((dx - 0.06).abs() < 1e-6);
        assert!((dy - 0.08).abs() < 1e-6);
    }

    #[test]
    fn brownian_walker_without_beacons_only_diffuses() {
        let profile = BrownianProfile::default();
        let mut noise = NoiseSource::seed_from_u64(19);
        let (dx, dy) =
            brownian_displacement(&profile, Position::new(0.0, 0.0), &[], 0.1, &mut noise);
        let bound = profile.noise_scale * 0.1f32.sqrt() * 6.0;
        assert!(dx.abs() < bound && dy.abs() < bound);
    }
}
