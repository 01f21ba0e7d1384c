//! # PhaseNet Engine
//!
//! Discrete-time simulation of a network of abstract spiking neurons.
//!
//! Every step is a synchronous generation: all inbound sums are computed from
//! a frozen copy of the previous potentials and activations, then every
//! neuron is transformed at once.
//!
//! Update rules, from simplest to richest:
//! - Binary: leak + inbound sum, saturate to Vmax at threshold
//! - Weighted: signed per-column normalized synapses, clamp to [Vmin, Vmax]
//! - Psychoactive: weighted synapses with a subset of rows rescaled by `ca`
//! - Phase: rise, fall, post-depolarization, hyperpolarization and rest,
//!   with a recovery penalty (lambda) on the next attainable peak
//!
//! The [`Model`] driver decides each step whether to re-feed a fully rested
//! network, cold-start a non-transmittable one, or advance one generation.

use ndarray::{Array1, Array2};
use phasenet_core::{
    validate_beta, validate_ca, validate_delta_t, validate_gamma, Generation, ModelConfig,
    NetError, NetworkParams, NeuronConstants, Result, Time, Variant, Voltage,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use tracing::{debug, info, trace};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ============================================================================
// LINK MATRIX
// ============================================================================

/// Probability that two neurons within range of each other are linked
pub const DISTANCE_LINK_PROBABILITY: f64 = 0.8;

/// Planar neuron position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// Link matrix construction policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkPolicy {
    /// Bernoulli {0, 1} with the configured connection probability
    Unweighted,
    /// Bernoulli {0, 1} between neurons no further apart than `radius`
    DistanceGated { points: Vec<Point>, radius: f64 },
    /// Unweighted, then each column replaced by a signed random partition of 1
    ProportionallyWeighted,
}

/// Inbound contribution of one neuron, split into its own leak and what it
/// receives from emitting peers
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Inbound {
    pub leak: f64,
    pub peers: f64,
}

impl Inbound {
    pub fn total(&self) -> f64 {
        self.leak + self.peers
    }
}

/// N x N inbound matrix: `weights[[i, j]]` is what neuron j sends to neuron i.
///
/// The diagonal always holds the self-leak term `gamma / beta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMatrix {
    weights: Array2<f64>,
}

impl LinkMatrix {
    /// Build a matrix for `config.params.neurons` neurons under `policy`
    pub fn build<R: Rng + ?Sized>(
        policy: &LinkPolicy,
        config: &ModelConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let n = config.params.neurons;
        let p = config.params.connection_probability;
        let self_leak = config.self_leak();

        let links = match policy {
            LinkPolicy::Unweighted => Self::unweighted(n, p, self_leak, rng),
            LinkPolicy::DistanceGated { points, radius } => {
                if points.len() != n {
                    return Err(NetError::DimensionMismatch {
                        expected: n,
                        got: points.len(),
                    });
                }
                Self::distance_gated(points, *radius, self_leak, rng)?
            }
            LinkPolicy::ProportionallyWeighted => {
                let mut links = Self::unweighted(n, p, self_leak, rng);
                links.distribute_weights(rng);
                links
            }
        };

        debug!(neurons = n, connections = links.connection_count(), "built link matrix");
        Ok(links)
    }

    /// Random binary connectivity
    pub fn unweighted<R: Rng + ?Sized>(n: usize, p: f64, self_leak: f64, rng: &mut R) -> Self {
        let mut weights = Array2::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                weights[[i, j]] = if i == j {
                    self_leak
                } else if rng.gen_bool(p) {
                    1.0
                } else {
                    0.0
                };
            }
        }
        Self { weights }
    }

    /// Binary connectivity restricted to pairs within `radius`
    pub fn distance_gated<R: Rng + ?Sized>(
        points: &[Point],
        radius: f64,
        self_leak: f64,
        rng: &mut R,
    ) -> Result<Self> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(NetError::InvalidRadius(radius));
        }

        let n = points.len();
        let r2 = radius * radius;
        let mut weights = Array2::zeros((n, n));

        for i in 0..n {
            for j in 0..n {
                weights[[i, j]] = if i == j {
                    self_leak
                } else if points[i].distance_squared(&points[j]) <= r2
                    && rng.gen_bool(DISTANCE_LINK_PROBABILITY)
                {
                    1.0
                } else {
                    0.0
                };
            }
        }

        Ok(Self { weights })
    }

    /// Wrap a caller-supplied connectivity matrix, forcing the diagonal to `self_leak`
    pub fn from_connectivity(mut weights: Array2<f64>, self_leak: f64) -> Result<Self> {
        let (rows, cols) = weights.dim();
        if rows != cols {
            return Err(NetError::DimensionMismatch {
                expected: rows,
                got: cols,
            });
        }
        weights.diag_mut().fill(self_leak);
        Ok(Self { weights })
    }

    /// Replace the nonzero off-diagonal entries of every column with a random
    /// partition of 1, each part given a random sign.
    ///
    /// Columns without connections are left untouched.
    pub fn distribute_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let n = self.len();

        for col in 0..n {
            let count = self.column_connections(col);
            if count == 0 {
                continue;
            }

            // 1 - [0, 1) keeps every part strictly positive
            let mut parts: Vec<f64> = (0..count).map(|_| 1.0 - rng.gen::<f64>()).collect();
            let sum: f64 = parts.iter().sum();
            parts.iter_mut().for_each(|part| *part /= sum);

            let mut k = 0;
            for row in 0..n {
                if row != col && self.weights[[row, col]] != 0.0 {
                    let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                    self.weights[[row, col]] = sign * parts[k];
                    k += 1;
                }
            }
        }
    }

    /// Rescale every inbound weight of `round(N * |ca|)` randomly chosen
    /// neurons by `1 + ca`. Returns the affected neurons in ascending order.
    ///
    /// Column sums are not renormalized afterwards.
    pub fn modulate<R: Rng + ?Sized>(&mut self, ca: f64, rng: &mut R) -> Vec<usize> {
        let n = self.len();
        let count = ((n as f64) * ca.abs()).round() as usize;
        let count = count.min(n);

        let mut affected = rand::seq::index::sample(rng, n, count).into_vec();
        affected.sort_unstable();

        let factor = 1.0 + ca;
        for &i in &affected {
            for j in 0..n {
                if i != j {
                    self.weights[[i, j]] *= factor;
                }
            }
        }

        debug!(ca, affected = affected.len(), "applied pharmacological modulation");
        affected
    }

    /// Rewrite the diagonal after beta or gamma changed
    pub fn set_self_leak(&mut self, self_leak: f64) {
        self.weights.diag_mut().fill(self_leak);
    }

    pub fn len(&self) -> usize {
        self.weights.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn get(&self, target: usize, source: usize) -> f64 {
        self.weights[[target, source]]
    }

    /// Nonzero off-diagonal entries of column `col` (targets of neuron `col`)
    pub fn column_connections(&self, col: usize) -> usize {
        self.weights
            .column(col)
            .iter()
            .enumerate()
            .filter(|&(row, &w)| row != col && w != 0.0)
            .count()
    }

    /// Sum of absolute off-diagonal weights in column `col`
    pub fn column_abs_sum(&self, col: usize) -> f64 {
        self.weights
            .column(col)
            .iter()
            .enumerate()
            .filter(|&(row, _)| row != col)
            .map(|(_, w)| w.abs())
            .sum()
    }

    /// Total number of off-diagonal connections
    pub fn connection_count(&self) -> usize {
        (0..self.len()).map(|col| self.column_connections(col)).sum()
    }

    /// Inbound sum of neuron `i`:
    /// `beta * sum_j links[i][j] * potential[j] * effective_activation[j]`.
    ///
    /// The own term only counts while `i` is silent; emitting peers transmit
    /// `potential[j] - offset`.
    pub fn inbound(
        &self,
        i: usize,
        beta: f64,
        potential: &Array1<f64>,
        active: &[bool],
        offset: Voltage,
    ) -> Inbound {
        let row = self.weights.row(i);
        let leak = if active[i] {
            0.0
        } else {
            beta * row[i] * potential[i]
        };

        let peers: f64 = row
            .iter()
            .enumerate()
            .filter(|&(j, &w)| j != i && active[j] && w != 0.0)
            .map(|(j, &w)| w * (potential[j] - offset))
            .sum();

        Inbound {
            leak,
            peers: beta * peers,
        }
    }
}

// ============================================================================
// NEURON STATE
// ============================================================================

/// Potentials and emitting flags of every neuron, index-aligned with the links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronVector {
    pub potential: Array1<f64>,
    pub active: Vec<bool>,
}

impl NeuronVector {
    pub fn new(n: usize) -> Self {
        Self {
            potential: Array1::zeros(n),
            active: vec![false; n],
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn any_active(&self) -> bool {
        self.active.iter().any(|&a| a)
    }

    /// Every potential is exactly zero
    pub fn all_at_rest(&self) -> bool {
        self.potential.iter().all(|&v| v == 0.0)
    }
}

/// Inbound sums of every neuron, read from the frozen `state`
fn inbound_all(links: &LinkMatrix, beta: f64, state: &NeuronVector, offset: Voltage) -> Vec<Inbound> {
    #[cfg(feature = "parallel")]
    {
        (0..state.len())
            .into_par_iter()
            .map(|i| links.inbound(i, beta, &state.potential, &state.active, offset))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        (0..state.len())
            .map(|i| links.inbound(i, beta, &state.potential, &state.active, offset))
            .collect()
    }
}

// ============================================================================
// ACTIVATION FUNCTIONS
// ============================================================================

/// Identity below threshold, Vmax at or above it
pub fn binary_activation(v: Voltage, c: &NeuronConstants) -> Voltage {
    if v >= c.threshold {
        c.v_max
    } else {
        v
    }
}

/// Vmax above threshold, Vmin below the floor, identity in between
pub fn clamped_activation(v: Voltage, c: &NeuronConstants) -> Voltage {
    if v > c.threshold {
        c.v_max
    } else if v < c.v_min {
        c.v_min
    } else {
        v
    }
}

/// One generation of a history-free rule
fn advance_saturating(
    config: &ModelConfig,
    links: &LinkMatrix,
    state: &mut NeuronVector,
    activation: fn(Voltage, &NeuronConstants) -> Voltage,
) {
    let c = &config.neuron;
    let inbound = inbound_all(links, config.params.beta, state, 0.0);

    let potential = Array1::from_iter(inbound.iter().map(|s| activation(s.total(), c)));
    let active = potential.iter().map(|&v| v == c.v_max).collect();

    *state = NeuronVector { potential, active };
}

/// Add `increments` and pass the result through `activation`
fn stimulate_saturating(
    config: &ModelConfig,
    state: &mut NeuronVector,
    increments: &[f64],
    activation: fn(Voltage, &NeuronConstants) -> Voltage,
) {
    let c = &config.neuron;
    for (i, &inc) in increments.iter().enumerate() {
        if inc == 0.0 {
            continue;
        }
        let v = activation(state.potential[i] + inc, c);
        state.potential[i] = v;
        state.active[i] = v == c.v_max;
    }
}

// ============================================================================
// PHASE STATE MACHINE
// ============================================================================

/// Lowest value a recovery penalty can take
pub const LAMBDA_FLOOR: f64 = 1e-3;

/// Lifecycle phase of a neuron
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Fully recovered and receptive
    #[default]
    Resting,
    /// Emitting, rising to the penalized peak
    Rise,
    /// Emitting, falling back to threshold
    Fall,
    /// Receptive, decaying towards `lambda * Vrest`
    PostDepolarization,
    /// Receptive, recovering from `lambda * Vrest` to 0
    Hyperpolarization,
}

impl Phase {
    pub fn index(&self) -> u8 {
        match self {
            Phase::Resting => 0,
            Phase::Rise => 1,
            Phase::Fall => 2,
            Phase::PostDepolarization => 3,
            Phase::Hyperpolarization => 4,
        }
    }

    pub fn is_emitting(&self) -> bool {
        matches!(self, Phase::Rise | Phase::Fall)
    }

    pub fn is_receptive(&self) -> bool {
        !self.is_emitting()
    }
}

/// Per-neuron phase, recovery penalty and rest timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMachine {
    pub phase: Vec<Phase>,
    /// Fraction of (Vmax - threshold) reachable at the next depolarization
    pub lambda: Array1<f64>,
    /// Recovery countdown since the last depolarization (ms)
    pub time_rest: Array1<f64>,
}

impl PhaseMachine {
    pub fn new(n: usize) -> Self {
        Self {
            phase: vec![Phase::Resting; n],
            lambda: Array1::ones(n),
            time_rest: Array1::zeros(n),
        }
    }

    pub fn len(&self) -> usize {
        self.phase.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phase.is_empty()
    }

    /// No neuron emitting and every neuron in phase 0
    pub fn is_quiescent(&self, state: &NeuronVector) -> bool {
        !state.any_active() && self.phase.iter().all(|&p| p == Phase::Resting)
    }

    fn recovery_scale(&self, i: usize, config: &ModelConfig) -> f64 {
        (config.params.gamma * (1.0 - self.lambda[i])).exp()
    }

    /// Peak of neuron `i`'s current depolarization
    pub fn peak(&self, i: usize, c: &NeuronConstants) -> Voltage {
        self.lambda[i] * (c.v_max - c.threshold) + c.threshold
    }

    /// Full recovery interval of neuron `i`
    pub fn recovery_window(&self, i: usize, config: &ModelConfig) -> Time {
        let p = &config.phase;
        self.recovery_scale(i, config) * (p.t_pd + p.t_h) + config.params.delta_t
    }

    /// Recompute the penalty of a neuron that depolarizes again
    pub fn update_lambda(&mut self, i: usize, config: &ModelConfig) {
        let lambda = 1.0 - self.time_rest[i] / self.recovery_window(i, config);
        self.lambda[i] = lambda.clamp(LAMBDA_FLOOR, 1.0);
    }

    /// Arm the rest timer of a neuron entering post-depolarization
    pub fn arm_rest_timer(&mut self, i: usize, config: &ModelConfig) {
        self.time_rest[i] = self.recovery_window(i, config);
    }

    fn tick_rest_timer(&mut self, i: usize, dt: Time) {
        if self.time_rest[i] > 0.0 {
            self.time_rest[i] -= dt;
        } else {
            self.lambda[i] = 1.0;
            self.time_rest[i] = 0.0;
        }
    }

    /// Phase 0: relax towards zero, saturate at threshold or `Vmin_ma`
    pub fn resting_activation(v: Voltage, config: &ModelConfig) -> Voltage {
        let c = &config.neuron;
        let p = &config.phase;
        let tau = p.tau_min + p.tau_max * v / c.threshold;

        if v >= c.threshold {
            c.threshold
        } else if v > 0.0 {
            v * (-(100.0 * c.threshold).ln() / tau).exp()
        } else if v <= p.v_min_ma {
            p.v_min_ma
        } else if v < 0.0 {
            v * (-(100.0 * p.v_min_ma.abs()).ln() / tau).exp()
        } else {
            0.0
        }
    }

    fn ramp(&self, i: usize, config: &ModelConfig) -> Voltage {
        let c = &config.neuron;
        let dt = config.params.delta_t;
        2.0 * self.lambda[i] * (c.v_max - c.threshold) * dt / (config.phase.t_pa - dt)
    }

    /// Phase 1: linear rise, clamped at the penalized peak
    pub fn rise_activation(&self, v: Voltage, i: usize, config: &ModelConfig) -> Voltage {
        let peak = self.peak(i, &config.neuron);
        (v + self.ramp(i, config)).min(peak)
    }

    /// Phase 2: linear fall, clamped at threshold
    pub fn fall_activation(&self, v: Voltage, i: usize, config: &ModelConfig) -> Voltage {
        (v - self.ramp(i, config)).max(config.neuron.threshold)
    }

    /// Phase 3: decay towards `lambda * Vrest`
    pub fn post_depolarization_activation(&self, v: Voltage, i: usize, config: &ModelConfig) -> Voltage {
        let floor = self.lambda[i] * config.phase.v_rest;
        let rate = (config.neuron.threshold - floor)
            / (self.recovery_scale(i, config) * config.phase.t_pd);
        (v - config.params.delta_t * rate).max(floor)
    }

    /// Phase 4: rise from `lambda * Vrest` back to 0
    pub fn hyperpolarization_activation(&self, v: Voltage, i: usize, config: &ModelConfig) -> Voltage {
        let rate = self.lambda[i] * config.phase.v_rest
            / (self.recovery_scale(i, config) * config.phase.t_h);
        (v - config.params.delta_t * rate).min(0.0)
    }

    fn depolarize(&mut self, i: usize, config: &ModelConfig, active: &mut [bool]) {
        active[i] = true;
        self.phase[i] = Phase::Rise;
        self.update_lambda(i, config);
    }

    /// Phase-0 transfer of `total`; depolarizes the neuron if it lands on threshold
    fn receive(&mut self, i: usize, total: Voltage, config: &ModelConfig, active: &mut [bool]) -> Voltage {
        self.phase[i] = Phase::Resting;
        let v = Self::resting_activation(total, config);
        if v == config.neuron.threshold {
            self.depolarize(i, config, active);
        }
        v
    }

    /// One synchronous generation of the five-phase lifecycle
    pub fn advance(&mut self, config: &ModelConfig, links: &LinkMatrix, state: &mut NeuronVector) {
        let c = &config.neuron;
        let dt = config.params.delta_t;
        let prev = state.clone();
        let inbound = inbound_all(links, config.params.beta, &prev, c.threshold);
        let mut next = prev.clone();

        for i in 0..prev.len() {
            let v = prev.potential[i];

            // Emitting neurons ignore their inputs
            let stimulus = if prev.active[i] {
                Inbound { leak: v, peers: 0.0 }
            } else {
                self.tick_rest_timer(i, dt);
                inbound[i]
            };
            let total = stimulus.total();

            let phase = self.phase[i];
            next.potential[i] = match phase {
                Phase::Resting => self.receive(i, total, config, &mut next.active),
                Phase::Rise => {
                    let nv = self.rise_activation(total, i, config);
                    if nv == self.peak(i, c) {
                        self.phase[i] = Phase::Fall;
                    }
                    nv
                }
                Phase::Fall => {
                    let nv = self.fall_activation(total, i, config);
                    if nv == c.threshold {
                        next.active[i] = false;
                        self.phase[i] = Phase::PostDepolarization;
                        self.arm_rest_timer(i, config);
                    }
                    nv
                }
                // Only peer input counts as stimulus; the own leak is always nonzero
                Phase::PostDepolarization | Phase::Hyperpolarization if stimulus.peers != 0.0 => {
                    self.receive(i, total, config, &mut next.active)
                }
                Phase::PostDepolarization => {
                    let nv = self.post_depolarization_activation(v, i, config);
                    if nv == self.lambda[i] * config.phase.v_rest {
                        self.phase[i] = Phase::Hyperpolarization;
                    }
                    nv
                }
                Phase::Hyperpolarization => {
                    let nv = self.hyperpolarization_activation(v, i, config);
                    if nv == 0.0 {
                        self.phase[i] = Phase::Resting;
                        self.lambda[i] = 1.0;
                    }
                    nv
                }
            };
        }

        *state = next;
    }

    /// Add `increments` to receptive neurons through the phase-0 transfer
    pub fn stimulate(&mut self, config: &ModelConfig, state: &mut NeuronVector, increments: &[f64]) {
        for (i, &inc) in increments.iter().enumerate() {
            if inc == 0.0 || self.phase[i].is_emitting() {
                continue;
            }
            let total = state.potential[i] + inc;
            state.potential[i] = self.receive(i, total, config, &mut state.active);
        }
    }

    /// Kick a quiescent network: about half the neurons receive a random
    /// increment in `[0, (threshold + Vmax) / 2)`
    pub fn cold_start<R: Rng + ?Sized>(&mut self, config: &ModelConfig, state: &mut NeuronVector, rng: &mut R) {
        let c = &config.neuron;
        let upper = (c.threshold + c.v_max) / 2.0;
        let increments: Vec<f64> = (0..state.len())
            .map(|_| {
                let inc = rng.gen_range(0.0..upper);
                if rng.gen_bool(0.5) {
                    inc
                } else {
                    0.0
                }
            })
            .collect();

        self.stimulate(config, state, &increments);
    }

    /// Re-feed a fully rested network with signed increments in
    /// `[-threshold, threshold)`; neurons that stay below threshold are
    /// returned to phase 0 with their penalty cleared.
    ///
    /// The driver only re-feeds when every potential is 0, and the half-open
    /// range never reaches threshold from 0, so depolarization (and the
    /// lambda update for phase 3/4 neurons) only happens when this is called
    /// on a network with nonzero potentials.
    pub fn refeed<R: Rng + ?Sized>(&mut self, config: &ModelConfig, state: &mut NeuronVector, rng: &mut R) {
        let threshold = config.neuron.threshold;

        for i in 0..state.len() {
            if self.phase[i].is_emitting() {
                continue;
            }

            let sign = [-1.0, 0.0, 1.0][rng.gen_range(0..3)];
            let inc = rng.gen_range(0.0..threshold) * sign;
            let v = Self::resting_activation(state.potential[i] + inc, config);
            state.potential[i] = v;

            if v == threshold {
                self.depolarize(i, config, &mut state.active);
            } else {
                self.lambda[i] = 1.0;
                self.phase[i] = Phase::Resting;
            }
        }
    }
}

// ============================================================================
// UPDATE RULES
// ============================================================================

/// Update rule of a model variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateRule {
    Binary,
    Weighted,
    Psychoactive,
    Phase(PhaseMachine),
}

impl UpdateRule {
    pub fn new(variant: Variant, n: usize) -> Self {
        match variant {
            Variant::Binary => UpdateRule::Binary,
            Variant::Weighted => UpdateRule::Weighted,
            Variant::Psychoactive => UpdateRule::Psychoactive,
            Variant::Phase => UpdateRule::Phase(PhaseMachine::new(n)),
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            UpdateRule::Binary => Variant::Binary,
            UpdateRule::Weighted => Variant::Weighted,
            UpdateRule::Psychoactive => Variant::Psychoactive,
            UpdateRule::Phase(_) => Variant::Phase,
        }
    }

    pub fn phase_machine(&self) -> Option<&PhaseMachine> {
        match self {
            UpdateRule::Phase(machine) => Some(machine),
            _ => None,
        }
    }

    /// Advance every neuron by one generation
    pub fn advance(&mut self, config: &ModelConfig, links: &LinkMatrix, state: &mut NeuronVector) {
        match self {
            UpdateRule::Binary => advance_saturating(config, links, state, binary_activation),
            UpdateRule::Weighted | UpdateRule::Psychoactive => {
                advance_saturating(config, links, state, clamped_activation)
            }
            UpdateRule::Phase(machine) => machine.advance(config, links, state),
        }
    }

    /// Apply caller-chosen increments with cold-start semantics
    pub fn stimulate(&mut self, config: &ModelConfig, state: &mut NeuronVector, increments: &[f64]) {
        match self {
            UpdateRule::Binary => stimulate_saturating(config, state, increments, binary_activation),
            UpdateRule::Weighted | UpdateRule::Psychoactive => {
                stimulate_saturating(config, state, increments, clamped_activation)
            }
            UpdateRule::Phase(machine) => machine.stimulate(config, state, increments),
        }
    }

    pub fn cold_start<R: Rng + ?Sized>(&mut self, config: &ModelConfig, state: &mut NeuronVector, rng: &mut R) {
        let c = &config.neuron;
        let lower = match self {
            UpdateRule::Phase(machine) => return machine.cold_start(config, state, rng),
            UpdateRule::Binary => 0.0,
            UpdateRule::Weighted | UpdateRule::Psychoactive => c.v_min,
        };

        let increments: Vec<f64> = (0..state.len())
            .map(|_| rng.gen_range(lower..c.v_max))
            .collect();
        self.stimulate(config, state, &increments);
    }

    /// Rest re-feed; history-free rules simply cold-start
    pub fn refeed<R: Rng + ?Sized>(&mut self, config: &ModelConfig, state: &mut NeuronVector, rng: &mut R) {
        match self {
            UpdateRule::Phase(machine) => machine.refeed(config, state, rng),
            _ => self.cold_start(config, state, rng),
        }
    }

    /// Nothing can be transmitted without a stimulation routine
    pub fn is_quiescent(&self, state: &NeuronVector) -> bool {
        match self {
            UpdateRule::Phase(machine) => machine.is_quiescent(state),
            _ => !state.any_active(),
        }
    }
}

// ============================================================================
// SIMULATION DRIVER
// ============================================================================

/// What the driver did during a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routine {
    /// Fully rested network re-fed
    Refeed,
    /// Non-transmittable network kicked off
    ColdStart,
    /// One generation of the update rule
    Advance,
}

impl Routine {
    pub fn name(&self) -> &'static str {
        match self {
            Routine::Refeed => "refeed",
            Routine::ColdStart => "cold_start",
            Routine::Advance => "advance",
        }
    }
}

/// Network state after one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub generation: Generation,
    pub routine: Routine,
    pub activations: Vec<bool>,
    pub potentials: Vec<Voltage>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.potentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.potentials.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.activations.iter().filter(|&&a| a).count()
    }

    pub fn mean_potential(&self) -> Voltage {
        if self.potentials.is_empty() {
            return 0.0;
        }
        self.potentials.iter().sum::<f64>() / self.potentials.len() as f64
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Apply the variant's weighting to a binary connectivity matrix.
///
/// Returns the unmodulated weights and the links actually used.
fn weigh_links(
    variant: Variant,
    config: &ModelConfig,
    mut connectivity: LinkMatrix,
    rng: &mut StdRng,
) -> (LinkMatrix, LinkMatrix) {
    if variant.is_weighted() {
        connectivity.distribute_weights(rng);
    }
    let mut links = connectivity.clone();
    if variant.is_modulated() {
        links.modulate(config.params.ca, rng);
    }
    (connectivity, links)
}

/// A simulated network: topology, neuron state, update rule and generator
#[derive(Debug, Clone)]
pub struct Model {
    config: ModelConfig,
    base_links: LinkMatrix,
    links: LinkMatrix,
    state: NeuronVector,
    rule: UpdateRule,
    rng: StdRng,
    generation: Generation,
}

impl Model {
    /// Build a model with random Bernoulli connectivity
    pub fn new(variant: Variant, params: NetworkParams) -> Result<Self> {
        Self::with_config(variant, ModelConfig::new(params)?)
    }

    pub fn with_config(variant: Variant, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = seeded_rng(config.params.seed);
        let connectivity = LinkMatrix::build(&LinkPolicy::Unweighted, &config, &mut rng)?;
        Ok(Self::assemble(variant, config, connectivity, rng))
    }

    /// Build a model whose connectivity is gated by the distance between `points`
    pub fn with_layout(
        variant: Variant,
        params: NetworkParams,
        points: &[Point],
        radius: f64,
    ) -> Result<Self> {
        let config = ModelConfig::new(params)?;
        let mut rng = seeded_rng(config.params.seed);
        let policy = LinkPolicy::DistanceGated {
            points: points.to_vec(),
            radius,
        };
        let connectivity = LinkMatrix::build(&policy, &config, &mut rng)?;
        Ok(Self::assemble(variant, config, connectivity, rng))
    }

    fn assemble(variant: Variant, config: ModelConfig, connectivity: LinkMatrix, mut rng: StdRng) -> Self {
        let n = config.params.neurons;
        let (base_links, links) = weigh_links(variant, &config, connectivity, &mut rng);
        debug!(%variant, neurons = n, "model assembled");

        Self {
            config,
            base_links,
            links,
            state: NeuronVector::new(n),
            rule: UpdateRule::new(variant, n),
            rng,
            generation: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn variant(&self) -> Variant {
        self.rule.variant()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn potentials(&self) -> &Array1<f64> {
        &self.state.potential
    }

    pub fn activations(&self) -> &[bool] {
        &self.state.active
    }

    pub fn state(&self) -> &NeuronVector {
        &self.state
    }

    pub fn links(&self) -> &LinkMatrix {
        &self.links
    }

    /// Phase, lambda and rest timers (phase variant only)
    pub fn phase_machine(&self) -> Option<&PhaseMachine> {
        self.rule.phase_machine()
    }

    /// No emitting neuron and, for the phase variant, every neuron in phase 0
    pub fn is_quiescent(&self) -> bool {
        self.rule.is_quiescent(&self.state)
    }

    /// Every potential is exactly zero
    pub fn is_fully_rested(&self) -> bool {
        self.state.all_at_rest()
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Advance the network by exactly one step and return the new state
    pub fn step(&mut self) -> Snapshot {
        let routine = if self.is_fully_rested() {
            info!(generation = self.generation, "network at rest, re-feeding");
            self.refeed();
            Routine::Refeed
        } else if self.is_quiescent() {
            info!(generation = self.generation, "network non-transmittable, feeding signals");
            self.cold_start();
            Routine::ColdStart
        } else {
            self.advance();
            Routine::Advance
        };

        self.generation += 1;
        trace!(
            generation = self.generation,
            routine = routine.name(),
            active = self.state.active_count(),
            "step"
        );
        self.snapshot(routine)
    }

    /// One generation of the update rule, without any stimulation
    pub fn advance(&mut self) {
        self.rule.advance(&self.config, &self.links, &mut self.state);
    }

    pub fn cold_start(&mut self) {
        self.rule.cold_start(&self.config, &mut self.state, &mut self.rng);
    }

    pub fn refeed(&mut self) {
        self.rule.refeed(&self.config, &mut self.state, &mut self.rng);
    }

    /// Deliver one increment per neuron with cold-start semantics
    pub fn stimulate(&mut self, increments: &[f64]) -> Result<()> {
        if increments.len() != self.len() {
            return Err(NetError::DimensionMismatch {
                expected: self.len(),
                got: increments.len(),
            });
        }
        self.rule.stimulate(&self.config, &mut self.state, increments);
        Ok(())
    }

    /// Lazy sequence of `steps` snapshots, each computed when pulled
    pub fn simulation(&mut self, steps: usize) -> Simulation<'_> {
        Simulation {
            model: self,
            remaining: steps,
        }
    }

    pub fn snapshot(&self, routine: Routine) -> Snapshot {
        Snapshot {
            generation: self.generation,
            routine,
            activations: self.state.active.clone(),
            potentials: self.state.potential.to_vec(),
        }
    }

    // ------------------------------------------------------------------------
    // Parameter mutation
    // ------------------------------------------------------------------------

    pub fn set_beta(&mut self, beta: f64) -> Result<()> {
        validate_beta(beta)?;
        self.config.params.beta = beta;
        self.refresh_self_leak();
        Ok(())
    }

    pub fn set_gamma(&mut self, gamma: f64) -> Result<()> {
        validate_gamma(gamma)?;
        self.config.params.gamma = gamma;
        self.refresh_self_leak();
        Ok(())
    }

    fn refresh_self_leak(&mut self) {
        let self_leak = self.config.self_leak();
        self.base_links.set_self_leak(self_leak);
        self.links.set_self_leak(self_leak);
    }

    /// Change the drug concentration and re-apply the modulator to the
    /// unmodulated weights
    pub fn set_ca(&mut self, ca: f64) -> Result<()> {
        validate_ca(ca)?;
        self.config.params.ca = ca;
        if self.variant().is_modulated() {
            self.links = self.base_links.clone();
            self.links.modulate(ca, &mut self.rng);
        }
        Ok(())
    }

    pub fn set_delta_t(&mut self, delta_t: Time) -> Result<()> {
        validate_delta_t(delta_t, &self.config.phase)?;
        self.config.params.delta_t = delta_t;
        Ok(())
    }

    /// Resize the network; topology and neuron state are rebuilt
    pub fn set_neuron_count(&mut self, neurons: usize) -> Result<()> {
        if neurons == 0 {
            return Err(NetError::InvalidNeuronCount(neurons));
        }
        self.config.params.neurons = neurons;
        self.rebuild(self.variant())
    }

    /// Switch variant; topology and neuron state are rebuilt
    pub fn set_variant(&mut self, variant: Variant) -> Result<()> {
        self.rebuild(variant)
    }

    fn rebuild(&mut self, variant: Variant) -> Result<()> {
        let connectivity = LinkMatrix::build(&LinkPolicy::Unweighted, &self.config, &mut self.rng)?;
        let (base_links, links) = weigh_links(variant, &self.config, connectivity, &mut self.rng);
        let n = self.config.params.neurons;

        self.base_links = base_links;
        self.links = links;
        self.state = NeuronVector::new(n);
        self.rule = UpdateRule::new(variant, n);
        Ok(())
    }

    /// Replace the topology with a caller-computed connectivity matrix
    /// (nonzero off-diagonal entries are connections). The variant's
    /// weighting and modulation are derived from it.
    pub fn set_links(&mut self, connectivity: Array2<f64>) -> Result<()> {
        let n = self.len();
        if connectivity.nrows() != n {
            return Err(NetError::DimensionMismatch {
                expected: n,
                got: connectivity.nrows(),
            });
        }

        let connectivity = LinkMatrix::from_connectivity(connectivity, self.config.self_leak())?;
        let (base_links, links) = weigh_links(self.variant(), &self.config, connectivity, &mut self.rng);
        self.base_links = base_links;
        self.links = links;
        Ok(())
    }

    /// Zero every potential and return all neurons to phase 0
    pub fn reset_state(&mut self) {
        let n = self.len();
        self.state = NeuronVector::new(n);
        self.rule = UpdateRule::new(self.variant(), n);
        self.generation = 0;
    }
}

/// Pull-based, one-shot sequence of simulation steps
#[derive(Debug)]
pub struct Simulation<'a> {
    model: &'a mut Model,
    remaining: usize,
}

impl Iterator for Simulation<'_> {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Snapshot> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.model.step())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Simulation<'_> {}

impl FusedIterator for Simulation<'_> {}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const TOL: f64 = 1e-9;

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    fn machine_mut(model: &mut Model) -> &mut PhaseMachine {
        match &mut model.rule {
            UpdateRule::Phase(machine) => machine,
            _ => panic!("not a phase model"),
        }
    }

    fn phase_model(n: usize, seed: u64) -> Model {
        let params = NetworkParams::new(n, 0.5, 0.9).with_delta_t(0.05).with_seed(seed);
        Model::new(Variant::Phase, params).unwrap()
    }

    #[test]
    fn test_unweighted_links() {
        let links = LinkMatrix::unweighted(12, 0.5, 1.8, &mut rng(1));

        assert_eq!(links.len(), 12);
        for i in 0..12 {
            assert_eq!(links.get(i, i), 1.8);
            for j in 0..12 {
                if i != j {
                    let w = links.get(i, j);
                    assert!(w == 0.0 || w == 1.0);
                }
            }
        }
    }

    #[test]
    fn test_connection_probability_extremes() {
        let full = LinkMatrix::unweighted(6, 1.0, 1.0, &mut rng(2));
        assert_eq!(full.connection_count(), 30);

        let empty = LinkMatrix::unweighted(6, 0.0, 1.0, &mut rng(2));
        assert_eq!(empty.connection_count(), 0);
    }

    #[test]
    fn test_distance_gated_links() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(3.0, 4.0),
            Point::new(100.0, 100.0),
            Point::new(0.0, 5.0),
        ];
        let mut generator = rng(3);

        for _ in 0..20 {
            let links = LinkMatrix::distance_gated(&points, 5.0, 1.5, &mut generator).unwrap();
            for j in 0..4 {
                if j != 2 {
                    assert_eq!(links.get(2, j), 0.0);
                    assert_eq!(links.get(j, 2), 0.0);
                }
            }
            assert_eq!(links.get(2, 2), 1.5);
        }

        // Pairs exactly at the radius are in range
        let linked = (0..20).any(|_| {
            LinkMatrix::distance_gated(&points[..2], 5.0, 1.5, &mut generator)
                .map(|links| links.get(1, 0) == 1.0)
                .unwrap_or(false)
        });
        assert!(linked);

        assert!(matches!(
            LinkMatrix::distance_gated(&points, -1.0, 1.5, &mut generator),
            Err(NetError::InvalidRadius(_))
        ));
    }

    #[test]
    fn test_distance_gated_connects_in_range() {
        let points: Vec<Point> = (0..10).map(|i| Point::new(i as f64, 0.0)).collect();
        let links = LinkMatrix::distance_gated(&points, 100.0, 1.0, &mut rng(5)).unwrap();

        // 90 candidate pairs at p = 0.8
        assert!(links.connection_count() > 50);
    }

    #[test]
    fn test_build_rejects_layout_size_mismatch() {
        let config = ModelConfig::new(NetworkParams::new(4, 0.5, 0.9)).unwrap();
        let policy = LinkPolicy::DistanceGated {
            points: vec![Point::new(0.0, 0.0); 3],
            radius: 10.0,
        };

        assert!(matches!(
            LinkMatrix::build(&policy, &config, &mut rng(6)),
            Err(NetError::DimensionMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_weighted_columns_sum_to_one() {
        let config = ModelConfig::new(NetworkParams::new(20, 0.5, 0.9)).unwrap();
        let links =
            LinkMatrix::build(&LinkPolicy::ProportionallyWeighted, &config, &mut rng(7)).unwrap();

        for col in 0..20 {
            if links.column_connections(col) > 0 {
                assert!((links.column_abs_sum(col) - 1.0).abs() < 1e-9);
            }
            assert!((links.get(col, col) - 1.8).abs() < TOL);
        }
    }

    #[test]
    fn test_weighting_empty_column_is_noop() {
        let mut links = LinkMatrix::unweighted(5, 0.0, 1.0, &mut rng(8));
        let before = links.clone();
        links.distribute_weights(&mut rng(8));

        assert_eq!(links, before);
    }

    #[test]
    fn test_modulation_scales_selected_rows() {
        let mut base = LinkMatrix::unweighted(10, 1.0, 1.8, &mut rng(9));
        base.distribute_weights(&mut rng(9));

        let mut links = base.clone();
        let affected = links.modulate(0.5, &mut rng(10));
        assert_eq!(affected.len(), 5);

        for i in 0..10 {
            assert_eq!(links.get(i, i), base.get(i, i));
            for j in (0..10).filter(|&j| j != i) {
                let expected = if affected.contains(&i) {
                    1.5 * base.get(i, j)
                } else {
                    base.get(i, j)
                };
                assert!((links.get(i, j) - expected).abs() < TOL);
            }
        }
    }

    #[test]
    fn test_depressant_silences_inbound() {
        let mut links = LinkMatrix::unweighted(8, 1.0, 1.8, &mut rng(11));
        let affected = links.modulate(-1.0, &mut rng(12));

        assert_eq!(affected.len(), 8);
        assert_eq!(links.connection_count(), 0);
        assert_eq!(links.get(3, 3), 1.8);
    }

    #[test]
    fn test_zero_concentration_is_noop() {
        let mut links = LinkMatrix::unweighted(8, 0.5, 1.8, &mut rng(13));
        let before = links.clone();

        assert!(links.modulate(0.0, &mut rng(14)).is_empty());
        assert_eq!(links, before);
    }

    #[test]
    fn test_activation_functions() {
        let c = NeuronConstants::default();

        assert_eq!(binary_activation(59.9, &c), 59.9);
        assert_eq!(binary_activation(60.0, &c), 120.0);
        assert_eq!(binary_activation(-500.0, &c), -500.0);

        assert_eq!(clamped_activation(60.0, &c), 60.0);
        assert_eq!(clamped_activation(60.5, &c), 120.0);
        assert_eq!(clamped_activation(-31.0, &c), -30.0);
        assert_eq!(clamped_activation(-12.0, &c), -12.0);
    }

    #[test]
    fn test_resting_activation() {
        let config = ModelConfig::default();

        assert_eq!(PhaseMachine::resting_activation(0.0, &config), 0.0);
        assert_eq!(PhaseMachine::resting_activation(60.0, &config), 60.0);
        assert_eq!(PhaseMachine::resting_activation(95.0, &config), 60.0);
        assert_eq!(PhaseMachine::resting_activation(-40.0, &config), -15.0);

        let relaxed = PhaseMachine::resting_activation(30.0, &config);
        assert!(relaxed > 0.0 && relaxed < 30.0);

        let relaxed = PhaseMachine::resting_activation(-10.0, &config);
        assert!(relaxed < 0.0 && relaxed > -10.0);
    }

    #[test]
    fn test_binary_three_neuron_propagation() {
        let params = NetworkParams::new(3, 0.5, 0.9)
            .with_connection_probability(1.0)
            .with_seed(42);
        let mut model = Model::new(Variant::Binary, params).unwrap();
        let c = model.config().neuron;

        model.stimulate(&[c.threshold, 0.0, 0.0]).unwrap();
        assert_eq!(model.activations(), &[true, false, false]);
        assert_eq!(model.potentials()[0], c.v_max);

        let snapshot = model.step();
        assert_eq!(snapshot.routine, Routine::Advance);

        let received = 0.5 * model.links().get(1, 0) * c.v_max;
        let expected = binary_activation(received, &c);
        assert_eq!(snapshot.potentials[1], expected);
        assert_eq!(snapshot.potentials[2], expected);
        assert_eq!(expected, c.v_max);

        // The emitter drops its own potential once it has fired
        assert_eq!(snapshot.potentials[0], 0.0);
        assert!(!snapshot.activations[0]);
    }

    #[test]
    fn test_update_is_synchronous() {
        let params = NetworkParams::new(2, 0.4, 0.9).with_seed(1);
        let mut model = Model::new(Variant::Binary, params).unwrap();
        model.set_links(array![[0.0, 0.0], [1.0, 0.0]]).unwrap();

        model.state.potential[0] = 120.0;
        model.state.active[0] = true;
        model.advance();

        // Neuron 1 must see neuron 0's pre-step potential, not its reset value
        assert!((model.potentials()[1] - 48.0).abs() < TOL);
        assert_eq!(model.potentials()[0], 0.0);
        assert_eq!(model.activations(), &[false, false]);
    }

    #[test]
    fn test_lengths_stable_for_every_variant() {
        for variant in Variant::ALL {
            let params = NetworkParams::new(15, 0.6, 0.9).with_ca(0.3).with_seed(21);
            let mut model = Model::new(variant, params).unwrap();

            for snapshot in model.simulation(60) {
                assert_eq!(snapshot.len(), 15);
                assert_eq!(snapshot.activations.len(), 15);
            }
            assert_eq!(model.potentials().len(), 15);
            assert_eq!(model.activations().len(), 15);
        }
    }

    #[test]
    fn test_weighted_potentials_stay_clamped() {
        let params = NetworkParams::new(20, 0.8, 0.9).with_seed(17);
        let mut model = Model::new(Variant::Weighted, params).unwrap();
        let c = model.config().neuron;

        for snapshot in model.simulation(100) {
            for &v in &snapshot.potentials {
                assert!(v >= c.v_min && v <= c.v_max);
            }
        }
    }

    #[test]
    fn test_peak_falls_to_post_depolarization() {
        let mut model = phase_model(1, 3);
        let config = model.config().clone();
        let peak = config.neuron.v_max;

        model.state.potential[0] = peak;
        model.state.active[0] = true;
        machine_mut(&mut model).phase[0] = Phase::Rise;

        let bound = (config.phase.t_pa / config.params.delta_t).ceil() as usize + 1;
        let mut seen_fall = false;
        for _ in 0..bound {
            model.advance();
            let phase = model.phase_machine().unwrap().phase[0];
            seen_fall |= phase == Phase::Fall;
            if phase == Phase::PostDepolarization {
                break;
            }
        }

        let machine = model.phase_machine().unwrap();
        assert!(seen_fall);
        assert_eq!(machine.phase[0], Phase::PostDepolarization);
        assert_eq!(model.potentials()[0], config.neuron.threshold);
        assert!(!model.activations()[0]);

        let armed = (config.params.gamma * (1.0 - machine.lambda[0])).exp()
            * (config.phase.t_pd + config.phase.t_h)
            + config.params.delta_t;
        assert!((machine.time_rest[0] - armed).abs() < TOL);
        assert!((armed - 2.05).abs() < TOL);
    }

    fn depolarize_and_wait(model: &mut Model, steps_after_fall: usize) {
        model.stimulate(&[60.0]).unwrap();
        assert_eq!(model.phase_machine().unwrap().phase[0], Phase::Rise);

        while model.phase_machine().unwrap().phase[0] != Phase::PostDepolarization {
            model.advance();
        }
        for _ in 0..steps_after_fall {
            model.advance();
        }
    }

    #[test]
    fn test_quick_redepolarization_is_penalized() {
        let mut hasty = phase_model(1, 4);
        depolarize_and_wait(&mut hasty, 1);
        hasty.stimulate(&[100.0]).unwrap();

        let mut patient = phase_model(1, 4);
        depolarize_and_wait(&mut patient, 200);
        assert_eq!(patient.phase_machine().unwrap().phase[0], Phase::Resting);
        patient.stimulate(&[100.0]).unwrap();

        let c = NeuronConstants::default();
        let hasty_machine = hasty.phase_machine().unwrap();
        let patient_machine = patient.phase_machine().unwrap();

        assert_eq!(hasty_machine.phase[0], Phase::Rise);
        assert_eq!(patient_machine.phase[0], Phase::Rise);
        assert!(hasty_machine.lambda[0] > 0.0);
        assert!(hasty_machine.lambda[0] < patient_machine.lambda[0]);
        assert_eq!(patient_machine.lambda[0], 1.0);
        assert!(hasty_machine.peak(0, &c) < patient_machine.peak(0, &c));
    }

    #[test]
    fn test_phase_invariants_over_run() {
        let params = NetworkParams::new(25, 0.6, 0.9).with_delta_t(0.05).with_seed(7);
        let mut model = Model::new(Variant::Phase, params).unwrap();
        let mut previous = model.phase_machine().unwrap().phase.clone();

        for _ in 0..500 {
            model.step();
            let machine = model.phase_machine().unwrap();

            for (i, (&before, &after)) in previous.iter().zip(&machine.phase).enumerate() {
                if after == Phase::Rise && before != Phase::Rise {
                    assert!(matches!(
                        before,
                        Phase::Resting | Phase::PostDepolarization | Phase::Hyperpolarization
                    ));
                }
                assert_eq!(model.activations()[i], after.is_emitting());
                assert!(machine.lambda[i] > 0.0 && machine.lambda[i] <= 1.0);
            }
            previous = machine.phase.clone();
        }
    }

    /// A quiescent network advanced without any stimulation routine keeps
    /// every potential and phase
    #[test]
    fn test_quiescent_network_is_left_unchanged() {
        for variant in Variant::ALL {
            let params = NetworkParams::new(10, 0.6, 0.9).with_seed(5);
            let mut model = Model::new(variant, params).unwrap();
            assert!(model.is_quiescent());

            let before = model.state().clone();
            let phases = model.phase_machine().cloned();
            model.advance();

            assert_eq!(model.state(), &before);
            assert_eq!(model.phase_machine().cloned(), phases);
        }
    }

    #[test]
    fn test_driver_routine_order() {
        let mut model = phase_model(25, 8);
        assert!(model.is_fully_rested());

        let first = model.step();
        assert_eq!(first.routine, Routine::Refeed);
        assert!(!model.is_fully_rested());
        assert!(model.is_quiescent());

        let second = model.step();
        assert_eq!(second.routine, Routine::ColdStart);
        assert_eq!(second.generation, 2);
    }

    #[test]
    fn test_refeed_clears_penalty_below_threshold() {
        let mut model = phase_model(6, 9);
        let config = model.config().clone();
        {
            let machine = machine_mut(&mut model);
            machine.lambda.fill(0.5);
            machine.phase.fill(Phase::Hyperpolarization);
        }

        let UpdateRule::Phase(machine) = &mut model.rule else {
            panic!("not a phase model");
        };
        machine.refeed(&config, &mut model.state, &mut model.rng);

        for i in 0..6 {
            assert!(model.state.potential[i] < config.neuron.threshold);
            assert_eq!(machine.phase[i], Phase::Resting);
            assert_eq!(machine.lambda[i], 1.0);
        }
    }

    #[test]
    fn test_stimulus_breaks_post_depolarization() {
        let mut model = phase_model(1, 10);
        depolarize_and_wait(&mut model, 2);

        // Negative kick: no threshold crossing, back to phase 0
        model.stimulate(&[-5.0]).unwrap();
        let machine = model.phase_machine().unwrap();
        assert_eq!(machine.phase[0], Phase::Resting);
        assert!(machine.lambda[0] < 1.0 || machine.time_rest[0] > 0.0);
    }

    #[test]
    fn test_simulation_is_lazy_and_bounded() {
        let params = NetworkParams::new(10, 0.6, 0.9).with_seed(11);
        let mut model = Model::new(Variant::Weighted, params).unwrap();

        {
            let mut sim = model.simulation(5);
            assert_eq!(sim.len(), 5);
            let first = sim.next().unwrap();
            assert_eq!(first.generation, 1);
            assert_eq!(sim.len(), 4);
        }
        assert_eq!(model.generation(), 1);

        let rest: Vec<Snapshot> = model.simulation(3).collect();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[2].generation, 4);

        let mut empty = model.simulation(0);
        assert!(empty.next().is_none());
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let params = NetworkParams::new(20, 0.6, 0.9).with_ca(0.4).with_seed(99);
        let mut a = Model::new(Variant::Phase, params.clone()).unwrap();
        let mut b = Model::new(Variant::Phase, params).unwrap();

        assert_eq!(a.links(), b.links());
        let run_a: Vec<Snapshot> = a.simulation(100).collect();
        let run_b: Vec<Snapshot> = b.simulation(100).collect();
        assert_eq!(run_a, run_b);
    }

    #[test]
    fn test_set_ca_does_not_compound() {
        let params = NetworkParams::new(10, 0.5, 0.9)
            .with_connection_probability(1.0)
            .with_seed(12);
        let mut model = Model::new(Variant::Psychoactive, params).unwrap();

        model.set_ca(1.0).unwrap();
        let once = model.links().clone();
        model.set_ca(1.0).unwrap();

        // Every row is selected at ca = 1, so both applications double the base
        assert_eq!(model.links(), &once);
        for col in 0..10 {
            assert!((model.links().column_abs_sum(col) - 2.0).abs() < 1e-9);
        }

        assert!(matches!(model.set_ca(1.5), Err(NetError::InvalidConcentration(_))));
    }

    #[test]
    fn test_set_gamma_and_beta_rewrite_self_leak() {
        let params = NetworkParams::new(5, 0.5, 0.9).with_seed(13);
        let mut model = Model::new(Variant::Weighted, params).unwrap();

        model.set_gamma(0.95).unwrap();
        assert!((model.links().get(2, 2) - 1.9).abs() < TOL);

        model.set_beta(0.25).unwrap();
        assert!((model.links().get(4, 4) - 3.8).abs() < TOL);

        assert!(model.set_beta(0.0).is_err());
        assert!(model.set_gamma(1.1).is_err());
        assert!(model.set_delta_t(1.0).is_err());
        assert!(model.set_delta_t(0.1).is_ok());
    }

    #[test]
    fn test_set_links_weighs_injected_connectivity() {
        let params = NetworkParams::new(3, 0.5, 0.9).with_seed(14);
        let mut model = Model::new(Variant::Weighted, params).unwrap();

        let connectivity = array![[0.0, 1.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        model.set_links(connectivity).unwrap();

        let links = model.links();
        assert_eq!(links.get(2, 0), 0.0);
        assert_eq!(links.get(0, 2).abs(), 1.0);
        assert!((links.column_abs_sum(0) - 1.0).abs() < TOL);
        assert!((links.column_abs_sum(1) - 1.0).abs() < TOL);
        assert!((links.get(1, 1) - 1.8).abs() < TOL);

        assert!(matches!(
            model.set_links(Array2::zeros((4, 4))),
            Err(NetError::DimensionMismatch { expected: 3, got: 4 })
        ));
        assert!(model.set_links(Array2::zeros((3, 2))).is_err());
    }

    #[test]
    fn test_resize_and_variant_switch_reset_state() {
        let params = NetworkParams::new(8, 0.6, 0.9).with_seed(15);
        let mut model = Model::new(Variant::Binary, params).unwrap();
        model.simulation(10).for_each(drop);

        model.set_neuron_count(12).unwrap();
        assert_eq!(model.len(), 12);
        assert_eq!(model.links().len(), 12);
        assert!(model.is_fully_rested());

        model.set_variant(Variant::Phase).unwrap();
        assert_eq!(model.variant(), Variant::Phase);
        assert_eq!(model.phase_machine().unwrap().len(), 12);

        assert!(model.set_neuron_count(0).is_err());
    }

    #[test]
    fn test_stimulate_checks_length() {
        let mut model = phase_model(4, 16);
        assert!(matches!(
            model.stimulate(&[1.0, 2.0]),
            Err(NetError::DimensionMismatch { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn test_rest_timer_expiry_clears_penalty_mid_phase() {
        let mut model = phase_model(1, 19);
        let dt = model.config().params.delta_t;
        model.state.potential[0] = 50.0;
        {
            let machine = machine_mut(&mut model);
            machine.phase[0] = Phase::PostDepolarization;
            machine.lambda[0] = 0.5;
            machine.time_rest[0] = dt;
        }

        // First tick consumes the last delta_t, the second finds it spent
        model.advance();
        assert_eq!(model.phase_machine().unwrap().lambda[0], 0.5);
        model.advance();

        let machine = model.phase_machine().unwrap();
        assert_eq!(machine.lambda[0], 1.0);
        assert_eq!(machine.time_rest[0], 0.0);
        assert!(matches!(
            machine.phase[0],
            Phase::PostDepolarization | Phase::Hyperpolarization
        ));
    }

    #[test]
    fn test_phase_cold_start_kicks_a_subset() {
        let mut model = phase_model(40, 20);
        let threshold = model.config().neuron.threshold;
        model.cold_start();

        let machine = model.phase_machine().unwrap();
        let potentials = model.potentials();
        let kicked = potentials.iter().filter(|&&v| v != 0.0).count();
        assert!(kicked > 0 && kicked < 40);

        let mut crossed = 0;
        for i in 0..40 {
            // Increments are non-negative and the phase-0 transfer saturates at threshold
            assert!(potentials[i] >= 0.0 && potentials[i] <= threshold);
            if potentials[i] == threshold {
                crossed += 1;
                assert_eq!(machine.phase[i], Phase::Rise);
                assert!(model.activations()[i]);
                assert_eq!(machine.lambda[i], 1.0);
            } else {
                assert_eq!(machine.phase[i], Phase::Resting);
                assert!(!model.activations()[i]);
            }
        }
        assert!(crossed > 0);
    }

    #[test]
    fn test_weighted_cold_start_activates_only_at_vmax() {
        let params = NetworkParams::new(30, 0.6, 0.9).with_seed(21);
        let mut model = Model::new(Variant::Weighted, params).unwrap();
        let c = model.config().neuron;
        model.cold_start();

        let potentials = model.potentials();
        for (i, &active) in model.activations().iter().enumerate() {
            assert_eq!(active, potentials[i] == c.v_max);
            assert!(potentials[i] >= c.v_min && potentials[i] <= c.v_max);
            assert!(potentials[i] == c.v_max || potentials[i] <= c.threshold);
        }
        assert!(model.state().any_active());
    }

    #[test]
    fn test_refeed_recomputes_lambda_when_recovering_neuron_crosses() {
        let config = ModelConfig::new(NetworkParams::new(1, 0.5, 0.9)).unwrap();
        let mut crossings = 0;

        for seed in 0..200 {
            let mut machine = PhaseMachine::new(1);
            machine.phase[0] = Phase::PostDepolarization;
            machine.time_rest[0] = 1.0;
            let mut state = NeuronVector::new(1);
            state.potential[0] = 55.0;

            machine.refeed(&config, &mut state, &mut rng(seed));

            if machine.phase[0] == Phase::Rise {
                crossings += 1;
                assert!(state.active[0]);
                assert_eq!(state.potential[0], config.neuron.threshold);
                // Window taken at lambda = 1, before the update
                let window = config.phase.t_pd + config.phase.t_h + config.params.delta_t;
                let expected = 1.0 - 1.0 / window;
                assert!((machine.lambda[0] - expected).abs() < TOL);
                assert!(machine.lambda[0] < 1.0);
            } else {
                assert_eq!(machine.phase[0], Phase::Resting);
                assert_eq!(machine.lambda[0], 1.0);
            }
        }
        assert!(crossings > 0);
    }

    #[test]
    fn test_rested_network_refeed_never_crosses() {
        let config = ModelConfig::new(NetworkParams::new(50, 0.5, 0.9)).unwrap();
        let mut machine = PhaseMachine::new(50);
        let mut state = NeuronVector::new(50);

        machine.refeed(&config, &mut state, &mut rng(22));

        assert!(!state.any_active());
        assert!(machine.phase.iter().all(|&p| p == Phase::Resting));
    }

    #[test]
    fn test_broken_constants_rejected_before_stepping() {
        let mut config = ModelConfig::new(NetworkParams::new(5, 0.5, 0.9)).unwrap();
        config.neuron.threshold = 0.0;
        assert!(matches!(
            Model::with_config(Variant::Phase, config),
            Err(NetError::InvalidNeuronConstants(_))
        ));

        let mut config = ModelConfig::new(NetworkParams::new(5, 0.5, 0.9)).unwrap();
        config.neuron.v_min = 200.0;
        assert!(Model::with_config(Variant::Weighted, config).is_err());

        let mut config = ModelConfig::new(NetworkParams::new(5, 0.5, 0.9)).unwrap();
        config.phase.tau_min = 0.0;
        assert!(matches!(
            Model::with_config(Variant::Phase, config),
            Err(NetError::InvalidPhaseConstants(_))
        ));
    }

    #[test]
    fn test_model_rejects_invalid_params() {
        assert!(Model::new(Variant::Binary, NetworkParams::new(0, 0.5, 0.9)).is_err());
        assert!(Model::new(Variant::Phase, NetworkParams::new(5, 0.5, 0.9).with_ca(-2.0)).is_err());
    }

    #[test]
    fn test_layout_model() {
        let points: Vec<Point> = (0..6).map(|i| Point::new(10.0 * i as f64, 0.0)).collect();
        let params = NetworkParams::new(6, 0.5, 0.9).with_seed(18);
        let model = Model::with_layout(Variant::Binary, params, &points, 15.0).unwrap();

        for i in 0..6 {
            for j in 0..6 {
                if (i as i64 - j as i64).abs() > 1 {
                    assert_eq!(model.links().get(i, j), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_snapshot_summary_and_json() {
        let snapshot = Snapshot {
            generation: 3,
            routine: Routine::ColdStart,
            activations: vec![true, false, true, false],
            potentials: vec![120.0, 0.0, 120.0, -40.0],
        };

        assert_eq!(snapshot.active_count(), 2);
        assert!((snapshot.mean_potential() - 50.0).abs() < TOL);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"cold_start\""));
    }
}
