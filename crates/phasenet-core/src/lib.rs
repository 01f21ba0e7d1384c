//! # PhaseNet Core
//!
//! Shared types and utilities for the PhaseNet discrete-time spiking network.
//!
//! ## Model Variants
//!
//! | Variant | Activation | Links | Extra state |
//! |---------|-----------|-------|-------------|
//! | Binary | saturate at threshold | Bernoulli {0,1} | - |
//! | Weighted | clamp to [Vmin, Vmax] | signed partition per column | - |
//! | Psychoactive | clamp to [Vmin, Vmax] | partition rescaled by `ca` | - |
//! | Phase | five-phase lifecycle | partition rescaled by `ca` | phase, lambda, time_rest |
//!
//! ## Design Philosophy
//!
//! 1. One explicit configuration record, no ambient defaults
//! 2. Fail fast on invalid parameters, lenient mode only with warnings
//! 3. Reproducible runs from a single seed

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Model variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Binary,
    Weighted,
    Psychoactive,
    Phase,
}

impl Variant {
    pub const ALL: [Variant; 4] = [
        Variant::Binary,
        Variant::Weighted,
        Variant::Psychoactive,
        Variant::Phase,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Variant::Binary => "binary",
            Variant::Weighted => "weighted",
            Variant::Psychoactive => "psychoactive",
            Variant::Phase => "phase",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Variant::Binary => "Binary activation, unweighted links",
            Variant::Weighted => "Signed per-column normalized synapses, clamped potentials",
            Variant::Psychoactive => "Weighted synapses rescaled by a drug concentration",
            Variant::Phase => "Five-phase depolarization cycle with recovery penalty",
        }
    }

    /// Whether links are built with the proportionally-weighted policy
    pub fn is_weighted(&self) -> bool {
        !matches!(self, Variant::Binary)
    }

    /// Whether the pharmacological modulator is applied to the links
    pub fn is_modulated(&self) -> bool {
        matches!(self, Variant::Psychoactive | Variant::Phase)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Common errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("Invalid neuron count: {0} (must be at least 1)")]
    InvalidNeuronCount(usize),

    #[error("Invalid transmission coefficient beta: {0} (must be in (0, 1])")]
    InvalidBeta(f64),

    #[error("Invalid leak coefficient gamma: {0} (must be in [0, 1])")]
    InvalidGamma(f64),

    #[error("Invalid concentration ca: {0} (must be in [-1, 1])")]
    InvalidConcentration(f64),

    #[error("Invalid time step: {dt} (must be in (0, {t_pa}))")]
    InvalidTimeStep { dt: f64, t_pa: f64 },

    #[error("Invalid connection probability: {0} (must be in [0, 1])")]
    InvalidProbability(f64),

    #[error("Invalid radius: {0} (must be finite and non-negative)")]
    InvalidRadius(f64),

    #[error("Invalid neuron constants: {0}")]
    InvalidNeuronConstants(&'static str),

    #[error("Invalid phase constants: {0}")]
    InvalidPhaseConstants(&'static str),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Step count
pub type Generation = u64;

/// Time (ms)
pub type Time = f64;

/// Membrane potential (mV)
pub type Voltage = f64;

// ============================================================================
// CONFIGURATION
// ============================================================================

pub const DEFAULT_BETA: f64 = 0.5;
pub const DEFAULT_GAMMA: f64 = 0.9;
pub const DEFAULT_CA: f64 = 0.0;

/// Network parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    /// Number of neurons
    pub neurons: usize,
    /// Transmission-loss coefficient
    pub beta: f64,
    /// Leak coefficient
    pub gamma: f64,
    /// Drug concentration, negative = depressant, positive = stimulant
    pub ca: f64,
    /// Time step of the phase model (ms)
    pub delta_t: Time,
    /// Probability that an ordered pair of neurons is linked
    pub connection_probability: f64,
    /// Generator seed (None = entropy)
    pub seed: Option<u64>,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            neurons: 25,
            beta: 0.6,
            gamma: 0.9,
            ca: 0.0,
            delta_t: 0.05,
            connection_probability: 0.5,
            seed: None,
        }
    }
}

/// A parameter replaced by [`NetworkParams::sanitize`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamWarning {
    pub field: &'static str,
    pub given: f64,
    pub replaced_by: f64,
}

impl fmt::Display for ParamWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} is out of range, using {}",
            self.field, self.given, self.replaced_by
        )
    }
}

impl NetworkParams {
    pub fn new(neurons: usize, beta: f64, gamma: f64) -> Self {
        Self {
            neurons,
            beta,
            gamma,
            ..Default::default()
        }
    }

    pub fn with_ca(mut self, ca: f64) -> Self {
        self.ca = ca;
        self
    }

    pub fn with_delta_t(mut self, delta_t: Time) -> Self {
        self.delta_t = delta_t;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_connection_probability(mut self, p: f64) -> Self {
        self.connection_probability = p;
        self
    }

    /// Load parameters from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Check every parameter against its domain
    pub fn validate(&self, phase: &PhaseConstants) -> Result<()> {
        if self.neurons == 0 {
            return Err(NetError::InvalidNeuronCount(self.neurons));
        }
        validate_beta(self.beta)?;
        validate_gamma(self.gamma)?;
        validate_ca(self.ca)?;
        validate_delta_t(self.delta_t, phase)?;
        validate_probability(self.connection_probability)?;
        Ok(())
    }

    /// Replace out-of-range beta, gamma and ca with their defaults.
    ///
    /// Every replacement is reported so the caller can surface it.
    pub fn sanitize(mut self) -> (Self, Vec<ParamWarning>) {
        let mut warnings = Vec::new();

        if validate_beta(self.beta).is_err() {
            warnings.push(ParamWarning {
                field: "beta",
                given: self.beta,
                replaced_by: DEFAULT_BETA,
            });
            self.beta = DEFAULT_BETA;
        }
        if validate_gamma(self.gamma).is_err() {
            warnings.push(ParamWarning {
                field: "gamma",
                given: self.gamma,
                replaced_by: DEFAULT_GAMMA,
            });
            self.gamma = DEFAULT_GAMMA;
        }
        if validate_ca(self.ca).is_err() {
            warnings.push(ParamWarning {
                field: "ca",
                given: self.ca,
                replaced_by: DEFAULT_CA,
            });
            self.ca = DEFAULT_CA;
        }

        (self, warnings)
    }
}

pub fn validate_beta(beta: f64) -> Result<()> {
    if beta.is_finite() && beta > 0.0 && beta <= 1.0 {
        Ok(())
    } else {
        Err(NetError::InvalidBeta(beta))
    }
}

pub fn validate_gamma(gamma: f64) -> Result<()> {
    if (0.0..=1.0).contains(&gamma) {
        Ok(())
    } else {
        Err(NetError::InvalidGamma(gamma))
    }
}

pub fn validate_ca(ca: f64) -> Result<()> {
    if (-1.0..=1.0).contains(&ca) {
        Ok(())
    } else {
        Err(NetError::InvalidConcentration(ca))
    }
}

pub fn validate_delta_t(dt: Time, phase: &PhaseConstants) -> Result<()> {
    if dt.is_finite() && dt > 0.0 && dt < phase.t_pa {
        Ok(())
    } else {
        Err(NetError::InvalidTimeStep { dt, t_pa: phase.t_pa })
    }
}

pub fn validate_probability(p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(NetError::InvalidProbability(p))
    }
}

/// Potential levels shared by every variant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeuronConstants {
    /// Depolarization threshold (mV)
    pub threshold: Voltage,
    /// Peak potential (mV)
    pub v_max: Voltage,
    /// Floor of the weighted variants (mV)
    pub v_min: Voltage,
}

impl Default for NeuronConstants {
    fn default() -> Self {
        Self {
            threshold: 60.0,
            v_max: 120.0,
            v_min: -30.0,
        }
    }
}

impl NeuronConstants {
    /// Require `v_min < 0 < threshold < v_max`, all finite
    pub fn validate(&self) -> Result<()> {
        let levels = [self.threshold, self.v_max, self.v_min];
        if !levels.iter().all(|v| v.is_finite()) {
            return Err(NetError::InvalidNeuronConstants("levels must be finite"));
        }
        if self.threshold <= 0.0 {
            return Err(NetError::InvalidNeuronConstants("threshold must be positive"));
        }
        if self.v_max <= self.threshold {
            return Err(NetError::InvalidNeuronConstants("v_max must exceed threshold"));
        }
        if self.v_min >= 0.0 {
            return Err(NetError::InvalidNeuronConstants("v_min must be negative"));
        }
        Ok(())
    }
}

/// Timing and potential constants of the phase lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseConstants {
    /// Resting potential reached after post-depolarization (mV)
    pub v_rest: Voltage,
    /// Lowest potential of a phase-0 neuron (mV)
    pub v_min_ma: Voltage,
    /// Shortest relaxation time constant
    pub tau_min: f64,
    /// Potential-dependent part of the relaxation time constant
    pub tau_max: f64,
    /// Activation time, phases 1 and 2 (ms)
    pub t_pa: Time,
    /// Post-depolarization time, phase 3 (ms)
    pub t_pd: Time,
    /// Hyperpolarization time, phase 4 (ms)
    pub t_h: Time,
}

impl Default for PhaseConstants {
    fn default() -> Self {
        Self {
            v_rest: -5.0,
            v_min_ma: -15.0,
            tau_min: 10.0,
            tau_max: 20.0,
            t_pa: 1.0,
            t_pd: 0.9,
            t_h: 1.1,
        }
    }
}

impl PhaseConstants {
    /// Check the lifecycle constants against the neuron `threshold`.
    ///
    /// The phase-0 time constant `tau_min + tau_max * v / threshold` must stay
    /// positive down to `v_min_ma`.
    pub fn validate(&self, threshold: Voltage) -> Result<()> {
        let values = [
            self.v_rest,
            self.v_min_ma,
            self.tau_min,
            self.tau_max,
            self.t_pa,
            self.t_pd,
            self.t_h,
        ];
        if !values.iter().all(|v| v.is_finite()) {
            return Err(NetError::InvalidPhaseConstants("constants must be finite"));
        }
        if !(self.v_min_ma < self.v_rest && self.v_rest < 0.0) {
            return Err(NetError::InvalidPhaseConstants("need v_min_ma < v_rest < 0"));
        }
        if self.tau_min <= 0.0 || self.tau_max < 0.0 {
            return Err(NetError::InvalidPhaseConstants("need tau_min > 0 and tau_max >= 0"));
        }
        if self.tau_min + self.tau_max * self.v_min_ma / threshold <= 0.0 {
            return Err(NetError::InvalidPhaseConstants(
                "relaxation time constant vanishes above v_min_ma",
            ));
        }
        if self.t_pa <= 0.0 || self.t_pd <= 0.0 || self.t_h <= 0.0 {
            return Err(NetError::InvalidPhaseConstants("phase durations must be positive"));
        }
        Ok(())
    }
}

/// Everything an update routine reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub params: NetworkParams,
    pub neuron: NeuronConstants,
    pub phase: PhaseConstants,
}

impl ModelConfig {
    /// Validate `params` against the default constants
    pub fn new(params: NetworkParams) -> Result<Self> {
        let config = Self {
            params,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.neuron.validate()?;
        self.phase.validate(self.neuron.threshold)?;
        self.params.validate(&self.phase)
    }

    /// Diagonal entry of the link matrix
    pub fn self_leak(&self) -> f64 {
        self.params.gamma / self.params.beta
    }
}

// ============================================================================
// ACTIVITY TRACE
// ============================================================================

/// Per-step network activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityTrace {
    /// Generation of each record
    pub generation: Vec<Generation>,
    /// Number of emitting neurons
    pub active: Vec<usize>,
    /// Mean membrane potential
    pub mean_potential: Vec<Voltage>,
    /// Stimulation routine used at each step, if any
    pub routine: Vec<String>,
}

impl ActivityTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, generation: Generation, active: usize, mean: Voltage, routine: &str) {
        self.generation.push(generation);
        self.active.push(active);
        self.mean_potential.push(mean);
        self.routine.push(routine.to_string());
    }

    pub fn len(&self) -> usize {
        self.generation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generation.is_empty()
    }

    /// Largest number of simultaneously emitting neurons
    pub fn peak_active(&self) -> usize {
        self.active.iter().copied().max().unwrap_or(0)
    }

    /// Steps that used the given routine
    pub fn count_routine(&self, routine: &str) -> usize {
        self.routine.iter().filter(|r| r.as_str() == routine).count()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
