use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Solver timestep index. Doubles as the audit timestamp.
pub type Timestep = u64;

/// Monotonic per-session counter identifying an equilibrium configuration.
pub type Generation = u64;

// ─── Solver input ─────────────────────────────────────────────

/// Spatial field summary statistics. Treated as the state vector `u` for all
/// distance computations.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSummary {
    pub velocity_l2: f64,
    pub pressure_mean: f64,
    pub kinetic_energy: f64,
    pub total_mass: f64,
}

impl FieldSummary {
    pub fn as_vector(&self) -> [f64; 4] {
        [
            self.velocity_l2,
            self.pressure_mean,
            self.kinetic_energy,
            self.total_mass,
        ]
    }
}

/// One solver timestep as seen by the verifier. Produced by the external solver;
/// never mutated by the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverSnapshot {
    pub timestep: Timestep,
    /// Residual norm R(t).
    pub residual_norm: f64,
    /// Parameter vector p.
    pub parameters: Vec<f64>,
    pub field: FieldSummary,
    /// Externally supplied base solution value g(x,t).
    pub base_value: f64,
    pub fingerprint: Fingerprint,
}

impl SolverSnapshot {
    /// Returns false if any numeric field is NaN/inf or the residual is negative.
    pub fn is_well_formed(&self) -> bool {
        self.residual_norm.is_finite()
            && self.residual_norm >= 0.0
            && self.base_value.is_finite()
            && self.parameters.iter().all(|p| p.is_finite())
            && self.field.as_vector().iter().all(|v| v.is_finite())
    }
}

// ─── Equilibrium configuration ────────────────────────────────

/// A detected equilibrium base case. Immutable once created; re-identification
/// produces a new value with a higher generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumConfig {
    pub generation: Generation,
    pub sensitivity_threshold: f64,
    pub convergence_iterations: u32,
    pub equilibrium_tolerance: f64,
    pub stability_verified: bool,
    /// Largest |∂‖u−u_eq‖/∂p_i| observed during detection.
    pub max_sensitivity: f64,
    pub conservation_error: f64,
    /// The snapshot anchoring this configuration (u_eq).
    pub reference: SolverSnapshot,
}

impl EquilibriumConfig {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.reference.fingerprint
    }
}

// ─── Automaton state ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomatonState {
    Scan,
    Detect,
    Verify,
    Trust,
    Validate,
    Failed,
}

impl AutomatonState {
    /// Returns true for the window-ending states. VALIDATE keeps monitoring
    /// incoming snapshots; FAILED accepts none until a rescan.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AutomatonState::Validate | AutomatonState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AutomatonState::Scan => "SCAN",
            AutomatonState::Detect => "DETECT",
            AutomatonState::Verify => "VERIFY",
            AutomatonState::Trust => "TRUST",
            AutomatonState::Validate => "VALIDATE",
            AutomatonState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AutomatonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Trust output ─────────────────────────────────────────────

/// Discrete trust grade derived from φ with fixed thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustGrade {
    Low,
    Medium,
    High,
}

/// Emitted whenever TRUST or VALIDATE is entered, and once at session end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustAssessment {
    pub confidence: f64,
    pub grade: TrustGrade,
    pub session_id: Uuid,
}
