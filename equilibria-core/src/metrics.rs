//! Stability metrics.
//!
//! Pure functions over solver snapshots: distances, sensitivities, convergence
//! runs, conservation drift and the residual trend. Nothing here holds state.

use crate::types::{FieldSummary, SolverSnapshot};
use serde::{Deserialize, Serialize};

/// Floor for denominators so relative measures stay finite near zero.
pub const NORM_FLOOR: f64 = 1e-12;

/// Parameter steps smaller than this are treated as "not varied".
pub const PARAMETER_STEP_FLOOR: f64 = 1e-12;

/// Number of trailing residuals that must strictly increase to call a reversal.
pub const TREND_SPAN: usize = 3;

/// Direction of the residual over the recent window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trend", rename_all = "snake_case")]
pub enum ResidualTrend {
    Decreasing,
    Stalled,
    /// The last [`TREND_SPAN`] residuals strictly increase. `growth` is the
    /// latest residual over the window minimum.
    Reversed { growth: f64 },
}

impl ResidualTrend {
    pub fn is_reversed(&self) -> bool {
        matches!(self, ResidualTrend::Reversed { .. })
    }
}

pub fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// ‖a − b‖₂ over the field summary vector.
pub fn field_distance(a: &FieldSummary, b: &FieldSummary) -> f64 {
    let (a, b) = (a.as_vector(), b.as_vector());
    let diff: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x - y).collect();
    l2_norm(&diff)
}

/// ‖u − u_eq‖ / ‖u_eq‖, with the denominator floored at [`NORM_FLOOR`].
pub fn relative_deviation(observed: &FieldSummary, reference: &FieldSummary) -> f64 {
    let scale = l2_norm(&reference.as_vector()).max(NORM_FLOOR);
    field_distance(observed, reference) / scale
}

/// Finite-difference estimate of ∂‖u−u_eq‖/∂p_i for every parameter.
///
/// Uses consecutive snapshot pairs where p_i moved by more than
/// [`PARAMETER_STEP_FLOOR`] and reports the largest magnitude seen. A parameter
/// that never moves reports 0.
pub fn parameter_sensitivities(window: &[SolverSnapshot], reference: &SolverSnapshot) -> Vec<f64> {
    let n_params = reference.parameters.len();
    let mut sensitivities = vec![0.0_f64; n_params];

    for pair in window.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let d_prev = field_distance(&prev.field, &reference.field);
        let d_next = field_distance(&next.field, &reference.field);

        for (i, slot) in sensitivities.iter_mut().enumerate() {
            let (Some(p0), Some(p1)) = (prev.parameters.get(i), next.parameters.get(i)) else {
                continue;
            };
            let dp = p1 - p0;
            if dp.abs() <= PARAMETER_STEP_FLOOR {
                continue;
            }
            let derivative = ((d_next - d_prev) / dp).abs();
            if derivative > *slot {
                *slot = derivative;
            }
        }
    }
    sensitivities
}

/// Length of the trailing run of strictly decreasing residual steps.
pub fn trailing_decrease_run(residuals: &[f64]) -> usize {
    residuals
        .windows(2)
        .rev()
        .take_while(|w| w[1] < w[0])
        .count()
}

/// Largest relative drift of total mass or kinetic energy from the reference.
pub fn conservation_error(window: &[SolverSnapshot], reference: &SolverSnapshot) -> f64 {
    let mass_ref = reference.field.total_mass.abs().max(NORM_FLOOR);
    let energy_ref = reference.field.kinetic_energy.abs().max(NORM_FLOOR);

    window.iter().fold(0.0_f64, |worst, s| {
        let mass = (s.field.total_mass - reference.field.total_mass).abs() / mass_ref;
        let energy = (s.field.kinetic_energy - reference.field.kinetic_energy).abs() / energy_ref;
        worst.max(mass).max(energy)
    })
}

pub fn residual_trend(residuals: &[f64]) -> ResidualTrend {
    if residuals.len() >= TREND_SPAN {
        let tail = &residuals[residuals.len() - TREND_SPAN..];
        if tail.windows(2).all(|w| w[1] > w[0]) {
            let min = residuals.iter().copied().fold(f64::INFINITY, f64::min);
            let latest = residuals[residuals.len() - 1];
            return ResidualTrend::Reversed {
                growth: latest / min.max(NORM_FLOOR),
            };
        }
    }
    match residuals {
        [.., a, b] if b < a => ResidualTrend::Decreasing,
        _ => ResidualTrend::Stalled,
    }
}

/// False on any NaN/inf value or a negative residual.
pub fn is_finite_snapshot(snapshot: &SolverSnapshot) -> bool {
    snapshot.is_well_formed()
}

/// β(R) = 1 / (1 + ln(1 + R)). Monotonically decreasing, β(0) = 1.
/// Negative or non-finite residuals are treated as unbounded (β = 0).
pub fn stability_correction(residual: f64) -> f64 {
    if !residual.is_finite() || residual < 0.0 {
        return 0.0;
    }
    1.0 / (1.0 + residual.ln_1p())
}
