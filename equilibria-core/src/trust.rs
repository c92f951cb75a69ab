//! Trust controller
//!
//! Owns the per-session [`TrustState`] and the exponential decay model
//! φ(t) = exp(−α·δ(t)). The overall feedback value is
//! f(x,t,φ) = g(x,t)·φ(t)·β(R(t)), with β the stability correction from
//! [`crate::metrics::stability_correction`].
//!
//! δ(t) is measured in units of the equilibrium tolerance, so δ = 1 means the
//! live field sits exactly one tolerance away from its anchor.

use crate::config::SessionConfig;
use crate::error::TrustUndetermined;
use crate::metrics;
use crate::types::{SolverSnapshot, TrustGrade};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// φ above this grades High.
pub const HIGH_GRADE_FLOOR: f64 = 0.8;
/// φ above this (and not above [`HIGH_GRADE_FLOOR`]) grades Medium.
pub const MEDIUM_GRADE_FLOOR: f64 = 0.4;

/// Fixed grading thresholds: `φ > 0.8 → High`, `0.4 < φ ≤ 0.8 → Medium`,
/// `φ ≤ 0.4 → Low`. NaN grades Low.
pub fn grade(phi: f64) -> TrustGrade {
    if phi > HIGH_GRADE_FLOOR {
        TrustGrade::High
    } else if phi > MEDIUM_GRADE_FLOOR {
        TrustGrade::Medium
    } else {
        TrustGrade::Low
    }
}

/// Result of one trust evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustReading {
    pub phi: f64,
    pub grade: TrustGrade,
    /// f(x,t,φ)
    pub feedback: f64,
    /// δ(t) the reading was computed from.
    pub deviation: f64,
}

/// Mutable per-session trust state.
#[derive(Clone, Debug, PartialEq)]
pub struct TrustState {
    pub phi: f64,
    pub grade: TrustGrade,
    pub alpha: f64,
    deviations: VecDeque<f64>,
    capacity: usize,
}

impl TrustState {
    fn new(alpha: f64, capacity: usize) -> Self {
        Self {
            phi: 0.0,
            grade: TrustGrade::Low,
            alpha,
            deviations: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn deviations(&self) -> impl Iterator<Item = f64> + '_ {
        self.deviations.iter().copied()
    }

    pub fn latest_deviation(&self) -> Option<f64> {
        self.deviations.back().copied()
    }

    fn record(&mut self, deviation: f64) {
        if self.deviations.len() == self.capacity {
            self.deviations.pop_front();
        }
        self.deviations.push_back(deviation);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrustController {
    state: TrustState,
    equilibrium_tolerance: f64,
}

impl TrustController {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: TrustState::new(config.alpha, config.deviation_history),
            equilibrium_tolerance: config.equilibrium_tolerance,
        }
    }

    pub fn state(&self) -> &TrustState {
        &self.state
    }

    /// φ = exp(−α·δ), clamped into [0, 1]. Non-finite δ gives 0.
    pub fn decay(&self, deviation: f64) -> f64 {
        if !deviation.is_finite() {
            return 0.0;
        }
        (-self.state.alpha * deviation.max(0.0)).exp().clamp(0.0, 1.0)
    }

    /// δ(t) for `snapshot` against its anchor, in tolerance units.
    pub fn deviation_from(&self, snapshot: &SolverSnapshot, anchor: &SolverSnapshot) -> f64 {
        metrics::relative_deviation(&snapshot.field, &anchor.field) / self.equilibrium_tolerance
    }

    /// Evaluate trust for `snapshot`.
    ///
    /// With `deviation = None` the latest recorded δ is reused; with no history
    /// at all the result is [`TrustUndetermined`].
    pub fn evaluate(
        &mut self,
        snapshot: &SolverSnapshot,
        deviation: Option<f64>,
    ) -> Result<TrustReading, TrustUndetermined> {
        let reading = self.assess(snapshot, deviation)?;
        self.commit(&reading, deviation.is_some());
        Ok(reading)
    }

    /// Same computation as [`evaluate`](Self::evaluate) without touching the
    /// trust state. The automaton assesses first and commits only after the
    /// audit entry is written.
    pub fn assess(
        &self,
        snapshot: &SolverSnapshot,
        deviation: Option<f64>,
    ) -> Result<TrustReading, TrustUndetermined> {
        let deviation = match deviation {
            Some(d) => d,
            None => self.state.latest_deviation().ok_or(TrustUndetermined)?,
        };

        let phi = self.decay(deviation);
        let feedback =
            snapshot.base_value * phi * metrics::stability_correction(snapshot.residual_norm);

        Ok(TrustReading {
            phi,
            grade: grade(phi),
            feedback,
            deviation,
        })
    }

    /// Fold a reading into the trust state. `fresh` readings also push their δ
    /// into the history.
    pub fn commit(&mut self, reading: &TrustReading, fresh: bool) {
        if fresh {
            self.state.record(reading.deviation);
        }
        self.state.phi = reading.phi;
        self.state.grade = reading.grade;
    }

    /// Mean of the δ ring buffer, if any.
    pub fn mean_deviation(&self) -> Option<f64> {
        let n = self.state.deviations.len();
        if n == 0 {
            return None;
        }
        Some(self.state.deviations.iter().sum::<f64>() / n as f64)
    }

    /// Forget all history (Level-4 reset).
    pub fn reset(&mut self) {
        self.state.deviations.clear();
        self.state.phi = 0.0;
        self.state.grade = TrustGrade::Low;
    }
}
