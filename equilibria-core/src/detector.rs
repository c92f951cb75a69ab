//! Equilibrium detection over a window of solver snapshots.
//!
//! Three phases run in order and short-circuit on the first failure:
//! sensitivity analysis, convergence verification, conservation validation.
//! The anchor (u_eq) is always the newest snapshot in the window.

use crate::config::SessionConfig;
use crate::error::DetectionFailure;
use crate::metrics;
use crate::types::{EquilibriumConfig, Generation, SolverSnapshot};
use tracing::debug;

/// Thresholds the detector applies. Copied out of [`SessionConfig`] so the
/// detector stays a plain value.
#[derive(Clone, Debug, PartialEq)]
pub struct EquilibriumDetector {
    sensitivity_threshold: f64,
    equilibrium_tolerance: f64,
    min_stable_iterations: usize,
    conservation_tolerance: f64,
}

impl EquilibriumDetector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sensitivity_threshold: config.sensitivity_threshold,
            equilibrium_tolerance: config.equilibrium_tolerance,
            min_stable_iterations: config.min_stable_iterations,
            conservation_tolerance: config.conservation_tolerance,
        }
    }

    /// Minimum number of snapshots a window needs before detection can pass.
    pub fn candidate_len(&self) -> usize {
        self.min_stable_iterations + 1
    }

    /// Decide whether `window` is an equilibrium base case.
    ///
    /// Pure: the same window and generation always give the same result.
    pub fn detect(
        &self,
        window: &[SolverSnapshot],
        generation: Generation,
    ) -> Result<EquilibriumConfig, DetectionFailure> {
        let Some(reference) = window.last() else {
            return Err(DetectionFailure::InsufficientConvergence {
                observed: 0,
                required: self.min_stable_iterations,
            });
        };

        // Phase 1: sensitivity
        let sensitivities = metrics::parameter_sensitivities(window, reference);
        let mut max_sensitivity = 0.0_f64;
        for (parameter, &sensitivity) in sensitivities.iter().enumerate() {
            if sensitivity > self.sensitivity_threshold {
                return Err(DetectionFailure::InsufficientSensitivityMargin {
                    parameter,
                    sensitivity,
                    threshold: self.sensitivity_threshold,
                });
            }
            max_sensitivity = max_sensitivity.max(sensitivity);
        }

        // Phase 2: convergence
        let residuals: Vec<f64> = window.iter().map(|s| s.residual_norm).collect();
        let run = metrics::trailing_decrease_run(&residuals);
        if run < self.min_stable_iterations {
            return Err(DetectionFailure::InsufficientConvergence {
                observed: run,
                required: self.min_stable_iterations,
            });
        }

        // Phase 3: conservation
        let conservation_error = metrics::conservation_error(window, reference);
        if conservation_error > self.conservation_tolerance {
            return Err(DetectionFailure::ConservationViolation {
                error: conservation_error,
                tolerance: self.conservation_tolerance,
            });
        }

        debug!(
            generation,
            timestep = reference.timestep,
            max_sensitivity,
            convergence_iterations = run,
            conservation_error,
            "equilibrium detected"
        );

        Ok(EquilibriumConfig {
            generation,
            sensitivity_threshold: self.sensitivity_threshold,
            convergence_iterations: u32::try_from(run).unwrap_or(u32::MAX),
            equilibrium_tolerance: self.equilibrium_tolerance,
            stability_verified: true,
            max_sensitivity,
            conservation_error,
            reference: reference.clone(),
        })
    }
}
