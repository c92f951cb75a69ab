//! Session configuration
//!
//! Loaded from YAML (every field optional, defaults below), optionally patched
//! from `EQUILIBRIA_*` environment variables, and always validated before a
//! session can be built from it.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Prefix for environment overrides, e.g. `EQUILIBRIA_ALPHA=0.5`.
pub const ENV_PREFIX: &str = "EQUILIBRIA_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Largest admissible |∂‖u−u_eq‖/∂p_i|.
    pub sensitivity_threshold: f64,
    /// Relative field deviation that counts as one unit of δ.
    pub equilibrium_tolerance: f64,
    /// Trust decay rate α in φ = exp(−α·δ).
    pub alpha: f64,
    /// Steps allowed between entering SCAN and reaching VALIDATE.
    pub max_iterations: u64,
    /// φ must exceed this for TRUST → VALIDATE.
    pub confidence_threshold: f64,
    pub min_stable_iterations: usize,
    pub conservation_tolerance: f64,
    /// Capacity of the detection window.
    pub window_size: usize,
    /// Superseded configs kept for Level-3 rollback.
    pub rollback_depth: usize,
    /// Capacity of the δ ring buffer.
    pub deviation_history: usize,
    /// Timesteps within which a second Level-3 escalates to Level-4.
    pub level3_window: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sensitivity_threshold: 0.01,
            equilibrium_tolerance: 1e-4,
            alpha: 0.25,
            max_iterations: 10_000,
            confidence_threshold: 0.8,
            min_stable_iterations: 10,
            conservation_tolerance: 1e-6,
            window_size: 64,
            rollback_depth: 4,
            deviation_history: 32,
            level3_window: 50,
        }
    }
}

impl SessionConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "loaded session config");
        Self::from_yaml_str(&raw)
    }

    /// Apply `EQUILIBRIA_<FIELD>` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(std::env::vars())
    }

    /// Apply overrides from an explicit `(name, value)` source. Unknown names
    /// are ignored; unparsable values are rejected.
    pub fn with_overrides<I>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in vars {
            let Some(field) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let bad = || ConfigError::EnvOverride {
                var: var.clone(),
                value: value.clone(),
            };
            match field.to_ascii_lowercase().as_str() {
                "sensitivity_threshold" => {
                    self.sensitivity_threshold = value.parse().map_err(|_| bad())?
                }
                "equilibrium_tolerance" => {
                    self.equilibrium_tolerance = value.parse().map_err(|_| bad())?
                }
                "alpha" => self.alpha = value.parse().map_err(|_| bad())?,
                "max_iterations" => self.max_iterations = value.parse().map_err(|_| bad())?,
                "confidence_threshold" => {
                    self.confidence_threshold = value.parse().map_err(|_| bad())?
                }
                "min_stable_iterations" => {
                    self.min_stable_iterations = value.parse().map_err(|_| bad())?
                }
                "conservation_tolerance" => {
                    self.conservation_tolerance = value.parse().map_err(|_| bad())?
                }
                "window_size" => self.window_size = value.parse().map_err(|_| bad())?,
                "rollback_depth" => self.rollback_depth = value.parse().map_err(|_| bad())?,
                "deviation_history" => {
                    self.deviation_history = value.parse().map_err(|_| bad())?
                }
                "level3_window" => self.level3_window = value.parse().map_err(|_| bad())?,
                _ => continue,
            }
            debug!(%var, %value, "applied config override");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(
            field: &'static str,
            value: f64,
            ok: bool,
            constraint: &'static str,
        ) -> Result<(), ConfigError> {
            if ok && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    field,
                    value,
                    constraint,
                })
            }
        }

        let s = self.sensitivity_threshold;
        check("sensitivity_threshold", s, s >= 0.0, "must be >= 0")?;
        let t = self.equilibrium_tolerance;
        check("equilibrium_tolerance", t, t > 0.0, "must be > 0")?;
        check("alpha", self.alpha, self.alpha > 0.0, "must be > 0")?;
        let c = self.confidence_threshold;
        check(
            "confidence_threshold",
            c,
            c > 0.0 && c <= 1.0,
            "must be in (0, 1]",
        )?;
        let ct = self.conservation_tolerance;
        check("conservation_tolerance", ct, ct > 0.0, "must be > 0")?;

        let counts: [(&'static str, u64); 5] = [
            ("max_iterations", self.max_iterations),
            ("min_stable_iterations", self.min_stable_iterations as u64),
            ("rollback_depth", self.rollback_depth as u64),
            ("deviation_history", self.deviation_history as u64),
            ("level3_window", self.level3_window),
        ];
        for (field, value) in counts {
            check(field, value as f64, value >= 1, "must be >= 1")?;
        }

        let required = self.min_stable_iterations + 1;
        if self.window_size < required {
            return Err(ConfigError::WindowTooSmall {
                window_size: self.window_size,
                required,
            });
        }
        Ok(())
    }
}
