//! Error families.
//!
//! Only [`ConfigError`] and [`InvariantViolation`] ever reach a caller.
//! [`DetectionFailure`] and [`TrustUndetermined`] are resolved inside the
//! automaton by transitions.

use crate::types::{AutomatonState, Timestep};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected session configuration. Fatal to session construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {value} ({constraint})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        constraint: &'static str,
    },

    #[error("window_size {window_size} must be at least min_stable_iterations + 1 ({required})")]
    WindowTooSmall { window_size: usize, required: usize },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read configuration file {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid environment override {var}={value}")]
    EnvOverride { var: String, value: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "CONFIG_OUT_OF_RANGE",
            Self::WindowTooSmall { .. } => "CONFIG_WINDOW_TOO_SMALL",
            Self::Parse(_) => "CONFIG_PARSE",
            Self::Io { .. } => "CONFIG_IO",
            Self::EnvOverride { .. } => "CONFIG_ENV_OVERRIDE",
        }
    }
}

/// Why a window did not qualify as an equilibrium base case.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum DetectionFailure {
    #[error("parameter {parameter} sensitivity {sensitivity:e} exceeds threshold {threshold:e}")]
    InsufficientSensitivityMargin {
        parameter: usize,
        sensitivity: f64,
        threshold: f64,
    },

    #[error("only {observed} consecutive residual decreases, {required} required")]
    InsufficientConvergence { observed: usize, required: usize },

    #[error("conservation error {error:e} exceeds tolerance {tolerance:e}")]
    ConservationViolation { error: f64, tolerance: f64 },
}

impl DetectionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientSensitivityMargin { .. } => "INSUFFICIENT_SENSITIVITY_MARGIN",
            Self::InsufficientConvergence { .. } => "INSUFFICIENT_CONVERGENCE",
            Self::ConservationViolation { .. } => "CONSERVATION_VIOLATION",
        }
    }
}

/// No deviation is available to evaluate φ against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("trust undetermined: no deviation history")]
pub struct TrustUndetermined;

/// A broken design contract. The session is aborted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("audit sequence out of order: expected seq {expected}, got {got}")]
    AuditOutOfOrder { expected: u64, got: u64 },

    #[error("audit timestamp regressed from {previous} to {got}")]
    AuditTimestampRegression { previous: Timestep, got: Timestep },

    #[error("snapshot timestep {got} does not follow {previous}")]
    TimestepRegression { previous: Timestep, got: Timestep },

    #[error("trust value {0} outside [0, 1]")]
    TrustOutOfRange(f64),

    #[error("step attempted in terminal state {0}")]
    StepAfterTerminal(AutomatonState),

    #[error("session already closed")]
    SessionClosed,

    #[error("session already aborted: {0}")]
    Aborted(String),
}

impl InvariantViolation {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuditOutOfOrder { .. } => "AUDIT_OUT_OF_ORDER",
            Self::AuditTimestampRegression { .. } => "AUDIT_TIMESTAMP_REGRESSION",
            Self::TimestepRegression { .. } => "TIMESTEP_REGRESSION",
            Self::TrustOutOfRange(_) => "TRUST_OUT_OF_RANGE",
            Self::StepAfterTerminal(_) => "STEP_AFTER_TERMINAL",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::Aborted(_) => "ABORTED",
        }
    }
}

/// Everything a session driver may surface to its caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("audit store: {0}")]
    Store(#[from] anyhow::Error),

    #[error("audit export: {0}")]
    Export(#[from] serde_json::Error),
}

impl SessionError {
    /// True for programming-error class failures (as opposed to bad input or
    /// infrastructure).
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}
