//! Collision and anomaly classification.
//!
//! A collision is raised when the observed structural fingerprint differs from
//! the one recorded at the last verification, or when the residual trend
//! reverses. Severity comes from fixed ladders over a deviation score and is
//! then escalated against the session's recent history.
//!
//! | Score | Level 1 | Level 2 | Level 3 | Level 4 |
//! |-------|---------|---------|---------|---------|
//! | fingerprint δ (tolerance units) | `< 1` | `< 10` | `< 100` | `≥ 100` |
//! | divergence (decades of residual growth) | `< 1` | `< 2` | `< 3` | `≥ 3` |
//!
//! A score sitting exactly on a cutoff takes the higher level.

use crate::fingerprint::Fingerprint;
use crate::metrics::ResidualTrend;
use crate::types::{SolverSnapshot, Timestep};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionKind {
    HashMismatch,
    Divergence,
    ReidentificationFailure,
}

/// Graduated response level. Each level maps to exactly one automaton response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Severity {
    /// Within trust bounds: parameter adjustment, no transition.
    Nudge = 1,
    /// Beyond trust bounds but prior equilibrium plausible: re-identify.
    Reidentify = 2,
    /// Re-identification failed: roll back to the last verified config.
    Rollback = 3,
    /// No rollback target, or repeated rollback: full reset to SCAN.
    Reset = 4,
}

impl Severity {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl From<Severity> for u8 {
    fn from(s: Severity) -> u8 {
        s.level()
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Severity::Nudge),
            2 => Ok(Severity::Reidentify),
            3 => Ok(Severity::Rollback),
            4 => Ok(Severity::Reset),
            other => Err(format!("severity {other} outside 1..=4")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.level())
    }
}

/// Monotone score → severity mapping. Cutoffs are the scores at which levels
/// 2, 3 and 4 begin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeverityLadder {
    pub level2_at: f64,
    pub level3_at: f64,
    pub level4_at: f64,
}

pub const FINGERPRINT_LADDER: SeverityLadder = SeverityLadder {
    level2_at: 1.0,
    level3_at: 10.0,
    level4_at: 100.0,
};

pub const DIVERGENCE_LADDER: SeverityLadder = SeverityLadder {
    level2_at: 1.0,
    level3_at: 2.0,
    level4_at: 3.0,
};

impl SeverityLadder {
    pub fn severity(&self, score: f64) -> Severity {
        // NaN fails every comparison below and lands on Reset.
        if score < self.level2_at {
            Severity::Nudge
        } else if score < self.level3_at {
            Severity::Reidentify
        } else if score < self.level4_at {
            Severity::Rollback
        } else {
            Severity::Reset
        }
    }
}

/// Immutable record of one verification anomaly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollisionEvent {
    pub timestamp: Timestep,
    pub kind: CollisionKind,
    pub severity: Severity,
    /// Score that produced the severity (before escalation).
    pub magnitude: f64,
    pub snapshot: SolverSnapshot,
}

/// Session history the classifier needs to escalate Level 3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EscalationContext {
    pub rollback_available: bool,
    /// Level-3 events already seen within the configured window.
    pub recent_level3: usize,
}

impl EscalationContext {
    pub(crate) fn escalate(&self, severity: Severity) -> Severity {
        if severity == Severity::Rollback && (!self.rollback_available || self.recent_level3 > 0) {
            Severity::Reset
        } else {
            severity
        }
    }
}

/// Stateless classifier. All history arrives through [`EscalationContext`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CollisionClassifier;

impl CollisionClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify one observation against the last verified fingerprint.
    ///
    /// `deviation` is δ in tolerance units; it sizes fingerprint mismatches.
    pub fn classify(
        &self,
        observed: &Fingerprint,
        expected: &Fingerprint,
        deviation: f64,
        trend: ResidualTrend,
        escalation: EscalationContext,
        snapshot: &SolverSnapshot,
    ) -> Option<CollisionEvent> {
        let mismatch = (observed != expected).then(|| {
            // f64::max would swallow NaN; keep it so the ladder lands on Reset.
            let score = if deviation < 0.0 { 0.0 } else { deviation };
            (
                CollisionKind::HashMismatch,
                FINGERPRINT_LADDER.severity(score),
                score,
            )
        });

        let divergence = match trend {
            ResidualTrend::Reversed { growth } => {
                let score = if growth > 1.0 { growth.log10() } else { 0.0 };
                Some((
                    CollisionKind::Divergence,
                    DIVERGENCE_LADDER.severity(score),
                    score,
                ))
            }
            _ => None,
        };

        let (kind, severity, magnitude) = match (mismatch, divergence) {
            (Some(m), Some(d)) => {
                if d.1 > m.1 {
                    d
                } else {
                    m
                }
            }
            (Some(m), None) => m,
            (None, Some(d)) => d,
            (None, None) => return None,
        };

        Some(CollisionEvent {
            timestamp: snapshot.timestep,
            kind,
            severity: escalation.escalate(severity),
            magnitude,
            snapshot: snapshot.clone(),
        })
    }

    /// A requested re-identification found no equilibrium.
    pub fn reidentification_failed(
        &self,
        escalation: EscalationContext,
        snapshot: &SolverSnapshot,
    ) -> CollisionEvent {
        CollisionEvent {
            timestamp: snapshot.timestep,
            kind: CollisionKind::ReidentificationFailure,
            severity: escalation.escalate(Severity::Rollback),
            magnitude: FINGERPRINT_LADDER.level3_at,
            snapshot: snapshot.clone(),
        }
    }

    /// The solver produced non-finite state.
    pub fn blow_up(&self, snapshot: &SolverSnapshot) -> CollisionEvent {
        CollisionEvent {
            timestamp: snapshot.timestep,
            kind: CollisionKind::Divergence,
            severity: Severity::Reset,
            magnitude: f64::MAX,
            snapshot: snapshot.clone(),
        }
    }
}
