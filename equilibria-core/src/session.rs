//! Verification session: one explicit object per run.
//!
//! A session owns its id, its validated configuration and its automaton. There
//! is no shared or global state; independent sessions may run in parallel.

use crate::audit::AuditTrail;
use crate::automaton::{Automaton, StepOutcome};
use crate::collision::CollisionEvent;
use crate::config::SessionConfig;
use crate::error::{ConfigError, InvariantViolation, SessionError};
use crate::types::{AutomatonState, SolverSnapshot, TrustAssessment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct VerificationSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    automaton: Automaton,
}

/// Summary of a finished session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub final_state: AutomatonState,
    pub assessment: TrustAssessment,
    pub entries: usize,
    pub collisions: usize,
    /// SHA-256 of the JSON-lines audit export.
    pub audit_digest: String,
    pub cancelled: bool,
}

impl VerificationSession {
    /// Validate `config` and start a session in SCAN.
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        Self::with_id(Uuid::now_v7(), config)
    }

    /// As [`new`](Self::new) with a caller-chosen id. Replays use a fixed id so
    /// their exports are byte-identical.
    pub fn with_id(id: Uuid, config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(session_id = %id, "verification session started");
        Ok(Self {
            id,
            started_at: Utc::now(),
            automaton: Automaton::new(id, config),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> AutomatonState {
        self.automaton.state()
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub fn trail(&self) -> &AuditTrail {
        self.automaton.trail()
    }

    pub fn step(&mut self, snapshot: &SolverSnapshot) -> Result<StepOutcome, InvariantViolation> {
        self.automaton.step(snapshot)
    }

    pub fn inject(&mut self, event: CollisionEvent) -> Result<StepOutcome, InvariantViolation> {
        self.automaton.inject(event)
    }

    pub fn rescan(&mut self) -> Result<Option<StepOutcome>, InvariantViolation> {
        self.automaton.rescan()
    }

    pub fn finish(&mut self) -> Result<TrustAssessment, InvariantViolation> {
        let assessment = self.automaton.finish()?;
        info!(
            session_id = %self.id,
            state = %self.automaton.state(),
            confidence = assessment.confidence,
            grade = ?assessment.grade,
            "verification session finished"
        );
        Ok(assessment)
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), InvariantViolation> {
        let reason = reason.into();
        info!(session_id = %self.id, %reason, "verification session cancelled");
        self.automaton.cancel(reason)
    }

    /// Build a report from the current trail. Call after `finish` or `cancel`.
    pub fn report(&self, cancelled: bool) -> Result<SessionReport, SessionError> {
        let trail = self.trail();
        let audit_digest = trail.digest()?;
        Ok(SessionReport {
            session_id: self.id,
            started_at: self.started_at,
            final_state: self.automaton.state(),
            assessment: self.automaton.assessment(),
            entries: trail.len(),
            collisions: trail.collisions().count(),
            audit_digest,
            cancelled,
        })
    }

    /// Run a full snapshot sequence through a fresh session and finish it.
    ///
    /// FAILED ends the run early; remaining snapshots are not consumed.
    pub fn replay(
        id: Uuid,
        config: SessionConfig,
        snapshots: &[SolverSnapshot],
    ) -> Result<Self, SessionError> {
        let mut session = Self::with_id(id, config)?;
        for snapshot in snapshots {
            session.step(snapshot)?;
            if session.state() == AutomatonState::Failed {
                break;
            }
        }
        session.finish()?;
        Ok(session)
    }
}
