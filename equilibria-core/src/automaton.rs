//! Verification automaton.
//!
//! SCAN → DETECT → VERIFY → TRUST → VALIDATE, plus the terminal FAILED state and
//! the collision responses that move the automaton backwards.
//!
//! Every call that changes the automaton goes through the same two phases:
//! `plan` decides the transition from an immutable view, then `commit` writes
//! the audit entry and only afterwards mutates state. A failed audit append
//! leaves the automaton untouched.

use crate::audit::{AuditEntry, AuditTrail, Transition, Trigger};
use crate::collision::{CollisionClassifier, CollisionEvent, EscalationContext, Severity};
use crate::config::SessionConfig;
use crate::detector::EquilibriumDetector;
use crate::error::InvariantViolation;
use crate::metrics;
use crate::trust::{TrustController, TrustReading};
use crate::types::{
    AutomatonState, EquilibriumConfig, Generation, SolverSnapshot, Timestep, TrustAssessment,
    TrustGrade,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A severity ≥ 2 collision that still blocks TRUST → VALIDATE.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingCollision {
    pub event: CollisionEvent,
    /// Clean TRUST steps still required before the collision is resolved.
    pub clean_steps_required: u64,
}

/// Level-1 response surfaced to the solver: steer back toward the anchor's
/// parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterNudge {
    pub timestamp: Timestep,
    pub magnitude: f64,
    pub target_parameters: Vec<f64>,
}

/// What one step produced.
#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    pub entry: AuditEntry,
    /// Present when TRUST or VALIDATE was entered.
    pub assessment: Option<TrustAssessment>,
    pub nudge: Option<ParameterNudge>,
}

impl StepOutcome {
    pub fn state(&self) -> AutomatonState {
        self.entry.state
    }
}

/// State mutations a planned transition carries out after its audit entry is
/// written.
#[derive(Clone, Debug)]
enum Effect {
    Hold,
    Adopt(EquilibriumConfig),
    BeginReidentify,
    ConsumeHold,
    Nudge,
    Rollback,
    Reset,
    Rescan,
    Close,
}

#[derive(Clone, Debug)]
struct Plan {
    to: AutomatonState,
    trigger: Trigger,
    reading: Option<TrustReading>,
    collision: Option<CollisionEvent>,
    effect: Effect,
}

impl Plan {
    fn new(to: AutomatonState, trigger: Trigger, reading: Option<TrustReading>) -> Self {
        Self {
            to,
            trigger,
            reading,
            collision: None,
            effect: Effect::Hold,
        }
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }
}

/// One verification session's state machine. Single writer of the current
/// equilibrium configuration and its rollback history.
#[derive(Clone, Debug)]
pub struct Automaton {
    session_id: Uuid,
    config: SessionConfig,
    state: AutomatonState,
    detector: EquilibriumDetector,
    trust: TrustController,
    classifier: CollisionClassifier,
    trail: AuditTrail,
    window: VecDeque<SolverSnapshot>,
    current: Option<EquilibriumConfig>,
    history: VecDeque<EquilibriumConfig>,
    next_generation: Generation,
    pending: Option<PendingCollision>,
    reidentifying: bool,
    level3_at: VecDeque<Timestep>,
    window_steps: u64,
    last_timestep: Option<Timestep>,
    closed: bool,
    aborted: Option<InvariantViolation>,
}

impl Automaton {
    /// Build an automaton in SCAN. `config` must already be validated.
    pub fn new(session_id: Uuid, config: SessionConfig) -> Self {
        Self {
            session_id,
            detector: EquilibriumDetector::new(&config),
            trust: TrustController::new(&config),
            classifier: CollisionClassifier::new(),
            state: AutomatonState::Scan,
            trail: AuditTrail::new(),
            window: VecDeque::with_capacity(config.window_size),
            current: None,
            history: VecDeque::with_capacity(config.rollback_depth),
            next_generation: 1,
            pending: None,
            reidentifying: false,
            level3_at: VecDeque::new(),
            window_steps: 0,
            last_timestep: None,
            closed: false,
            aborted: None,
            config,
        }
    }

    // ── Accessors ──

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> AutomatonState {
        self.state
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    pub fn trust(&self) -> &TrustController {
        &self.trust
    }

    pub fn current_config(&self) -> Option<&EquilibriumConfig> {
        self.current.as_ref()
    }

    /// Superseded configs, oldest first.
    pub fn rollback_history(&self) -> impl Iterator<Item = &EquilibriumConfig> {
        self.history.iter()
    }

    pub fn pending_collision(&self) -> Option<&PendingCollision> {
        self.pending.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn aborted(&self) -> Option<&InvariantViolation> {
        self.aborted.as_ref()
    }

    /// The assessment a caller receives right now.
    pub fn assessment(&self) -> TrustAssessment {
        let trust = self.trust.state();
        let anchored = matches!(
            self.state,
            AutomatonState::Verify | AutomatonState::Trust | AutomatonState::Validate
        );
        TrustAssessment {
            confidence: if anchored { trust.phi } else { 0.0 },
            grade: if anchored { trust.grade } else { TrustGrade::Low },
            session_id: self.session_id,
        }
    }

    /// Minimum number of further steps before VALIDATE could be reached.
    /// `u64::MAX` once FAILED.
    pub fn validation_distance(&self) -> u64 {
        let hold = self
            .pending
            .as_ref()
            .map(|p| p.clean_steps_required)
            .unwrap_or(0);
        match self.state {
            AutomatonState::Validate => 0,
            AutomatonState::Trust => hold + 1,
            AutomatonState::Verify => hold + 2,
            AutomatonState::Detect => hold + 3,
            AutomatonState::Scan => {
                let need = self.detector.candidate_len() as u64;
                let fill = need.saturating_sub(self.window.len() as u64).max(1);
                fill + hold + 3
            }
            AutomatonState::Failed => u64::MAX,
        }
    }

    // ── Driving ──

    /// Consume one snapshot and take exactly one transition.
    pub fn step(&mut self, snapshot: &SolverSnapshot) -> Result<StepOutcome, InvariantViolation> {
        self.ensure_live()?;
        if self.state == AutomatonState::Failed {
            return Err(InvariantViolation::StepAfterTerminal(self.state));
        }
        if let Some(previous) = self.last_timestep {
            if snapshot.timestep <= previous {
                return Err(self.abort(InvariantViolation::TimestepRegression {
                    previous,
                    got: snapshot.timestep,
                }));
            }
        }

        // An injected event may already carry a later timestamp.
        let timestamp = self.floor_timestamp(snapshot.timestep);
        let plan = self.plan(snapshot);
        self.commit(plan, timestamp, Some(snapshot))
    }

    /// Apply an externally reported collision. Level 3 is escalated against the
    /// session history exactly as for internally detected collisions.
    pub fn inject(&mut self, mut event: CollisionEvent) -> Result<StepOutcome, InvariantViolation> {
        self.ensure_live()?;
        if self.state == AutomatonState::Failed {
            return Err(InvariantViolation::StepAfterTerminal(self.state));
        }
        event.severity = self.escalation(event.timestamp).escalate(event.severity);
        let timestamp = self.floor_timestamp(event.timestamp);
        let plan = self.respond(event, None);
        self.commit(plan, timestamp, None)
    }

    /// Re-enter SCAN for the next window. Only valid from VALIDATE or FAILED;
    /// returns `None` otherwise.
    pub fn rescan(&mut self) -> Result<Option<StepOutcome>, InvariantViolation> {
        self.ensure_live()?;
        if !self.state.is_terminal() {
            return Ok(None);
        }
        let plan =
            Plan::new(AutomatonState::Scan, Trigger::Rescan, None).with_effect(Effect::Rescan);
        let timestamp = self.floor_timestamp(0);
        self.commit(plan, timestamp, None).map(Some)
    }

    /// Record the end of the snapshot stream and close the automaton.
    pub fn finish(&mut self) -> Result<TrustAssessment, InvariantViolation> {
        self.close(Trigger::EndOfStream)?;
        Ok(self.assessment())
    }

    /// Record a cancellation and close the automaton.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), InvariantViolation> {
        self.close(Trigger::Cancelled {
            reason: reason.into(),
        })
    }

    fn close(&mut self, trigger: Trigger) -> Result<(), InvariantViolation> {
        self.ensure_live()?;
        let plan = Plan::new(self.state, trigger, None).with_effect(Effect::Close);
        let timestamp = self.floor_timestamp(0);
        self.commit(plan, timestamp, None).map(|_| ())
    }

    // ── Planning (no mutation) ──

    fn plan(&self, snapshot: &SolverSnapshot) -> Plan {
        if !metrics::is_finite_snapshot(snapshot) {
            return self.respond(self.classifier.blow_up(snapshot), None);
        }

        let reading = self.current.as_ref().map(|eq| {
            let deviation = self.trust.deviation_from(snapshot, &eq.reference);
            // A fresh deviation is always supplied, so assess cannot be undetermined.
            self.trust
                .assess(snapshot, Some(deviation))
                .unwrap_or(TrustReading {
                    phi: 0.0,
                    grade: TrustGrade::Low,
                    feedback: 0.0,
                    deviation,
                })
        });

        // Classification runs only while an anchor is being relied on. In DETECT
        // the anchor is already under re-identification.
        if let (Some(eq), Some(r)) = (&self.current, &reading) {
            if matches!(
                self.state,
                AutomatonState::Verify | AutomatonState::Trust | AutomatonState::Validate
            ) {
                let trend = metrics::residual_trend(&self.residuals_with(snapshot));
                if let Some(event) = self.classifier.classify(
                    &snapshot.fingerprint,
                    eq.fingerprint(),
                    r.deviation,
                    trend,
                    self.escalation(snapshot.timestep),
                    snapshot,
                ) {
                    return self.respond(event, reading);
                }
            }
        }

        if self.state != AutomatonState::Validate && self.window_steps >= self.config.max_iterations
        {
            return Plan::new(
                AutomatonState::Failed,
                Trigger::IterationBudgetExhausted {
                    steps: self.window_steps,
                },
                reading,
            );
        }

        match self.state {
            AutomatonState::Scan => {
                let have = (self.window.len() + 1).min(self.config.window_size);
                let need = self.detector.candidate_len();
                if have >= need {
                    Plan::new(
                        AutomatonState::Detect,
                        Trigger::CandidateWindow { len: have },
                        reading,
                    )
                } else {
                    Plan::new(
                        AutomatonState::Scan,
                        Trigger::AwaitingWindow { have, need },
                        reading,
                    )
                }
            }

            AutomatonState::Detect => {
                let window = self.window_with(snapshot);
                match self.detector.detect(&window, self.next_generation) {
                    Ok(eq) => Plan::new(
                        AutomatonState::Verify,
                        Trigger::EquilibriumDetected {
                            generation: eq.generation,
                        },
                        reading,
                    )
                    .with_effect(Effect::Adopt(eq)),
                    Err(failure) if self.reidentifying => {
                        debug!(code = failure.code(), "re-identification failed");
                        let event = self
                            .classifier
                            .reidentification_failed(self.escalation(snapshot.timestep), snapshot);
                        self.respond(event, reading)
                    }
                    Err(failure) => Plan::new(
                        AutomatonState::Scan,
                        Trigger::DetectionFailed { failure },
                        reading,
                    ),
                }
            }

            AutomatonState::Verify => match reading {
                Some(r) if r.grade >= TrustGrade::Medium => Plan::new(
                    AutomatonState::Trust,
                    Trigger::TrustGraded { grade: r.grade },
                    reading,
                ),
                _ => Plan::new(
                    AutomatonState::Detect,
                    Trigger::TrustInsufficient {
                        grade: reading.map(|r| r.grade),
                    },
                    reading,
                )
                .with_effect(Effect::BeginReidentify),
            },

            AutomatonState::Trust => {
                let graded = reading.map(|r| r.grade).unwrap_or(TrustGrade::Low);
                if graded == TrustGrade::Low {
                    return Plan::new(
                        AutomatonState::Detect,
                        Trigger::TrustInsufficient {
                            grade: reading.map(|r| r.grade),
                        },
                        reading,
                    )
                    .with_effect(Effect::BeginReidentify);
                }
                let phi = reading.map(|r| r.phi).unwrap_or(0.0);
                match &self.pending {
                    Some(p) if p.clean_steps_required > 0 => Plan::new(
                        AutomatonState::Trust,
                        Trigger::PendingCollision {
                            remaining: p.clean_steps_required - 1,
                        },
                        reading,
                    )
                    .with_effect(Effect::ConsumeHold),
                    _ if phi > self.config.confidence_threshold => Plan::new(
                        AutomatonState::Validate,
                        Trigger::ConfidenceReached { phi },
                        reading,
                    ),
                    _ => Plan::new(
                        AutomatonState::Trust,
                        Trigger::ConfidenceBelowThreshold { phi },
                        reading,
                    ),
                }
            }

            AutomatonState::Validate => {
                Plan::new(AutomatonState::Validate, Trigger::Monitoring, reading)
            }

            // Rejected in step() before planning.
            AutomatonState::Failed => Plan::new(
                AutomatonState::Failed,
                Trigger::IterationBudgetExhausted {
                    steps: self.window_steps,
                },
                reading,
            ),
        }
    }

    /// Fixed severity → response mapping. SCAN has no anchor to re-identify or
    /// roll back, so only a reset affects it.
    fn respond(&self, event: CollisionEvent, reading: Option<TrustReading>) -> Plan {
        let prior = self.state;
        let (to, effect) = match event.severity {
            Severity::Nudge => (prior, Effect::Nudge),
            Severity::Reidentify if prior == AutomatonState::Scan => (prior, Effect::Hold),
            Severity::Reidentify => (AutomatonState::Detect, Effect::BeginReidentify),
            Severity::Rollback if prior == AutomatonState::Scan => (prior, Effect::Hold),
            Severity::Rollback => (AutomatonState::Verify, Effect::Rollback),
            Severity::Reset => (AutomatonState::Scan, Effect::Reset),
        };
        Plan {
            to,
            trigger: Trigger::CollisionResponse {
                kind: event.kind,
                severity: event.severity,
            },
            reading,
            collision: Some(event),
            effect,
        }
    }

    fn escalation(&self, now: Timestep) -> EscalationContext {
        let horizon = self.config.level3_window;
        EscalationContext {
            rollback_available: self.current.is_some() || !self.history.is_empty(),
            recent_level3: self
                .level3_at
                .iter()
                .filter(|&&t| now.saturating_sub(t) < horizon)
                .count(),
        }
    }

    fn window_with(&self, snapshot: &SolverSnapshot) -> Vec<SolverSnapshot> {
        let skip = (self.window.len() + 1).saturating_sub(self.config.window_size);
        self.window
            .iter()
            .skip(skip)
            .cloned()
            .chain(std::iter::once(snapshot.clone()))
            .collect()
    }

    fn residuals_with(&self, snapshot: &SolverSnapshot) -> Vec<f64> {
        self.window
            .iter()
            .map(|s| s.residual_norm)
            .chain(std::iter::once(snapshot.residual_norm))
            .collect()
    }

    fn floor_timestamp(&self, timestamp: Timestep) -> Timestep {
        let last = self.trail.last().map(|e| e.timestamp).unwrap_or(0);
        timestamp.max(last)
    }

    fn ensure_live(&self) -> Result<(), InvariantViolation> {
        if let Some(v) = &self.aborted {
            return Err(InvariantViolation::Aborted(v.to_string()));
        }
        if self.closed {
            return Err(InvariantViolation::SessionClosed);
        }
        Ok(())
    }

    fn abort(&mut self, violation: InvariantViolation) -> InvariantViolation {
        error!(
            session_id = %self.session_id,
            code = violation.code(),
            %violation,
            "verification session aborted"
        );
        self.aborted = Some(violation.clone());
        violation
    }

    // ── Commit (audit first, then mutate) ──

    fn commit(
        &mut self,
        plan: Plan,
        timestamp: Timestep,
        snapshot: Option<&SolverSnapshot>,
    ) -> Result<StepOutcome, InvariantViolation> {
        let from = self.state;
        let trust_value = plan
            .reading
            .map(|r| r.phi)
            .unwrap_or_else(|| self.trust.state().phi);
        if !(0.0..=1.0).contains(&trust_value) {
            return Err(self.abort(InvariantViolation::TrustOutOfRange(trust_value)));
        }

        let entry = AuditEntry {
            seq: self.trail.next_seq(),
            timestamp,
            trust_value,
            feedback: plan.reading.map(|r| r.feedback).unwrap_or(0.0),
            state: plan.to,
            collision: plan.collision.clone(),
            transition: Transition {
                from,
                to: plan.to,
                trigger: plan.trigger,
            },
        };
        if let Err(violation) = self.trail.append(entry.clone()) {
            return Err(self.abort(violation));
        }

        // Audit entry is durable in the trail; mutate.
        if let Some(s) = snapshot {
            if self.window.len() == self.config.window_size {
                self.window.pop_front();
            }
            self.window.push_back(s.clone());
            self.last_timestep = Some(s.timestep);
            self.window_steps += 1;
        }
        // VALIDATE closes the budget window; leaving it starts a fresh one.
        if plan.to == AutomatonState::Validate {
            self.window_steps = 0;
        }
        if let Some(r) = &plan.reading {
            self.trust.commit(r, true);
        }

        let mut nudge = None;
        match plan.effect {
            Effect::Hold => {}
            Effect::Adopt(eq) => {
                if let Some(old) = self.current.take() {
                    self.history.push_back(old);
                    if self.history.len() > self.config.rollback_depth {
                        self.history.pop_front();
                    }
                }
                self.next_generation = eq.generation + 1;
                self.current = Some(eq);
                self.reidentifying = false;
            }
            Effect::BeginReidentify => self.reidentifying = true,
            Effect::ConsumeHold => {
                if let Some(p) = self.pending.as_mut() {
                    p.clean_steps_required = p.clean_steps_required.saturating_sub(1);
                    if p.clean_steps_required == 0 {
                        self.pending = None;
                    }
                }
            }
            Effect::Nudge => {
                if let (Some(event), Some(eq)) = (&plan.collision, &self.current) {
                    nudge = Some(ParameterNudge {
                        timestamp: event.timestamp,
                        magnitude: event.magnitude,
                        target_parameters: eq.reference.parameters.clone(),
                    });
                }
            }
            Effect::Rollback => {
                if let Some(previous) = self.history.pop_back() {
                    self.current = Some(previous);
                }
                self.reidentifying = false;
            }
            Effect::Reset => {
                self.current = None;
                self.history.clear();
                self.window.clear();
                self.trust.reset();
                self.level3_at.clear();
                self.reidentifying = false;
                self.window_steps = 0;
            }
            Effect::Rescan => {
                if let Some(old) = self.current.take() {
                    self.history.push_back(old);
                    if self.history.len() > self.config.rollback_depth {
                        self.history.pop_front();
                    }
                }
                self.window.clear();
                self.trust.reset();
                self.reidentifying = false;
                self.window_steps = 0;
            }
            Effect::Close => self.closed = true,
        }

        if let Some(event) = &plan.collision {
            self.record_collision(event);
        }
        self.state = plan.to;

        let assessment = (from != plan.to
            && matches!(plan.to, AutomatonState::Trust | AutomatonState::Validate))
        .then(|| self.assessment());

        if from != plan.to {
            info!(
                session_id = %self.session_id,
                seq = entry.seq,
                timestamp,
                %from,
                to = %plan.to,
                trust = trust_value,
                "transition"
            );
        } else {
            debug!(session_id = %self.session_id, seq = entry.seq, state = %from, "hold");
        }

        Ok(StepOutcome {
            entry,
            assessment,
            nudge,
        })
    }

    fn record_collision(&mut self, event: &CollisionEvent) {
        if event.severity >= Severity::Reidentify {
            warn!(
                session_id = %self.session_id,
                timestamp = event.timestamp,
                kind = ?event.kind,
                severity = %event.severity,
                magnitude = event.magnitude,
                "collision"
            );
        }

        let floor = self
            .pending
            .as_ref()
            .map(|p| p.clean_steps_required)
            .unwrap_or(0)
            .max(self.config.min_stable_iterations as u64);
        let clean_steps_required = match event.severity {
            Severity::Nudge => return,
            Severity::Reidentify => floor,
            Severity::Rollback | Severity::Reset => floor + 1,
        };
        if event.severity == Severity::Rollback {
            self.level3_at.push_back(event.timestamp);
            let horizon = self.config.level3_window;
            while let Some(&front) = self.level3_at.front() {
                if event.timestamp.saturating_sub(front) >= horizon {
                    self.level3_at.pop_front();
                } else {
                    break;
                }
            }
        }
        self.pending = Some(PendingCollision {
            event: event.clone(),
            clean_steps_required,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::CollisionKind;
    use crate::fingerprint::Fingerprint;
    use crate::types::FieldSummary;

    const FP: Fingerprint = Fingerprint([7; 32]);

    fn config() -> SessionConfig {
        SessionConfig {
            min_stable_iterations: 3,
            window_size: 8,
            max_iterations: 100,
            ..SessionConfig::default()
        }
    }

    fn field() -> FieldSummary {
        FieldSummary {
            velocity_l2: 1.0,
            pressure_mean: 0.1,
            kinetic_energy: 0.5,
            total_mass: 2.0,
        }
    }

    fn snap(t: u64) -> SolverSnapshot {
        SolverSnapshot {
            timestep: t,
            residual_norm: 1.0 / (1 + t) as f64,
            parameters: vec![0.5],
            field: field(),
            base_value: 1.0,
            fingerprint: FP,
        }
    }

    fn automaton() -> Automaton {
        Automaton::new(Uuid::nil(), config())
    }

    fn drive_to(a: &mut Automaton, target: AutomatonState) -> u64 {
        let mut t = a.last_timestep.map(|t| t + 1).unwrap_or(0);
        while a.state() != target {
            a.step(&snap(t)).unwrap();
            t += 1;
            assert!(t < 100, "never reached {target}");
        }
        t
    }

    fn event(t: u64, severity: Severity) -> CollisionEvent {
        CollisionEvent {
            timestamp: t,
            kind: CollisionKind::HashMismatch,
            severity,
            magnitude: 0.0,
            snapshot: snap(t),
        }
    }

    #[test]
    fn test_happy_path_reaches_validate() {
        let mut a = automaton();
        let states: Vec<AutomatonState> = (0..8).map(|t| a.step(&snap(t)).unwrap().state()).collect();
        assert_eq!(
            states,
            vec![
                AutomatonState::Scan,
                AutomatonState::Scan,
                AutomatonState::Scan,
                AutomatonState::Detect,
                AutomatonState::Verify,
                AutomatonState::Trust,
                AutomatonState::Validate,
                AutomatonState::Validate,
            ]
        );
        assert_eq!(a.trail().len(), 8);
        assert_eq!(a.current_config().unwrap().generation, 1);
    }

    #[test]
    fn test_assessment_emitted_on_trust_and_validate_entry() {
        let mut a = automaton();
        let emitted: Vec<AutomatonState> = (0..8)
            .filter_map(|t| {
                let out = a.step(&snap(t)).unwrap();
                out.assessment.as_ref().map(|_| out.state())
            })
            .collect();
        assert_eq!(
            emitted,
            vec![AutomatonState::Trust, AutomatonState::Validate]
        );
    }

    #[test]
    fn test_detection_failure_returns_to_scan() {
        let mut a = automaton();
        // Flat residual: never converges.
        for t in 0..4 {
            let mut s = snap(t);
            s.residual_norm = 1.0;
            a.step(&s).unwrap();
        }
        assert_eq!(a.state(), AutomatonState::Detect);
        let mut s = snap(4);
        s.residual_norm = 1.0;
        let out = a.step(&s).unwrap();
        assert_eq!(out.state(), AutomatonState::Scan);
        assert!(matches!(
            out.entry.transition.trigger,
            Trigger::DetectionFailed { .. }
        ));
        assert!(a.current_config().is_none());
    }

    #[test]
    fn test_low_trust_in_verify_reidentifies() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Verify);
        let t = a.last_timestep.unwrap() + 1;
        let mut s = snap(t);
        s.field.velocity_l2 = 1.5; // far outside tolerance, same fingerprint
        let out = a.step(&s).unwrap();
        assert_eq!(out.state(), AutomatonState::Detect);
        assert!(a.reidentifying);
    }

    #[test]
    fn test_failed_reidentification_rolls_back() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Verify);
        let anchor = a.current_config().unwrap().clone();

        let t = a.last_timestep.unwrap() + 1;
        let mut far = snap(t);
        far.field.velocity_l2 = 1.5;
        a.step(&far).unwrap();
        assert_eq!(a.state(), AutomatonState::Detect);

        // Residual jumps: detection fails while re-identifying.
        let mut bad = snap(t + 1);
        bad.residual_norm = 10.0;
        let out = a.step(&bad).unwrap();
        let collision = out.entry.collision.unwrap();
        assert_eq!(collision.kind, CollisionKind::ReidentificationFailure);
        assert_eq!(collision.severity, Severity::Rollback);
        assert_eq!(out.entry.state, AutomatonState::Verify);
        assert_eq!(a.current_config(), Some(&anchor));
    }

    #[test]
    fn test_repeated_rollback_escalates_to_reset() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Trust);
        let t = a.last_timestep.unwrap();

        let first = a.inject(event(t, Severity::Rollback)).unwrap();
        assert_eq!(first.entry.collision.unwrap().severity, Severity::Rollback);
        assert_eq!(a.state(), AutomatonState::Verify);

        let second = a.inject(event(t + 1, Severity::Rollback)).unwrap();
        assert_eq!(second.entry.collision.unwrap().severity, Severity::Reset);
        assert_eq!(a.state(), AutomatonState::Scan);
        assert!(a.current_config().is_none());
        assert_eq!(a.rollback_history().count(), 0);
    }

    #[test]
    fn test_nudge_stays_in_place() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Trust);
        let t = a.last_timestep.unwrap();
        let out = a.inject(event(t, Severity::Nudge)).unwrap();
        assert_eq!(out.state(), AutomatonState::Trust);
        assert!(out.entry.transition.is_self_loop());
        assert_eq!(out.nudge.unwrap().target_parameters, vec![0.5]);
        assert!(a.pending_collision().is_none());
    }

    #[test]
    fn test_pending_collision_blocks_validation() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Trust);
        let t = a.last_timestep.unwrap();
        a.inject(event(t, Severity::Reidentify)).unwrap();
        assert_eq!(a.state(), AutomatonState::Detect);
        assert_eq!(a.pending_collision().unwrap().clean_steps_required, 3);

        let mut t = t + 1;
        // DETECT → VERIFY → TRUST, then three held TRUST steps, then VALIDATE.
        let mut states = Vec::new();
        while a.state() != AutomatonState::Validate {
            states.push(a.step(&snap(t)).unwrap().state());
            t += 1;
        }
        assert_eq!(
            states,
            vec![
                AutomatonState::Verify,
                AutomatonState::Trust,
                AutomatonState::Trust,
                AutomatonState::Trust,
                AutomatonState::Trust,
                AutomatonState::Validate,
            ]
        );
        assert!(a.pending_collision().is_none());
    }

    #[test]
    fn test_blow_up_resets() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Trust);
        let t = a.last_timestep.unwrap() + 1;
        let mut s = snap(t);
        s.residual_norm = f64::NAN;
        let out = a.step(&s).unwrap();
        assert_eq!(out.state(), AutomatonState::Scan);
        assert_eq!(out.entry.collision.unwrap().severity, Severity::Reset);
        assert!(a.current_config().is_none());
        assert_eq!(a.trust().mean_deviation(), None);
    }

    #[test]
    fn test_timestep_regression_aborts() {
        let mut a = automaton();
        a.step(&snap(5)).unwrap();
        let err = a.step(&snap(5)).unwrap_err();
        assert_eq!(err.code(), "TIMESTEP_REGRESSION");
        assert_eq!(a.trail().len(), 1);
        assert_eq!(a.step(&snap(6)).unwrap_err().code(), "ABORTED");
    }

    #[test]
    fn test_iteration_budget_fails_session() {
        let config = SessionConfig {
            max_iterations: 5,
            ..config()
        };
        let mut a = Automaton::new(Uuid::nil(), config);
        for t in 0..5 {
            let mut s = snap(t);
            s.residual_norm = 1.0;
            a.step(&s).unwrap();
        }
        let mut s = snap(5);
        s.residual_norm = 1.0;
        let out = a.step(&s).unwrap();
        assert_eq!(out.state(), AutomatonState::Failed);
        assert_eq!(
            a.step(&snap(6)).unwrap_err(),
            InvariantViolation::StepAfterTerminal(AutomatonState::Failed)
        );

        let rescan = a.rescan().unwrap().unwrap();
        assert_eq!(rescan.state(), AutomatonState::Scan);
        assert!(a.step(&snap(7)).is_ok());
    }

    #[test]
    fn test_budget_restarts_after_validate() {
        let config = SessionConfig {
            max_iterations: 20,
            ..config()
        };
        let mut a = Automaton::new(Uuid::nil(), config);
        let mut t = drive_to(&mut a, AutomatonState::Validate);

        // Monitor well past the budget.
        for _ in 0..30 {
            assert_eq!(a.step(&snap(t)).unwrap().state(), AutomatonState::Validate);
            t += 1;
        }
        a.inject(event(t - 1, Severity::Reidentify)).unwrap();
        assert_eq!(a.state(), AutomatonState::Detect);

        let out = a.step(&snap(t)).unwrap();
        assert_eq!(out.state(), AutomatonState::Verify);
        drive_to(&mut a, AutomatonState::Validate);
        assert!(a
            .trail()
            .entries()
            .iter()
            .all(|e| e.state != AutomatonState::Failed));
    }

    #[test]
    fn test_rollback_history_bounded_by_depth() {
        let config = SessionConfig {
            rollback_depth: 2,
            ..config()
        };
        let mut a = Automaton::new(Uuid::nil(), config);
        drive_to(&mut a, AutomatonState::Verify);

        for _ in 0..3 {
            let t = a.last_timestep.unwrap();
            a.inject(event(t, Severity::Reidentify)).unwrap();
            drive_to(&mut a, AutomatonState::Verify);
        }

        assert_eq!(a.current_config().unwrap().generation, 4);
        let history: Vec<Generation> = a.rollback_history().map(|c| c.generation).collect();
        assert_eq!(history, vec![2, 3]);
    }

    #[test]
    fn test_rollback_outside_level3_window_not_escalated() {
        let config = SessionConfig {
            level3_window: 5,
            ..config()
        };
        let mut a = Automaton::new(Uuid::nil(), config);
        drive_to(&mut a, AutomatonState::Trust);
        let t = a.last_timestep.unwrap();
        a.inject(event(t, Severity::Rollback)).unwrap();
        assert_eq!(a.state(), AutomatonState::Verify);

        // One timestep short of the window still escalates.
        let mut inside = a.clone();
        let out = inside.inject(event(t + 4, Severity::Rollback)).unwrap();
        assert_eq!(out.entry.collision.unwrap().severity, Severity::Reset);
        assert_eq!(inside.state(), AutomatonState::Scan);

        let out = a.inject(event(t + 5, Severity::Rollback)).unwrap();
        assert_eq!(out.entry.collision.unwrap().severity, Severity::Rollback);
        assert_eq!(a.state(), AutomatonState::Verify);
        assert_eq!(a.current_config().unwrap().generation, 1);
    }

    #[test]
    fn test_rescan_only_from_terminal() {
        let mut a = automaton();
        a.step(&snap(0)).unwrap();
        assert!(a.rescan().unwrap().is_none());

        drive_to(&mut a, AutomatonState::Validate);
        let out = a.rescan().unwrap().unwrap();
        assert_eq!(out.entry.transition.trigger, Trigger::Rescan);
        assert!(a.current_config().is_none());
        assert_eq!(a.rollback_history().count(), 1);
    }

    #[test]
    fn test_finish_closes_session() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Validate);
        let assessment = a.finish().unwrap();
        assert_eq!(assessment.grade, TrustGrade::High);
        assert_eq!(assessment.confidence, 1.0);
        assert_eq!(
            a.trail().last().unwrap().transition.trigger,
            Trigger::EndOfStream
        );
        assert_eq!(
            a.step(&snap(99)).unwrap_err(),
            InvariantViolation::SessionClosed
        );
    }

    #[test]
    fn test_reidentification_supersedes_config() {
        let mut a = automaton();
        drive_to(&mut a, AutomatonState::Trust);
        let t = a.last_timestep.unwrap();
        a.inject(event(t, Severity::Reidentify)).unwrap();
        let t = drive_to(&mut a, AutomatonState::Verify);
        assert!(t > 0);
        assert_eq!(a.current_config().unwrap().generation, 2);
        let history: Vec<Generation> = a.rollback_history().map(|c| c.generation).collect();
        assert_eq!(history, vec![1]);
    }

    #[test]
    fn test_validation_distance_matches_state() {
        let mut a = automaton();
        assert_eq!(a.validation_distance(), 4 + 3);
        drive_to(&mut a, AutomatonState::Detect);
        assert_eq!(a.validation_distance(), 3);
        drive_to(&mut a, AutomatonState::Validate);
        assert_eq!(a.validation_distance(), 0);
    }
}
