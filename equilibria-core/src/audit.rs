//! Audit trail - the ordered, append-only record of every automaton transition.
//!
//! Each entry is written before the automaton mutates any state, so a trail
//! always describes a prefix of what happened and replaying the same snapshot
//! sequence reproduces it exactly.

use crate::collision::{CollisionEvent, CollisionKind, Severity};
use crate::error::{DetectionFailure, InvariantViolation};
use crate::types::{AutomatonState, Generation, Timestep, TrustGrade};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Why a transition was taken.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// SCAN hold: not enough snapshots for a candidate window yet.
    AwaitingWindow { have: usize, need: usize },
    CandidateWindow { len: usize },
    EquilibriumDetected { generation: Generation },
    DetectionFailed { failure: DetectionFailure },
    /// VERIFY → TRUST.
    TrustGraded { grade: TrustGrade },
    /// VERIFY/TRUST → DETECT. `grade` is `None` when trust was undetermined.
    TrustInsufficient { grade: Option<TrustGrade> },
    /// TRUST hold while a severity ≥ 2 collision is still pending.
    PendingCollision { remaining: u64 },
    ConfidenceBelowThreshold { phi: f64 },
    ConfidenceReached { phi: f64 },
    Monitoring,
    CollisionResponse {
        kind: CollisionKind,
        severity: Severity,
    },
    IterationBudgetExhausted { steps: u64 },
    Rescan,
    EndOfStream,
    Cancelled { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: AutomatonState,
    pub to: AutomatonState,
    pub trigger: Trigger,
}

impl Transition {
    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }
}

/// One immutable audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    /// Timestep of the snapshot that caused the transition.
    pub timestamp: Timestep,
    /// φ at the time of the transition; 0.0 when undetermined.
    pub trust_value: f64,
    /// f(x,t,φ); 0.0 when no trust reading was taken.
    pub feedback: f64,
    /// State after the transition.
    pub state: AutomatonState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision: Option<CollisionEvent>,
    pub transition: Transition,
}

/// Append-only ordered sequence of [`AuditEntry`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next entry must carry.
    pub fn next_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Append an entry, enforcing dense sequence numbers and non-decreasing
    /// timestamps. Returns the entry's sequence number.
    pub fn append(&mut self, entry: AuditEntry) -> Result<u64, InvariantViolation> {
        let expected = self.next_seq();
        if entry.seq != expected {
            return Err(InvariantViolation::AuditOutOfOrder {
                expected,
                got: entry.seq,
            });
        }
        if let Some(last) = self.entries.last() {
            if entry.timestamp < last.timestamp {
                return Err(InvariantViolation::AuditTimestampRegression {
                    previous: last.timestamp,
                    got: entry.timestamp,
                });
            }
        }
        self.entries.push(entry);
        Ok(expected)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Entries with `seq >= from_seq`.
    pub fn since(&self, from_seq: u64) -> &[AuditEntry] {
        let start = usize::try_from(from_seq)
            .unwrap_or(usize::MAX)
            .min(self.entries.len());
        &self.entries[start..]
    }

    pub fn last(&self) -> Option<&AuditEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn collisions(&self) -> impl Iterator<Item = &CollisionEvent> {
        self.entries.iter().filter_map(|e| e.collision.as_ref())
    }

    /// Export as JSON lines, one entry per line, in sequence order.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        to_json_lines(&self.entries)
    }

    /// SHA-256 over the JSON-lines export, hex encoded.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let export = self.to_json_lines()?;
        Ok(hex::encode(Sha256::digest(export.as_bytes())))
    }
}

/// JSON-lines export of `entries`. Shared by in-memory trails and entries read
/// back from an [`AuditStore`](crate::store::AuditStore).
pub fn to_json_lines(entries: &[AuditEntry]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, timestamp: Timestep) -> AuditEntry {
        AuditEntry {
            seq,
            timestamp,
            trust_value: 0.0,
            feedback: 0.0,
            state: AutomatonState::Scan,
            collision: None,
            transition: Transition {
                from: AutomatonState::Scan,
                to: AutomatonState::Scan,
                trigger: Trigger::AwaitingWindow { have: 1, need: 4 },
            },
        }
    }

    #[test]
    fn test_append_assigns_dense_sequence() {
        let mut trail = AuditTrail::new();
        assert_eq!(trail.append(entry(0, 1)).unwrap(), 0);
        assert_eq!(trail.append(entry(1, 1)).unwrap(), 1);
        assert_eq!(trail.len(), 2);
        assert_eq!(trail.since(1).len(), 1);
        assert_eq!(trail.since(10).len(), 0);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut trail = AuditTrail::new();
        trail.append(entry(0, 1)).unwrap();
        assert_eq!(
            trail.append(entry(5, 2)),
            Err(InvariantViolation::AuditOutOfOrder {
                expected: 1,
                got: 5
            })
        );
        assert_eq!(trail.len(), 1);
    }

    #[test]
    fn test_timestamp_regression_rejected() {
        let mut trail = AuditTrail::new();
        trail.append(entry(0, 5)).unwrap();
        let err = trail.append(entry(1, 4)).unwrap_err();
        assert_eq!(err.code(), "AUDIT_TIMESTAMP_REGRESSION");
    }

    #[test]
    fn test_export_field_names() {
        let mut trail = AuditTrail::new();
        trail.append(entry(0, 3)).unwrap();
        let export = trail.to_json_lines().unwrap();
        let value: serde_json::Value = serde_json::from_str(export.trim()).unwrap();
        for field in ["timestamp", "trust_value", "state", "transition"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert!(value.get("collision").is_none());
        assert_eq!(value["transition"]["trigger"]["type"], "awaiting_window");
    }

    #[test]
    fn test_entry_export_matches_trail_export() {
        let mut trail = AuditTrail::new();
        trail.append(entry(0, 1)).unwrap();
        trail.append(entry(1, 2)).unwrap();
        let copied: Vec<AuditEntry> = trail.since(0).to_vec();
        assert_eq!(to_json_lines(&copied).unwrap(), trail.to_json_lines().unwrap());
        assert_eq!(to_json_lines(&[]).unwrap(), "");
    }

    #[test]
    fn test_digest_tracks_content() {
        let mut a = AuditTrail::new();
        let mut b = AuditTrail::new();
        a.append(entry(0, 1)).unwrap();
        b.append(entry(0, 1)).unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        b.append(entry(1, 2)).unwrap();
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }
}
