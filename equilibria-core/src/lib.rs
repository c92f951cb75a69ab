//! Equilibria Core - Equilibrium-anchored verification for CFD solutions.
//!
//! A verification session watches a stream of solver snapshots, identifies a
//! stable equilibrium base case, and grades every later snapshot against it:
//! - `metrics` - Distances, sensitivities, convergence runs, conservation drift
//! - `detector` - Equilibrium base-case detection over a snapshot window
//! - `trust` - φ(t) = exp(−α·δ(t)) and the feedback value f(x,t,φ)
//! - `collision` - Fingerprint mismatch / divergence classification, severity 1-4
//! - `automaton` - SCAN → DETECT → VERIFY → TRUST → VALIDATE plus FAILED
//! - `audit` - Append-only transition record with JSON-lines export
//! - `runner` - Async driver over an mpsc snapshot channel
//!
//! # Architecture
//!
//! ```text
//! SolverSnapshot ──► VerificationSession ──► Automaton
//!                                             ├── EquilibriumDetector
//!                                             ├── TrustController
//!                                             ├── CollisionClassifier
//!                                             └── AuditTrail ──► AuditStore
//! ```
//!
//! Each step writes its audit entry before any state changes, so a replay of
//! the same snapshot sequence reproduces the trail byte for byte.
//!
//! # Example
//!
//! ```
//! use equilibria_core::{SessionConfig, VerificationSession};
//!
//! let config = SessionConfig::from_yaml_str("min_stable_iterations: 4\nwindow_size: 16\n").unwrap();
//! let session = VerificationSession::new(config).unwrap();
//! assert_eq!(session.state().as_str(), "SCAN");
//! ```

pub mod audit;
pub mod automaton;
pub mod collision;
pub mod config;
pub mod detector;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod runner;
pub mod session;
pub mod store;
pub mod store_memory;
pub mod trust;
pub mod types;

pub use audit::{AuditEntry, AuditTrail, Transition, Trigger};
pub use automaton::{Automaton, ParameterNudge, PendingCollision, StepOutcome};
pub use collision::{CollisionClassifier, CollisionEvent, CollisionKind, Severity};
pub use config::SessionConfig;
pub use detector::EquilibriumDetector;
pub use error::{ConfigError, DetectionFailure, InvariantViolation, SessionError, TrustUndetermined};
pub use fingerprint::Fingerprint;
pub use runner::{run_session, run_sweep, SessionInput};
pub use session::{SessionReport, VerificationSession};
pub use store::AuditStore;
pub use store_memory::MemoryAuditStore;
pub use trust::{TrustController, TrustReading, TrustState};
pub use types::{
    AutomatonState, EquilibriumConfig, FieldSummary, Generation, SolverSnapshot, Timestep,
    TrustAssessment, TrustGrade,
};
