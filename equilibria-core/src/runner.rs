//! Async session driver.
//!
//! `run_session` awaits inputs on an mpsc channel and feeds them to one
//! session. A closed channel counts as end of stream. The `watch<bool>` cancel
//! signal is checked between steps, never inside one. Every audit entry is
//! forwarded to the [`AuditStore`] in sequence order, including on the
//! cancellation and invariant-violation paths.

use crate::collision::CollisionEvent;
use crate::error::SessionError;
use crate::session::{SessionReport, VerificationSession};
use crate::store::AuditStore;
use crate::types::{AutomatonState, SolverSnapshot, TrustAssessment};
use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Buffer between a feeder and its session in [`run_sweep`].
pub const INPUT_BUFFER: usize = 64;

#[derive(Clone, Debug)]
pub enum SessionInput {
    Snapshot(SolverSnapshot),
    /// Externally reported collision.
    Collision(CollisionEvent),
    EndOfStream,
}

/// Drive `session` until end of stream, FAILED, cancellation or an invariant
/// violation.
pub async fn run_session(
    mut session: VerificationSession,
    mut inputs: mpsc::Receiver<SessionInput>,
    mut cancel: watch::Receiver<bool>,
    store: Arc<dyn AuditStore>,
    assessments: Option<mpsc::Sender<TrustAssessment>>,
) -> Result<SessionReport, SessionError> {
    let session_id = session.id();
    let mut forwarded = 0u64;
    let mut cancel_live = true;
    info!(%session_id, "session runner started");

    let cancelled = loop {
        if *cancel.borrow() {
            break true;
        }

        let input = tokio::select! {
            biased;
            changed = cancel.changed(), if cancel_live => {
                if changed.is_err() {
                    // Sender gone: cancellation can no longer arrive.
                    cancel_live = false;
                }
                continue;
            }
            input = inputs.recv() => input,
        };

        let outcome = match input {
            None | Some(SessionInput::EndOfStream) => break false,
            Some(SessionInput::Snapshot(snapshot)) => session.step(&snapshot),
            Some(SessionInput::Collision(event)) => session.inject(event),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(violation) => {
                error!(%session_id, code = violation.code(), %violation, "session runner aborted");
                flush(&session, store.as_ref(), &mut forwarded).await?;
                return Err(violation.into());
            }
        };
        flush(&session, store.as_ref(), &mut forwarded).await?;

        if let (Some(tx), Some(assessment)) = (&assessments, outcome.assessment) {
            if tx.send(assessment).await.is_err() {
                debug!(%session_id, "assessment receiver dropped");
            }
        }

        if session.state() == AutomatonState::Failed {
            warn!(%session_id, "session failed, stopping runner");
            break false;
        }
    };

    if cancelled {
        session.cancel("cancellation requested")?;
    } else {
        session.finish()?;
    }
    flush(&session, store.as_ref(), &mut forwarded).await?;

    let report = session.report(cancelled)?;
    info!(
        %session_id,
        final_state = %report.final_state,
        entries = report.entries,
        collisions = report.collisions,
        cancelled,
        "session runner stopped"
    );
    Ok(report)
}

/// Forward entries the store has not seen yet.
async fn flush(
    session: &VerificationSession,
    store: &dyn AuditStore,
    forwarded: &mut u64,
) -> Result<(), SessionError> {
    for entry in session.trail().since(*forwarded) {
        store.append(session.id(), entry).await?;
        *forwarded += 1;
    }
    Ok(())
}

/// Run independent sessions in parallel, one task per session, each fed the
/// given snapshots followed by end of stream. Results come back in input order.
pub async fn run_sweep(
    jobs: Vec<(VerificationSession, Vec<SolverSnapshot>)>,
    store: Arc<dyn AuditStore>,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<Vec<Result<SessionReport, SessionError>>> {
    let total = jobs.len();
    let mut tasks = JoinSet::new();

    for (index, (session, snapshots)) in jobs.into_iter().enumerate() {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let (tx, rx) = mpsc::channel(INPUT_BUFFER);
            let feeder = tokio::spawn(async move {
                for snapshot in snapshots {
                    if tx.send(SessionInput::Snapshot(snapshot)).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(SessionInput::EndOfStream).await;
            });
            let result = run_session(session, rx, cancel, store, None).await;
            feeder.abort();
            (index, result)
        });
    }

    let mut results: Vec<Option<Result<SessionReport, SessionError>>> =
        (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|e| anyhow!("session task failed: {}", e))?;
        results[index] = Some(result);
    }

    info!(sessions = total, "sweep complete");
    results
        .into_iter()
        .enumerate()
        .map(|(index, r)| r.ok_or_else(|| anyhow!("session {} produced no result", index)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Trigger;
    use crate::config::SessionConfig;
    use crate::fingerprint::Fingerprint;
    use crate::store_memory::MemoryAuditStore;
    use crate::types::{FieldSummary, TrustGrade};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            min_stable_iterations: 3,
            window_size: 8,
            ..SessionConfig::default()
        }
    }

    fn snap(t: u64) -> SolverSnapshot {
        SolverSnapshot {
            timestep: t,
            residual_norm: 1.0 / (1 + t) as f64,
            parameters: vec![1.0],
            field: FieldSummary {
                velocity_l2: 1.0,
                pressure_mean: 0.0,
                kinetic_energy: 1.0,
                total_mass: 1.0,
            },
            base_value: 1.0,
            fingerprint: Fingerprint([9; 32]),
        }
    }

    #[tokio::test]
    async fn test_runs_to_end_of_stream() {
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let session = VerificationSession::new(config()).unwrap();
        let id = session.id();
        let (tx, rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (assess_tx, mut assess_rx) = mpsc::channel(16);

        for t in 0..10 {
            tx.send(SessionInput::Snapshot(snap(t))).await.unwrap();
        }
        tx.send(SessionInput::EndOfStream).await.unwrap();

        let report = run_session(session, rx, cancel_rx, Arc::clone(&store), Some(assess_tx))
            .await
            .unwrap();
        assert_eq!(report.final_state, AutomatonState::Validate);
        assert_eq!(report.assessment.grade, TrustGrade::High);
        assert!(!report.cancelled);

        let stored = store.read(id, 0).await.unwrap();
        assert_eq!(stored.len(), report.entries);
        assert_eq!(stored.last().unwrap().transition.trigger, Trigger::EndOfStream);

        let mut emitted = 0;
        while assess_rx.try_recv().is_ok() {
            emitted += 1;
        }
        assert_eq!(emitted, 2);
    }

    #[tokio::test]
    async fn test_closed_channel_is_end_of_stream() {
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let session = VerificationSession::new(config()).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        tx.send(SessionInput::Snapshot(snap(0))).await.unwrap();
        drop(tx);

        let report = run_session(session, rx, cancel_rx, store, None).await.unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.final_state, AutomatonState::Scan);
        assert_eq!(report.assessment.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_cancellation_flushes_trail() {
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let session = VerificationSession::new(config()).unwrap();
        let id = session.id();
        let (tx, rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(run_session(session, rx, cancel_rx, Arc::clone(&store), None));
        for t in 0..5 {
            tx.send(SessionInput::Snapshot(snap(t))).await.unwrap();
        }
        while store.read(id, 0).await.unwrap().len() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel_tx.send(true).unwrap();

        let report = handle.await.unwrap().unwrap();
        assert!(report.cancelled);
        let stored = store.read(id, 0).await.unwrap();
        assert_eq!(stored.len(), report.entries);
        assert_eq!(stored.len(), 6);
        assert!(matches!(
            stored.last().unwrap().transition.trigger,
            Trigger::Cancelled { .. }
        ));
    }

    #[tokio::test]
    async fn test_invariant_violation_surfaces_after_flush() {
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let session = VerificationSession::new(config()).unwrap();
        let id = session.id();
        let (tx, rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        tx.send(SessionInput::Snapshot(snap(3))).await.unwrap();
        tx.send(SessionInput::Snapshot(snap(2))).await.unwrap();

        let err = run_session(session, rx, cancel_rx, Arc::clone(&store), None)
            .await
            .unwrap_err();
        assert!(err.is_defect());
        assert_eq!(store.read(id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_runs_sessions_in_parallel() {
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let jobs: Vec<_> = (0..4)
            .map(|_| {
                let session = VerificationSession::new(config()).unwrap();
                (session, (0..12).map(snap).collect::<Vec<_>>())
            })
            .collect();

        let results = run_sweep(jobs, Arc::clone(&store), cancel_rx).await.unwrap();
        assert_eq!(results.len(), 4);
        let digests: Vec<String> = results
            .into_iter()
            .map(|r| {
                let report = r.unwrap();
                assert_eq!(report.final_state, AutomatonState::Validate);
                report.audit_digest
            })
            .collect();
        // The audit export carries no session id.
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.sessions().await.unwrap().len(), 4);
    }
}
