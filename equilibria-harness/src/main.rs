//! Equilibria Harness CLI
//!
//! Drives verification sessions from JSON-lines snapshot files:
//! 1. `synth` writes a synthetic converging stream, optionally perturbed
//! 2. `run` verifies one stream through the async runner
//! 3. `replay-check` runs the same stream N times in parallel and compares
//!    BLAKE3 digests of the audit exports
//!
//! Usage:
//!   equilibria-harness synth --steps 200 --perturb-at 120 --perturb-scale 0.02 --out run.jsonl
//!   equilibria-harness run --snapshots run.jsonl --audit-out audit.jsonl
//!   EQUILIBRIA_CONFIG=session.yaml equilibria-harness replay-check --snapshots run.jsonl --runs 8

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use equilibria_core::fingerprint::DEFAULT_QUANTUM;
use equilibria_core::{
    audit, run_session, run_sweep, AuditStore, FieldSummary, Fingerprint, MemoryAuditStore,
    SessionConfig, SessionInput, SolverSnapshot, TrustAssessment, VerificationSession,
};

#[derive(Parser, Debug)]
#[command(name = "equilibria-harness")]
#[command(about = "Equilibrium-anchored verification of CFD snapshot streams")]
struct Args {
    /// Session configuration (YAML). Defaults apply when omitted.
    #[arg(long, global = true, env = "EQUILIBRIA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a synthetic converging snapshot stream as JSON lines
    Synth {
        #[arg(long, default_value_t = 100)]
        steps: u64,

        /// Timestep at which to perturb the velocity field
        #[arg(long)]
        perturb_at: Option<u64>,

        /// Relative velocity perturbation applied at `perturb_at`
        #[arg(long, default_value_t = 0.01)]
        perturb_scale: f64,

        #[arg(long, short = 'o')]
        out: PathBuf,
    },

    /// Verify one snapshot stream and print the final report
    Run {
        #[arg(long, short = 's')]
        snapshots: PathBuf,

        /// Write the audit trail as JSON lines
        #[arg(long)]
        audit_out: Option<PathBuf>,
    },

    /// Run the same stream through independent sessions and compare audit digests
    ReplayCheck {
        #[arg(long, short = 's')]
        snapshots: PathBuf,

        #[arg(long, default_value_t = 4)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Synth {
            steps,
            perturb_at,
            perturb_scale,
            out,
        } => {
            let stream = synth(steps, perturb_at.map(|t| (t, perturb_scale)));
            write_snapshots(&out, &stream)?;
            info!(steps, path = %out.display(), "wrote snapshot stream");
        }

        Command::Run {
            snapshots,
            audit_out,
        } => {
            let config = load_config(args.config.as_deref())?;
            let stream = read_snapshots(&snapshots)?;
            run(config, stream, audit_out.as_deref()).await?;
        }

        Command::ReplayCheck { snapshots, runs } => {
            let config = load_config(args.config.as_deref())?;
            let stream = read_snapshots(&snapshots)?;
            replay_check(config, stream, runs).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let config = match path {
        Some(path) => SessionConfig::from_yaml_file(path)?,
        None => SessionConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

/// Residual decays geometrically from 1.0 to 1e-9; the field is steady except
/// for an optional one-step velocity perturbation.
fn synth(steps: u64, perturb: Option<(u64, f64)>) -> Vec<SolverSnapshot> {
    let span = steps.saturating_sub(1).max(1) as f64;
    (0..steps)
        .map(|t| {
            let mut field = FieldSummary {
                velocity_l2: 1.0,
                pressure_mean: 0.25,
                kinetic_energy: 0.5,
                total_mass: 1.0,
            };
            if let Some((at, scale)) = perturb {
                if t == at {
                    field.velocity_l2 *= 1.0 + scale;
                }
            }
            let parameters = vec![0.01, 1.0];
            SolverSnapshot {
                timestep: t,
                residual_norm: 10f64.powf(-9.0 * t as f64 / span),
                fingerprint: Fingerprint::of_state(&field, &parameters, DEFAULT_QUANTUM),
                parameters,
                field,
                base_value: 1.0,
            }
        })
        .collect()
}

fn write_snapshots(path: &Path, stream: &[SolverSnapshot]) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for snapshot in stream {
        serde_json::to_writer(&mut out, snapshot)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn read_snapshots(path: &Path) -> Result<Vec<SolverSnapshot>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut stream = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let snapshot = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid snapshot", path.display(), n + 1))?;
        stream.push(snapshot);
    }
    Ok(stream)
}

async fn run(
    config: SessionConfig,
    stream: Vec<SolverSnapshot>,
    audit_out: Option<&Path>,
) -> Result<()> {
    let session = VerificationSession::new(config)?;
    let session_id = session.id();
    let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());

    let (tx, rx) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let (assess_tx, mut assess_rx) = mpsc::channel::<TrustAssessment>(16);

    let feeder = tokio::spawn(async move {
        for snapshot in stream {
            if tx.send(SessionInput::Snapshot(snapshot)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(SessionInput::EndOfStream).await;
    });
    let printer = tokio::spawn(async move {
        while let Some(assessment) = assess_rx.recv().await {
            info!(
                confidence = assessment.confidence,
                grade = ?assessment.grade,
                "trust assessment"
            );
        }
    });

    let report = run_session(session, rx, cancel_rx, Arc::clone(&store), Some(assess_tx)).await?;
    feeder.abort();
    printer.await?;

    if let Some(path) = audit_out {
        let entries = store.read(session_id, 0).await?;
        fs::write(path, audit::to_json_lines(&entries)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(entries = entries.len(), path = %path.display(), "wrote audit trail");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn replay_check(
    config: SessionConfig,
    stream: Vec<SolverSnapshot>,
    runs: usize,
) -> Result<()> {
    if runs < 2 {
        bail!("replay-check needs at least 2 runs, got {}", runs);
    }
    let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let jobs = (0..runs)
        .map(|_| Ok((VerificationSession::new(config.clone())?, stream.clone())))
        .collect::<Result<Vec<_>>>()?;

    let mut digests: Vec<(Uuid, String)> = Vec::with_capacity(runs);
    for result in run_sweep(jobs, Arc::clone(&store), cancel_rx).await? {
        let report = result?;
        let entries = store.read(report.session_id, 0).await?;
        let export = audit::to_json_lines(&entries)?;
        let digest = blake3::hash(export.as_bytes()).to_hex().to_string();
        digests.push((report.session_id, digest));
    }

    let (_, reference) = digests
        .first()
        .ok_or_else(|| anyhow!("no sessions completed"))?;
    let drifted: Vec<&Uuid> = digests
        .iter()
        .filter(|(_, d)| d != reference)
        .map(|(id, _)| id)
        .collect();

    if !drifted.is_empty() {
        for id in &drifted {
            warn!(session_id = %id, "audit digest differs from first run");
        }
        bail!("{} of {} runs drifted", drifted.len(), runs);
    }

    println!("{} runs, blake3 {}", runs, reference);
    Ok(())
}
