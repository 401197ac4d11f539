use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tolsim_analysis::{Aggregator, DriftSummary, Verdict};
use tolsim_netlist::{below_precision, Netlist, Perturbation, Perturber, ResistorDecl};

use crate::cancel::CancelFlag;
use crate::config::{AnalysisConfig, RunConfig};
use crate::snapshot::PristineSnapshot;
use crate::toolchain::Toolchain;
use crate::trial::{run_trial, TrialContext, TrialError, TrialOutcome, TrialRecord};

#[derive(Debug, Error)]
#[error("run cancelled after {completed} of {requested} trials; description restored")]
pub struct RunCancelled {
    pub completed: usize,
    pub requested: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub description: PathBuf,
    pub started_at: String,
    pub finished_at: String,
    pub seed: u64,
    pub tolerance: f64,
    pub resistors: usize,
    pub pristine_digest: String,
    pub trials_requested: usize,
    pub trials_succeeded: usize,
    pub trials_failed: usize,
    /// Absent when no trial succeeded.
    pub summary: Option<DriftSummary>,
    pub empty_result: Option<String>,
    pub verdict: Verdict,
    pub trials: Vec<TrialRecord>,
}

impl RunReport {
    pub fn samples_db(&self) -> Vec<f64> {
        self.trials.iter().filter_map(|t| t.gain_db()).collect()
    }
}

pub fn resolve_seed(config: &AnalysisConfig) -> u64 {
    config.seed.unwrap_or_else(rand::random::<u64>)
}

fn load_pristine(snapshot: &PristineSnapshot) -> Result<Netlist> {
    let text = std::str::from_utf8(snapshot.bytes()).with_context(|| {
        format!(
            "circuit description {} is not valid UTF-8",
            snapshot.path().display()
        )
    })?;
    Ok(Netlist::parse(text))
}

/// INIT → (PERTURB → BUILD → RUN → PARSE → RESTORE){N} → AGGREGATE.
///
/// The pristine description is captured before the loop and written back
/// after every trial; the snapshot guard covers every other way out.
pub fn run_analysis(
    description: &Path,
    config: &RunConfig,
    toolchain: &dyn Toolchain,
    cancel: &CancelFlag,
) -> Result<RunReport> {
    config.validate()?;
    let analysis = &config.analysis;
    let started_at = Utc::now().to_rfc3339();
    let seed = resolve_seed(analysis);

    let mut snapshot = PristineSnapshot::capture(description).with_context(|| {
        format!("failed to read circuit description {}", description.display())
    })?;
    let netlist = load_pristine(&snapshot)?;
    if netlist.resistors().is_empty() {
        tracing::warn!(
            description = %description.display(),
            "no eligible resistor declarations; trials will run unperturbed"
        );
    }
    for r in unrepresentable_resistors(netlist.resistors(), analysis.value_precision) {
        tracing::warn!(
            name = %r.name,
            value = r.value,
            precision = analysis.value_precision,
            "resistor value rounds to zero at this precision"
        );
    }
    let mut perturber = Perturber::seeded(analysis.tolerance, analysis.value_precision, seed)?;
    tracing::info!(
        trials = analysis.trials,
        tolerance = analysis.tolerance,
        resistors = netlist.resistors().len(),
        seed,
        "starting Monte-Carlo analysis"
    );

    let ctx = TrialContext {
        netlist: &netlist,
        gain_marker: &config.toolchain.gain_marker,
    };
    let mut aggregator = Aggregator::new();
    let mut records = Vec::with_capacity(analysis.trials);

    for index in 1..=analysis.trials {
        if cancel.is_cancelled() {
            return Err(cancelled(&mut snapshot, records.len(), analysis.trials));
        }
        let _span = tracing::info_span!("trial", index).entered();
        let started = Instant::now();
        let result = run_trial(&ctx, &mut perturber, &mut snapshot, toolchain);
        snapshot.restore().with_context(|| {
            format!(
                "failed to restore pristine description {}",
                description.display()
            )
        })?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(gain) => {
                let gain_db = aggregator.record_gain(gain);
                tracing::info!(gain, gain_db, "trial measured");
                TrialOutcome::Measured { gain, gain_db }
            }
            Err(TrialError::Cancelled { phase }) => {
                tracing::warn!(%phase, "trial interrupted");
                return Err(cancelled(&mut snapshot, records.len(), analysis.trials));
            }
            Err(err) => {
                aggregator.record_failure();
                tracing::warn!(kind = ?err.kind(), error = %err, "trial failed");
                TrialOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        };
        records.push(TrialRecord {
            index,
            outcome,
            elapsed_ms,
        });
    }

    if !snapshot.verify().context("failed to re-read circuit description")? {
        return Err(anyhow!(
            "circuit description {} does not match its pristine digest {} after the run",
            description.display(),
            snapshot.digest()
        ));
    }

    let (summary, empty_result) = match aggregator.summarize(&analysis.limits()) {
        Ok(summary) => (Some(summary), None),
        Err(err) => {
            tracing::error!(error = %err, "no statistics computed");
            (None, Some(err.to_string()))
        }
    };
    let verdict = summary
        .as_ref()
        .map(|s| s.verdict)
        .unwrap_or(Verdict::Fail);

    Ok(RunReport {
        description: description.to_path_buf(),
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        seed,
        tolerance: analysis.tolerance,
        resistors: netlist.resistors().len(),
        pristine_digest: snapshot.digest().to_string(),
        trials_requested: analysis.trials,
        trials_succeeded: aggregator.samples_db().len(),
        trials_failed: aggregator.failed(),
        summary,
        empty_result,
        verdict,
        trials: records,
    })
}

fn cancelled(snapshot: &mut PristineSnapshot, completed: usize, requested: usize) -> anyhow::Error {
    if let Err(e) = snapshot.restore() {
        tracing::error!(error = %e, "restore after cancellation failed");
    }
    RunCancelled {
        completed,
        requested,
    }
    .into()
}

#[derive(Debug, Clone)]
pub struct Preview {
    pub seed: u64,
    pub netlist: Netlist,
    pub perturbation: Perturbation,
}

/// One perturbed rendition of the description, computed in memory only.
pub fn preview_perturbation(description: &Path, analysis: &AnalysisConfig) -> Result<Preview> {
    let netlist = Netlist::load(description)?;
    let seed = resolve_seed(analysis);
    let mut perturber = Perturber::seeded(analysis.tolerance, analysis.value_precision, seed)?;
    let perturbation = perturber.perturb(&netlist);
    Ok(Preview {
        seed,
        netlist,
        perturbation,
    })
}

pub fn eligible_resistors(description: &Path) -> Result<Vec<ResistorDecl>> {
    Ok(Netlist::load(description)?.resistors().to_vec())
}

/// Declarations whose nominal value would render as zero at `precision`.
pub fn unrepresentable_resistors(resistors: &[ResistorDecl], precision: usize) -> Vec<&ResistorDecl> {
    resistors
        .iter()
        .filter(|r| below_precision(r.value, precision))
        .collect()
}
