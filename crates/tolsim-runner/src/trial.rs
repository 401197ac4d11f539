use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tolsim_netlist::{Netlist, Perturber};

use crate::snapshot::PristineSnapshot;
use crate::toolchain::Toolchain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Perturb,
    Build,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Perturb => "perturb",
            Phase::Build => "build",
            Phase::Run => "run",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    IoFailure,
    BuildFailure,
    RunFailure,
    ParseFailure,
    Timeout,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::IoFailure => "io_failure",
            FailureKind::BuildFailure => "build_failure",
            FailureKind::RunFailure => "run_failure",
            FailureKind::ParseFailure => "parse_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// Why a single trial produced no gain. None of these abort the run except
/// `Cancelled`.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("{phase} failed on {path}: {source}")]
    Io {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch {program} during {phase}: {source}")]
    Spawn {
        phase: Phase,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build exited with status {status}: {stderr_tail}")]
    Build { status: String, stderr_tail: String },

    #[error("simulator exited with status {status}: {stderr_tail}")]
    Run { status: String, stderr_tail: String },

    #[error("{phase} exceeded {secs}s timeout")]
    Timeout { phase: Phase, secs: u64 },

    #[error("no valid {marker}=<float> in simulator output: {detail}")]
    Parse { marker: String, detail: String },

    #[error("cancelled during {phase}")]
    Cancelled { phase: Phase },
}

impl TrialError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TrialError::Io { .. } => FailureKind::IoFailure,
            TrialError::Spawn {
                phase: Phase::Build,
                ..
            }
            | TrialError::Build { .. } => FailureKind::BuildFailure,
            TrialError::Spawn { .. } | TrialError::Run { .. } => FailureKind::RunFailure,
            TrialError::Timeout { .. } => FailureKind::Timeout,
            TrialError::Parse { .. } => FailureKind::ParseFailure,
            TrialError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Measured { gain: f64, gain_db: f64 },
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    /// 1-based trial number.
    pub index: usize,
    #[serde(flatten)]
    pub outcome: TrialOutcome,
    pub elapsed_ms: u64,
}

impl TrialRecord {
    pub fn gain_db(&self) -> Option<f64> {
        match self.outcome {
            TrialOutcome::Measured { gain_db, .. } => Some(gain_db),
            TrialOutcome::Failed { .. } => None,
        }
    }
}

/// Find the first `<marker>=` followed by a number and return that number.
/// Occurrences with no number after them (`TARGET_GAIN=N/A`) are skipped.
/// The gain must be finite and strictly positive so it has a dB value.
pub fn parse_gain(stdout: &str, marker: &str) -> Result<f64, TrialError> {
    let fail = |detail: String| TrialError::Parse {
        marker: marker.to_string(),
        detail,
    };
    let needle = format!("{}=", marker);
    let mut seen = false;
    for (idx, _) in stdout.match_indices(&needle) {
        seen = true;
        let token = numeric_prefix(&stdout[idx + needle.len()..]);
        let Ok(gain) = token.parse::<f64>() else {
            continue;
        };
        if !gain.is_finite() || gain <= 0.0 {
            return Err(fail(format!("gain {} is not a positive finite number", gain)));
        }
        return Ok(gain);
    }
    if seen {
        Err(fail("no numeric value after marker".to_string()))
    } else {
        Err(fail("marker not found".to_string()))
    }
}

/// Longest leading `[+-]digits[.digits][e[+-]digits]` slice of `s`. The
/// exponent is only taken when digits follow it, so `2.0e` yields `2.0`.
fn numeric_prefix(s: &str) -> &str {
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && matches!(bytes[exp], b'+' | b'-') {
            exp += 1;
        }
        let digits_start = exp;
        while exp < bytes.len() && bytes[exp].is_ascii_digit() {
            exp += 1;
        }
        if exp > digits_start {
            end = exp;
        }
    }
    &s[..end]
}

/// Everything one trial needs besides the toolchain.
pub struct TrialContext<'a> {
    pub netlist: &'a Netlist,
    pub gain_marker: &'a str,
}

/// PERTURB → BUILD → RUN → PARSE. Restoring the description is the caller's
/// job and happens whatever this returns.
pub fn run_trial<R: rand::Rng>(
    ctx: &TrialContext<'_>,
    perturber: &mut Perturber<R>,
    snapshot: &mut PristineSnapshot,
    toolchain: &dyn Toolchain,
) -> Result<f64, TrialError> {
    let perturbation = perturber.perturb(ctx.netlist);
    for v in &perturbation.values {
        tracing::trace!(name = %v.name, nominal = v.nominal, perturbed = v.perturbed, "perturbed");
    }
    snapshot
        .write_perturbed(perturbation.text.as_bytes())
        .map_err(|source| TrialError::Io {
            phase: Phase::Perturb,
            path: snapshot.path().to_path_buf(),
            source,
        })?;

    let artifact = toolchain.build(snapshot.path())?;
    let output = toolchain.run(&artifact)?;
    parse_gain(&output.stdout, ctx.gain_marker)
}
