//! Monte-Carlo tolerance runs: perturb the circuit description, build and
//! simulate it once per trial, restore it, and aggregate the measured gains.

pub mod cancel;
pub mod config;
pub mod process;
pub mod run;
pub mod snapshot;
pub mod toolchain;
pub mod trial;

pub use cancel::CancelFlag;
pub use config::{AnalysisConfig, RunConfig, ToolchainConfig, CONFIG_TEMPLATE, DEFAULT_CONFIG_FILE};
pub use run::{
    eligible_resistors, preview_perturbation, resolve_seed, run_analysis, unrepresentable_resistors,
    Preview, RunCancelled, RunReport,
};
pub use snapshot::PristineSnapshot;
pub use toolchain::{Artifact, CommandToolchain, RawOutput, Toolchain};
pub use trial::{parse_gain, FailureKind, Phase, TrialError, TrialOutcome, TrialRecord};
pub use tolsim_analysis::{DriftSummary, Verdict};
