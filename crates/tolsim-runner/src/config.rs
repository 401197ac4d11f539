use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tolsim_analysis::DriftLimits;
use tolsim_netlist::{DEFAULT_PRECISION, MAX_PRECISION};

pub const DEFAULT_CONFIG_FILE: &str = "tolsim.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub trials: usize,
    pub tolerance: f64,
    pub drift_limit_db: f64,
    pub target_gain_db: f64,
    pub seed: Option<u64>,
    pub value_precision: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            trials: 20,
            tolerance: 0.05,
            drift_limit_db: 0.5,
            target_gain_db: 6.02,
            seed: None,
            value_precision: DEFAULT_PRECISION,
        }
    }
}

impl AnalysisConfig {
    pub fn limits(&self) -> DriftLimits {
        DriftLimits {
            drift_limit_db: self.drift_limit_db,
            target_gain_db: self.target_gain_db,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    /// Build directory; defaults to the directory holding the description.
    pub work_dir: Option<PathBuf>,
    pub compiler: String,
    pub compiler_flags: Vec<String>,
    pub entry_source: PathBuf,
    pub artifact: PathBuf,
    pub gain_marker: String,
    pub build_timeout_secs: u64,
    pub run_timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            compiler: "g++".to_string(),
            compiler_flags: vec!["-std=c++17".to_string()],
            entry_source: PathBuf::from("main.cpp"),
            artifact: PathBuf::from("mc_test"),
            gain_marker: "GAIN".to_string(),
            build_timeout_secs: 300,
            run_timeout_secs: 60,
        }
    }
}

impl ToolchainConfig {
    pub fn resolve_work_dir(&self, description: &Path) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        match description.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub analysis: AnalysisConfig,
    pub toolchain: ToolchainConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Load `explicit` if given, else `tolsim.yaml` in `cwd` when present,
    /// else defaults.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = cwd.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "using discovered config");
            return Self::load(&candidate);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let a = &self.analysis;
        let t = &self.toolchain;
        let mut problems = Vec::new();
        if a.trials == 0 {
            problems.push("analysis.trials must be at least 1".to_string());
        }
        if !(a.tolerance.is_finite() && (0.0..1.0).contains(&a.tolerance)) {
            problems.push(format!(
                "analysis.tolerance must be in [0, 1), got {}",
                a.tolerance
            ));
        }
        if !(a.drift_limit_db.is_finite() && a.drift_limit_db >= 0.0) {
            problems.push(format!(
                "analysis.drift_limit_db must be a finite value >= 0, got {}",
                a.drift_limit_db
            ));
        }
        if !a.target_gain_db.is_finite() {
            problems.push("analysis.target_gain_db must be finite".to_string());
        }
        if a.value_precision > MAX_PRECISION {
            problems.push(format!(
                "analysis.value_precision must be at most {}, got {}",
                MAX_PRECISION, a.value_precision
            ));
        }
        if t.compiler.trim().is_empty() {
            problems.push("toolchain.compiler must not be empty".to_string());
        }
        if t.gain_marker.trim().is_empty() || t.gain_marker.contains('=') {
            problems.push("toolchain.gain_marker must be a non-empty key without '='".to_string());
        }
        if t.build_timeout_secs == 0 {
            problems.push("toolchain.build_timeout_secs must be at least 1".to_string());
        }
        if t.run_timeout_secs == 0 {
            problems.push("toolchain.run_timeout_secs must be at least 1".to_string());
        }
        if t.artifact.as_os_str().is_empty() {
            problems.push("toolchain.artifact must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "invalid configuration:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }
}

pub const CONFIG_TEMPLATE: &str = "\
# tolsim Monte-Carlo tolerance analysis settings. Every key is optional.
analysis:
  trials: 20                # number of perturb-build-run cycles
  tolerance: 0.05           # +/- fraction applied to each resistor
  drift_limit_db: 0.5       # max allowed (max_db - min_db)
  target_gain_db: 6.02      # informational only
  # seed: 1337              # fix for reproducible runs
  value_precision: 4        # decimals written for perturbed values
toolchain:
  # work_dir: .             # defaults to the description's directory
  compiler: g++
  compiler_flags: [\"-std=c++17\"]
  entry_source: main.cpp
  artifact: mc_test
  gain_marker: GAIN         # simulator prints GAIN=<float>
  build_timeout_secs: 300
  run_timeout_secs: 60
";
