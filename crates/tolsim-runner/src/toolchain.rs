//! The build-and-simulate collaborator behind a narrow trait.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::cancel::CancelFlag;
use crate::config::ToolchainConfig;
use crate::process::{run_with_timeout, WaitError};
use crate::trial::{Phase, TrialError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
}

pub trait Toolchain {
    /// Compile the current on-disk description into an executable.
    fn build(&self, description: &Path) -> Result<Artifact, TrialError>;

    /// Execute a built artifact with no arguments and capture its stdout.
    fn run(&self, artifact: &Artifact) -> Result<RawOutput, TrialError>;
}

/// Shells out to a compiler, then runs what it produced.
///
/// Build: `<compiler> <flags..> -I. <entry_source> -o <artifact>` with the
/// working directory as cwd. Run: `<work_dir>/<artifact>`.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    compiler: String,
    compiler_flags: Vec<String>,
    entry_source: PathBuf,
    artifact: PathBuf,
    work_dir: PathBuf,
    build_timeout: Duration,
    run_timeout: Duration,
    cancel: CancelFlag,
}

impl CommandToolchain {
    pub fn new(config: &ToolchainConfig, work_dir: PathBuf, cancel: CancelFlag) -> Self {
        // The artifact is exec'd with work_dir as cwd, so a relative path
        // would resolve twice.
        let work_dir = work_dir.canonicalize().unwrap_or(work_dir);
        Self {
            compiler: config.compiler.clone(),
            compiler_flags: config.compiler_flags.clone(),
            entry_source: config.entry_source.clone(),
            artifact: config.artifact.clone(),
            work_dir,
            build_timeout: Duration::from_secs(config.build_timeout_secs),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            cancel,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.work_dir.join(&self.artifact)
    }

    pub fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.compiler);
        cmd.args(&self.compiler_flags)
            .arg("-I.")
            .arg(&self.entry_source)
            .arg("-o")
            .arg(&self.artifact)
            .current_dir(&self.work_dir);
        cmd
    }
}

fn wait_error(phase: Phase, program: String, timeout: Duration, err: WaitError) -> TrialError {
    match err {
        WaitError::Spawn(source) | WaitError::Wait(source) => TrialError::Spawn {
            phase,
            program,
            source,
        },
        WaitError::Timeout => TrialError::Timeout {
            phase,
            secs: timeout.as_secs(),
        },
        WaitError::Cancelled => TrialError::Cancelled { phase },
    }
}

impl Toolchain for CommandToolchain {
    fn build(&self, description: &Path) -> Result<Artifact, TrialError> {
        tracing::debug!(
            description = %description.display(),
            compiler = %self.compiler,
            work_dir = %self.work_dir.display(),
            "building"
        );
        let output = run_with_timeout(self.build_command(), self.build_timeout, &self.cancel)
            .map_err(|e| wait_error(Phase::Build, self.compiler.clone(), self.build_timeout, e))?;
        if !output.status.success() {
            return Err(TrialError::Build {
                status: output.status_label(),
                stderr_tail: output.stderr_tail(),
            });
        }
        Ok(Artifact {
            path: self.artifact_path(),
        })
    }

    fn run(&self, artifact: &Artifact) -> Result<RawOutput, TrialError> {
        let mut cmd = Command::new(&artifact.path);
        cmd.current_dir(&self.work_dir);
        let output = run_with_timeout(cmd, self.run_timeout, &self.cancel).map_err(|e| {
            wait_error(
                Phase::Run,
                artifact.path.display().to_string(),
                self.run_timeout,
                e,
            )
        })?;
        if !output.status.success() {
            return Err(TrialError::Run {
                status: output.status_label(),
                stderr_tail: output.stderr_tail(),
            });
        }
        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
