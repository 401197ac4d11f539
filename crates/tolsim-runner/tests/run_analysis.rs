use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};

use tolsim_netlist::Netlist;
use tolsim_runner::{
    run_analysis, Artifact, CancelFlag, FailureKind, Phase, RawOutput, RunCancelled, RunConfig,
    Toolchain, TrialError, TrialOutcome, Verdict,
};

const BUILDER: &str = r#"#pragma once
#include "circuit.h"

inline void build_2520(Circuit& c) {
    c.addElement<Resistor>("R_Feedback", nOUT, nINM, 10000.0);
    c.addElement<Resistor>("R_Input", nINM, nGND, 10000.0);
    c.addElement<Resistor>("R_Miller_DC", nVAS, nC4, 1.0e7);
    c.addElement<Resistor>(name + "_RB", b_ext, b_int, p.RB);
}
"#;

#[derive(Clone, Copy)]
enum Step {
    Gain(f64),
    BuildFails,
    NoMarker,
    Cancel,
    CancelAfterBuild,
    Panic,
}

struct StubToolchain {
    steps: Vec<Step>,
    calls: Cell<usize>,
    seen: RefCell<Vec<String>>,
    cancel: CancelFlag,
}

impl StubToolchain {
    fn new(steps: Vec<Step>, cancel: &CancelFlag) -> Self {
        Self {
            steps,
            calls: Cell::new(0),
            seen: RefCell::new(Vec::new()),
            cancel: cancel.clone(),
        }
    }

    fn current(&self) -> Step {
        let i = self.calls.get().saturating_sub(1);
        self.steps[i % self.steps.len()]
    }
}

impl Toolchain for StubToolchain {
    fn build(&self, description: &Path) -> Result<Artifact, TrialError> {
        self.calls.set(self.calls.get() + 1);
        self.seen
            .borrow_mut()
            .push(fs::read_to_string(description).expect("description readable during build"));
        match self.current() {
            Step::BuildFails => Err(TrialError::Build {
                status: "1".to_string(),
                stderr_tail: "main.cpp:1: error: expected ';'".to_string(),
            }),
            Step::Cancel => {
                self.cancel.cancel();
                Err(TrialError::Cancelled {
                    phase: Phase::Build,
                })
            }
            Step::CancelAfterBuild => {
                self.cancel.cancel();
                Ok(Artifact {
                    path: PathBuf::from("mc_test"),
                })
            }
            Step::Panic => panic!("compiler crashed"),
            _ => Ok(Artifact {
                path: PathBuf::from("mc_test"),
            }),
        }
    }

    fn run(&self, _artifact: &Artifact) -> Result<RawOutput, TrialError> {
        let stdout = match self.current() {
            Step::Gain(g) => format!("TIME(ms) | VIN(V) | VOUT(V)\nGAIN={}\n", g),
            Step::CancelAfterBuild => "GAIN=2.0\n".to_string(),
            _ => "VOUT=1.0\n".to_string(),
        };
        Ok(RawOutput { stdout })
    }
}

fn setup() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("api_2520_builder.h");
    fs::write(&path, BUILDER).expect("write builder");
    (dir, path)
}

fn config(trials: usize, tolerance: f64) -> RunConfig {
    let mut cfg = RunConfig::default();
    cfg.analysis.trials = trials;
    cfg.analysis.tolerance = tolerance;
    cfg.analysis.seed = Some(2520);
    cfg
}

#[test]
fn zero_tolerance_constant_gain_passes_with_zero_drift() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0)], &cancel);

    let report = run_analysis(&path, &config(3, 0.0), &stub, &cancel).expect("run");

    let samples = report.samples_db();
    assert_eq!(samples.len(), 3);
    for db in &samples {
        assert!((db - 6.0206).abs() < 1e-4, "sample {}", db);
    }
    let summary = report.summary.as_ref().expect("summary");
    assert_eq!(summary.drift_db, 0.0);
    assert_eq!(report.verdict, Verdict::Pass);
    assert_eq!(report.resistors, 3);
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}

#[test]
fn per_trial_failures_are_recorded_and_run_continues() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(
        vec![
            Step::Gain(2.0),
            Step::BuildFails,
            Step::NoMarker,
            Step::Gain(2.05),
        ],
        &cancel,
    );

    let report = run_analysis(&path, &config(4, 0.05), &stub, &cancel).expect("run");

    assert_eq!(report.trials_succeeded, 2);
    assert_eq!(report.trials_failed, 2);
    let kinds: Vec<Option<FailureKind>> = report
        .trials
        .iter()
        .map(|t| match &t.outcome {
            TrialOutcome::Failed { kind, .. } => Some(*kind),
            TrialOutcome::Measured { .. } => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            None,
            Some(FailureKind::BuildFailure),
            Some(FailureKind::ParseFailure),
            None
        ]
    );
    let indices: Vec<usize> = report.trials.iter().map(|t| t.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    assert_eq!(report.verdict, Verdict::Pass);
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}

#[test]
fn every_trial_perturbs_from_the_pristine_values() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0)], &cancel);

    run_analysis(&path, &config(25, 0.05), &stub, &cancel).expect("run");

    let nominal = Netlist::parse(BUILDER);
    let seen = stub.seen.borrow();
    assert_eq!(seen.len(), 25);
    for text in seen.iter() {
        assert_ne!(text, BUILDER, "build must see a perturbed description");
        let perturbed = Netlist::parse(text.clone());
        assert_eq!(perturbed.resistors().len(), nominal.resistors().len());
        for (p, n) in perturbed.resistors().iter().zip(nominal.resistors()) {
            assert!(p.value >= n.value * 0.95 - 1e-4, "{} vs {}", p.value, n.value);
            assert!(p.value <= n.value * 1.05 + 1e-4, "{} vs {}", p.value, n.value);
        }
        assert!(text.contains("c.addElement<Resistor>(name + \"_RB\", b_ext, b_int, p.RB);"));
    }
}

#[test]
fn no_successful_trial_is_empty_result_and_fails() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::BuildFails, Step::NoMarker], &cancel);

    let report = run_analysis(&path, &config(4, 0.05), &stub, &cancel).expect("run");

    assert!(report.summary.is_none());
    assert!(report
        .empty_result
        .as_deref()
        .expect("empty result recorded")
        .contains("no successful trials"));
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(report.verdict.exit_code(), 1);
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}

#[test]
fn drift_beyond_limit_fails() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(1.0), Step::Gain(2.0)], &cancel);

    let report = run_analysis(&path, &config(2, 0.05), &stub, &cancel).expect("run");

    let summary = report.summary.expect("summary");
    assert!((summary.drift_db - 6.0206).abs() < 1e-4);
    assert_eq!(summary.verdict, Verdict::Fail);
    assert_eq!(report.verdict, Verdict::Fail);
}

#[test]
fn cancellation_inside_a_trial_restores_and_reports() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0), Step::Cancel], &cancel);

    let err = run_analysis(&path, &config(5, 0.05), &stub, &cancel).expect_err("cancelled");

    let cancelled = err.downcast_ref::<RunCancelled>().expect("RunCancelled");
    assert_eq!(cancelled.completed, 1);
    assert_eq!(cancelled.requested, 5);
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}

#[test]
fn cancellation_between_trials_stops_the_loop() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0), Step::CancelAfterBuild], &cancel);

    let err = run_analysis(&path, &config(5, 0.05), &stub, &cancel).expect_err("cancelled");

    let cancelled = err.downcast_ref::<RunCancelled>().expect("RunCancelled");
    assert_eq!(cancelled.completed, 2);
    assert_eq!(stub.calls.get(), 2);
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}

#[test]
fn panic_inside_toolchain_still_restores() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0), Step::Panic], &cancel);
    let cfg = config(3, 0.05);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_analysis(&path, &cfg, &stub, &cancel)
    }));

    assert!(result.is_err());
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}

#[test]
fn invalid_config_touches_nothing() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0)], &cancel);

    let err = run_analysis(&path, &config(0, 0.05), &stub, &cancel).expect_err("invalid");

    assert!(err.to_string().contains("analysis.trials"));
    assert_eq!(stub.calls.get(), 0);
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}

#[test]
fn missing_description_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0)], &cancel);
    let path = dir.path().join("absent.h");

    let err = run_analysis(&path, &config(1, 0.05), &stub, &cancel).expect_err("missing");

    assert!(format!("{:#}", err).contains("absent.h"));
    assert!(!path.exists());
}

#[test]
fn same_seed_reproduces_the_same_perturbations() {
    let (_dir, path) = setup();
    let cancel = CancelFlag::new();
    let first = StubToolchain::new(vec![Step::Gain(2.0)], &cancel);
    let second = StubToolchain::new(vec![Step::Gain(2.0)], &cancel);

    let a = run_analysis(&path, &config(3, 0.05), &first, &cancel).expect("run a");
    let b = run_analysis(&path, &config(3, 0.05), &second, &cancel).expect("run b");

    assert_eq!(a.seed, b.seed);
    assert_eq!(*first.seen.borrow(), *second.seen.borrow());
}

#[test]
fn failed_perturb_write_is_a_per_trial_io_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Readable name, but the atomic writer's staging name overflows NAME_MAX.
    let path = dir.path().join(format!("{}.h", "b".repeat(238)));
    fs::write(&path, BUILDER).expect("write builder");
    let cancel = CancelFlag::new();
    let stub = StubToolchain::new(vec![Step::Gain(2.0)], &cancel);

    let report = run_analysis(&path, &config(3, 0.05), &stub, &cancel).expect("run completes");

    assert_eq!(report.trials_failed, 3);
    assert!(report.trials.iter().all(|t| matches!(
        t.outcome,
        TrialOutcome::Failed {
            kind: FailureKind::IoFailure,
            ..
        }
    )));
    assert_eq!(stub.calls.get(), 0);
    assert!(report.summary.is_none());
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(fs::read_to_string(&path).expect("read"), BUILDER);
}
