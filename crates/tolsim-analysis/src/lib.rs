//! Decibel aggregation of per-trial gains and the drift verdict.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("no successful trials (all {failed} failed), no statistics computed")]
    EmptyResult { failed: usize },
}

pub fn gain_to_db(gain: f64) -> f64 {
    20.0 * gain.log10()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftLimits {
    pub drift_limit_db: f64,
    /// Reported against the mean; never affects the verdict.
    pub target_gain_db: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftSummary {
    pub samples: usize,
    pub min_db: f64,
    pub max_db: f64,
    pub drift_db: f64,
    pub mean_db: f64,
    pub drift_limit_db: f64,
    pub target_gain_db: f64,
    pub target_deviation_db: f64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    samples_db: Vec<f64>,
    failed: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a linear gain and keep it. Returns the value in dB.
    pub fn record_gain(&mut self, gain: f64) -> f64 {
        let db = gain_to_db(gain);
        self.samples_db.push(db);
        db
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn samples_db(&self) -> &[f64] {
        &self.samples_db
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn summarize(&self, limits: &DriftLimits) -> Result<DriftSummary, AnalysisError> {
        summarize_db(&self.samples_db, limits).ok_or(AnalysisError::EmptyResult {
            failed: self.failed,
        })
    }
}

fn summarize_db(samples_db: &[f64], limits: &DriftLimits) -> Option<DriftSummary> {
    let first = *samples_db.first()?;
    let (min_db, max_db) = samples_db
        .iter()
        .fold((first, first), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let drift_db = max_db - min_db;
    let mean_db = samples_db.iter().sum::<f64>() / samples_db.len() as f64;
    let verdict = if drift_db <= limits.drift_limit_db {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    Some(DriftSummary {
        samples: samples_db.len(),
        min_db,
        max_db,
        drift_db,
        mean_db,
        drift_limit_db: limits.drift_limit_db,
        target_gain_db: limits.target_gain_db,
        target_deviation_db: mean_db - limits.target_gain_db,
        verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: DriftLimits = DriftLimits {
        drift_limit_db: 0.5,
        target_gain_db: 6.02,
    };

    fn aggregate(samples_db: &[f64]) -> Aggregator {
        Aggregator {
            samples_db: samples_db.to_vec(),
            failed: 0,
        }
    }

    #[test]
    fn db_conversion_reference_points() {
        assert_eq!(gain_to_db(1.0), 0.0);
        assert!((gain_to_db(2.0) - 6.0206).abs() < 1e-4);
        assert!((gain_to_db(10.0) - 20.0).abs() < 1e-12);
        assert!(gain_to_db(0.5) < 0.0);
    }

    #[test]
    fn db_conversion_is_monotonic() {
        let gains = [0.01, 0.5, 0.99, 1.0, 1.5, 2.0, 3.7, 100.0];
        for pair in gains.windows(2) {
            assert!(gain_to_db(pair[0]) < gain_to_db(pair[1]));
        }
    }

    #[test]
    fn drift_of_reference_samples_is_half_db() {
        let summary = aggregate(&[5.8, 6.0, 6.3]).summarize(&LIMITS).expect("summary");
        assert_eq!(summary.min_db, 5.8);
        assert_eq!(summary.max_db, 6.3);
        assert!((summary.drift_db - 0.5).abs() < 1e-12);
        assert_eq!(summary.samples, 3);
    }

    #[test]
    fn drift_equal_to_limit_passes() {
        let summary = aggregate(&[5.8, 6.0, 6.3]).summarize(&LIMITS).expect("summary");
        assert_eq!(summary.drift_db, LIMITS.drift_limit_db);
        assert_eq!(summary.verdict, Verdict::Pass);
    }

    #[test]
    fn drift_above_limit_fails() {
        let summary = aggregate(&[5.7, 6.0, 6.3]).summarize(&LIMITS).expect("summary");
        assert_eq!(summary.verdict, Verdict::Fail);
        assert_eq!(summary.verdict.exit_code(), 1);
    }

    #[test]
    fn target_deviation_is_informational() {
        let summary = aggregate(&[0.0, 0.1]).summarize(&LIMITS).expect("summary");
        assert!((summary.target_deviation_db - (0.05 - 6.02)).abs() < 1e-12);
        assert_eq!(summary.verdict, Verdict::Pass);
    }

    #[test]
    fn no_samples_is_empty_result() {
        let mut agg = Aggregator::new();
        agg.record_failure();
        agg.record_failure();
        assert_eq!(
            agg.summarize(&LIMITS),
            Err(AnalysisError::EmptyResult { failed: 2 })
        );
    }

    #[test]
    fn record_gain_converts_to_db() {
        let mut agg = Aggregator::new();
        let db = agg.record_gain(2.0);
        agg.record_gain(2.0);
        agg.record_gain(2.0);
        assert!((db - 6.0206).abs() < 1e-4);
        let summary = agg.summarize(&LIMITS).expect("summary");
        assert_eq!(summary.drift_db, 0.0);
        assert_eq!(summary.verdict, Verdict::Pass);
    }
}
