//! Random tolerance variation applied to parsed resistor values.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::parser::Netlist;

pub const DEFAULT_PRECISION: usize = 4;
pub const MAX_PRECISION: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerturbedValue {
    pub name: String,
    pub nominal: f64,
    pub perturbed: f64,
}

#[derive(Debug, Clone)]
pub struct Perturbation {
    pub text: String,
    pub values: Vec<PerturbedValue>,
}

/// Draws `v * (1 + u)` with `u ~ U[-tolerance, +tolerance]` independently for
/// every eligible declaration.
#[derive(Debug)]
pub struct Perturber<R: Rng> {
    rng: R,
    tolerance: f64,
    precision: usize,
}

impl Perturber<ChaCha8Rng> {
    pub fn seeded(tolerance: f64, precision: usize, seed: u64) -> Result<Self> {
        Self::new(ChaCha8Rng::seed_from_u64(seed), tolerance, precision)
    }
}

impl<R: Rng> Perturber<R> {
    pub fn new(rng: R, tolerance: f64, precision: usize) -> Result<Self> {
        validate_tolerance(tolerance)?;
        if precision > MAX_PRECISION {
            return Err(Error::InvalidPrecision {
                got: precision,
                max: MAX_PRECISION,
            });
        }
        Ok(Self {
            rng,
            tolerance,
            precision,
        })
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    fn factor(&mut self) -> f64 {
        if self.tolerance == 0.0 {
            return 1.0;
        }
        1.0 + self.rng.gen_range(-self.tolerance..=self.tolerance)
    }

    pub fn perturb(&mut self, netlist: &Netlist) -> Perturbation {
        let mut values = Vec::with_capacity(netlist.resistors().len());
        let precision = self.precision;
        let text = netlist.render_with(|decl| {
            let perturbed = decl.value * self.factor();
            values.push(PerturbedValue {
                name: decl.name.clone(),
                nominal: decl.value,
                perturbed,
            });
            format!("{:.*}", precision, perturbed)
        });
        Perturbation { text, values }
    }
}

/// True when `value` is too small to survive rendering at `precision`
/// decimal places, e.g. `0.00004` at 4 places prints as `0.0000`.
pub fn below_precision(value: f64, precision: usize) -> bool {
    value.abs() <= 10f64.powi(-(precision as i32))
}

pub fn validate_tolerance(tolerance: f64) -> Result<()> {
    if tolerance.is_finite() && (0.0..1.0).contains(&tolerance) {
        Ok(())
    } else {
        Err(Error::InvalidTolerance(tolerance))
    }
}
