//! Circuit description parsing and tolerance perturbation.

pub mod error;
pub mod parser;
pub mod perturb;

pub use error::{Error as NetlistError, Result as NetlistResult};
pub use parser::{Netlist, ResistorDecl, RESISTOR_CALL};
pub use perturb::{
    below_precision, validate_tolerance, Perturbation, PerturbedValue, Perturber, DEFAULT_PRECISION, MAX_PRECISION,
};
