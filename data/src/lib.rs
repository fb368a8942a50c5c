//! Data format used by the 1D wave equation simulation

pub mod parameters;
pub mod snapshot;
pub mod wave;

/// Computation precision
pub type Precision = f64;
