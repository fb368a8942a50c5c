//! Common facilities shared by all compute backends

#[cfg(feature = "criterion")]
pub mod benchmark;
pub mod cpu;
pub mod driver;
pub mod partition;

use clap::Args;
use data::{parameters::Parameters, wave::Wave};
use std::{error::Error, fmt::Debug};

/// Commonalities between all ways to set up a simulation
pub trait SimulateBase: Sized {
    /// Supplementary CLI arguments allowing fine-tuning of this backend
    ///
    /// To honor the principle of least surprise and make criterion
    /// microbenchmarks work smoothly, any argument you add must have a default
    /// value and should also be configurable through environment variables.
    type CliArgs: Args + Debug;

    /// Error type used by simulation operations
    type Error: Error + Send + Sync + 'static;
}

/// Simulation compute backend constructor
pub trait SimulateCreate: SimulateBase {
    /// Set up the simulation
    ///
    /// Backends that need long-lived resources, like a pool of worker
    /// threads, acquire them here once and keep them for the whole run.
    fn new(params: Parameters, args: Self::CliArgs) -> Result<Self, Self::Error>;
}

/// Simulation compute backend interface expected by the binaries
pub trait Simulate: SimulateCreate {
    /// Perform `steps` simulation time steps
    ///
    /// At the end of each step, the end points of the newly computed field
    /// are pinned to zero and the time levels are rotated, so that
    /// `wave.current()` holds the latest field when this returns.
    fn perform_steps(&self, wave: &mut Wave, steps: usize) -> Result<(), Self::Error>;
}

/// Placeholder for backends that take no CLI arguments
#[derive(Args, Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct NoArgs;
