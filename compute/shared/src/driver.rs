//! Time-stepping driver
//!
//! The driver owns the wave state for the whole run. It sets up the state and
//! the compute backend once, advances the simulation one step at a time, and
//! hands the freshly computed field to an [`Observer`] at a fixed interval.
//! Stop requests are only honored between two steps.

use crate::Simulate;
use data::{
    parameters::Parameters,
    wave::{FieldView, Wave, WaveError},
};
use log::{debug, info, warn};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;

/// Default number of grid points
pub const DEFAULT_NUM_POINTS: usize = 10_000;

/// Default number of simulation steps
pub const DEFAULT_STEPS: usize = 1_000;

/// Default number of steps between two snapshots
pub const DEFAULT_SNAPSHOT_INTERVAL: usize = 100;

/// Shape of a simulation run
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Number of grid points, boundaries included
    pub num_points: usize,

    /// Number of time steps to perform
    pub steps: usize,

    /// Number of steps between two snapshots, if any
    ///
    /// Snapshots are taken after steps 0, interval, 2·interval...
    pub snapshot_interval: Option<NonZeroUsize>,

    /// Raise this flag to stop the run at the next step boundary
    pub stop: Option<Arc<AtomicBool>>,
}
//
impl RunConfig {
    /// Truth that a stop was requested
    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::Acquire))
    }

    /// Truth that a snapshot should be taken after a certain step
    fn snapshot_due(&self, step: usize) -> bool {
        self.snapshot_interval
            .is_some_and(|interval| step % interval.get() == 0)
    }
}
//
impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_points: DEFAULT_NUM_POINTS,
            steps: DEFAULT_STEPS,
            snapshot_interval: NonZeroUsize::new(DEFAULT_SNAPSHOT_INTERVAL),
            stop: None,
        }
    }
}

/// Receiver of simulation progress
pub trait Observer {
    /// Called after every completed step, snapshot or not
    fn step_completed(&mut self, _step: usize) {}

    /// Called with the field that a step just computed, once per interval
    fn snapshot(&mut self, step: usize, field: FieldView);
}

/// Observer that only cares about snapshots, see [`snapshots()`]
#[derive(Clone, Debug)]
pub struct SnapshotFn<F>(F);
//
impl<F: FnMut(usize, FieldView)> Observer for SnapshotFn<F> {
    fn snapshot(&mut self, step: usize, field: FieldView) {
        (self.0)(step, field)
    }
}

/// Turn a closure into an [`Observer`] that is called for every snapshot
pub fn snapshots<F: FnMut(usize, FieldView)>(callback: F) -> SnapshotFn<F> {
    SnapshotFn(callback)
}

/// Outcome of a simulation run
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutput {
    /// Final wave state
    pub wave: Wave,

    /// Run statistics
    pub report: RunReport,
}

/// Statistics of a simulation run
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct RunReport {
    /// Number of steps that were fully computed and rotated in
    pub steps_completed: usize,

    /// Wall-clock duration of the run, from state setup to backend teardown
    pub elapsed: Duration,

    /// Truth that the run was stopped before performing all steps
    pub stopped_early: bool,
}

/// Run a simulation from its initial state
///
/// The compute backend is created once before the time loop and dropped once
/// after it, so pooled backends keep the same workers for every step.
pub fn run<Simulation: Simulate>(
    params: Parameters,
    args: Simulation::CliArgs,
    config: &RunConfig,
    observer: &mut impl Observer,
) -> Result<RunOutput, DriverError<Simulation::Error>> {
    let start = Instant::now();
    if !params.is_stable() {
        warn!(
            "Courant number {} exceeds 1, the simulation will be unstable",
            params.courant_number()
        );
    }

    // Set up the wave, then the backend which must be dropped first
    let mut wave = Wave::new(config.num_points, &params)?;
    let simulation = Simulation::new(params, args).map_err(DriverError::Simulation)?;
    info!(
        "Starting simulation of {} points over {} steps",
        config.num_points, config.steps
    );

    // Run the time loop
    let mut steps_completed = 0;
    let mut stopped_early = false;
    for step in 0..config.steps {
        if config.stop_requested() {
            info!("Stop requested, ending simulation after {step} steps");
            stopped_early = true;
            break;
        }
        simulation
            .perform_steps(&mut wave, 1)
            .map_err(DriverError::Simulation)?;
        steps_completed += 1;
        observer.step_completed(step);
        if config.snapshot_due(step) {
            debug!("Taking snapshot after step {step}");
            observer.snapshot(step, wave.current());
        }
    }

    // Shut down the backend before measuring elapsed time
    std::mem::drop(simulation);
    let elapsed = start.elapsed();
    info!("Simulated {steps_completed} steps in {elapsed:?}");
    Ok(RunOutput {
        wave,
        report: RunReport {
            steps_completed,
            elapsed,
            stopped_early,
        },
    })
}

/// Things that can go wrong during a simulation run
#[derive(Debug, Error)]
pub enum DriverError<SimulationError: std::error::Error> {
    /// Failed to set up the wave state
    #[error("failed to set up the wave state")]
    Wave(#[from] WaveError),

    /// Error from the compute backend
    #[error(transparent)]
    Simulation(SimulationError),
}
