//! Parallel implementation of the 1D wave equation simulation
//!
//! This crate implements a parallel version of the wave simulation based on
//! domain decomposition over a pool of long-lived worker threads. The grid
//! interior is partitioned once into one chunk per worker. Every step then
//! dispatches one job per chunk to a shared task queue and waits on a
//! synchronization primitive until all chunks have been computed, before the
//! time levels are rotated.

mod pool;
pub mod sync;

use crate::{
    pool::{Job, StepView, WorkerPool},
    sync::{Outcome, StepSync, SyncError, SyncMode},
};
use clap::Args;
use compute::{
    cpu::{SimulateCpu, SimulateStep},
    partition::Partition,
    SimulateBase, SimulateCreate,
};
use data::{parameters::Parameters, wave::Wave};
use log::{debug, error, warn};
use std::{
    cell::{Cell, RefCell, RefMut},
    io,
    marker::PhantomData,
    num::NonZeroUsize,
    ops::Range,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;

/// Wave equation simulation
pub type Simulation = ParallelSimulation<compute_naive::Simulation>;

/// Parameters are tunable via CLI args and environment variables
#[derive(Args, Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct CliArgs<BackendArgs: Args> {
    /// Number of worker threads [default: available parallelism]
    ///
    /// This comes before the number of grid points, so a single positional
    /// argument is understood as a worker count.
    #[arg(env)]
    num_workers: Option<NonZeroUsize>,

    /// Primitive used to wait for all workers at the end of each step
    #[arg(long = "sync", env, value_enum, default_value_t)]
    sync_mode: SyncMode,

    /// Expose backend arguments too
    #[command(flatten)]
    backend: BackendArgs,
}

/// Wave simulation wrapper that spreads each step over a worker pool
#[derive(Debug)]
pub struct ParallelSimulation<Backend: SimulateCpu + Send + Sync + 'static> {
    /// Number of workers, which is also the number of chunks per step
    num_workers: NonZeroUsize,

    /// Chunk assignment for the last grid size that was simulated
    partition: RefCell<Option<Partition>>,

    /// Number of the next step to be dispatched
    next_step: Cell<u64>,

    /// Worker threads, each holding a handle to the backend
    pool: WorkerPool,

    /// Underlying sequential compute backend
    backend: PhantomData<fn() -> Backend>,
}
//
impl<Backend: SimulateCpu + Send + Sync + 'static> SimulateBase for ParallelSimulation<Backend> {
    type CliArgs = CliArgs<Backend::CliArgs>;

    type Error = Error<Backend::Error>;
}
//
impl<Backend: SimulateCpu + Send + Sync + 'static> SimulateCreate
    for ParallelSimulation<Backend>
{
    fn new(params: Parameters, args: Self::CliArgs) -> Result<Self, Self::Error> {
        let num_workers = args.num_workers.unwrap_or_else(default_num_workers);
        let backend = Arc::new(Backend::new(params, args.backend).map_err(Error::Backend)?);
        let sync = Arc::new(StepSync::new(args.sync_mode, num_workers));
        let pool = WorkerPool::new(num_workers, backend, sync).map_err(Error::Spawn)?;
        debug!(
            "Set up {} workers with {:?} step synchronization",
            pool.num_workers(),
            args.sync_mode
        );
        Ok(Self {
            num_workers,
            partition: RefCell::new(None),
            next_step: Cell::new(0),
            pool,
            backend: PhantomData,
        })
    }
}
//
impl<Backend: SimulateCpu + Send + Sync + 'static> SimulateStep for ParallelSimulation<Backend> {
    fn perform_step(&self, wave: &mut Wave) -> Result<(), Self::Error> {
        self.perform_step_traced(wave).map(std::mem::drop)
    }
}
//
impl<Backend: SimulateCpu + Send + Sync + 'static> ParallelSimulation<Backend> {
    /// Number of worker threads
    pub fn num_workers(&self) -> NonZeroUsize {
        self.num_workers
    }

    /// Like [`SimulateStep::perform_step()`], but also report how the step's
    /// jobs were scheduled
    pub fn perform_step_traced(&self, wave: &mut Wave) -> Result<StepTrace, Error<Backend::Error>> {
        let num_points = wave.num_points();
        let partition = self.partition(num_points);
        let step = self.next_step.get();
        self.next_step.set(step + 1);

        // The wave stays mutably borrowed by this function until every job
        // has reported back, which is what StepView requires
        let view = {
            let (curr, prev, mut next) = wave.in_out();
            StepView {
                curr: curr.as_ptr(),
                prev: prev.as_ptr(),
                next: next.as_mut_ptr(),
                num_points,
            }
        };

        // Hand out one chunk per worker, unless the pool cannot wait for them
        self.pool.sync().check().map_err(|e| {
            error!("Cannot start step {step}: {e}");
            Error::Sync(e)
        })?;
        let dispatched = Instant::now();
        for (chunk, range) in partition.ranges().iter().enumerate() {
            let job = Job {
                step,
                chunk,
                range: range.clone(),
                view,
            };
            // No worker is alive if this fails, so no job can be in flight
            if self.pool.dispatch(job).is_err() {
                error!("All workers are gone, cannot dispatch step {step}");
                return Err(Error::PoolDisconnected);
            }
        }

        // Wait for all of them. The primitive is only broken when the pool
        // is dropped and workers never panic with its lock held, so an error
        // here means that no job is left running.
        let mut outcomes = self.pool.sync().wait_all().map_err(|e| {
            error!("Failed to synchronize step {step}: {e}");
            Error::Sync(e)
        })?;
        let synchronized = Instant::now();
        outcomes.sort_unstable_by_key(|outcome| outcome.chunk);
        debug_assert_eq!(outcomes.len(), partition.len());
        debug_assert!(outcomes.iter().all(|outcome| outcome.step == step));

        if let Some(failed) = outcomes.iter().find(|outcome| outcome.failure.is_some()) {
            let message = failed.failure.clone().unwrap_or_default();
            error!(
                "Worker failed on chunk {} ({:?}) of step {step}: {message}",
                failed.chunk, failed.range
            );
            return Err(Error::WorkerFailed {
                chunk: failed.chunk,
                range: failed.range.clone(),
                message,
            });
        }
        Ok(StepTrace {
            step,
            dispatched,
            synchronized,
            outcomes,
        })
    }

    /// Chunk assignment for a certain grid size, computed on first use
    fn partition(&self, num_points: usize) -> RefMut<'_, Partition> {
        RefMut::map(self.partition.borrow_mut(), |cached| {
            if cached
                .as_ref()
                .is_some_and(|partition| partition.num_points() != num_points)
            {
                *cached = None;
            }
            cached.get_or_insert_with(|| {
                debug!("Partitioning {num_points} points into {} chunks", self.num_workers);
                Partition::new(num_points, self.num_workers)
            })
        })
    }
}

/// Default number of workers when none is specified
fn default_num_workers() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or_else(|e| {
        warn!("Failed to query available parallelism ({e}), falling back to one worker");
        NonZeroUsize::MIN
    })
}

/// Scheduling record of one simulation step
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepTrace {
    /// Step number, counted from 0 since the simulation was set up
    pub step: u64,

    /// When the driver started dispatching jobs
    pub dispatched: Instant,

    /// When the driver got past the synchronization primitive
    pub synchronized: Instant,

    /// Outcome of every job, ordered by chunk
    pub outcomes: Vec<Outcome>,
}
//
impl StepTrace {
    /// Earliest time at which a worker started computing
    pub fn first_start(&self) -> Option<Instant> {
        self.outcomes.iter().map(|outcome| outcome.started).min()
    }

    /// Latest time at which a worker finished computing
    pub fn last_finish(&self) -> Option<Instant> {
        self.outcomes.iter().map(|outcome| outcome.finished).max()
    }
}

/// Things that can go wrong when performing parallel simulation
#[derive(Debug, Error)]
pub enum Error<BackendError: std::error::Error> {
    /// Error from the underlying compute backend
    #[error(transparent)]
    Backend(BackendError),

    /// Failed to spawn a worker thread
    #[error("failed to spawn a worker thread")]
    Spawn(#[source] io::Error),

    /// The task queue has no worker left
    #[error("the worker pool is disconnected")]
    PoolDisconnected,

    /// Failed to synchronize with the workers
    ///
    /// The step is not rotated in and the simulation should not go on. This
    /// is only reported before any job of the step was dispatched, or once
    /// all of them have reported back, so no worker still accesses the wave.
    #[error("failed to synchronize with the workers")]
    Sync(#[from] SyncError),

    /// A worker panicked while computing its chunk
    #[error("worker failed on chunk {chunk} (points {range:?}): {message}")]
    WorkerFailed {
        /// Index of the failed chunk
        chunk: usize,

        /// Grid points of the failed chunk
        range: Range<usize>,

        /// Panic message
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute::{
        cpu::CpuGrid,
        driver::{self, RunConfig},
        NoArgs, Simulate,
    };
    use std::{convert::Infallible, sync::Once};

    fn init_logger() {
        static INIT_LOGGER: Once = Once::new();
        INIT_LOGGER.call_once(|| env_logger::builder().is_test(true).init());
    }

    fn args(num_workers: usize, sync_mode: SyncMode) -> CliArgs<NoArgs> {
        CliArgs {
            num_workers: NonZeroUsize::new(num_workers),
            sync_mode,
            backend: NoArgs,
        }
    }

    fn reference(num_points: usize, steps: usize) -> Wave {
        let params = Parameters::default();
        let mut wave = Wave::new(num_points, &params).unwrap();
        compute_naive::Simulation::new(params, NoArgs)
            .unwrap()
            .perform_steps(&mut wave, steps)
            .unwrap();
        wave
    }

    const MODES: [SyncMode; 2] = [SyncMode::Barrier, SyncMode::Permits];

    #[test]
    fn matches_sequential_reference() {
        init_logger();
        let (num_points, steps) = (1001, 50);
        let expected = reference(num_points, steps);
        for mode in MODES {
            for num_workers in [1, 3, 8] {
                let params = Parameters::default();
                let sim = Simulation::new(params, args(num_workers, mode)).unwrap();
                let mut wave = Wave::new(num_points, &params).unwrap();
                sim.perform_steps(&mut wave, steps).unwrap();
                assert_eq!(wave, expected, "{num_workers} workers, {mode:?}");
            }
        }
    }

    #[test]
    fn more_workers_than_interior_points() {
        init_logger();
        let expected = reference(5, 10);
        for mode in MODES {
            let params = Parameters::default();
            let sim = Simulation::new(params, args(16, mode)).unwrap();
            let mut wave = Wave::new(5, &params).unwrap();
            sim.perform_steps(&mut wave, 10).unwrap();
            assert_eq!(wave, expected);
        }
    }

    #[test]
    fn grid_size_can_change_between_steps() {
        init_logger();
        let params = Parameters::default();
        let sim = Simulation::new(params, args(4, SyncMode::Barrier)).unwrap();
        for num_points in [10, 37, 10] {
            let mut wave = Wave::new(num_points, &params).unwrap();
            sim.perform_steps(&mut wave, 5).unwrap();
            assert_eq!(wave, reference(num_points, 5));
        }
    }

    #[test]
    fn boundaries_stay_pinned() {
        init_logger();
        let params = Parameters::default();
        let sim = Simulation::new(params, args(4, SyncMode::Permits)).unwrap();
        let mut wave = Wave::new(64, &params).unwrap();
        for _ in 0..30 {
            sim.perform_steps(&mut wave, 1).unwrap();
            assert_eq!(wave.current()[0], 0.0);
            assert_eq!(wave.current()[63], 0.0);
        }
    }

    #[test]
    fn steps_are_synchronized() {
        init_logger();
        for mode in MODES {
            for num_workers in [2, 4, 8] {
                // Fresh pools give the scheduler new chances to misbehave
                for _ in 0..5 {
                    let params = Parameters::default();
                    let sim = Simulation::new(params, args(num_workers, mode)).unwrap();
                    let mut wave = Wave::new(500, &params).unwrap();
                    let mut last_synchronized = None;
                    for expected_step in 0..50 {
                        let trace = sim.perform_step_traced(&mut wave).unwrap();
                        wave.apply_boundary();
                        wave.rotate();

                        assert_eq!(trace.step, expected_step);
                        let chunks: Vec<_> = trace.outcomes.iter().map(|o| o.chunk).collect();
                        assert_eq!(chunks, (0..num_workers).collect::<Vec<_>>());
                        assert!(trace.outcomes.iter().all(|o| o.step == expected_step));

                        // No worker starts before the step is dispatched or
                        // finishes after the driver is released
                        let first_start = trace.first_start().unwrap();
                        assert!(trace.dispatched <= first_start);
                        assert!(trace.last_finish().unwrap() <= trace.synchronized);

                        // Steps never overlap
                        if let Some(previous) = last_synchronized {
                            assert!(previous <= first_start);
                        }
                        last_synchronized = Some(trace.synchronized);
                    }
                }
            }
        }
    }

    #[test]
    fn long_runs_match_sequential_reference() {
        init_logger();
        let steps = 300;
        for mode in MODES {
            let params = Parameters::default();
            let sim = Simulation::new(params, args(8, mode)).unwrap();
            for num_points in (3..300).step_by(10) {
                let mut wave = Wave::new(num_points, &params).unwrap();
                sim.perform_steps(&mut wave, steps).unwrap();
                assert_eq!(wave, reference(num_points, steps), "{num_points} points, {mode:?}");
            }
        }
    }

    #[test]
    fn broken_sync_stops_the_simulation() {
        init_logger();
        for mode in MODES {
            let params = Parameters::default();
            let sim = Simulation::new(params, args(3, mode)).unwrap();
            let mut wave = Wave::new(40, &params).unwrap();
            sim.perform_steps(&mut wave, 2).unwrap();
            let before = wave.clone();

            sim.pool.sync().break_sync();
            assert!(matches!(
                sim.perform_steps(&mut wave, 1),
                Err(Error::Sync(SyncError::Broken))
            ));
            assert_eq!(wave.current(), before.current());
            assert_eq!(wave.previous(), before.previous());
        }
    }

    #[derive(clap::Parser)]
    struct Cli {
        #[command(flatten)]
        shared: ui::SharedArgs<Simulation>,
    }

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        <Cli as clap::Parser>::try_parse_from(std::iter::once("simulate").chain(args.iter().copied()))
    }

    #[test]
    fn worker_count_comes_before_grid_size() {
        let cli = parse(&["4", "1000"]).unwrap();
        assert_eq!(cli.shared.backend.num_workers, NonZeroUsize::new(4));
        assert_eq!(cli.shared.backend.sync_mode, SyncMode::Barrier);
        assert_eq!(cli.shared.num_points, 1000);

        let cli = parse(&["--sync", "permits", "2", "50"]).unwrap();
        assert_eq!(cli.shared.backend.num_workers, NonZeroUsize::new(2));
        assert_eq!(cli.shared.backend.sync_mode, SyncMode::Permits);
        assert_eq!(cli.shared.num_points, 50);

        // A lone positional argument is a worker count
        let cli = parse(&["1000"]).unwrap();
        assert_eq!(cli.shared.backend.num_workers, NonZeroUsize::new(1000));
        assert_eq!(cli.shared.num_points, compute::driver::DEFAULT_NUM_POINTS);
    }

    #[test]
    fn invalid_worker_counts_are_rejected() {
        for workers in ["0", "x", "-2", "1.5"] {
            assert!(parse(&[workers, "1000"]).is_err(), "{workers}");
        }
        assert!(parse(&["4", "2"]).is_err());
        assert!(parse(&["--sync", "spin", "4", "100"]).is_err());
    }

    #[test]
    fn driver_run_matches_sequential_run() {
        init_logger();
        let params = Parameters::default();
        let config = RunConfig {
            num_points: 257,
            steps: 120,
            ..RunConfig::default()
        };
        let mut parallel_snapshots = Vec::new();
        let parallel = driver::run::<Simulation>(
            params,
            args(3, SyncMode::Barrier),
            &config,
            &mut driver::snapshots(|step, field| parallel_snapshots.push((step, field.to_vec()))),
        )
        .unwrap();
        let mut naive_snapshots = Vec::new();
        let naive = driver::run::<compute_naive::Simulation>(
            params,
            NoArgs,
            &config,
            &mut driver::snapshots(|step, field| naive_snapshots.push((step, field.to_vec()))),
        )
        .unwrap();
        assert_eq!(parallel.wave, naive.wave);
        assert_eq!(parallel.report.steps_completed, 120);
        assert_eq!(parallel_snapshots, naive_snapshots);
        assert_eq!(parallel_snapshots.len(), 2);
    }

    /// Backend that panics when asked to compute a certain grid point
    #[derive(Debug)]
    struct Faulty {
        poisoned_point: usize,
    }
    //
    impl SimulateBase for Faulty {
        type CliArgs = NoArgs;
        type Error = Infallible;
    }
    //
    impl SimulateCreate for Faulty {
        fn new(_params: Parameters, _args: NoArgs) -> Result<Self, Infallible> {
            Ok(Self { poisoned_point: 7 })
        }
    }
    //
    impl SimulateCpu for Faulty {
        fn unchecked_step_impl(&self, mut grid: CpuGrid) {
            assert!(
                !grid.range.contains(&self.poisoned_point),
                "cannot compute point {}",
                self.poisoned_point
            );
            grid.next.fill(1.0);
        }
    }

    #[test]
    fn worker_panic_is_reported() {
        init_logger();
        for mode in MODES {
            let params = Parameters::default();
            let sim = ParallelSimulation::<Faulty>::new(params, args(4, mode)).unwrap();
            // 18 interior points, chunks of 4 points plus a last one of 6
            let mut wave = Wave::new(20, &params).unwrap();
            let initial = wave.clone();
            match sim.perform_steps(&mut wave, 1) {
                Err(Error::WorkerFailed {
                    chunk,
                    range,
                    message,
                }) => {
                    assert_eq!(chunk, 1);
                    assert_eq!(range, 5..9);
                    assert!(message.contains("cannot compute point 7"), "{message}");
                }
                other => panic!("unexpected result {other:?}"),
            }
            // The failed step was not rotated in
            assert_eq!(wave.current(), initial.current());
            assert_eq!(wave.previous(), initial.previous());

            // The pool survives the panic
            let mut small = Wave::new(6, &params).unwrap();
            sim.perform_steps(&mut small, 1).unwrap();
            assert_eq!(small.current().to_vec(), vec![0.0, 1.0, 1.0, 1.0, 1.0, 0.0]);
        }
    }
}
