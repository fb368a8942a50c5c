//! Fork-join implementation of the 1D wave equation simulation
//!
//! Each step splits the interior of the next field into one chunk per thread
//! of a dedicated rayon thread pool, and processes all chunks in parallel.
//! The parallel iteration only returns once every chunk is done, which acts
//! as the end-of-step barrier.

use clap::Args;
use compute::{
    cpu::{CpuGrid, SimulateCpu, SimulateStep},
    partition::Partition,
    SimulateBase, SimulateCreate,
};
use data::{parameters::Parameters, wave::Wave};
use log::{debug, error};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{
    any::Any,
    cell::{RefCell, RefMut},
    num::NonZeroUsize,
    ops::Range,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;

/// Wave equation simulation
pub type Simulation = ForkJoinSimulation<compute_naive::Simulation>;

/// Parameters are tunable via CLI args and environment variables
#[derive(Args, Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct CliArgs<BackendArgs: Args> {
    /// Number of processing threads [default: available parallelism]
    #[arg(short = 'j', long, env)]
    num_threads: Option<NonZeroUsize>,

    /// Expose backend arguments too
    #[command(flatten)]
    backend: BackendArgs,
}

/// Wave simulation wrapper that forks one task per chunk at every step
#[derive(Debug)]
pub struct ForkJoinSimulation<Backend: SimulateCpu + Sync> {
    /// Threads that process the chunks
    pool: ThreadPool,

    /// Number of chunks per step
    num_chunks: NonZeroUsize,

    /// Chunk assignment for the last grid size that was simulated
    partition: RefCell<Option<Partition>>,

    /// Underlying sequential compute backend
    backend: Backend,
}
//
impl<Backend: SimulateCpu + Sync> SimulateBase for ForkJoinSimulation<Backend> {
    type CliArgs = CliArgs<Backend::CliArgs>;

    type Error = Error<Backend::Error>;
}
//
impl<Backend: SimulateCpu + Sync> SimulateCreate for ForkJoinSimulation<Backend> {
    fn new(params: Parameters, args: Self::CliArgs) -> Result<Self, Self::Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(args.num_threads.map_or(0, usize::from))
            .thread_name(|index| format!("wave-forkjoin-{index}"))
            .build()
            .map_err(Error::ThreadPool)?;
        let num_chunks = NonZeroUsize::new(pool.current_num_threads()).unwrap_or(NonZeroUsize::MIN);
        debug!("Set up a thread pool with {num_chunks} threads");
        Ok(Self {
            pool,
            num_chunks,
            partition: RefCell::new(None),
            backend: Backend::new(params, args.backend).map_err(Error::Backend)?,
        })
    }
}
//
impl<Backend: SimulateCpu + Sync> SimulateStep for ForkJoinSimulation<Backend> {
    fn perform_step(&self, wave: &mut Wave) -> Result<(), Self::Error> {
        let partition = self.partition(wave.num_points());
        let chunks = CpuGrid::interior(wave).split(partition.ranges());
        let backend = &self.backend;
        let mut failures = self.pool.install(|| {
            chunks
                .into_par_iter()
                .enumerate()
                .filter_map(|(chunk, grid)| {
                    let range = grid.range.clone();
                    panic::catch_unwind(AssertUnwindSafe(|| backend.step_impl(grid)))
                        .err()
                        .map(|payload| (chunk, range, panic_message(payload)))
                })
                .collect::<Vec<_>>()
        });
        failures.sort_unstable_by_key(|(chunk, _, _)| *chunk);
        match failures.into_iter().next() {
            None => Ok(()),
            Some((chunk, range, message)) => {
                error!("Task failed on chunk {chunk} ({range:?}): {message}");
                Err(Error::WorkerFailed {
                    chunk,
                    range,
                    message,
                })
            }
        }
    }
}
//
impl<Backend: SimulateCpu + Sync> ForkJoinSimulation<Backend> {
    /// Number of chunks that each step is split into
    pub fn num_chunks(&self) -> NonZeroUsize {
        self.num_chunks
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
            cached.get_or_insert_with(|| Partition::new(num_points, self.num_chunks))
        })
    }
}

/// Turn a panic payload into something printable
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic payload".to_owned(), |s| (*s).to_owned()),
    }
}

/// Things that can go wrong when performing fork-join simulation
#[derive(Debug, Error)]
pub enum Error<BackendError: std::error::Error> {
    /// Error from the underlying compute backend
    #[error(transparent)]
    Backend(BackendError),

    /// Failed to configure thread pool
    #[error("failed to configure thread pool")]
    ThreadPool(#[source] ThreadPoolBuildError),

    /// A task panicked while computing its chunk
    #[error("task failed on chunk {chunk} (points {range:?}): {message}")]
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
    use compute::{NoArgs, Simulate};
    use std::{convert::Infallible, sync::Once};

    fn init_logger() {
        static INIT_LOGGER: Once = Once::new();
        INIT_LOGGER.call_once(|| env_logger::builder().is_test(true).init());
    }

    fn args(num_threads: usize) -> CliArgs<NoArgs> {
        CliArgs {
            num_threads: NonZeroUsize::new(num_threads),
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

    #[test]
    fn matches_sequential_reference() {
        init_logger();
        for num_threads in [1, 2, 5] {
            let params = Parameters::default();
            let sim = Simulation::new(params, args(num_threads)).unwrap();
            assert_eq!(sim.num_chunks().get(), num_threads);
            for num_points in [3, 5, 100, 1001] {
                let mut wave = Wave::new(num_points, &params).unwrap();
                sim.perform_steps(&mut wave, 40).unwrap();
                assert_eq!(wave, reference(num_points, 40), "{num_threads} threads");
            }
        }
    }

    #[test]
    fn default_thread_count() {
        init_logger();
        let sim = Simulation::new(Parameters::default(), args(0)).unwrap();
        assert_eq!(sim.num_chunks().get(), sim.pool.current_num_threads());
    }

    /// Backend that panics when asked to compute a certain grid point
    struct Faulty;
    //
    impl SimulateBase for Faulty {
        type CliArgs = NoArgs;
        type Error = Infallible;
    }
    //
    impl SimulateCreate for Faulty {
        fn new(_params: Parameters, _args: NoArgs) -> Result<Self, Infallible> {
            Ok(Self)
        }
    }
    //
    impl SimulateCpu for Faulty {
        fn unchecked_step_impl(&self, grid: CpuGrid) {
            if grid.range.contains(&3) {
                panic!("point 3 is cursed");
            }
        }
    }

    #[test]
    fn task_panic_is_reported() {
        init_logger();
        let params = Parameters::default();
        let sim = ForkJoinSimulation::<Faulty>::new(params, args(2)).unwrap();
        // 8 interior points, two chunks of 4
        let mut wave = Wave::new(10, &params).unwrap();
        let initial = wave.clone();
        match sim.perform_steps(&mut wave, 1) {
            Err(Error::WorkerFailed {
                chunk,
                range,
                message,
            }) => {
                assert_eq!(chunk, 0);
                assert_eq!(range, 1..5);
                assert_eq!(message, "point 3 is cursed");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(wave.current(), initial.current());
    }
}
