//! Benchmarking utilities
//!
//! Please consider using the [`criterion_benchmark!`](crate::criterion_benchmark)
//! macro instead of calling these implementation details directly.

use crate::Simulate;
use clap::{Args, Command, FromArgMatches};
use criterion::{BenchmarkId, Criterion, Throughput};
use data::{parameters::Parameters, wave::Wave};
use std::{hint::black_box, sync::Once};

/// Re-export criterion for the criterion_benchmark macro
pub use criterion;

// Make sure env_logger is only initialized once
fn init_logger() {
    static INIT_LOGGER: Once = Once::new();
    INIT_LOGGER.call_once(env_logger::init);
}

/// Parse backend arguments from the environment and some CLI arguments
fn parse_args<Simulation: Simulate>(
    args: impl IntoIterator<Item = String>,
) -> Simulation::CliArgs {
    Simulation::CliArgs::from_arg_matches(
        &Simulation::CliArgs::augment_args(Command::default().no_binary_name(true))
            .get_matches_from(args),
    )
    .expect("Failed to parse arguments from defaults & environment")
}

/// Common criterion benchmark for all wave equation computations
pub fn criterion_benchmark<Simulation: Simulate>(c: &mut Criterion, backend_name: &str) {
    init_logger();

    let args = parse_args::<Simulation>(None);
    let params = black_box(Parameters::default());
    let sim = Simulation::new(params, black_box(args)).expect("Failed to set up simulation");
    let mut group = c.benchmark_group(format!("{backend_name}::step"));
    for size_pow2 in (8..=24).step_by(4) {
        let num_points = 2usize.pow(size_pow2);
        let mut wave = Wave::new(black_box(num_points), &params).expect("Failed to set up wave");

        group.throughput(Throughput::Elements(num_points as u64));
        group.bench_function(BenchmarkId::from_parameter(num_points), |b| {
            b.iter(|| sim.perform_steps(&mut wave, 1).expect("Failed to perform step"));
        });
        black_box(wave);
    }
    group.finish();
}

/// Worker counts covered by [`scaling_benchmark()`]
///
/// Powers of two up to 8, then the available parallelism if it is not one
/// of them already.
pub fn scaling_worker_counts(available_parallelism: usize) -> Vec<usize> {
    let mut counts = vec![1, 2, 4, 8];
    if !counts.contains(&available_parallelism) {
        counts.push(available_parallelism);
        counts.sort_unstable();
    }
    counts
}

/// Run time of multi-threaded backends as a function of the worker count
///
/// `worker_args` turns a worker count into the CLI arguments that set it up.
pub fn scaling_benchmark<Simulation: Simulate>(
    c: &mut Criterion,
    backend_name: &str,
    worker_args: impl Fn(usize) -> Vec<String>,
) {
    init_logger();

    let available = std::thread::available_parallelism().map_or(1, usize::from);
    let params = black_box(Parameters::default());
    let mut group = c.benchmark_group(format!("{backend_name}::scaling"));
    for num_workers in scaling_worker_counts(available) {
        let args = parse_args::<Simulation>(worker_args(num_workers));
        let sim = Simulation::new(params, black_box(args)).expect("Failed to set up simulation");
        for size_pow2 in (12..=20).step_by(4) {
            let num_points = 2usize.pow(size_pow2);
            let mut wave =
                Wave::new(black_box(num_points), &params).expect("Failed to set up wave");

            group.throughput(Throughput::Elements(num_points as u64));
            group.bench_function(
                BenchmarkId::new(format!("{num_workers}workers"), num_points),
                |b| {
                    b.iter(|| sim.perform_steps(&mut wave, 1).expect("Failed to perform step"));
                },
            );
            black_box(wave);
        }
    }
    group.finish();
}

/// Macro that generates a complete criterion benchmark harness for you
///
/// Multi-threaded backends can also pass `workers = <closure>`, mapping a
/// worker count to CLI arguments, to get a worker count scaling benchmark.
#[macro_export]
macro_rules! criterion_benchmark {
    ($backend:ident) => {
        fn criterion_benchmark(c: &mut $crate::benchmark::criterion::Criterion) {
            $crate::benchmark::criterion_benchmark::<$backend::Simulation>(
                c,
                stringify!($backend),
            )
        }
        $crate::benchmark::criterion::criterion_group!(benches, criterion_benchmark);
        $crate::benchmark::criterion::criterion_main!(benches);
    };
    ($backend:ident, workers = $worker_args:expr) => {
        fn criterion_benchmark(c: &mut $crate::benchmark::criterion::Criterion) {
            $crate::benchmark::criterion_benchmark::<$backend::Simulation>(
                c,
                stringify!($backend),
            );
            $crate::benchmark::scaling_benchmark::<$backend::Simulation>(
                c,
                stringify!($backend),
                $worker_args,
            );
        }
        $crate::benchmark::criterion::criterion_group!(benches, criterion_benchmark);
        $crate::benchmark::criterion::criterion_main!(benches);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::{CpuGrid, SimulateCpu},
        SimulateBase, SimulateCreate,
    };
    use std::convert::Infallible;

    #[test]
    fn worker_counts_include_available_parallelism() {
        assert_eq!(scaling_worker_counts(4), vec![1, 2, 4, 8]);
        assert_eq!(scaling_worker_counts(1), vec![1, 2, 4, 8]);
        assert_eq!(scaling_worker_counts(6), vec![1, 2, 4, 6, 8]);
        assert_eq!(scaling_worker_counts(64), vec![1, 2, 4, 8, 64]);
    }

    /// Backend with a worker count knob
    struct Tunable;
    //
    #[derive(clap::Args, Debug)]
    struct TunableArgs {
        #[arg(short = 'j', default_value_t = 1)]
        workers: usize,
    }
    //
    impl SimulateBase for Tunable {
        type CliArgs = TunableArgs;
        type Error = Infallible;
    }
    //
    impl SimulateCreate for Tunable {
        fn new(_params: Parameters, _args: TunableArgs) -> Result<Self, Infallible> {
            Ok(Self)
        }
    }
    //
    impl SimulateCpu for Tunable {
        fn unchecked_step_impl(&self, _grid: CpuGrid) {}
    }

    #[test]
    fn worker_args_are_parsed() {
        assert_eq!(parse_args::<Tunable>(None).workers, 1);
        let args = vec!["-j".to_owned(), "6".to_owned()];
        assert_eq!(parse_args::<Tunable>(args).workers, 6);
    }
}
