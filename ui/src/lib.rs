//! This crate collects elements that are shared between the CLI programs:
//! argument parsing, logging and progress reporting.

use clap::{builder::RangedU64ValueParser, Args};
use compute::{
    driver::{RunConfig, DEFAULT_NUM_POINTS, DEFAULT_SNAPSHOT_INTERVAL, DEFAULT_STEPS},
    SimulateBase,
};
use data::{parameters::Parameters, wave::MIN_POINTS, Precision};
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};
use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

/// Default name of the snapshot file
pub const DEFAULT_OUTPUT_FILE: &str = "wave_output.txt";

/// CLI arguments shared by the executables that run a simulation
#[derive(Args)]
pub struct SharedArgs<Simulation: SimulateBase> {
    /// Backend-specific CLI arguments
    #[command(flatten)]
    pub backend: Simulation::CliArgs,

    /// Number of grid points, boundaries included
    #[arg(
        default_value_t = DEFAULT_NUM_POINTS,
        value_parser = RangedU64ValueParser::<usize>::new().range(MIN_POINTS as u64..)
    )]
    pub num_points: usize,

    /// Number of simulation steps to perform
    #[arg(short = 't', long, default_value_t = DEFAULT_STEPS)]
    pub steps: usize,

    /// Propagation speed of the wave [default: 0.1]
    #[arg(long)]
    pub wave_speed: Option<Precision>,

    /// Distance between two grid points [default: 0.01]
    #[arg(long)]
    pub dx: Option<Precision>,

    /// Simulated time interval on each simulation step [default: 0.005]
    #[arg(long)]
    pub dt: Option<Precision>,

    /// Number of simulation steps between two snapshots, 0 disables them
    #[arg(short = 's', long, default_value_t = DEFAULT_SNAPSHOT_INTERVAL)]
    pub snapshot_every: usize,
}
//
impl<Simulation: SimulateBase> SharedArgs<Simulation> {
    /// Physical parameters, with defaults for the ones clap can't handle
    pub fn params(&self) -> Parameters {
        let defaults = Parameters::default();
        Parameters {
            wave_speed: self.wave_speed.unwrap_or(defaults.wave_speed),
            grid_spacing: self.dx.unwrap_or(defaults.grid_spacing),
            time_step: self.dt.unwrap_or(defaults.time_step),
        }
    }

    /// Shape of the simulation run
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            num_points: self.num_points,
            steps: self.steps,
            snapshot_interval: NonZeroUsize::new(self.snapshot_every),
            stop: None,
        }
    }
}

/// Log to stderr at `info` level unless `RUST_LOG` says otherwise
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::debug!("Logging initialized");
}

/// Set up a progress bar over `len` units of work
pub fn init_progress_reporting(message: impl Into<String>, len: usize) -> ProgressBar {
    let progress = ProgressBar::new(len as u64)
        .with_message(message.into())
        .with_style(
            ProgressStyle::with_template("{msg} {pos}/{len} {wide_bar} {elapsed}/~{duration}")
                .expect("Failed to parse style"),
        )
        .with_finish(ProgressFinish::AndClear);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Path of the snapshot file, falling back to [`DEFAULT_OUTPUT_FILE`]
pub fn simulation_output_path(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| DEFAULT_OUTPUT_FILE.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use compute::NoArgs;

    /// Stand-in backend for argument parsing
    struct Backend;
    //
    impl SimulateBase for Backend {
        type CliArgs = NoArgs;
        type Error = std::convert::Infallible;
    }

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        shared: SharedArgs<Backend>,
    }

    fn parse(args: &[&str]) -> Result<SharedArgs<Backend>, clap::Error> {
        Cli::try_parse_from(std::iter::once("wave").chain(args.iter().copied()))
            .map(|cli| cli.shared)
    }

    #[test]
    fn defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.params(), Parameters::default());
        let config = args.run_config();
        assert_eq!(config.num_points, DEFAULT_NUM_POINTS);
        assert_eq!(config.steps, DEFAULT_STEPS);
        assert_eq!(
            config.snapshot_interval.map(NonZeroUsize::get),
            Some(DEFAULT_SNAPSHOT_INTERVAL)
        );
    }

    #[test]
    fn explicit_values() {
        let args = parse(&["42", "-t", "7", "--wave-speed", "0.5", "--dx", "0.1", "-s", "0"])
            .unwrap();
        let params = args.params();
        assert_eq!(params.wave_speed, 0.5);
        assert_eq!(params.grid_spacing, 0.1);
        assert_eq!(params.time_step, Parameters::default().time_step);
        let config = args.run_config();
        assert_eq!(config.num_points, 42);
        assert_eq!(config.steps, 7);
        assert_eq!(config.snapshot_interval, None);
    }

    #[test]
    fn invalid_grid_sizes() {
        assert!(parse(&["2"]).is_err());
        assert!(parse(&["abc"]).is_err());
        assert!(parse(&["-5"]).is_err());
        assert!(parse(&["10", "20"]).is_err());
    }

    #[test]
    fn output_path() {
        assert_eq!(simulation_output_path(None), PathBuf::from("wave_output.txt"));
        assert_eq!(
            simulation_output_path(Some("out.txt".into())),
            PathBuf::from("out.txt")
        );
    }
}
