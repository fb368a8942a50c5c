use clap::Parser;
use compute::driver::{self, Observer};
use compute_selector::Simulation;
use data::{
    snapshot::Writer,
    wave::{Field, FieldView},
};
use eyre::{eyre, Result};
use indicatif::ProgressBar;
use log::{info, warn};
use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, SyncSender},
    thread,
};
use ui::SharedArgs;

/// Simulate a vibrating string with fixed ends
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CLI arguments shared with other simulation executables
    #[command(flatten)]
    shared: SharedArgs<Simulation>,

    /// Path to the snapshot file, appended to if it already exists
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Size of the snapshot buffer between the compute and I/O thread
    ///
    /// 2 is the minimum to fully decouple compute and I/O. If the buffer is
    /// full, the simulation waits for the I/O thread to catch up.
    #[arg(long, default_value_t = NonZeroUsize::MIN.saturating_add(1))]
    output_buffer: NonZeroUsize,
}

fn main() -> Result<()> {
    // Enable logging to stderr
    ui::init_logging();

    // Parse CLI arguments and handle clap-incompatible defaults
    let args = Args::parse();
    let params = args.shared.params();
    let config = args.shared.run_config();
    let output = ui::simulation_output_path(args.output);

    // Set up progress reporting
    let progress = ui::init_progress_reporting("Running simulation step", config.steps);

    let report = thread::scope(|s| {
        // Start the writer thread
        let (sender, receiver) = mpsc::sync_channel::<Field>(args.output_buffer.into());
        let output = &output;
        let writer = s.spawn(move || write_snapshots(output, receiver));

        // Run the simulation on the main thread
        let mut reporter = Reporter::new(sender, &progress);
        let result = driver::run::<Simulation>(params, args.shared.backend, &config, &mut reporter);

        // Let the writer thread flush remaining snapshots
        std::mem::drop(reporter);
        let num_written = writer
            .join()
            .map_err(|_| eyre!("the snapshot writer thread panicked"))?;
        info!("Wrote {num_written} snapshots to {}", output.display());
        Ok::<_, eyre::Report>(result?.report)
    })?;
    std::mem::drop(progress);

    let secs = report.elapsed.as_secs_f64();
    info!("Performed {} steps in {secs:.6}s", report.steps_completed);
    println!("Simulation completed in {secs:.6} seconds");
    Ok(())
}

/// Forwards simulation progress to the progress bar and snapshot writer
struct Reporter<'progress> {
    /// Snapshot queue, or None if the writer thread is gone
    snapshots: Option<SyncSender<Field>>,

    /// Progress bar over simulation steps
    progress: &'progress ProgressBar,
}
//
impl<'progress> Reporter<'progress> {
    fn new(snapshots: SyncSender<Field>, progress: &'progress ProgressBar) -> Self {
        Self {
            snapshots: Some(snapshots),
            progress,
        }
    }
}
//
impl Observer for Reporter<'_> {
    fn step_completed(&mut self, _step: usize) {
        self.progress.inc(1);
    }

    fn snapshot(&mut self, step: usize, field: FieldView) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        if snapshots.send(field.to_owned()).is_err() {
            warn!("Snapshot writer is gone, discarding snapshots from step {step} onwards");
            self.snapshots = None;
        }
    }
}

/// Writer thread main loop, returns the number of snapshots written
///
/// I/O errors are logged and do not interrupt the simulation.
fn write_snapshots(path: &Path, snapshots: Receiver<Field>) -> usize {
    let mut writer = match Writer::open_append(path) {
        Ok(writer) => writer,
        Err(e) => {
            warn!("Failed to open {}, snapshots will be lost: {e}", path.display());
            return 0;
        }
    };
    for field in snapshots {
        if let Err(e) = writer.write(field.view()) {
            warn!("Failed to write snapshot to {}: {e}", path.display());
        }
    }
    let num_written = writer.num_written();
    if let Err(e) = writer.close() {
        warn!("Failed to close {}: {e}", path.display());
    }
    num_written
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::snapshot::read_snapshots;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("simulate-{}-{name}.txt", std::process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn reporter_feeds_writer() {
        let path = temp_path("reporter");
        let progress = ProgressBar::hidden();
        let (sender, receiver) = mpsc::sync_channel(1);
        let writer = {
            let path = path.clone();
            thread::spawn(move || write_snapshots(&path, receiver))
        };
        let mut reporter = Reporter::new(sender, &progress);
        for step in 0..3 {
            reporter.step_completed(step);
            let field = Field::from_elem(4, step as f64);
            reporter.snapshot(step, field.view());
        }
        std::mem::drop(reporter);

        assert_eq!(writer.join().unwrap(), 3);
        assert_eq!(progress.position(), 3);
        let snapshots = read_snapshots(&path).unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[2], vec![2.0; 4]);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn unwritable_output_is_not_fatal() {
        let directory = std::env::temp_dir();
        let progress = ProgressBar::hidden();
        let (sender, receiver) = mpsc::sync_channel(1);
        assert_eq!(write_snapshots(&directory, receiver), 0);

        // Snapshots are discarded once the writer is gone
        let mut reporter = Reporter::new(sender, &progress);
        let field = Field::zeros(3);
        reporter.snapshot(0, field.view());
        assert!(reporter.snapshots.is_none());
        reporter.snapshot(1, field.view());
    }
}
