//! Fixed-size pool of long-lived worker threads
//!
//! Workers are spawned once and pull jobs from a shared task queue until the
//! pool is dropped. Each job asks for one chunk of the next field to be
//! computed, and ends with a report to the pool's [`StepSync`].

use crate::sync::{Outcome, StepSync};
use compute::cpu::{CpuGrid, SimulateCpu};
use crossbeam_channel::{Receiver, Sender};
use data::Precision;
use log::{debug, error, trace};
use ndarray::{ArrayView1, ArrayViewMut1};
use std::{
    any::Any,
    io,
    num::NonZeroUsize,
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

/// Raw access to the wave buffers during one simulation step
///
/// Workers cannot borrow the driver's buffers across the thread boundary, so
/// the driver hands out raw pointers instead. This is sound as long as the
/// driver upholds the following:
///
/// - The buffers stay alive and are not accessed by the driver from the
///   moment the first job of a step is dispatched to the moment every job of
///   that step has reported to the pool's [`StepSync`].
/// - The chunk ranges of the step's jobs are disjoint and lie within
///   `1..num_points - 1`.
///
/// Workers only read `curr` and `prev`, and only write to their own chunk of
/// `next`, so no two threads ever write to the same grid point.
#[derive(Copy, Clone, Debug)]
pub(crate) struct StepView {
    /// Start of the field at time t
    pub curr: *const Precision,

    /// Start of the field at time t-1
    pub prev: *const Precision,

    /// Start of the field at time t+1
    pub next: *mut Precision,

    /// Length of each field
    pub num_points: usize,
}
//
// SAFETY: See the type-level documentation, the driver guarantees exclusive
//         write access to each chunk for the duration of the step.
unsafe impl Send for StepView {}

/// Request to compute one chunk of a simulation step
#[derive(Clone, Debug)]
pub(crate) struct Job {
    /// Simulation step that this job belongs to
    pub step: u64,

    /// Index of the chunk within the partition
    pub chunk: usize,

    /// Grid points to be computed
    pub range: Range<usize>,

    /// Access to the wave buffers
    pub view: StepView,
}
//
impl Job {
    /// Compute the chunk, catching any panic along the way
    fn execute<Backend: SimulateCpu>(self, backend: &Backend) -> Outcome {
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: The driver upholds the contract of StepView until this
            //         job has reported its outcome.
            let grid = unsafe { self.grid() };
            backend.step_impl(grid);
        }));
        Outcome {
            step: self.step,
            chunk: self.chunk,
            range: self.range,
            started,
            finished: Instant::now(),
            failure: result.err().map(panic_message),
        }
    }

    /// Reconstruct the views of the wave buffers that this job may access
    ///
    /// # Safety
    ///
    /// The [`StepView`] contract must be upheld for the lifetime of the
    /// output grid.
    unsafe fn grid(&self) -> CpuGrid<'_, '_> {
        let StepView {
            curr,
            prev,
            next,
            num_points,
        } = self.view;
        debug_assert!(self.range.start <= self.range.end && self.range.end <= num_points);
        CpuGrid {
            curr: ArrayView1::from_shape_ptr(num_points, curr),
            prev: ArrayView1::from_shape_ptr(num_points, prev),
            next: ArrayViewMut1::from_shape_ptr(self.range.len(), next.add(self.range.start)),
            range: self.range.clone(),
        }
    }
}

/// Turn a panic payload into something printable
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Pool of worker threads fed through a shared task queue
#[derive(Debug)]
pub(crate) struct WorkerPool {
    /// Task queue, closed when the pool shuts down
    jobs: Option<Sender<Job>>,

    /// Synchronization primitive that workers report to
    sync: Arc<StepSync>,

    /// Worker threads
    threads: Vec<JoinHandle<()>>,
}
//
impl WorkerPool {
    /// Spawn `num_workers` threads that compute chunks with `backend`
    pub fn new<Backend: SimulateCpu + Send + Sync + 'static>(
        num_workers: NonZeroUsize,
        backend: Arc<Backend>,
        sync: Arc<StepSync>,
    ) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut pool = Self {
            jobs: Some(sender),
            sync,
            threads: Vec::with_capacity(num_workers.get()),
        };
        for worker in 0..num_workers.get() {
            let receiver = receiver.clone();
            let backend = backend.clone();
            let sync = pool.sync.clone();
            // On error, dropping the pool shuts down the threads spawned so far
            let thread = thread::Builder::new()
                .name(format!("wave-worker-{worker}"))
                .spawn(move || work(worker, receiver, &*backend, &sync))?;
            pool.threads.push(thread);
        }
        debug!("Spawned {num_workers} worker threads");
        Ok(pool)
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.threads.len()
    }

    /// Synchronization primitive that workers report to
    pub fn sync(&self) -> &StepSync {
        &self.sync
    }

    /// Submit a job to the task queue
    ///
    /// Fails if no worker is left to receive it. Workers only exit once the
    /// queue is closed, so this can only happen if they all crashed.
    pub fn dispatch(&self, job: Job) -> Result<(), Job> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }
}
//
impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Wake up any worker stuck at the barrier, then let them run out of jobs
        self.sync.break_sync();
        self.jobs = None;
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("worker").to_owned();
            if thread.join().is_err() {
                error!("{name} panicked outside of a job");
            }
        }
        debug!("Worker pool shut down");
    }
}

/// Worker thread main loop
fn work<Backend: SimulateCpu>(
    worker: usize,
    jobs: Receiver<Job>,
    backend: &Backend,
    sync: &StepSync,
) {
    for job in jobs {
        trace!(
            "Worker {worker} computing chunk {} ({:?}) of step {}",
            job.chunk, job.range, job.step
        );
        let outcome = job.execute(backend);
        if let Err(e) = sync.arrive(outcome) {
            debug!("Worker {worker} could not report its outcome: {e}");
        }
    }
}
