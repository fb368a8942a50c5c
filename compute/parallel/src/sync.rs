//! Per-step synchronization between the driver and the workers
//!
//! Every worker reports one [`Outcome`] per job, and the driver waits until
//! all jobs of the current step have reported before it may rotate the time
//! levels. Two primitives implement this contract:
//!
//! - [`StepBarrier`] is a cyclic rendezvous of all workers plus the driver.
//!   Workers block after finishing their chunk until everyone has arrived.
//! - [`Permits`] is a counting semaphore. Workers release one permit and go
//!   straight back to the task queue, the driver acquires all of them.
//!
//! Either way, the lock that guards the primitive orders every worker's
//! writes before the driver's return from [`StepSync::wait_all()`].

use clap::ValueEnum;
use std::{
    num::NonZeroUsize,
    ops::Range,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use thiserror::Error;

/// Choice of step synchronization primitive
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq, ValueEnum)]
pub enum SyncMode {
    /// Cyclic barrier shared by the workers and the driver
    #[default]
    Barrier,

    /// Counting semaphore released by workers and drained by the driver
    Permits,
}

/// Report from one worker about one chunk of one step
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outcome {
    /// Simulation step that the job belonged to
    pub step: u64,

    /// Index of the chunk within the partition
    pub chunk: usize,

    /// Grid points that the chunk covers
    pub range: Range<usize>,

    /// When the worker started computing the chunk
    pub started: Instant,

    /// When the worker finished computing the chunk
    pub finished: Instant,

    /// Panic message, if the computation failed
    pub failure: Option<String>,
}

/// Synchronization primitive of a worker pool
#[derive(Debug)]
pub enum StepSync {
    /// See [`StepBarrier`]
    Barrier(StepBarrier),

    /// See [`Permits`]
    Permits(Permits),
}
//
impl StepSync {
    /// Set up the primitive for a certain number of workers
    pub fn new(mode: SyncMode, num_workers: NonZeroUsize) -> Self {
        match mode {
            SyncMode::Barrier => Self::Barrier(StepBarrier::new(num_workers)),
            SyncMode::Permits => Self::Permits(Permits::new(num_workers)),
        }
    }

    /// Worker side: report completion of one job
    pub fn arrive(&self, outcome: Outcome) -> Result<(), SyncError> {
        match self {
            Self::Barrier(barrier) => barrier.arrive(outcome),
            Self::Permits(permits) => permits.release(outcome),
        }
    }

    /// Driver side: wait for every job of the current step
    ///
    /// Returns the outcomes of all jobs, in arrival order.
    pub fn wait_all(&self) -> Result<Vec<Outcome>, SyncError> {
        match self {
            Self::Barrier(barrier) => barrier.wait_all(),
            Self::Permits(permits) => permits.acquire_all(),
        }
    }

    /// Driver side: check that the primitive is still usable
    ///
    /// This must be called before dispatching any job of a step, since a
    /// failed [`StepSync::wait_all()`] would leave those jobs running.
    pub fn check(&self) -> Result<(), SyncError> {
        let broken = match self {
            Self::Barrier(barrier) => barrier.state.lock()?.broken,
            Self::Permits(permits) => permits.state.lock()?.broken,
        };
        if broken {
            Err(SyncError::Broken)
        } else {
            Ok(())
        }
    }

    /// Make every pending and future wait fail with [`SyncError::Broken`]
    pub fn break_sync(&self) {
        match self {
            Self::Barrier(barrier) => barrier.break_barrier(),
            Self::Permits(permits) => permits.break_permits(),
        }
    }
}

/// Cyclic barrier for `num_workers + 1` participants
///
/// The last participant to arrive releases all others and starts the next
/// generation. The outcomes collected during a generation are handed over to
/// the driver once it is released.
#[derive(Debug)]
pub struct StepBarrier {
    /// Number of participants, the driver included
    parties: usize,

    /// Barrier state
    state: Mutex<BarrierState>,

    /// Signaled when a generation completes or the barrier breaks
    released: Condvar,
}
//
#[derive(Debug, Default)]
struct BarrierState {
    /// Number of completed generations
    generation: u64,

    /// Number of participants that arrived in the current generation
    arrived: usize,

    /// Outcomes reported in the current generation
    pending: Vec<Outcome>,

    /// Outcomes of the last completed generation, until the driver takes them
    completed: Vec<Outcome>,

    /// Truth that the barrier was broken
    broken: bool,
}
//
impl StepBarrier {
    /// Set up a barrier for some workers and one driver
    pub fn new(num_workers: NonZeroUsize) -> Self {
        Self {
            parties: num_workers.get() + 1,
            state: Mutex::new(BarrierState {
                pending: Vec::with_capacity(num_workers.get()),
                ..BarrierState::default()
            }),
            released: Condvar::new(),
        }
    }

    /// Worker side: record an outcome and wait for the generation to complete
    pub fn arrive(&self, outcome: Outcome) -> Result<(), SyncError> {
        self.enter(Some(outcome)).map(std::mem::drop)
    }

    /// Driver side: wait for the generation to complete and collect outcomes
    pub fn wait_all(&self) -> Result<Vec<Outcome>, SyncError> {
        let mut state = self.enter(None)?;
        Ok(std::mem::take(&mut state.completed))
    }

    /// Release everyone with an error, now and forever
    pub fn break_barrier(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.broken = true;
        self.released.notify_all();
    }

    /// Arrive at the barrier and wait for the current generation to complete
    fn enter(&self, outcome: Option<Outcome>) -> Result<MutexGuard<'_, BarrierState>, SyncError> {
        let mut state = self.state.lock()?;
        if state.broken {
            return Err(SyncError::Broken);
        }
        state.pending.extend(outcome);
        state.arrived += 1;

        // Last one in releases everyone else
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            state.completed = std::mem::take(&mut state.pending);
            self.released.notify_all();
            return Ok(state);
        }

        // Others wait for the generation to change
        let generation = state.generation;
        let state = self
            .released
            .wait_while(state, |state| {
                state.generation == generation && !state.broken
            })?;
        if state.generation == generation {
            Err(SyncError::Broken)
        } else {
            Ok(state)
        }
    }
}

/// Counting semaphore with one permit per worker
///
/// Each job releases one permit on completion. The driver blocks until it can
/// acquire one permit per worker, which leaves the count at zero for the next
/// step.
#[derive(Debug)]
pub struct Permits {
    /// Number of permits the driver acquires per step
    num_workers: usize,

    /// Semaphore state
    state: Mutex<PermitState>,

    /// Signaled whenever a permit is released or the semaphore breaks
    released: Condvar,
}
//
#[derive(Debug, Default)]
struct PermitState {
    /// Number of released permits not yet acquired
    available: usize,

    /// Outcomes attached to the released permits
    outcomes: Vec<Outcome>,

    /// Truth that the semaphore was broken
    broken: bool,
}
//
impl Permits {
    /// Set up a semaphore for some workers, with no permit available
    pub fn new(num_workers: NonZeroUsize) -> Self {
        Self {
            num_workers: num_workers.get(),
            state: Mutex::new(PermitState {
                outcomes: Vec::with_capacity(num_workers.get()),
                ..PermitState::default()
            }),
            released: Condvar::new(),
        }
    }

    /// Worker side: release one permit along with the job's outcome
    pub fn release(&self, outcome: Outcome) -> Result<(), SyncError> {
        let mut state = self.state.lock()?;
        if state.broken {
            return Err(SyncError::Broken);
        }
        state.available += 1;
        state.outcomes.push(outcome);
        self.released.notify_all();
        Ok(())
    }

    /// Driver side: acquire one permit per worker
    pub fn acquire_all(&self) -> Result<Vec<Outcome>, SyncError> {
        let state = self.state.lock()?;
        let mut state = self.released.wait_while(state, |state| {
            state.available < self.num_workers && !state.broken
        })?;
        if state.broken {
            return Err(SyncError::Broken);
        }
        state.available -= self.num_workers;
        Ok(std::mem::take(&mut state.outcomes))
    }

    /// Release everyone with an error, now and forever
    pub fn break_permits(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.broken = true;
        self.released.notify_all();
    }
}

/// Things that can go wrong while synchronizing a step
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// The primitive was broken while or before waiting
    #[error("step synchronization was broken")]
    Broken,

    /// A thread panicked while holding the primitive's lock
    #[error("step synchronization lock was poisoned")]
    Poisoned,
}
//
impl<T> From<PoisonError<T>> for SyncError {
    fn from(_: PoisonError<T>) -> Self {
        Self::Poisoned
    }
}
