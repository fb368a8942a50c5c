//! Facilities that are specific to CPU implementations

use crate::{Simulate, SimulateBase, SimulateCreate};
use data::wave::{FieldView, FieldViewMut, Wave};
use ndarray::{s, Axis};
use std::ops::Range;

/// Simplified version of Simulate that simulates a single time step at a time
///
/// If you implement this, then a [`Simulate`] implementation that loops while
/// enforcing boundary conditions and rotating time levels will be
/// automatically provided.
pub trait SimulateStep: SimulateBase + SimulateCreate {
    /// Perform a single simulation time step
    ///
    /// This must fill every interior point of `wave`'s next field from its
    /// current and previous fields. Boundary points and time level rotation
    /// are taken care of by the caller.
    fn perform_step(&self, wave: &mut Wave) -> Result<(), Self::Error>;
}
//
impl<T: SimulateStep> Simulate for T {
    fn perform_steps(&self, wave: &mut Wave, steps: usize) -> Result<(), Self::Error> {
        for _ in 0..steps {
            self.perform_step(wave)?;
            wave.apply_boundary();
            wave.rotate();
        }
        Ok(())
    }
}

/// Lower-level grid-based interface to a CPU compute backend
///
/// Some CPU compute backends expose a lower-level interface that updates an
/// arbitrary contiguous chunk of the grid's interior.
///
/// This is used by the parallel backends to slice the original step
/// computation into per-worker sub-computations.
///
/// If you implement this, then `Simulate` will be implemented automatically
pub trait SimulateCpu: SimulateBase + SimulateCreate {
    /// Perform one simulation time step on the full interior or a chunk of it
    ///
    /// This method does not check the grid for consistency, but is used to
    /// implement `step_impl` that does perform some sanity checks.
    fn unchecked_step_impl(&self, grid: CpuGrid);

    /// Check that the CpuGrid seems correct
    fn check_grid(grid: &CpuGrid) {
        let num_points = grid.curr.len();
        debug_assert_eq!(grid.prev.len(), num_points);
        debug_assert_eq!(grid.next.len(), grid.range.len());
        debug_assert!(grid.range.is_empty() || grid.range.start >= 1);
        debug_assert!(grid.range.is_empty() || grid.range.end < num_points);
    }

    /// Like `unchecked_step_impl()`, but with some sanity checks
    #[inline]
    fn step_impl(&self, grid: CpuGrid) {
        Self::check_grid(&grid);
        self.unchecked_step_impl(grid);
    }
}
//
impl<T: SimulateCpu> SimulateStep for T {
    fn perform_step(&self, wave: &mut Wave) -> Result<(), Self::Error> {
        self.step_impl(CpuGrid::interior(wave));
        Ok(())
    }
}

/// Low-level representation of the simulation grid used by SimulateCpu
///
/// The current and previous fields are always complete, so that the stencil
/// can reach one point past either end of `range`. The next field only
/// covers `range`: this is the part of the output that the computation owns.
#[derive(Debug)]
pub struct CpuGrid<'input, 'output> {
    /// Field at time t
    pub curr: FieldView<'input>,

    /// Field at time t-1
    pub prev: FieldView<'input>,

    /// Field at time t+1, restricted to `range`
    pub next: FieldViewMut<'output>,

    /// Indices of the points of the full grid that `next` covers
    pub range: Range<usize>,
}
//
impl<'wave> CpuGrid<'wave, 'wave> {
    /// Set up a grid covering the whole interior of a wave
    pub fn interior(wave: &'wave mut Wave) -> Self {
        let (curr, prev, next) = wave.in_out();
        let range = 1..curr.len() - 1;
        let next = next.slice_move(s![range.clone()]);
        Self {
            curr,
            prev,
            next,
            range,
        }
    }
}
//
impl<'input, 'output> CpuGrid<'input, 'output> {
    /// Split this grid into consecutive chunks
    ///
    /// `chunks` must be contiguous and cover `self.range` exactly, as the
    /// output of [`crate::partition::partition()`] does. Empty chunks are
    /// allowed and produce empty grids.
    pub fn split(self, chunks: &[Range<usize>]) -> Vec<Self> {
        let Self {
            curr,
            prev,
            mut next,
            range,
        } = self;
        debug_assert_eq!(chunks.first().map(|c| c.start), Some(range.start));
        debug_assert_eq!(chunks.last().map(|c| c.end), Some(range.end));

        let mut result = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let (head, tail) = next.split_at(Axis(0), chunk.len());
            next = tail;
            result.push(Self {
                curr,
                prev,
                next: head,
                range: chunk.clone(),
            });
        }
        debug_assert!(next.is_empty());
        result
    }
}
