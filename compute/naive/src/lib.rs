//! Naive implementation of the 1D wave equation simulation
//!
//! This is the single-threaded reference: it sweeps the whole interior of the
//! grid in one go. It also provides the leapfrog kernel that the parallel
//! backends apply to their chunks, so that every backend computes every grid
//! point with exactly the same floating-point operations.

use compute::{
    cpu::{CpuGrid, SimulateCpu},
    NoArgs, SimulateBase, SimulateCreate,
};
use data::{
    parameters::Parameters,
    wave::{FieldView, FieldViewMut},
    Precision,
};
use ndarray::{azip, s};
use std::{convert::Infallible, ops::Range};

/// Wave equation simulation
#[derive(Debug)]
pub struct Simulation {
    /// Weight of the discrete Laplacian, `(C·DT/DX)²`
    coefficient: Precision,
}
//
impl SimulateBase for Simulation {
    type CliArgs = NoArgs;

    type Error = Infallible;
}
//
impl SimulateCreate for Simulation {
    fn new(params: Parameters, _args: NoArgs) -> Result<Self, Infallible> {
        Ok(Self {
            coefficient: params.coefficient(),
        })
    }
}
//
impl SimulateCpu for Simulation {
    #[inline]
    fn unchecked_step_impl(&self, grid: CpuGrid) {
        update_chunk(
            self.coefficient,
            grid.curr,
            grid.prev,
            grid.next,
            grid.range,
        );
    }
}

/// Leapfrog update of a single grid point
///
/// `left`, `center` and `right` come from the current field, `previous` is
/// the value of the same point one step earlier.
#[inline(always)]
pub fn leapfrog(
    coefficient: Precision,
    [left, center, right]: [Precision; 3],
    previous: Precision,
) -> Precision {
    2.0 * center - previous + coefficient * (left - 2.0 * center + right)
}

/// Compute the next field over a range of interior points
///
/// `next` only covers `range`, whereas `curr` and `prev` are full fields.
/// The range must stay within `1..N-1`, an empty range is a no-op.
pub fn update_chunk(
    coefficient: Precision,
    curr: FieldView,
    prev: FieldView,
    next: FieldViewMut,
    range: Range<usize>,
) {
    if range.is_empty() {
        return;
    }
    let stencil = curr.slice(s![range.start - 1..range.end + 1]);
    let prev = prev.slice(s![range]);
    azip!((out in next, &old in &prev, window in stencil.windows(3)) {
        *out = leapfrog(coefficient, [window[0], window[1], window[2]], old);
    });
}

/// Like [`update_chunk()`], but `next` is the full next field
pub fn update_range(
    coefficient: Precision,
    curr: FieldView,
    prev: FieldView,
    next: FieldViewMut,
    range: Range<usize>,
) {
    let chunk = next.slice_move(s![range.clone()]);
    update_chunk(coefficient, curr, prev, chunk, range);
}
