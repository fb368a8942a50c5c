//! Domain decomposition of the grid interior
//!
//! The interior `[1, N-1)` is cut into one contiguous chunk per worker. All
//! chunks have the same base size except the last one, which also receives
//! the remainder of the integer division. The kernel cost per point is
//! uniform, so the resulting imbalance of at most `W-1` points is harmless.

use data::wave::MIN_POINTS;
use std::{num::NonZeroUsize, ops::Range};

/// Split the interior of a grid of `num_points` into `num_chunks` ranges
///
/// Ranges are half-open, contiguous, ordered and cover `1..num_points - 1`
/// exactly once. When there are more chunks than interior points, all chunks
/// but the last are empty.
pub fn partition(num_points: usize, num_chunks: NonZeroUsize) -> Vec<Range<usize>> {
    debug_assert!(num_points >= MIN_POINTS, "grid has no interior");
    let num_chunks = num_chunks.get();
    let interior_end = num_points.saturating_sub(1).max(1);
    let base_size = num_points.saturating_sub(2) / num_chunks;
    (0..num_chunks)
        .map(|chunk| {
            let start = 1 + chunk * base_size;
            let end = if chunk == num_chunks - 1 {
                interior_end
            } else {
                start + base_size
            };
            start..end
        })
        .collect()
}

/// Precomputed chunk assignment, reused for every simulation step
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Partition {
    /// Number of grid points, boundaries included
    num_points: usize,

    /// One range of interior indices per worker
    ranges: Box<[Range<usize>]>,
}
//
impl Partition {
    /// Compute the chunk assignment of a grid
    pub fn new(num_points: usize, num_chunks: NonZeroUsize) -> Self {
        Self {
            num_points,
            ranges: partition(num_points, num_chunks).into_boxed_slice(),
        }
    }

    /// Number of grid points that this partition was computed for
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Truth that there are no chunks (never true, provided for clippy)
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Interior index range of every chunk
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }
}
