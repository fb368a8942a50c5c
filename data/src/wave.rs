//! State of the vibrating string at three consecutive time levels

use crate::{parameters::Parameters, Precision};
use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use std::f64::consts::PI;
use thiserror::Error;

/// Sampled wave amplitude at every grid point
pub type Field = Array1<Precision>;

/// Read-only view of a [`Field`]
pub type FieldView<'a> = ArrayView1<'a, Precision>;

/// Mutable view of a [`Field`] or of a contiguous chunk of it
pub type FieldViewMut<'a> = ArrayViewMut1<'a, Precision>;

/// Smallest grid that has at least one interior point
pub const MIN_POINTS: usize = 3;

/// Wave field at times t-1, t and t+1
///
/// All three buffers are allocated once and keep the same length for the
/// whole simulation. Stepping computes `next` from `curr` and `prev`, then
/// [`Wave::rotate()`] makes `next` the new current time level.
#[derive(Clone, Debug, PartialEq)]
pub struct Wave {
    /// Field at time t-1
    prev: Field,

    /// Field at time t
    curr: Field,

    /// Field at time t+1, overwritten by every step
    next: Field,
}
//
impl Wave {
    /// Set up a sinusoidal wave with zero initial velocity
    ///
    /// The current field is `sin(π·i·DX)`, the previous field is a copy of it,
    /// and the end points of the next field are pinned to zero.
    pub fn new(num_points: usize, params: &Parameters) -> Result<Self, WaveError> {
        check_num_points(num_points)?;
        let dx = params.grid_spacing;
        let curr = Field::from_shape_fn(num_points, |i| (PI * i as Precision * dx).sin());
        Ok(Self::with_levels(curr.clone(), curr))
    }

    /// Set up a wave from explicit previous and current fields
    pub fn from_fields(prev: Field, curr: Field) -> Result<Self, WaveError> {
        check_num_points(curr.len())?;
        if prev.len() != curr.len() {
            return Err(WaveError::LengthMismatch {
                prev: prev.len(),
                curr: curr.len(),
            });
        }
        Ok(Self::with_levels(prev, curr))
    }

    /// Number of grid points, boundaries included
    pub fn num_points(&self) -> usize {
        self.curr.len()
    }

    /// Field at time t-1
    pub fn previous(&self) -> FieldView {
        self.prev.view()
    }

    /// Field at time t
    ///
    /// After a step has been rotated in, this is the field it computed.
    pub fn current(&self) -> FieldView {
        self.curr.view()
    }

    /// Field at time t+1, as left by the last computation
    pub fn next(&self) -> FieldView {
        self.next.view()
    }

    /// Access the current and previous fields as inputs, and the next field
    /// as the output of a simulation step
    pub fn in_out(&mut self) -> (FieldView, FieldView, FieldViewMut) {
        (self.curr.view(), self.prev.view(), self.next.view_mut())
    }

    /// Pin both ends of the next field to zero (fixed-end boundary)
    pub fn apply_boundary(&mut self) {
        let last = self.next.len() - 1;
        self.next[0] = 0.0;
        self.next[last] = 0.0;
    }

    /// Make the next field become the current one
    ///
    /// `prev ← curr` and `curr ← next`. Buffers are exchanged, not copied: the
    /// old previous field becomes the next one and is expected to be fully
    /// overwritten by the following step.
    pub fn rotate(&mut self) {
        std::mem::swap(&mut self.prev, &mut self.curr);
        std::mem::swap(&mut self.curr, &mut self.next);
    }

    /// Build the state once the inputs have been validated
    fn with_levels(prev: Field, curr: Field) -> Self {
        let mut result = Self {
            next: Field::zeros(curr.len()),
            prev,
            curr,
        };
        result.apply_boundary();
        result
    }
}

/// Check that a grid is large enough to have an interior
fn check_num_points(num_points: usize) -> Result<(), WaveError> {
    if num_points < MIN_POINTS {
        Err(WaveError::TooFewPoints(num_points))
    } else {
        Ok(())
    }
}

/// Things that can go wrong when setting up a [`Wave`]
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaveError {
    /// The grid has no interior point to update
    #[error("the grid must have at least {MIN_POINTS} points, got {0}")]
    TooFewPoints(usize),

    /// The two input fields do not have the same length
    #[error("previous field has {prev} points but current field has {curr}")]
    LengthMismatch { prev: usize, curr: usize },
}
