//! Computation parameters

use crate::Precision;

/// Computation parameters
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Parameters {
    /// Propagation speed of the wave (C)
    pub wave_speed: Precision,

    /// Distance between two neighboring grid points (DX)
    pub grid_spacing: Precision,

    /// Simulated time interval on each step (DT)
    pub time_step: Precision,
}
//
impl Parameters {
    /// Courant number `C·DT/DX`
    pub fn courant_number(&self) -> Precision {
        self.wave_speed * self.time_step / self.grid_spacing
    }

    /// Weight of the discrete Laplacian in the leapfrog update
    ///
    /// This is the square of the Courant number.
    pub fn coefficient(&self) -> Precision {
        self.courant_number().powi(2)
    }

    /// Truth that the explicit scheme is stable with these parameters
    ///
    /// An unstable configuration still runs, but its results are physically
    /// meaningless as errors grow exponentially.
    pub fn is_stable(&self) -> bool {
        self.coefficient() <= 1.0
    }
}
//
impl Default for Parameters {
    fn default() -> Self {
        Self {
            wave_speed: 0.1,
            grid_spacing: 0.01,
            time_step: 0.005,
        }
    }
}
