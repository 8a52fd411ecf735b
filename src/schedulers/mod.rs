//! # Noise schedules
//!
//! A noise schedule fixes, for every diffusion timestep, how much of the clean
//! signal survives and how much gaussian noise replaces it.

use tch::{kind, Tensor};

pub mod noise;

pub use noise::{NoiseScheduler, NoiseSchedulerConfig};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

impl BetaSchedule {
    /// Betas as a double precision cpu tensor of `timesteps` elements.
    pub(crate) fn betas(&self, beta_start: f64, beta_end: f64, timesteps: usize) -> Tensor {
        match self {
            Self::Linear => {
                Tensor::linspace(beta_start, beta_end, timesteps as i64, kind::DOUBLE_CPU)
            }
            Self::ScaledLinear => Tensor::linspace(
                beta_start.sqrt(),
                beta_end.sqrt(),
                timesteps as i64,
                kind::DOUBLE_CPU,
            )
            .square(),
        }
    }
}
