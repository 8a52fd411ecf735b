//! # Forward diffusion
//!
//! Closed-form corruption of a clean sample `x0` to timestep `t`:
//!
//! `xt = sqrt(alpha_bar_t) * x0 + sqrt(1 - alpha_bar_t) * noise`
//!
//! where `alpha_bar_t` is the running product of `1 - beta` up to `t`. Any
//! timestep is reached in a single step rather than by iterating `t` times.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use super::BetaSchedule;
use crate::error::{config_error, Error, Result};
use tch::{Kind, Tensor};

/// The configuration for the [`NoiseScheduler`].
#[derive(Debug, Clone, Copy)]
pub struct NoiseSchedulerConfig {
    /// The value of beta at the first timestep.
    pub beta_start: f64,
    /// The value of beta at the last timestep.
    pub beta_end: f64,
    /// How beta evolves between the two.
    pub beta_schedule: BetaSchedule,
    /// Number of diffusion timesteps.
    pub train_timesteps: usize,
}

impl Default for NoiseSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps: 1000,
        }
    }
}

impl NoiseSchedulerConfig {
    /// A linear schedule of `timesteps` steps going from `start` to `end`.
    pub fn linear(timesteps: usize, start: f64, end: f64) -> Self {
        Self {
            beta_start: start,
            beta_end: end,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps: timesteps,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.train_timesteps == 0 {
            return config_error("the number of timesteps must be positive");
        }
        // Written as negations so that NaN bounds are rejected too.
        if !(self.beta_start > 0.) {
            return config_error(format!("beta_start must be positive, got {}", self.beta_start));
        }
        if !(self.beta_end > self.beta_start) {
            return config_error(format!(
                "beta_end ({}) must be greater than beta_start ({})",
                self.beta_end, self.beta_start
            ));
        }
        if !(self.beta_end < 1.) {
            return config_error(format!("beta_end must be below 1, got {}", self.beta_end));
        }
        Ok(())
    }
}

/// Precomputed forward-diffusion coefficients, read-only once built.
#[derive(Debug, Clone)]
pub struct NoiseScheduler {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub config: NoiseSchedulerConfig,
}

impl NoiseScheduler {
    pub fn new(config: NoiseSchedulerConfig) -> Result<Self> {
        config.validate()?;
        let betas = config.beta_schedule.betas(
            config.beta_start,
            config.beta_end,
            config.train_timesteps,
        );
        // &betas to avoid moving it
        let alphas: Tensor = 1. - &betas;
        let alphas_cumprod = alphas.cumprod(0, Kind::Double);
        let sqrt_alphas_cumprod = alphas_cumprod.sqrt();
        let sqrt_one_minus_alphas_cumprod = (1f64 - &alphas_cumprod).sqrt();

        let scheduler = Self {
            betas: Vec::<f64>::try_from(betas)?,
            alphas: Vec::<f64>::try_from(alphas)?,
            alphas_cumprod: Vec::<f64>::try_from(alphas_cumprod)?,
            sqrt_alphas_cumprod: Vec::<f64>::try_from(sqrt_alphas_cumprod)?,
            sqrt_one_minus_alphas_cumprod: Vec::<f64>::try_from(sqrt_one_minus_alphas_cumprod)?,
            config,
        };
        log::info!(
            "noise schedule: {} timesteps, beta {} -> {} ({:?}), final alpha_bar {:.6}",
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
            scheduler.alphas_cumprod[config.train_timesteps - 1],
        );
        Ok(scheduler)
    }

    /// Number of timesteps `T`; valid timesteps are `0..T`.
    pub fn timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }

    fn check_timestep(&self, timestep: usize) -> Result<()> {
        if timestep >= self.timesteps() {
            return Err(Error::TimestepOutOfRange { timestep, timesteps: self.timesteps() });
        }
        Ok(())
    }

    /// Fails on the first timestep outside of `0..T`.
    pub fn check_timesteps(&self, timesteps: &[usize]) -> Result<()> {
        timesteps.iter().try_for_each(|&t| self.check_timestep(t))
    }

    /// Corrupts `original` to `timestep` using the provided `noise`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        self.check_timestep(timestep)?;
        if original.size() != noise.size() {
            return Err(Error::ShapeMismatch { expected: original.size(), got: noise.size() });
        }
        let sqrt_alpha_prod = self.sqrt_alphas_cumprod[timestep];
        let sqrt_one_minus_alpha_prod = self.sqrt_one_minus_alphas_cumprod[timestep];
        Ok(sqrt_alpha_prod * original + sqrt_one_minus_alpha_prod * noise)
    }

    /// Corrupts `x0` to `timestep` with a fresh standard normal draw.
    ///
    /// Every call samples new noise from the torch generator, seed it with
    /// [`tch::manual_seed`] for reproducible results.
    pub fn forward(&self, x0: &Tensor, timestep: usize) -> Result<Tensor> {
        self.check_timestep(timestep)?;
        let noise = x0.f_randn_like()?;
        self.add_noise(x0, &noise, timestep)
    }

    /// Corrupts a batch `[N, ...]` where element `i` goes to `timesteps[i]`.
    pub fn forward_batch(&self, xs: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let size = xs.size();
        if size.first().copied() != Some(timesteps.len() as i64) {
            let mut expected = size.clone();
            match expected.first_mut() {
                Some(n) => *n = timesteps.len() as i64,
                None => expected.push(timesteps.len() as i64),
            }
            return Err(Error::ShapeMismatch { expected, got: size });
        }
        self.check_timesteps(timesteps)?;
        let mut coef_shape = vec![1i64; size.len()];
        coef_shape[0] = timesteps.len() as i64;
        let coefs = |values: &[f64]| -> Result<Tensor> {
            let gathered: Vec<f64> = timesteps.iter().map(|&t| values[t]).collect();
            let coefs = Tensor::from_slice(&gathered)
                .f_to_kind(xs.kind())?
                .f_to_device(xs.device())?
                .f_view(coef_shape.as_slice())?;
            Ok(coefs)
        };
        let sqrt_alpha_prod = coefs(&self.sqrt_alphas_cumprod)?;
        let sqrt_one_minus_alpha_prod = coefs(&self.sqrt_one_minus_alphas_cumprod)?;
        let noise = xs.f_randn_like()?;
        Ok(sqrt_alpha_prod * xs + sqrt_one_minus_alpha_prod * noise)
    }
}
