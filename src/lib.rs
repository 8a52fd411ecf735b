//! # Training data and models for denoising diffusion
//!
//! Prepares training pairs for a diffusion-style image model and builds the
//! UNet that consumes them, using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - A closed-form forward-diffusion noise schedule.
//! - A symmetric encoder-decoder (UNet) graph builder with skip connections,
//!   and a binding of that graph to trainable `tch` parameters.
//! - A generator producing (noised image, residual) pairs for every timestep.
//!
//! Images are channels-first `[C, H, W]` tensors with values in `[-1, 1]`.

pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

pub use error::{Error, Result};
