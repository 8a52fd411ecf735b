//! # Models
//!
//! The encoder-decoder graph description and its binding to trainable
//! parameters.

pub mod unet_2d;
pub mod unet_graph;
