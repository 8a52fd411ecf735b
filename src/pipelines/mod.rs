//! # Pipelines

pub mod training_pairs;

pub use training_pairs::{TrainingBatch, TrainingPairConfig, TrainingPairGenerator};
