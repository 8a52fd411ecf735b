//! # Training pairs
//!
//! For every source image, one noised version per timestep together with the
//! residual `image - noised` that the denoising model learns to predict.
use crate::error::{Error, Result};
use crate::schedulers::{NoiseScheduler, NoiseSchedulerConfig};
use crate::utils;
use std::path::Path;
use tch::Tensor;

/// The configuration for the [`TrainingPairGenerator`].
#[derive(Debug, Clone, Copy)]
pub struct TrainingPairConfig {
    /// Number of timesteps, also the number of pairs generated per image.
    pub n_timesteps: usize,
    pub noise_start: f64,
    pub noise_end: f64,
}

impl Default for TrainingPairConfig {
    fn default() -> Self {
        Self { n_timesteps: 50, noise_start: 0.0001, noise_end: 0.06 }
    }
}

/// The pairs generated for a single image, indexed by timestep.
#[derive(Debug)]
pub struct TrainingBatch {
    /// `inputs[t]` is the image noised to timestep `t`.
    pub inputs: Vec<Tensor>,
    /// `targets[t]` is `image - inputs[t]`.
    pub targets: Vec<Tensor>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Inputs and targets stacked along a new leading timestep dimension.
    pub fn stacked(&self) -> Result<(Tensor, Tensor)> {
        let inputs = Tensor::f_stack(&self.inputs, 0)?;
        let targets = Tensor::f_stack(&self.targets, 0)?;
        Ok((inputs, targets))
    }
}

#[derive(Debug)]
pub struct TrainingPairGenerator {
    images: Vec<Tensor>,
    scheduler: NoiseScheduler,
    pub config: TrainingPairConfig,
}

impl TrainingPairGenerator {
    /// Wraps images already scaled to `[-1, 1]`.
    pub fn new(images: Vec<Tensor>, config: TrainingPairConfig) -> Result<Self> {
        let scheduler = NoiseScheduler::new(NoiseSchedulerConfig::linear(
            config.n_timesteps,
            config.noise_start,
            config.noise_end,
        ))?;
        log::info!(
            "training pair generator: {} images, {} timesteps",
            images.len(),
            config.n_timesteps
        );
        Ok(Self { images, scheduler, config })
    }

    /// Loads, resizes to `img_length` squares and scales the given image files.
    pub fn from_files<P: AsRef<Path>>(
        paths: &[P],
        img_length: i64,
        config: TrainingPairConfig,
    ) -> Result<Self> {
        let images = paths
            .iter()
            .map(|path| utils::load_image(path, img_length))
            .collect::<Result<Vec<_>>>()?;
        Self::new(images, config)
    }

    /// Number of source images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn scheduler(&self) -> &NoiseScheduler {
        &self.scheduler
    }

    pub fn image(&self, index: usize) -> Option<&Tensor> {
        self.images.get(index)
    }

    /// Noises the image at `index` to every timestep. Fresh noise is drawn on
    /// each call.
    pub fn pair_for(&self, index: usize) -> Result<TrainingBatch> {
        let image = self
            .images
            .get(index)
            .ok_or(Error::IndexOutOfRange { index, len: self.images.len() })?;
        let inputs = (0..self.config.n_timesteps)
            .map(|t| self.scheduler.forward(image, t))
            .collect::<Result<Vec<_>>>()?;
        let targets = inputs.iter().map(|xt| image - xt).collect();
        log::debug!("generated {} pairs for image {index}", inputs.len());
        Ok(TrainingBatch { inputs, targets })
    }

    /// One batch per image, in index order.
    pub fn iter(&self) -> impl Iterator<Item = Result<TrainingBatch>> + '_ {
        (0..self.len()).map(move |index| self.pair_for(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::kind;

    fn generator(n_images: usize, n_timesteps: usize) -> TrainingPairGenerator {
        let images = (0..n_images)
            .map(|_| Tensor::rand([3, 16, 16], kind::FLOAT_CPU) * 2. - 1.)
            .collect();
        let config = TrainingPairConfig { n_timesteps, ..Default::default() };
        TrainingPairGenerator::new(images, config).unwrap()
    }

    #[test]
    fn one_pair_per_timestep() {
        let gen = generator(3, 50);
        assert_eq!(gen.len(), 3);
        assert_eq!(gen.scheduler().timesteps(), 50);
        let batch = gen.pair_for(2).unwrap();
        assert_eq!(batch.len(), 50);
        assert_eq!(batch.inputs.len(), 50);
        assert_eq!(batch.targets.len(), 50);
        for (input, target) in batch.inputs.iter().zip(batch.targets.iter()) {
            assert_eq!(input.size(), vec![3, 16, 16]);
            assert_eq!(target.size(), vec![3, 16, 16]);
        }
    }

    #[test]
    fn targets_are_exact_residuals() {
        let gen = generator(2, 10);
        let image = gen.image(1).unwrap();
        let batch = gen.pair_for(1).unwrap();
        for t in 0..10 {
            assert!(batch.targets[t].equal(&(image - &batch.inputs[t])), "timestep {t}");
        }
    }

    #[test]
    fn repeated_calls_draw_new_noise() {
        let gen = generator(1, 5);
        let a = gen.pair_for(0).unwrap();
        let b = gen.pair_for(0).unwrap();
        for t in 0..5 {
            assert_eq!(a.inputs[t].size(), b.inputs[t].size());
            assert!(!a.inputs[t].equal(&b.inputs[t]));
        }
    }

    #[test]
    fn index_out_of_range() {
        let gen = generator(2, 5);
        assert!(matches!(gen.pair_for(2), Err(Error::IndexOutOfRange { index: 2, len: 2 })));
        assert!(matches!(gen.pair_for(100), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn noise_grows_with_timesteps() {
        tch::manual_seed(3);
        let gen = generator(1, 50);
        let batch = gen.pair_for(0).unwrap();
        let magnitude =
            |t: usize| batch.targets[t].square().mean(tch::Kind::Float).double_value(&[]);
        assert!(magnitude(0) < magnitude(49));
    }

    #[test]
    fn stacked_batches() {
        let gen = generator(2, 7);
        let (inputs, targets) = gen.pair_for(0).unwrap().stacked().unwrap();
        assert_eq!(inputs.size(), vec![7, 3, 16, 16]);
        assert_eq!(targets.size(), vec![7, 3, 16, 16]);
        assert_eq!(gen.iter().count(), 2);
        assert!(gen.iter().all(|batch| batch.is_ok()));
    }

    #[test]
    fn images_of_different_sizes() {
        let images = vec![
            Tensor::zeros([3, 16, 16], kind::FLOAT_CPU),
            Tensor::zeros([3, 8, 8], kind::FLOAT_CPU),
        ];
        let config = TrainingPairConfig { n_timesteps: 4, ..Default::default() };
        let gen = TrainingPairGenerator::new(images, config).unwrap();
        let batch = gen.pair_for(1).unwrap();
        for (input, target) in batch.inputs.iter().zip(batch.targets.iter()) {
            assert_eq!(input.size(), vec![3, 8, 8]);
            assert_eq!(target.size(), vec![3, 8, 8]);
        }
        let (inputs, _) = batch.stacked().unwrap();
        assert_eq!(inputs.size(), vec![4, 3, 8, 8]);
        assert_eq!(gen.pair_for(0).unwrap().inputs[0].size(), vec![3, 16, 16]);
    }

    #[test]
    fn invalid_inputs() {
        let config = TrainingPairConfig { n_timesteps: 0, ..Default::default() };
        assert!(matches!(TrainingPairGenerator::new(vec![], config), Err(Error::Configuration(_))));

        let gen = TrainingPairGenerator::new(vec![], TrainingPairConfig::default()).unwrap();
        assert!(gen.is_empty());
        assert!(gen.pair_for(0).is_err());
    }

    #[test]
    fn from_missing_files() {
        let paths = ["missing.jpg"];
        let res = TrainingPairGenerator::from_files(&paths[..], 16, TrainingPairConfig::default());
        assert!(matches!(res, Err(Error::ImageLoad { .. })));
    }
}
