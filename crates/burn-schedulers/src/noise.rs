//! Random tensor sources
//!
//! Stochastic schedulers (ancestral Euler, LCM, Wuerstchen, DDIM with eta > 0)
//! draw fresh Gaussian noise through a [`NoiseSource`] so callers control
//! reproducibility.

use burn::prelude::*;
use burn::tensor::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Produces normally distributed tensors
pub trait NoiseSource<B: Backend> {
    /// Draw a tensor of the given shape from `N(mean, std^2)`
    fn normal<const D: usize>(
        &mut self,
        dims: [usize; D],
        mean: f64,
        std: f64,
        device: &B::Device,
    ) -> Tensor<B, D>;
}

/// Deterministic noise from a seeded host RNG
///
/// Values are generated on the host and uploaded, so the same seed yields the
/// same tensors on every backend.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<B: Backend> NoiseSource<B> for SeededNoise {
    fn normal<const D: usize>(
        &mut self,
        dims: [usize; D],
        mean: f64,
        std: f64,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let count: usize = dims.iter().product();
        let values: Vec<f32> = (0..count)
            .map(|_| {
                let z: f64 = self.rng.sample(StandardNormal);
                (mean + std * z) as f32
            })
            .collect();
        Tensor::from_data(TensorData::new(values, dims), device)
    }
}

/// Noise from the backend's own random generator
///
/// Seed it through the backend if reproducibility matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendNoise;

impl<B: Backend> NoiseSource<B> for BackendNoise {
    fn normal<const D: usize>(
        &mut self,
        dims: [usize; D],
        mean: f64,
        std: f64,
        device: &B::Device,
    ) -> Tensor<B, D> {
        Tensor::random(dims, Distribution::Normal(mean, std), device)
    }
}
