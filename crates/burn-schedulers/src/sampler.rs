//! The contract shared by every scheduler

use burn::prelude::*;

use crate::error::Result;
use crate::noise::NoiseSource;
use crate::scheduler::NoiseSchedule;
use crate::tensor::weighted_sum;

/// A diffusion scheduler: a fixed timestep sequence plus a step state machine
///
/// Typical loop:
///
/// ```ignore
/// let mut latent = noise.normal(dims, 0.0, scheduler.init_noise_sigma(), &device);
/// for &t in scheduler.timesteps().to_vec().iter() {
///     let input = scheduler.scale_model_input(t, latent.clone())?;
///     let output = model.forward(input, t);
///     latent = scheduler.step(output, t, latent, &mut noise)?;
/// }
/// ```
pub trait Scheduler<B: Backend, const D: usize> {
    /// The derived training schedule
    fn schedule(&self) -> &NoiseSchedule;

    /// Timesteps to visit, in order, after strength truncation
    fn timesteps(&self) -> &[f64];

    /// Standard deviation of the initial latent noise
    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// Scale the model input for the given timestep
    fn scale_model_input(&self, _timestep: f64, sample: Tensor<B, D>) -> Result<Tensor<B, D>> {
        Ok(sample)
    }

    /// Advance the sample by one entry of [`timesteps`](Self::timesteps)
    fn step<N: NoiseSource<B>>(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
        noise: &mut N,
    ) -> Result<Tensor<B, D>>;

    /// Forward process: noise `original` to the level of `timestep`
    ///
    /// One output per noise tensor. `None` uses the first timestep.
    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        let t = timestep
            .or_else(|| self.timesteps().first().copied())
            .unwrap_or(0.0);
        let alpha_cumprod = self.schedule().alpha_cumprod_at(t);
        noise_to_level(
            &original,
            noise,
            alpha_cumprod.sqrt(),
            (1.0 - alpha_cumprod).sqrt(),
        )
    }

    /// Most recent predicted clean sample, for previews
    fn last_denoised(&self) -> Option<&Tensor<B, D>>;

    /// Clear solver state so the same sequence can be run again
    fn reset(&mut self);
}

/// `signal * original + noise_scale * n` for each noise tensor
pub fn noise_to_level<B: Backend, const D: usize>(
    original: &Tensor<B, D>,
    noise: &[Tensor<B, D>],
    signal: f64,
    noise_scale: f64,
) -> Result<Vec<Tensor<B, D>>> {
    noise
        .iter()
        .map(|n| weighted_sum(&[original.clone(), n.clone()], &[signal, noise_scale]))
        .collect()
}
