//! Sampling loop against a synthetic model
//!
//! There is no denoising network here: the model output is either zero or a
//! constant, which is enough to watch how a scheduler moves the latent.

use anyhow::{Context, Result};
use burn::prelude::*;
use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, info};

use burn_schedulers::tensor::to_host;
use burn_schedulers::{AnyScheduler, NoiseSource, Scheduler, SeededNoise};

use crate::CliBackend;

/// Synthetic model prediction
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SyntheticModel {
    /// Always predicts zero
    Zero,
    /// Always predicts `--value`
    Constant,
}

#[derive(Debug, Serialize)]
pub struct SampleReport {
    pub scheduler: &'static str,
    pub steps: usize,
    pub init_noise_sigma: f64,
    pub final_stats: TensorStats,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TensorStats {
    pub mean: f64,
    pub std: f64,
    pub min: f32,
    pub max: f32,
}

impl TensorStats {
    fn of(tensor: Tensor<CliBackend, 4>) -> Result<Self> {
        let values = to_host(tensor).context("Failed to read latent")?;
        let count = values.len().max(1) as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / count;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / count;
        Ok(Self {
            mean,
            std: var.sqrt(),
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        })
    }
}

/// Drive `scheduler` through its whole timestep sequence
///
/// With `from_image`, the loop starts from a noised all-zero "image" at
/// the first retained timestep instead of pure noise.
pub fn run(
    scheduler: &mut AnyScheduler<CliBackend, 4>,
    dims: [usize; 4],
    seed: u64,
    model: SyntheticModel,
    value: f32,
    from_image: bool,
) -> Result<SampleReport> {
    let device = Default::default();
    let mut noise = SeededNoise::new(seed);
    let kind = scheduler.kind();
    let init_noise_sigma = scheduler.init_noise_sigma();
    let timesteps = scheduler.timesteps().to_vec();

    info!(
        scheduler = %kind,
        steps = timesteps.len(),
        init_noise_sigma,
        ?dims,
        "Starting sampling loop"
    );

    let initial: Tensor<CliBackend, 4> =
        NoiseSource::<CliBackend>::normal(&mut noise, dims, 0.0, 1.0, &device);
    let mut latent = if from_image {
        let image = Tensor::<CliBackend, 4>::zeros(dims, &device);
        scheduler
            .add_noise(image, &[initial], None)?
            .pop()
            .context("add_noise returned no tensors")?
    } else {
        initial.mul_scalar(init_noise_sigma)
    };

    for (i, &t) in timesteps.iter().enumerate() {
        let input = scheduler.scale_model_input(t, latent.clone())?;
        let output = match model {
            SyntheticModel::Zero => input.zeros_like(),
            SyntheticModel::Constant => input.ones_like().mul_scalar(value),
        };
        latent = scheduler
            .step(output, t, latent, &mut noise)
            .with_context(|| format!("Step {i} at timestep {t} failed"))?;

        let stats = TensorStats::of(latent.clone())?;
        debug!(step = i, timestep = t, mean = stats.mean, std = stats.std, "latent");
    }

    let final_stats = TensorStats::of(latent)?;
    info!(mean = final_stats.mean, std = final_stats.std, "Sampling complete");

    Ok(SampleReport {
        scheduler: kind.id(),
        steps: timesteps.len(),
        init_noise_sigma,
        final_stats,
    })
}
