//! LCM (Latent Consistency Model) scheduler
//!
//! A distillation-based scheduler that enables high-quality generation
//! in very few steps (1-8 steps typically). Each step predicts the clean
//! sample through the consistency boundary conditions and, except on the
//! final step, re-noises it to the next timestep.
//!
//! Luo et al., 2023. https://arxiv.org/abs/2310.04378

use burn::prelude::*;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::noise::NoiseSource;
use crate::sampler::Scheduler;
use crate::scheduler::{NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, linspace};
use crate::tensor::{ensure_same_shape, weighted_sum};

/// Configuration for the LCM scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LcmOptions {
    /// Step count of the schedule the model was distilled on
    pub original_inference_steps: usize,
    /// Multiplier applied to the timestep in the boundary conditions
    pub timestep_scaling: f64,
    /// Standard deviation of the data distribution
    pub sigma_data: f64,
}

impl Default for LcmOptions {
    fn default() -> Self {
        Self {
            original_inference_steps: 50,
            timestep_scaling: 10.0,
            sigma_data: 0.5,
        }
    }
}

/// LCM scheduler
pub struct LcmScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    timesteps: Vec<f64>,
    timestep_scaling: f64,
    sigma_data: f64,
    cursor: StepCursor,
    denoised: Option<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> LcmScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        Self::with_options(config, LcmOptions::default())
    }

    pub fn with_options(config: &ScheduleConfig, options: LcmOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let timesteps = Self::compute_timesteps(config, &options)?;

        Ok(Self {
            schedule,
            prediction_type: config.prediction_type,
            timesteps,
            timestep_scaling: options.timestep_scaling,
            sigma_data: options.sigma_data,
            cursor: StepCursor::new(config.strict_sequencing),
            denoised: None,
        })
    }

    /// Evenly skip through the distillation schedule
    ///
    /// Strength shortens the origin schedule (floor of `original * strength`)
    /// rather than dropping inference steps. Asking for more steps than there
    /// are origin steps repeats origin timesteps.
    fn compute_timesteps(config: &ScheduleConfig, options: &LcmOptions) -> Result<Vec<f64>> {
        let original = options.original_inference_steps;
        if original == 0 || original > config.train_step_count {
            return Err(SchedulerError::InvalidConfig(format!(
                "original_inference_steps must be between 1 and {}, got {original}",
                config.train_step_count
            )));
        }

        let ratio = config.train_step_count / original;
        let strength = config.strength.unwrap_or(1.0);
        let origin_count = ((original as f64 * strength) as usize).max(1);
        let n = config.inference_step_count;

        let origin: Vec<f64> = (1..=origin_count)
            .rev()
            .map(|i| (i * ratio) as f64 - 1.0)
            .collect();

        Ok(linspace(0.0, origin_count as f64, n, false)
            .into_iter()
            .map(|i| origin[(i.floor() as usize).min(origin_count - 1)])
            .collect())
    }

    /// Consistency boundary conditions (c_skip, c_out) at a timestep
    fn boundary_condition_scalings(&self, timestep: f64) -> (f64, f64) {
        let scaled = timestep * self.timestep_scaling;
        let sd2 = self.sigma_data * self.sigma_data;
        let c_skip = sd2 / (scaled * scaled + sd2);
        let c_out = scaled / (scaled * scaled + sd2).sqrt();
        (c_skip, c_out)
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for LcmScheduler<B, D> {
    fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step<N: NoiseSource<B>>(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
        noise: &mut N,
    ) -> Result<Tensor<B, D>> {
        ensure_same_shape(&sample, &model_output)?;
        let index = self.cursor.resolve(&self.timesteps, timestep)?;
        let t = self.timesteps[index];
        let next_t = self.timesteps.get(index + 1).copied();
        let is_final = next_t.is_none();
        let alpha_prod_t = self.schedule.alpha_cumprod_at(t);

        let (c_skip, c_out) = self.boundary_condition_scalings(t);
        let pred_original = self.prediction_type.predict_original(
            model_output,
            sample.clone(),
            alpha_prod_t.sqrt(),
            (1.0 - alpha_prod_t).sqrt(),
        )?;
        let denoised = weighted_sum(&[pred_original, sample], &[c_out, c_skip])?;

        debug!(step = index, timestep = t, c_skip, c_out, is_final, "lcm step");

        let prev_sample = match next_t {
            None => denoised.clone(),
            Some(next_t) => {
                let alpha_prod_t_prev = self.schedule.alpha_cumprod_at(next_t);
                let fresh = noise.normal(denoised.dims(), 0.0, 1.0, &denoised.device());
                weighted_sum(
                    &[denoised.clone(), fresh],
                    &[alpha_prod_t_prev.sqrt(), (1.0 - alpha_prod_t_prev).sqrt()],
                )?
            }
        };

        self.denoised = Some(denoised);
        self.cursor.advance(index);
        Ok(prev_sample)
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        self.denoised.as_ref()
    }

    fn reset(&mut self) {
        self.cursor.reset();
        self.denoised = None;
    }
}
