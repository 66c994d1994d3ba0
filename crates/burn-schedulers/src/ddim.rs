//! DDIM (Denoising Diffusion Implicit Models) scheduler
//!
//! Deterministic first-order update over the discrete alpha schedule.
//! With `eta > 0` it adds DDPM-style variance noise (eta = 1 matches DDPM).
//!
//! Song et al., 2020. https://arxiv.org/abs/2010.02502

use burn::prelude::*;
use tracing::debug;

use crate::error::Result;
use crate::noise::NoiseSource;
use crate::sampler::Scheduler;
use crate::scheduler::{
    NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, TimestepSpacing, strength_start,
};
use crate::tensor::{ensure_same_shape, weighted_sum};

/// DDIM-specific options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DdimOptions {
    /// Amount of stochastic noise (0 = deterministic DDIM)
    pub eta: f64,
}

impl Default for DdimOptions {
    fn default() -> Self {
        Self { eta: 0.0 }
    }
}

/// DDIM scheduler
pub struct DdimScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    timesteps: Vec<f64>,
    /// Distance between consecutive training timesteps
    step_ratio: usize,
    /// ᾱ used once the previous timestep falls below zero
    final_alpha_cumprod: f64,
    eta: f64,
    cursor: StepCursor,
    denoised: Option<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> DdimScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        Self::with_options(config, DdimOptions::default())
    }

    pub fn with_options(config: &ScheduleConfig, options: DdimOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let n = config.inference_step_count;

        let mut timesteps: Vec<f64> = config
            .spacing_or(TimestepSpacing::Leading)
            .timesteps(config.train_step_count, n, config.steps_offset)
            .into_iter()
            .map(f64::round)
            .collect();
        let start = strength_start(n, config.strength, timesteps.len());
        timesteps.drain(..start);

        let final_alpha_cumprod = if config.set_alpha_to_one.unwrap_or(false) {
            1.0
        } else {
            schedule.alphas_cumprod[0]
        };

        Ok(Self {
            schedule,
            prediction_type: config.prediction_type,
            timesteps,
            step_ratio: config.train_step_count / n,
            final_alpha_cumprod,
            eta: options.eta,
            cursor: StepCursor::new(config.strict_sequencing),
            denoised: None,
        })
    }

    fn alpha_cumprod_prev(&self, timestep: f64) -> f64 {
        let prev = timestep - self.step_ratio as f64;
        if prev >= 0.0 {
            self.schedule.alpha_cumprod_at(prev)
        } else {
            self.final_alpha_cumprod
        }
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for DdimScheduler<B, D> {
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

        let alpha_prod_t = self.schedule.alpha_cumprod_at(t);
        let alpha_prod_t_prev = self.alpha_cumprod_prev(t);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let (alpha_sqrt, beta_sqrt) = (alpha_prod_t.sqrt(), beta_prod_t.sqrt());
        let pred_original = self.prediction_type.predict_original(
            model_output.clone(),
            sample.clone(),
            alpha_sqrt,
            beta_sqrt,
        )?;
        let pred_epsilon =
            self.prediction_type
                .predict_epsilon(model_output, sample, alpha_sqrt, beta_sqrt)?;

        let variance = (beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.eta * variance.max(0.0).sqrt();
        let direction = (beta_prod_t_prev - std_dev_t * std_dev_t).max(0.0).sqrt();

        debug!(step = index, timestep = t, alpha_prod_t, alpha_prod_t_prev, "ddim step");

        let mut prev_sample = weighted_sum(
            &[pred_original.clone(), pred_epsilon],
            &[alpha_prod_t_prev.sqrt(), direction],
        )?;
        if std_dev_t > 0.0 {
            let variance_noise = noise.normal(prev_sample.dims(), 0.0, 1.0, &prev_sample.device());
            prev_sample = weighted_sum(&[prev_sample, variance_noise], &[1.0, std_dev_t])?;
        }

        self.denoised = Some(pred_original);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::SeededNoise;
    use crate::tensor::to_host;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn timesteps(config: ScheduleConfig) -> Vec<f64> {
        DdimScheduler::<TestBackend, 1>::new(&config)
            .unwrap()
            .timesteps
    }

    #[test]
    fn test_ddim_default_spacing_is_leading() {
        let config = ScheduleConfig::default().with_steps(2);
        assert_eq!(timesteps(config.clone()), vec![500.0, 0.0]);
        assert_eq!(
            timesteps(config.with_spacing(TimestepSpacing::Linspace)),
            vec![999.0, 0.0]
        );
    }

    #[test]
    fn test_ddim_single_step() {
        assert_eq!(timesteps(ScheduleConfig::default().with_steps(1)), vec![0.0]);
    }

    #[test]
    fn test_ddim_strength_truncates() {
        let ts = timesteps(
            ScheduleConfig::default()
                .with_spacing(TimestepSpacing::Linspace)
                .with_strength(0.7),
        );
        assert_eq!(ts.len(), 35);
        assert_eq!(ts[0], 693.0);
        assert_eq!(*ts.last().unwrap(), 0.0);
    }

    #[test]
    fn test_ddim_final_step_with_alpha_to_one_recovers_sample() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(1).with_alpha_to_one(true);
        let mut scheduler = DdimScheduler::<TestBackend, 2>::new(&config).unwrap();

        let x0 = Tensor::<TestBackend, 2>::full([2, 2], 0.5, &device);
        let eps = Tensor::<TestBackend, 2>::full([2, 2], -1.0, &device);
        let noisy = scheduler
            .add_noise(x0.clone(), &[eps.clone()], None)
            .unwrap()
            .remove(0);

        let out = scheduler
            .step(eps, 0.0, noisy, &mut SeededNoise::new(0))
            .unwrap();
        for v in to_host(out).unwrap() {
            assert!((v - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ddim_v_prediction_recovers_original() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default()
            .with_steps(10)
            .with_prediction_type(PredictionType::VPrediction);
        let mut scheduler = DdimScheduler::<TestBackend, 1>::new(&config).unwrap();
        let t = scheduler.timesteps[0];
        let acp = scheduler.schedule.alpha_cumprod_at(t);
        let (a, s) = (acp.sqrt(), (1.0 - acp).sqrt());

        let x0 = Tensor::<TestBackend, 1>::full([4], 0.25, &device);
        let eps = Tensor::<TestBackend, 1>::full([4], 1.0, &device);
        let noisy = weighted_sum(&[x0.clone(), eps.clone()], &[a, s]).unwrap();
        // v = alpha * eps - sigma * x0
        let v = weighted_sum(&[eps, x0], &[a, -s]).unwrap();

        scheduler
            .step(v, t, noisy, &mut SeededNoise::new(0))
            .unwrap();
        let denoised = to_host(scheduler.last_denoised().unwrap().clone()).unwrap();
        assert!(denoised.iter().all(|v| (v - 0.25).abs() < 1e-4));
    }

    #[test]
    fn test_ddim_eta_adds_noise_deterministically() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(10);
        let run = |seed| {
            let mut scheduler =
                DdimScheduler::<TestBackend, 1>::with_options(&config, DdimOptions { eta: 1.0 })
                    .unwrap();
            let t = scheduler.timesteps[0];
            let sample = Tensor::<TestBackend, 1>::ones([8], &device);
            let output = Tensor::<TestBackend, 1>::zeros([8], &device);
            to_host(
                scheduler
                    .step(output, t, sample, &mut SeededNoise::new(seed))
                    .unwrap(),
            )
            .unwrap()
        };
        assert_eq!(run(3), run(3));
        assert_ne!(run(3), run(4));
    }
}
