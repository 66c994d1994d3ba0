//! DDPM scheduler for Wuerstchen-style continuous-time models
//!
//! Timesteps are fractions in (0, 1] and the cumulative alpha comes from an
//! analytic cosine schedule rather than the discrete beta table. Each step
//! takes the DDPM posterior mean and adds fresh noise unless it lands on t=0.

use burn::prelude::*;
use std::f64::consts::PI;
use tracing::debug;

use crate::error::Result;
use crate::noise::NoiseSource;
use crate::sampler::{Scheduler, noise_to_level};
use crate::scheduler::{
    NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, linspace, strength_start,
};
use crate::tensor::{ensure_same_shape, weighted_sum};

const MIN_ALPHA_CUMPROD: f64 = 1e-4;
const MAX_ALPHA_CUMPROD: f64 = 0.9999;

/// Configuration for the Wuerstchen scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WuerstchenOptions {
    /// Cosine schedule offset
    pub s: f64,
    /// Time warp; values above 1 spend more of the run at low noise
    pub scaler: f64,
}

impl Default for WuerstchenOptions {
    fn default() -> Self {
        Self {
            s: 0.008,
            scaler: 1.0,
        }
    }
}

/// Wuerstchen DDPM scheduler
pub struct DdpmWuerstchenScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    timesteps: Vec<f64>,
    s: f64,
    scaler: f64,
    init_alpha_cumprod: f64,
    cursor: StepCursor,
    denoised: Option<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> DdpmWuerstchenScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        Self::with_options(config, WuerstchenOptions::default())
    }

    pub fn with_options(config: &ScheduleConfig, options: WuerstchenOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;

        let n = config.inference_step_count;
        let mut timesteps = linspace(1.0, 0.0, n + 1, true);
        timesteps.truncate(n);
        let start = strength_start(n, config.strength, timesteps.len());
        timesteps.drain(..start);

        let init_alpha_cumprod = (options.s / (1.0 + options.s) * PI * 0.5).cos().powi(2);

        Ok(Self {
            schedule,
            prediction_type: config.prediction_type,
            timesteps,
            s: options.s,
            scaler: options.scaler,
            init_alpha_cumprod,
            cursor: StepCursor::new(config.strict_sequencing),
            denoised: None,
        })
    }

    /// Cumulative alpha at continuous time `t` in [0, 1]
    pub fn alpha_cumprod(&self, t: f64) -> f64 {
        let t = if self.scaler > 1.0 {
            1.0 - (1.0 - t).powf(self.scaler)
        } else if self.scaler < 1.0 {
            t.powf(self.scaler)
        } else {
            t
        };
        let alpha_cumprod = ((t + self.s) / (1.0 + self.s) * PI * 0.5).cos().powi(2)
            / self.init_alpha_cumprod;
        alpha_cumprod.clamp(MIN_ALPHA_CUMPROD, MAX_ALPHA_CUMPROD)
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for DdpmWuerstchenScheduler<B, D> {
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
        let prev_t = self.timesteps.get(index + 1).copied().unwrap_or(0.0);

        let alpha_cumprod = self.alpha_cumprod(t);
        let alpha_cumprod_prev = self.alpha_cumprod(prev_t);
        let alpha = alpha_cumprod / alpha_cumprod_prev;
        let (signal, noise_level) = (alpha_cumprod.sqrt(), (1.0 - alpha_cumprod).sqrt());

        let epsilon = self.prediction_type.predict_epsilon(
            model_output.clone(),
            sample.clone(),
            signal,
            noise_level,
        )?;
        let denoised =
            self.prediction_type
                .predict_original(model_output, sample.clone(), signal, noise_level)?;

        // mu = sqrt(1/alpha) * (x - (1 - alpha) * eps / sqrt(1 - alpha_cumprod))
        let scale = (1.0 / alpha).sqrt();
        let mu = weighted_sum(
            &[sample, epsilon],
            &[scale, -scale * (1.0 - alpha) / noise_level],
        )?;

        let fresh = noise.normal(mu.dims(), 0.0, 1.0, &mu.device());
        let std = ((1.0 - alpha) * (1.0 - alpha_cumprod_prev) / (1.0 - alpha_cumprod)).sqrt();
        debug!(step = index, t, prev_t, alpha, std, "wuerstchen step");

        let prev_sample = if prev_t != 0.0 {
            weighted_sum(&[mu, fresh], &[1.0, std])?
        } else {
            mu
        };

        self.denoised = Some(denoised);
        self.cursor.advance(index);
        Ok(prev_sample)
    }

    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        let t = timestep
            .or_else(|| self.timesteps.first().copied())
            .unwrap_or(1.0);
        let alpha_cumprod = self.alpha_cumprod(t);
        noise_to_level(
            &original,
            noise,
            alpha_cumprod.sqrt(),
            (1.0 - alpha_cumprod).sqrt(),
        )
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

    fn scheduler(config: &ScheduleConfig) -> DdpmWuerstchenScheduler<TestBackend, 1> {
        DdpmWuerstchenScheduler::new(config).unwrap()
    }

    #[test]
    fn test_timesteps() {
        assert_eq!(
            scheduler(&ScheduleConfig::default().with_steps(2)).timesteps,
            vec![1.0, 0.5]
        );
        assert_eq!(
            scheduler(&ScheduleConfig::default().with_steps(1)).timesteps,
            vec![1.0]
        );

        let ts = scheduler(&ScheduleConfig::default().with_steps(10).with_strength(0.7)).timesteps;
        assert_eq!(ts.len(), 7);
        assert!((ts[0] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_alpha_cumprod_bounds() {
        let s = scheduler(&ScheduleConfig::default());
        assert_eq!(s.alpha_cumprod(0.0), MAX_ALPHA_CUMPROD);
        assert_eq!(s.alpha_cumprod(1.0), MIN_ALPHA_CUMPROD);
        let mid = s.alpha_cumprod(0.5);
        assert!(mid > MIN_ALPHA_CUMPROD && mid < MAX_ALPHA_CUMPROD);
        assert!(s.alpha_cumprod(0.25) > mid);
    }

    #[test]
    fn test_scaler_warps_time() {
        let config = ScheduleConfig::default();
        let plain = scheduler(&config);
        let warped = DdpmWuerstchenScheduler::<TestBackend, 1>::with_options(
            &config,
            WuerstchenOptions {
                scaler: 2.0,
                ..WuerstchenOptions::default()
            },
        )
        .unwrap();
        // 1 - (1 - 0.5)^2 = 0.75
        assert!((warped.alpha_cumprod(0.5) - plain.alpha_cumprod(0.75)).abs() < 1e-12);
    }

    #[test]
    fn test_final_step_is_noise_free() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(1);
        let sample = Tensor::<TestBackend, 1>::full([4], 0.3, &device);
        let output = Tensor::<TestBackend, 1>::full([4], 0.1, &device);

        let run = |seed: u64| {
            let mut s = scheduler(&config);
            let out = s
                .step(output.clone(), 1.0, sample.clone(), &mut SeededNoise::new(seed))
                .unwrap();
            to_host(out).unwrap()
        };
        assert_eq!(run(1), run(2));
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(4);

        let run = |seed: u64| {
            let mut s = scheduler(&config);
            let mut noise = SeededNoise::new(seed);
            let mut sample = Tensor::<TestBackend, 1>::ones([8], &device);
            for t in s.timesteps.clone() {
                let output = sample.clone().mul_scalar(0.5);
                sample = s.step(output, t, sample, &mut noise).unwrap();
            }
            to_host(sample).unwrap()
        };
        assert_eq!(run(3), run(3));
        assert_ne!(run(3), run(4));
    }

    #[test]
    fn test_add_noise_defaults_to_first_timestep() {
        let device = <TestBackend as Backend>::Device::default();
        let s = scheduler(&ScheduleConfig::default().with_steps(4));
        let original = Tensor::<TestBackend, 1>::ones([2], &device);
        let noise = Tensor::<TestBackend, 1>::zeros([2], &device);

        let noised = s.add_noise(original, &[noise], None).unwrap();
        let expected = MIN_ALPHA_CUMPROD.sqrt() as f32;
        for v in to_host(noised[0].clone()).unwrap() {
            assert!((v - expected).abs() < 1e-6);
        }
    }
}
