//! KDPM2 (k-diffusion DPM-Solver-2) scheduler
//!
//! Second-order solver that evaluates the model twice per sigma interval:
//! once at the interval start and once at its log-space midpoint. The
//! timestep sequence interleaves both evaluation points, so `n` requested
//! steps yield `2n - 1` calls.

use burn::prelude::*;
use tracing::debug;

use crate::error::Result;
use crate::euler::SigmaSteps;
use crate::noise::NoiseSource;
use crate::sampler::{Scheduler, noise_to_level};
use crate::scheduler::{
    NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, TimestepSpacing, strength_start,
    timestep_index,
};
use crate::tensor::{ensure_same_shape, weighted_sum};

/// Geometric midpoints `sqrt(sigma[j] * sigma[j - 1])`, 0 where undefined
fn interpolated_sigmas(sigmas: &[f64]) -> Vec<f64> {
    let log: Vec<f64> = sigmas.iter().map(|s| s.ln()).collect();
    let n = log.len();
    (0..n)
        .map(|j| {
            let rolled = log[(j + n - 1) % n];
            let mid = (log[j] + 0.5 * (rolled - log[j])).exp();
            if mid.is_nan() { 0.0 } else { mid }
        })
        .collect()
}

/// `[first] + each of rest[..] twice + [last]`
fn interleave_pairs(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len() * 2);
    out.push(values[0]);
    for &v in &values[1..] {
        out.extend([v, v]);
    }
    out.push(values[values.len() - 1]);
    out
}

/// KDPM2 discrete scheduler
pub struct Kdpm2DiscreteScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    timesteps: Vec<f64>,
    /// Interval-start sigmas, interleaved
    sigmas: Vec<f64>,
    /// Midpoint sigmas, interleaved
    sigmas_interpol: Vec<f64>,
    init_noise_sigma: f64,
    /// Sample cached by the first half-step; `None` means the next call is a first half
    sample: Option<Tensor<B, D>>,
    cursor: StepCursor,
    denoised: Option<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> Kdpm2DiscreteScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let base = SigmaSteps::new(
            &schedule,
            config,
            config.spacing_or(TimestepSpacing::Linspace),
        );

        let interpol = interpolated_sigmas(&base.sigmas);
        let timesteps_interpol: Vec<f64> =
            interpol.iter().map(|&s| schedule.sigma_to_t(s)).collect();

        let n = base.timesteps.len();
        let mut timesteps = Vec::with_capacity(2 * n - 1);
        timesteps.push(base.timesteps[0]);
        for (&mid, &t) in timesteps_interpol[1..n].iter().zip(&base.timesteps[1..]) {
            timesteps.extend([mid, t]);
        }

        let mut sigmas = interleave_pairs(&base.sigmas);
        let mut sigmas_interpol = interleave_pairs(&interpol);

        // Whole intervals only, so the first retained call is a first half
        let start = 2 * strength_start(config.inference_step_count, config.strength, n);
        timesteps.drain(..start);
        sigmas.drain(..start);
        sigmas_interpol.drain(..start);

        Ok(Self {
            schedule,
            prediction_type: config.prediction_type,
            timesteps,
            sigmas,
            sigmas_interpol,
            init_noise_sigma: base.init_noise_sigma,
            sample: None,
            cursor: StepCursor::new(config.strict_sequencing),
            denoised: None,
        })
    }

    fn state_in_first_order(&self) -> bool {
        self.sample.is_none()
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn sigmas_interpol(&self) -> &[f64] {
        &self.sigmas_interpol
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for Kdpm2DiscreteScheduler<B, D> {
    fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, timestep: f64, sample: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let index = self.cursor.resolve(&self.timesteps, timestep)?;
        let sigma = if self.state_in_first_order() {
            self.sigmas[index]
        } else {
            self.sigmas_interpol[index]
        };
        Ok(sample.div_scalar((sigma * sigma + 1.0).sqrt()))
    }

    fn step<N: NoiseSource<B>>(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
        _noise: &mut N,
    ) -> Result<Tensor<B, D>> {
        ensure_same_shape(&sample, &model_output)?;
        let index = self.cursor.resolve(&self.timesteps, timestep)?;

        let prev_sample = if self.state_in_first_order() {
            let sigma = self.sigmas[index];
            let sigma_interpol = self.sigmas_interpol[index + 1];
            debug!(step = index, sigma, sigma_interpol, "kdpm2 first half");

            let denoised = self
                .prediction_type
                .predict_original_from_sigma(model_output, sample.clone(), sigma)?;
            // d = (x - x0) / sigma, moved by dt = sigma_interpol - sigma
            let ratio = (sigma_interpol - sigma) / sigma;
            let prev = weighted_sum(&[sample.clone(), denoised.clone()], &[1.0 + ratio, -ratio])?;
            self.sample = Some(sample);
            self.denoised = Some(denoised);
            prev
        } else {
            let sigma = self.sigmas[index.saturating_sub(1)];
            let sigma_interpol = self.sigmas_interpol[index];
            let sigma_next = self.sigmas[index];
            debug!(step = index, sigma, sigma_interpol, sigma_next, "kdpm2 second half");

            let denoised = self.prediction_type.predict_original_from_sigma(
                model_output,
                sample.clone(),
                sigma_interpol,
            )?;
            // Derivative at the midpoint sample, applied from the cached interval start
            let ratio = (sigma_next - sigma) / sigma_interpol;
            let anchor = self.sample.take().unwrap_or_else(|| sample.clone());
            let prev = weighted_sum(
                &[anchor, sample, denoised.clone()],
                &[1.0, ratio, -ratio],
            )?;
            self.denoised = Some(denoised);
            prev
        };

        self.cursor.advance(index);
        Ok(prev_sample)
    }

    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        let index = timestep
            .map(|t| timestep_index(&self.timesteps, t))
            .unwrap_or(0);
        noise_to_level(&original, noise, 1.0, self.sigmas[index])
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        self.denoised.as_ref()
    }

    fn reset(&mut self) {
        self.sample = None;
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

    #[test]
    fn test_interpolated_sigmas_edges() {
        let interpol = interpolated_sigmas(&[4.0, 1.0, 0.0]);
        assert_eq!(interpol[0], 0.0);
        assert!((interpol[1] - 2.0).abs() < 1e-12);
        assert_eq!(interpol[2], 0.0);
    }

    #[test]
    fn test_interleaved_lengths() {
        let config = ScheduleConfig::default().with_steps(10);
        let scheduler = Kdpm2DiscreteScheduler::<TestBackend, 1>::new(&config).unwrap();
        assert_eq!(scheduler.timesteps.len(), 19);
        assert_eq!(scheduler.sigmas.len(), 22);
        assert_eq!(scheduler.sigmas_interpol.len(), 22);
    }

    #[test]
    fn test_two_steps() {
        let config = ScheduleConfig::default().with_steps(2);
        let scheduler = Kdpm2DiscreteScheduler::<TestBackend, 1>::new(&config).unwrap();
        assert_eq!(scheduler.timesteps.len(), 3);
        assert_eq!(scheduler.timesteps[0], 999.0);
        assert!((scheduler.timesteps[1] - 233.2097).abs() < 0.05);
        assert_eq!(scheduler.timesteps[2], 0.0);
    }

    #[test]
    fn test_strength_keeps_parity() {
        let config = ScheduleConfig::default().with_steps(10).with_strength(0.7);
        let scheduler = Kdpm2DiscreteScheduler::<TestBackend, 1>::new(&config).unwrap();
        // 3 intervals skipped, 6 calls dropped
        assert_eq!(scheduler.timesteps.len(), 13);
        assert_eq!(scheduler.sigmas.len(), 16);
        // First retained call spans a whole interval around its midpoint
        assert!(scheduler.sigmas[0] > scheduler.sigmas_interpol[1]);
        assert!(scheduler.sigmas_interpol[1] > scheduler.sigmas[1]);
    }

    #[test]
    fn test_half_steps_alternate() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(4);
        let mut scheduler = Kdpm2DiscreteScheduler::<TestBackend, 1>::new(&config).unwrap();
        let mut noise = SeededNoise::new(0);

        let mut sample = Tensor::<TestBackend, 1>::ones([2], &device);
        for (i, t) in scheduler.timesteps.clone().into_iter().enumerate() {
            assert_eq!(scheduler.state_in_first_order(), i % 2 == 0);
            let output = Tensor::<TestBackend, 1>::full([2], 0.1, &device);
            sample = scheduler.step(output, t, sample, &mut noise).unwrap();
        }
        assert!(to_host(sample).unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_second_half_derivative_uses_current_sample() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(4);
        let mut scheduler = Kdpm2DiscreteScheduler::<TestBackend, 1>::new(&config).unwrap();
        let mut noise = SeededNoise::new(0);
        let (t0, t1) = (scheduler.timesteps[0], scheduler.timesteps[1]);

        let anchor = Tensor::<TestBackend, 1>::full([2], 1.0, &device);
        let zero = Tensor::<TestBackend, 1>::zeros([2], &device);
        scheduler.step(zero.clone(), t0, anchor, &mut noise).unwrap();

        // Zero epsilon at the midpoint means a zero derivative there, so the
        // interval ends where it started regardless of the midpoint sample
        let midpoint = Tensor::<TestBackend, 1>::full([2], 3.0, &device);
        let out = scheduler.step(zero, t1, midpoint, &mut noise).unwrap();
        for v in to_host(out).unwrap() {
            assert!((v - 1.0).abs() < 1e-5, "{v}");
        }
    }
}
