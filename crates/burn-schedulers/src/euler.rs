//! Euler schedulers for diffusion models
//!
//! Implements the Euler method for ODE-based sampling in the k-diffusion
//! sigma parametrization (`x = x0 + sigma * eps`), plus the ancestral variant
//! that splits each step into a deterministic move and fresh noise.
//!
//! Fast and produces good results with ~20-30 steps.

use burn::prelude::*;
use tracing::debug;

use crate::error::Result;
use crate::noise::NoiseSource;
use crate::sampler::{Scheduler, noise_to_level};
use crate::scheduler::{
    NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, TimestepSpacing,
    get_ancestral_step, karras_sigmas, strength_start, timestep_index,
};
use crate::tensor::{ensure_same_shape, weighted_sum};

/// Timesteps and noise levels in sigma space
///
/// `sigmas` has one more entry than `timesteps`: the trailing 0.
#[derive(Debug, Clone, PartialEq)]
pub struct SigmaSteps {
    pub timesteps: Vec<f64>,
    pub sigmas: Vec<f64>,
    pub init_noise_sigma: f64,
}

impl SigmaSteps {
    /// Fractional timesteps for `spacing`, interpolated sigmas, optional Karras
    /// re-spacing; no strength truncation
    pub fn new(schedule: &NoiseSchedule, config: &ScheduleConfig, spacing: TimestepSpacing) -> Self {
        let mut timesteps = spacing.timesteps(
            config.train_step_count,
            config.inference_step_count,
            config.steps_offset,
        );
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| schedule.interp_sigma(t)).collect();

        if config.use_karras_sigmas {
            let sigma_max = sigmas[0];
            let sigma_min = sigmas[sigmas.len() - 1];
            sigmas = karras_sigmas(sigma_min, sigma_max, sigmas.len());
            timesteps = sigmas.iter().map(|&s| schedule.sigma_to_t(s)).collect();
        }

        let max_sigma = sigmas.iter().copied().fold(0.0, f64::max);
        let init_noise_sigma = match spacing {
            TimestepSpacing::Linspace | TimestepSpacing::Leading => max_sigma,
            TimestepSpacing::Trailing => (max_sigma * max_sigma + 1.0).sqrt(),
        };
        sigmas.push(0.0);

        Self {
            timesteps,
            sigmas,
            init_noise_sigma,
        }
    }

    /// Drop the leading steps skipped by `strength`
    fn truncate(&mut self, config: &ScheduleConfig) {
        let start = strength_start(
            config.inference_step_count,
            config.strength,
            self.timesteps.len(),
        );
        self.timesteps.drain(..start);
        self.sigmas.drain(..start);
    }
}

/// Euler ancestral options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerAncestralOptions {
    /// Eta for noise injection (0 = ODE, 1 = full ancestral)
    pub eta: f64,
    /// Noise scale multiplier
    pub s_noise: f64,
}

impl Default for EulerAncestralOptions {
    fn default() -> Self {
        Self {
            eta: 1.0,
            s_noise: 1.0,
        }
    }
}

/// State shared by both Euler variants
struct EulerCore<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    steps: SigmaSteps,
    cursor: StepCursor,
    denoised: Option<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> EulerCore<B, D> {
    fn new(config: &ScheduleConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let mut steps = SigmaSteps::new(
            &schedule,
            config,
            config.spacing_or(TimestepSpacing::Linspace),
        );
        steps.truncate(config);

        Ok(Self {
            schedule,
            prediction_type: config.prediction_type,
            steps,
            cursor: StepCursor::new(config.strict_sequencing),
            denoised: None,
        })
    }

    fn scale_model_input(&self, timestep: f64, sample: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let index = self.cursor.resolve(&self.steps.timesteps, timestep)?;
        let sigma = self.steps.sigmas[index];
        Ok(sample.div_scalar((sigma * sigma + 1.0).sqrt()))
    }

    /// Resolve the step and predict x0; returns (index, sigma, sigma_next, x0)
    fn denoise(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
    ) -> Result<(usize, f64, f64, Tensor<B, D>)> {
        ensure_same_shape(&sample, &model_output)?;
        let index = self.cursor.resolve(&self.steps.timesteps, timestep)?;
        let sigma = self.steps.sigmas[index];
        let sigma_next = self.steps.sigmas[index + 1];

        let denoised = self
            .prediction_type
            .predict_original_from_sigma(model_output, sample, sigma)?;
        self.denoised = Some(denoised.clone());
        Ok((index, sigma, sigma_next, denoised))
    }

    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        let index = timestep
            .map(|t| timestep_index(&self.steps.timesteps, t))
            .unwrap_or(0);
        noise_to_level(&original, noise, 1.0, self.steps.sigmas[index])
    }

    fn reset(&mut self) {
        self.cursor.reset();
        self.denoised = None;
    }
}

/// Move `sample` along the ODE derivative `(sample - denoised) / sigma` by `dt`
fn euler_move<B: Backend, const D: usize>(
    sample: Tensor<B, D>,
    denoised: Tensor<B, D>,
    sigma: f64,
    dt: f64,
) -> Result<Tensor<B, D>> {
    let ratio = dt / sigma;
    weighted_sum(&[sample, denoised], &[1.0 + ratio, -ratio])
}

/// Euler discrete scheduler
pub struct EulerDiscreteScheduler<B: Backend, const D: usize> {
    core: EulerCore<B, D>,
}

impl<B: Backend, const D: usize> EulerDiscreteScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            core: EulerCore::new(config)?,
        })
    }

    /// Get the sigma values (with the trailing 0)
    pub fn sigmas(&self) -> &[f64] {
        &self.core.steps.sigmas
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for EulerDiscreteScheduler<B, D> {
    fn schedule(&self) -> &NoiseSchedule {
        &self.core.schedule
    }

    fn timesteps(&self) -> &[f64] {
        &self.core.steps.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.core.steps.init_noise_sigma
    }

    fn scale_model_input(&self, timestep: f64, sample: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self.core.scale_model_input(timestep, sample)
    }

    fn step<N: NoiseSource<B>>(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
        _noise: &mut N,
    ) -> Result<Tensor<B, D>> {
        let (index, sigma, sigma_next, denoised) =
            self.core.denoise(model_output, timestep, sample.clone())?;
        debug!(step = index, sigma, sigma_next, "euler step");

        let prev_sample = euler_move(sample, denoised, sigma, sigma_next - sigma)?;
        self.core.cursor.advance(index);
        Ok(prev_sample)
    }

    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        self.core.add_noise(original, noise, timestep)
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        self.core.denoised.as_ref()
    }

    fn reset(&mut self) {
        self.core.reset();
    }
}

/// Euler Ancestral scheduler
///
/// Adds noise during sampling for more stochastic results.
/// Draws one normal tensor per call, even on the final step.
pub struct EulerAncestralDiscreteScheduler<B: Backend, const D: usize> {
    core: EulerCore<B, D>,
    eta: f64,
    s_noise: f64,
}

impl<B: Backend, const D: usize> EulerAncestralDiscreteScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        Self::with_options(config, EulerAncestralOptions::default())
    }

    pub fn with_options(config: &ScheduleConfig, options: EulerAncestralOptions) -> Result<Self> {
        Ok(Self {
            core: EulerCore::new(config)?,
            eta: options.eta,
            s_noise: options.s_noise,
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.core.steps.sigmas
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for EulerAncestralDiscreteScheduler<B, D> {
    fn schedule(&self) -> &NoiseSchedule {
        &self.core.schedule
    }

    fn timesteps(&self) -> &[f64] {
        &self.core.steps.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.core.steps.init_noise_sigma
    }

    fn scale_model_input(&self, timestep: f64, sample: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self.core.scale_model_input(timestep, sample)
    }

    fn step<N: NoiseSource<B>>(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
        noise: &mut N,
    ) -> Result<Tensor<B, D>> {
        let (index, sigma, sigma_next, denoised) =
            self.core.denoise(model_output, timestep, sample.clone())?;

        let (sigma_down, sigma_up) = get_ancestral_step(sigma, sigma_next, self.eta);
        debug!(step = index, sigma, sigma_down, sigma_up, "euler ancestral step");

        let moved = euler_move(sample, denoised, sigma, sigma_down - sigma)?;
        let fresh = noise.normal(moved.dims(), 0.0, 1.0, &moved.device());
        let prev_sample = weighted_sum(&[moved, fresh], &[1.0, sigma_up * self.s_noise])?;

        self.core.cursor.advance(index);
        Ok(prev_sample)
    }

    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        self.core.add_noise(original, noise, timestep)
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        self.core.denoised.as_ref()
    }

    fn reset(&mut self) {
        self.core.reset();
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
    fn test_euler_timesteps_are_fractional() {
        let scheduler =
            EulerDiscreteScheduler::<TestBackend, 1>::new(&ScheduleConfig::default().with_steps(33))
                .unwrap();
        let ts = Scheduler::timesteps(&scheduler);
        assert_eq!(ts.len(), 33);
        assert_eq!(ts[0], 999.0);
        assert!((ts[1] - 967.78125).abs() < 1e-9);
        assert_eq!(ts[32], 0.0);
        assert_eq!(scheduler.sigmas().len(), 34);
        assert_eq!(*scheduler.sigmas().last().unwrap(), 0.0);
    }

    #[test]
    fn test_euler_boundaries() {
        let two =
            EulerDiscreteScheduler::<TestBackend, 1>::new(&ScheduleConfig::default().with_steps(2))
                .unwrap();
        assert_eq!(Scheduler::timesteps(&two), &[999.0, 0.0]);
        let one =
            EulerAncestralDiscreteScheduler::<TestBackend, 1>::new(&ScheduleConfig::default().with_steps(1))
                .unwrap();
        assert_eq!(Scheduler::timesteps(&one), &[0.0]);
    }

    #[test]
    fn test_euler_init_noise_sigma() {
        let linspace =
            EulerDiscreteScheduler::<TestBackend, 1>::new(&ScheduleConfig::default()).unwrap();
        let max = linspace.sigmas()[0];
        assert_eq!(Scheduler::init_noise_sigma(&linspace), max);

        let trailing = EulerDiscreteScheduler::<TestBackend, 1>::new(
            &ScheduleConfig::default().with_spacing(TimestepSpacing::Trailing),
        )
        .unwrap();
        let max = trailing.sigmas()[0];
        assert!((Scheduler::init_noise_sigma(&trailing) - (max * max + 1.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_euler_strength_truncates_sigmas() {
        let scheduler = EulerDiscreteScheduler::<TestBackend, 1>::new(
            &ScheduleConfig::default().with_strength(0.7),
        )
        .unwrap();
        let ts = Scheduler::timesteps(&scheduler);
        assert_eq!(ts.len(), 35);
        assert!((ts[0] - 693.18367).abs() < 1e-4);
        assert_eq!(scheduler.sigmas().len(), 36);
    }

    #[test]
    fn test_euler_karras_sigmas_descend() {
        let scheduler = EulerDiscreteScheduler::<TestBackend, 1>::new(
            &ScheduleConfig::default().with_steps(20).with_karras_sigmas(true),
        )
        .unwrap();
        let sigmas = scheduler.sigmas();
        assert!(sigmas.windows(2).all(|w| w[1] < w[0]));
        let ts = Scheduler::timesteps(&scheduler);
        assert!((ts[0] - 999.0).abs() < 1e-6);
        assert!(ts[19].abs() < 1e-6);
    }

    #[test]
    fn test_euler_scale_model_input() {
        let device = <TestBackend as Backend>::Device::default();
        let scheduler =
            EulerDiscreteScheduler::<TestBackend, 1>::new(&ScheduleConfig::default().with_steps(10))
                .unwrap();
        let sigma = scheduler.sigmas()[0];
        let t = Scheduler::timesteps(&scheduler)[0];
        let scaled = scheduler
            .scale_model_input(t, Tensor::<TestBackend, 1>::ones([2], &device))
            .unwrap();
        let expected = 1.0 / (sigma * sigma + 1.0).sqrt();
        for v in to_host(scaled).unwrap() {
            assert!((v as f64 - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_euler_ancestral_is_seeded() {
        let device = <TestBackend as Backend>::Device::default();
        let run = |seed| {
            let config = ScheduleConfig::default().with_steps(5);
            let mut scheduler = EulerAncestralDiscreteScheduler::<TestBackend, 1>::new(&config).unwrap();
            let mut noise = SeededNoise::new(seed);
            let mut sample = Tensor::<TestBackend, 1>::ones([6], &device);
            for t in Scheduler::timesteps(&scheduler).to_vec() {
                let output = Tensor::<TestBackend, 1>::full([6], 0.2, &device);
                sample = scheduler.step(output, t, sample, &mut noise).unwrap();
            }
            to_host(sample).unwrap()
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }
}
