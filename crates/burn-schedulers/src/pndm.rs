//! PNDM (Pseudo Numerical methods for Diffusion Models) scheduler, PLMS variant
//!
//! Linear multi-step over past model outputs. The first two calls bootstrap
//! the history (the second timestep appears twice in the sequence), after
//! which fixed Adams-Bashforth coefficients of order 2, 3 and 4 are used.
//!
//! Liu et al., 2022. https://arxiv.org/abs/2202.09778

use burn::prelude::*;
use std::collections::VecDeque;
use tracing::debug;

use crate::error::Result;
use crate::noise::NoiseSource;
use crate::sampler::Scheduler;
use crate::scheduler::{
    NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, TimestepSpacing,
    adams_bashforth_coefficients, strength_start,
};
use crate::tensor::{ensure_same_shape, weighted_sum};

/// Maximum number of past outputs kept for the multi-step formula
const MAX_HISTORY: usize = 4;

/// PNDM scheduler (PLMS steps only)
pub struct PndmScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    timesteps: Vec<f64>,
    step_ratio: usize,
    final_alpha_cumprod: f64,
    /// Number of steps taken so far
    counter: usize,
    /// Past raw model outputs, oldest first
    ets: VecDeque<Tensor<B, D>>,
    /// Sample cached by the first bootstrap step
    current_sample: Option<Tensor<B, D>>,
    cursor: StepCursor,
    denoised: Option<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> PndmScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let n = config.inference_step_count;

        let mut timesteps: Vec<f64> = config
            .spacing_or(TimestepSpacing::Leading)
            .timesteps(config.train_step_count, n, config.steps_offset)
            .into_iter()
            .map(f64::round)
            .collect();
        if timesteps.len() > 1 {
            timesteps.insert(1, timesteps[1]);
        }
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
            counter: 0,
            ets: VecDeque::with_capacity(MAX_HISTORY),
            current_sample: None,
            cursor: StepCursor::new(config.strict_sequencing),
            denoised: None,
        })
    }

    /// Formula (9) of the PNDM paper: move `sample` from `timestep` to `prev_timestep`
    fn previous_sample(
        &self,
        sample: Tensor<B, D>,
        timestep: f64,
        prev_timestep: f64,
        model_output: Tensor<B, D>,
    ) -> Result<Tensor<B, D>> {
        let alpha_prod_t = self.schedule.alpha_cumprod_at(timestep);
        let alpha_prod_t_prev = if prev_timestep >= 0.0 {
            self.schedule.alpha_cumprod_at(prev_timestep)
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let model_output = match self.prediction_type {
            PredictionType::Epsilon => model_output,
            PredictionType::VPrediction => weighted_sum(
                &[model_output, sample.clone()],
                &[alpha_prod_t.sqrt(), beta_prod_t.sqrt()],
            )?,
        };

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let model_output_denom = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();
        let model_coeff = -(alpha_prod_t_prev - alpha_prod_t) / model_output_denom;

        weighted_sum(&[sample, model_output], &[sample_coeff, model_coeff])
    }

    fn combined_output(&self, model_output: Tensor<B, D>) -> Result<Tensor<B, D>> {
        match (self.ets.len(), self.counter) {
            (1, 0) => Ok(model_output),
            (1, _) => weighted_sum(&[model_output, self.ets[0].clone()], &[0.5, 0.5]),
            (len, _) => {
                let coefficients = adams_bashforth_coefficients(len.min(MAX_HISTORY));
                let history: Vec<Tensor<B, D>> = self.ets.iter().rev().cloned().collect();
                weighted_sum(&history, coefficients)
            }
        }
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for PndmScheduler<B, D> {
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
        _noise: &mut N,
    ) -> Result<Tensor<B, D>> {
        ensure_same_shape(&sample, &model_output)?;
        let index = self.cursor.resolve(&self.timesteps, timestep)?;

        let last = (self.schedule.train_step_count() - 1) as f64;
        let mut t = self.timesteps[index];
        let mut prev_t = t - self.step_ratio as f64;

        if self.counter != 1 {
            if self.ets.len() >= MAX_HISTORY {
                self.ets.pop_front();
            }
            self.ets.push_back(model_output.clone());
        } else {
            prev_t = t;
            t = (t + self.step_ratio as f64).min(last);
        }

        let combined = self.combined_output(model_output)?;
        let sample = match (self.ets.len(), self.counter) {
            (1, 0) => {
                self.current_sample = Some(sample.clone());
                sample
            }
            (1, _) => self.current_sample.take().unwrap_or(sample),
            _ => sample,
        };

        debug!(
            step = index,
            timestep = t,
            prev_timestep = prev_t,
            history = self.ets.len(),
            "plms step"
        );

        let alpha_prod_t = self.schedule.alpha_cumprod_at(t);
        self.denoised = Some(self.prediction_type.predict_original(
            combined.clone(),
            sample.clone(),
            alpha_prod_t.sqrt(),
            (1.0 - alpha_prod_t).sqrt(),
        )?);

        let prev_sample = self.previous_sample(sample, t, prev_t, combined)?;
        self.counter += 1;
        self.cursor.advance(index);
        Ok(prev_sample)
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        self.denoised.as_ref()
    }

    fn reset(&mut self) {
        self.counter = 0;
        self.ets.clear();
        self.current_sample = None;
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
        PndmScheduler::<TestBackend, 1>::new(&config)
            .unwrap()
            .timesteps
    }

    #[test]
    fn test_pndm_duplicates_second_timestep() {
        assert_eq!(
            timesteps(ScheduleConfig::default().with_steps(2)),
            vec![500.0, 0.0, 0.0]
        );
        let ts = timesteps(
            ScheduleConfig::default()
                .with_steps(33)
                .with_spacing(TimestepSpacing::Linspace),
        );
        assert_eq!(ts.len(), 34);
        assert_eq!(&ts[..4], &[999.0, 968.0, 968.0, 937.0]);
    }

    #[test]
    fn test_pndm_strength_counts_duplicate() {
        let ts = timesteps(
            ScheduleConfig::default()
                .with_spacing(TimestepSpacing::Linspace)
                .with_strength(0.7),
        );
        assert_eq!(ts[0], 714.0);
    }

    #[test]
    fn test_pndm_history_is_bounded() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(10);
        let mut scheduler = PndmScheduler::<TestBackend, 1>::new(&config).unwrap();
        let mut noise = SeededNoise::new(0);

        let mut sample = Tensor::<TestBackend, 1>::ones([3], &device);
        for t in scheduler.timesteps.clone() {
            let output = Tensor::<TestBackend, 1>::full([3], 0.1, &device);
            sample = scheduler.step(output, t, sample, &mut noise).unwrap();
            assert!(scheduler.ets.len() <= MAX_HISTORY);
        }
        assert_eq!(scheduler.counter, 11);
        assert!(to_host(sample).unwrap().iter().all(|v| v.is_finite()));
    }
}
