//! DPM-Solver++ (Diffusion Probabilistic Model) schedulers
//!
//! Implements the multistep DPM-Solver++ in the data-prediction (x0) form,
//! working in log-SNR (lambda) space. Typically produces excellent results
//! in 15-25 steps.
//!
//! Lu et al., 2022. https://arxiv.org/abs/2211.01095

use burn::prelude::*;
use std::collections::VecDeque;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::noise::NoiseSource;
use crate::sampler::{Scheduler, noise_to_level};
use crate::scheduler::{
    NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, TimestepSpacing, strength_start,
    timestep_index,
};
use crate::tensor::{ensure_same_shape, weighted_sum};

/// Runs shorter than this drop to first order near the end
const LOWER_ORDER_FINAL_STEPS: usize = 15;

/// DPM-Solver++ options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DpmSolverOptions {
    /// Solver order (1 = first-order, 2 = second-order, 3 = singlestep only)
    pub solver_order: usize,
    /// Use lower-order updates on the final steps of short runs
    pub lower_order_final: bool,
}

impl Default for DpmSolverOptions {
    fn default() -> Self {
        Self {
            solver_order: 2,
            lower_order_final: true,
        }
    }
}

impl DpmSolverOptions {
    pub(crate) fn validate(&self, max_order: usize) -> Result<()> {
        if self.solver_order == 0 || self.solver_order > max_order {
            return Err(SchedulerError::InvalidConfig(format!(
                "solver_order must be between 1 and {max_order}, got {}",
                self.solver_order
            )));
        }
        Ok(())
    }
}

/// Timesteps with per-step signal/noise coefficients
///
/// The coefficient arrays carry one extra trailing entry: the boundary the
/// final step moves to.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverSteps {
    pub timesteps: Vec<f64>,
    pub alpha_t: Vec<f64>,
    pub sigma_t: Vec<f64>,
    pub lambda_t: Vec<f64>,
}

impl SolverSteps {
    pub fn new(schedule: &NoiseSchedule, config: &ScheduleConfig) -> Self {
        let n = config.inference_step_count;

        let (timesteps, mut alpha_t, mut sigma_t) = if config.use_karras_sigmas {
            let (sigmas, timesteps) = schedule.karras_table(n);
            let alpha_t: Vec<f64> = sigmas.iter().map(|s| 1.0 / (s * s + 1.0).sqrt()).collect();
            let sigma_t: Vec<f64> = sigmas.iter().zip(&alpha_t).map(|(s, a)| s * a).collect();
            let timesteps = timesteps.into_iter().map(f64::round).collect();
            (timesteps, alpha_t, sigma_t)
        } else {
            let timesteps: Vec<f64> = config
                .spacing_or(TimestepSpacing::Linspace)
                .solver_timesteps(config.train_step_count, n, config.steps_offset);
            let index = |t: f64| (t as usize).min(schedule.train_step_count() - 1);
            let alpha_t = timesteps.iter().map(|&t| schedule.alpha_t[index(t)]).collect();
            let sigma_t = timesteps.iter().map(|&t| schedule.sigma_t[index(t)]).collect();
            (timesteps, alpha_t, sigma_t)
        };

        // Boundary the final step lands on
        if config.use_karras_sigmas {
            alpha_t.push(alpha_t[alpha_t.len() - 1]);
            sigma_t.push(sigma_t[sigma_t.len() - 1]);
        } else {
            alpha_t.push(schedule.alpha_t[0]);
            sigma_t.push(schedule.sigma_t[0]);
        }
        let lambda_t = alpha_t
            .iter()
            .zip(&sigma_t)
            .map(|(a, s)| a.ln() - s.ln())
            .collect();

        let mut steps = Self {
            timesteps,
            alpha_t,
            sigma_t,
            lambda_t,
        };
        let start = strength_start(n, config.strength, steps.timesteps.len());
        steps.timesteps.drain(..start);
        steps.alpha_t.drain(..start);
        steps.sigma_t.drain(..start);
        steps.lambda_t.drain(..start);
        steps
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// First-order (DDIM-equivalent) update from step `s` to step `t`
    pub(crate) fn first_order_update<B: Backend, const D: usize>(
        &self,
        model_output: Tensor<B, D>,
        sample: Tensor<B, D>,
        s: usize,
        t: usize,
    ) -> Result<Tensor<B, D>> {
        let h = self.lambda_t[t] - self.lambda_t[s];
        weighted_sum(
            &[sample, model_output],
            &[
                self.sigma_t[t] / self.sigma_t[s],
                -self.alpha_t[t] * (-h).exp_m1(),
            ],
        )
    }

    pub(crate) fn add_noise<B: Backend, const D: usize>(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        let index = timestep
            .map(|t| timestep_index(&self.timesteps, t))
            .unwrap_or(0);
        noise_to_level(&original, noise, self.alpha_t[index], self.sigma_t[index])
    }
}

/// DPM-Solver++ multistep scheduler (orders 1 and 2)
pub struct DpmSolverMultistepScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    steps: SolverSteps,
    solver_order: usize,
    lower_order_final: bool,
    /// Converted (x0) outputs of previous steps, oldest first
    model_outputs: VecDeque<Tensor<B, D>>,
    /// Steps completed, capped at the solver order
    lower_order_nums: usize,
    cursor: StepCursor,
}

impl<B: Backend, const D: usize> DpmSolverMultistepScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        Self::with_options(config, DpmSolverOptions::default())
    }

    pub fn with_options(config: &ScheduleConfig, options: DpmSolverOptions) -> Result<Self> {
        options.validate(2)?;
        let schedule = NoiseSchedule::new(config)?;
        let steps = SolverSteps::new(&schedule, config);

        Ok(Self {
            schedule,
            prediction_type: config.prediction_type,
            steps,
            solver_order: options.solver_order,
            lower_order_final: options.lower_order_final,
            model_outputs: VecDeque::with_capacity(options.solver_order),
            lower_order_nums: 0,
            cursor: StepCursor::new(config.strict_sequencing),
        })
    }

    pub fn solver_steps(&self) -> &SolverSteps {
        &self.steps
    }

    /// Midpoint second-order update using the two most recent outputs
    fn second_order_update(&self, sample: Tensor<B, D>, index: usize) -> Result<Tensor<B, D>> {
        let steps = &self.steps;
        let (t, s0, s1) = (index + 1, index, index - 1);
        let len = self.model_outputs.len();
        let m0 = self.model_outputs[len - 1].clone();
        let m1 = self.model_outputs[len - 2].clone();

        let h = steps.lambda_t[t] - steps.lambda_t[s0];
        let h0 = steps.lambda_t[s0] - steps.lambda_t[s1];
        let r0 = h0 / h;
        let alpha_em1 = steps.alpha_t[t] * (-h).exp_m1();

        // x = (sigma_t / sigma_s0) x - alpha_t (e^-h - 1) D0 - 0.5 alpha_t (e^-h - 1) D1
        // with D0 = m0, D1 = (m0 - m1) / r0
        weighted_sum(
            &[sample, m0, m1],
            &[
                steps.sigma_t[t] / steps.sigma_t[s0],
                -alpha_em1 - 0.5 * alpha_em1 / r0,
                0.5 * alpha_em1 / r0,
            ],
        )
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for DpmSolverMultistepScheduler<B, D> {
    fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn timesteps(&self) -> &[f64] {
        &self.steps.timesteps
    }

    fn step<N: NoiseSource<B>>(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
        _noise: &mut N,
    ) -> Result<Tensor<B, D>> {
        ensure_same_shape(&sample, &model_output)?;
        let index = self.cursor.resolve(&self.steps.timesteps, timestep)?;
        let len = self.steps.len();

        let short_run = self.lower_order_final && len < LOWER_ORDER_FINAL_STEPS;
        let lower_order_final = short_run && index + 1 == len;
        let lower_order_second = short_run && index + 2 == len;
        let order = if self.solver_order == 1
            || self.lower_order_nums < 1
            || index == 0
            || lower_order_final
            || lower_order_second
        {
            1
        } else {
            2
        };

        let converted = self.prediction_type.predict_original(
            model_output,
            sample.clone(),
            self.steps.alpha_t[index],
            self.steps.sigma_t[index],
        )?;
        if self.model_outputs.len() == self.solver_order {
            self.model_outputs.pop_front();
        }
        self.model_outputs.push_back(converted.clone());

        debug!(
            step = index,
            timestep = self.steps.timesteps[index],
            order,
            lambda = self.steps.lambda_t[index],
            "dpm++ multistep step"
        );

        let prev_sample = if order == 1 {
            self.steps
                .first_order_update(converted, sample, index, index + 1)?
        } else {
            self.second_order_update(sample, index)?
        };

        self.lower_order_nums = (self.lower_order_nums + 1).min(self.solver_order);
        self.cursor.advance(index);
        Ok(prev_sample)
    }

    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        self.steps.add_noise(original, noise, timestep)
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        self.model_outputs.back()
    }

    fn reset(&mut self) {
        self.model_outputs.clear();
        self.lower_order_nums = 0;
        self.cursor.reset();
    }
}
