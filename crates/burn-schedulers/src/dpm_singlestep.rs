//! DPM-Solver++ singlestep scheduler
//!
//! Each higher-order update restarts from the sample cached at the last
//! first-order step (the anchor) and combines the model outputs gathered since.
//! A precomputed order list decides the order of every step.

use burn::prelude::*;
use std::collections::VecDeque;
use tracing::debug;

use crate::dpm::{DpmSolverOptions, SolverSteps};
use crate::error::Result;
use crate::noise::NoiseSource;
use crate::sampler::Scheduler;
use crate::scheduler::{NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, strength_start};
use crate::tensor::{ensure_same_shape, weighted_sum};

/// Per-step solver orders for a run of `steps` steps
///
/// With `lower_order_final` the run always ends on a first- or second-order
/// step.
pub fn order_list(steps: usize, solver_order: usize, lower_order_final: bool) -> Vec<usize> {
    let cycle = |order: usize, repeats: usize| -> Vec<usize> {
        (0..repeats).flat_map(|_| 1..=order).collect()
    };

    if !lower_order_final {
        return (1..=solver_order.max(1)).cycle().take(steps).collect();
    }

    match solver_order {
        3 => {
            let mut orders = match steps % 3 {
                0 => {
                    let mut orders = cycle(3, (steps / 3).saturating_sub(1));
                    orders.extend([1, 2]);
                    orders
                }
                _ => cycle(3, steps / 3),
            };
            match steps % 3 {
                0 | 1 => orders.push(1),
                _ => orders.extend([1, 2]),
            }
            orders
        }
        2 => {
            let mut orders = cycle(2, steps / 2);
            if steps % 2 == 1 {
                orders.push(1);
            }
            orders
        }
        _ => vec![1; steps],
    }
}

/// DPM-Solver++ singlestep scheduler (orders 1 to 3)
pub struct DpmSolverSinglestepScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    steps: SolverSteps,
    solver_order: usize,
    orders: Vec<usize>,
    /// Position of the first retained step in `orders`
    order_offset: usize,
    /// Converted (x0) outputs, oldest first
    model_outputs: VecDeque<Tensor<B, D>>,
    /// Sample cached by the last first-order step
    anchor: Option<Tensor<B, D>>,
    cursor: StepCursor,
}

impl<B: Backend, const D: usize> DpmSolverSinglestepScheduler<B, D> {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        Self::with_options(config, DpmSolverOptions::default())
    }

    pub fn with_options(config: &ScheduleConfig, options: DpmSolverOptions) -> Result<Self> {
        options.validate(3)?;
        let schedule = NoiseSchedule::new(config)?;
        let steps = SolverSteps::new(&schedule, config);

        let n = config.inference_step_count;
        let orders = order_list(n, options.solver_order, options.lower_order_final);
        // Same truncation SolverSteps applied, so the tail of the list keeps its orders
        let order_offset = strength_start(n, config.strength, n);

        Ok(Self {
            schedule,
            prediction_type: config.prediction_type,
            steps,
            solver_order: options.solver_order,
            orders,
            order_offset,
            model_outputs: VecDeque::with_capacity(options.solver_order),
            anchor: None,
            cursor: StepCursor::new(config.strict_sequencing),
        })
    }

    pub fn solver_steps(&self) -> &SolverSteps {
        &self.steps
    }

    /// The order list for the untruncated run
    pub fn orders(&self) -> &[usize] {
        &self.orders
    }

    fn output(&self, back: usize) -> Tensor<B, D> {
        self.model_outputs[self.model_outputs.len() - 1 - back].clone()
    }

    fn second_order_update(&self, anchor: Tensor<B, D>, index: usize) -> Result<Tensor<B, D>> {
        let steps = &self.steps;
        let (t, s0, s1) = (index + 1, index, index - 1);
        let (m0, m1) = (self.output(0), self.output(1));

        let h = steps.lambda_t[t] - steps.lambda_t[s1];
        let h0 = steps.lambda_t[s0] - steps.lambda_t[s1];
        let r0 = h0 / h;
        let alpha_em1 = steps.alpha_t[t] * (-h).exp_m1();

        // D0 = m1, D1 = (m0 - m1) / r0
        weighted_sum(
            &[anchor, m1, m0],
            &[
                steps.sigma_t[t] / steps.sigma_t[s1],
                -alpha_em1 + 0.5 * alpha_em1 / r0,
                -0.5 * alpha_em1 / r0,
            ],
        )
    }

    fn third_order_update(&self, anchor: Tensor<B, D>, index: usize) -> Result<Tensor<B, D>> {
        let steps = &self.steps;
        let (t, s0, s2) = (index + 1, index, index - 2);
        let (m0, m2) = (self.output(0), self.output(2));

        let h = steps.lambda_t[t] - steps.lambda_t[s2];
        let h0 = steps.lambda_t[s0] - steps.lambda_t[s2];
        let r0 = h0 / h;
        let em1 = (-h).exp_m1();
        let alpha_em1 = steps.alpha_t[t] * em1;
        let d1_weight = steps.alpha_t[t] * (em1 / h + 1.0) / r0;

        // D0 = m2, D1_1 = (m0 - m2) / r0
        weighted_sum(
            &[anchor, m2, m0],
            &[
                steps.sigma_t[t] / steps.sigma_t[s2],
                -alpha_em1 - d1_weight,
                d1_weight,
            ],
        )
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for DpmSolverSinglestepScheduler<B, D> {
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

        // Image-to-image runs may start mid-cycle: clamp to the available history
        let order = self
            .orders
            .get(self.order_offset + index)
            .copied()
            .unwrap_or(1)
            .min(self.model_outputs.len())
            .min(index + 1)
            .max(1);
        if order == 1 {
            self.anchor = Some(sample.clone());
        }
        let anchor = self.anchor.clone().unwrap_or(sample);

        debug!(
            step = index,
            timestep = self.steps.timesteps[index],
            order,
            "dpm++ singlestep step"
        );

        let prev_sample = match order {
            1 => self
                .steps
                .first_order_update(converted, anchor, index, index + 1)?,
            2 => self.second_order_update(anchor, index)?,
            _ => self.third_order_update(anchor, index)?,
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
        self.steps.add_noise(original, noise, timestep)
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        self.model_outputs.back()
    }

    fn reset(&mut self) {
        self.model_outputs.clear();
        self.anchor = None;
        self.cursor.reset();
    }
}
