//! Noise schedules for diffusion models
//!
//! Shared schedule machinery: the user-facing [`ScheduleConfig`], the derived
//! [`NoiseSchedule`] tables, timestep spacing, the Karras sigma conversion,
//! strength truncation and the [`StepCursor`] every scheduler uses to track
//! its position in the timestep sequence.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::tensor::weighted_sum;

// ============================================================================
// Prediction Type (epsilon vs v-prediction)
// ============================================================================

/// Model prediction type
///
/// Different diffusion models are trained to predict different quantities:
/// - Epsilon (noise): SD 1.x, SDXL
/// - V-prediction (velocity): SD 2.x
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Model predicts the noise (epsilon) added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sigma_t * x0
    VPrediction,
}

impl PredictionType {
    /// Recover the clean sample in the `x = alpha_t * x0 + sigma_t * eps` form
    ///
    /// - epsilon: x0 = (x - sigma_t * eps) / alpha_t
    /// - v:       x0 = alpha_t * x - sigma_t * v
    pub fn predict_original<B: Backend, const D: usize>(
        self,
        model_output: Tensor<B, D>,
        sample: Tensor<B, D>,
        alpha_t: f64,
        sigma_t: f64,
    ) -> Result<Tensor<B, D>> {
        match self {
            PredictionType::Epsilon => {
                weighted_sum(&[sample, model_output], &[1.0 / alpha_t, -sigma_t / alpha_t])
            }
            PredictionType::VPrediction => {
                weighted_sum(&[sample, model_output], &[alpha_t, -sigma_t])
            }
        }
    }

    /// Recover the noise in the `x = alpha_t * x0 + sigma_t * eps` form
    ///
    /// For v-prediction: eps = alpha_t * v + sigma_t * x
    pub fn predict_epsilon<B: Backend, const D: usize>(
        self,
        model_output: Tensor<B, D>,
        sample: Tensor<B, D>,
        alpha_t: f64,
        sigma_t: f64,
    ) -> Result<Tensor<B, D>> {
        match self {
            PredictionType::Epsilon => Ok(model_output),
            PredictionType::VPrediction => {
                weighted_sum(&[model_output, sample], &[alpha_t, sigma_t])
            }
        }
    }

    /// Recover the clean sample in the `x = x0 + sigma * eps` (k-diffusion) form
    ///
    /// - epsilon: x0 = x - sigma * eps
    /// - v:       x0 = v * (-sigma / sqrt(sigma^2 + 1)) + x / (sigma^2 + 1)
    pub fn predict_original_from_sigma<B: Backend, const D: usize>(
        self,
        model_output: Tensor<B, D>,
        sample: Tensor<B, D>,
        sigma: f64,
    ) -> Result<Tensor<B, D>> {
        match self {
            PredictionType::Epsilon => weighted_sum(&[sample, model_output], &[1.0, -sigma]),
            PredictionType::VPrediction => {
                let s2 = sigma * sigma + 1.0;
                weighted_sum(&[model_output, sample], &[-sigma / s2.sqrt(), 1.0 / s2])
            }
        }
    }
}

// ============================================================================
// Schedule Configuration
// ============================================================================

/// Shape of the beta (per-step noise variance) ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear ramp from `beta_start` to `beta_end`
    Linear,
    /// Linear ramp in sqrt space, squared (Stable Diffusion)
    #[default]
    ScaledLinear,
}

/// How inference timesteps are spread over the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    /// Evenly spaced from `train - 1` down to 0
    Linspace,
    /// Integer multiples of `train / n`, starting at 0
    Leading,
    /// Integer multiples of `train / n`, ending at `train - 1`
    Trailing,
}

impl TimestepSpacing {
    /// Descending timesteps for the DDIM/PNDM/Euler family
    ///
    /// `Linspace` values are left fractional; discrete schedulers round them.
    pub fn timesteps(self, train_steps: usize, steps: usize, steps_offset: usize) -> Vec<f64> {
        match self {
            TimestepSpacing::Linspace => {
                let mut t = linspace(0.0, (train_steps - 1) as f64, steps, true);
                t.reverse();
                t
            }
            TimestepSpacing::Leading => {
                let ratio = train_steps / steps;
                (0..steps)
                    .rev()
                    .map(|i| (i * ratio + steps_offset) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => trailing(train_steps, steps),
        }
    }

    /// Descending timesteps for the DPM-Solver++ family
    ///
    /// Spaces `n + 1` points and drops the final boundary so the last step
    /// lands on timestep 0 through the per-step coefficient arrays.
    pub fn solver_timesteps(
        self,
        train_steps: usize,
        steps: usize,
        steps_offset: usize,
    ) -> Vec<f64> {
        match self {
            TimestepSpacing::Linspace => {
                linspace(0.0, (train_steps - 1) as f64, steps + 1, true)
                    .into_iter()
                    .skip(1)
                    .rev()
                    .map(f64::round)
                    .collect()
            }
            TimestepSpacing::Leading => {
                let ratio = train_steps / (steps + 1);
                (1..=steps)
                    .rev()
                    .map(|i| (i * ratio + steps_offset) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => trailing(train_steps, steps),
        }
    }
}

fn trailing(train_steps: usize, steps: usize) -> Vec<f64> {
    let ratio = train_steps as f64 / steps as f64;
    (0..steps)
        .map(|i| (train_steps as f64 - i as f64 * ratio).round() - 1.0)
        .collect()
}

/// Noise schedule configuration
///
/// Immutable once a scheduler is built from it. Unset optional fields fall
/// back to per-scheduler defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Number of training timesteps
    pub train_step_count: usize,
    /// Number of inference steps
    pub inference_step_count: usize,
    pub beta_schedule: BetaSchedule,
    pub beta_start: f64,
    pub beta_end: f64,
    pub prediction_type: PredictionType,
    /// Spacing policy, `None` selects the scheduler's default
    pub timestep_spacing: Option<TimestepSpacing>,
    /// Re-parametrize sigmas with the Karras et al. rho=7 schedule
    pub use_karras_sigmas: bool,
    /// Partial denoising strength in (0, 1] (image-to-image)
    pub strength: Option<f64>,
    /// Use alpha=1 past the final step instead of `alphas_cumprod[0]`
    pub set_alpha_to_one: Option<bool>,
    /// Added to `leading` timesteps
    pub steps_offset: usize,
    /// Return an error on out-of-sequence `step` calls instead of warning
    pub strict_sequencing: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            train_step_count: 1000,
            inference_step_count: 50,
            beta_schedule: BetaSchedule::ScaledLinear,
            beta_start: 0.00085,
            beta_end: 0.012,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: None,
            use_karras_sigmas: false,
            strength: None,
            set_alpha_to_one: None,
            steps_offset: 0,
            strict_sequencing: false,
        }
    }
}

impl ScheduleConfig {
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.inference_step_count = steps;
        self
    }

    pub fn with_train_steps(mut self, steps: usize) -> Self {
        self.train_step_count = steps;
        self
    }

    pub fn with_beta_schedule(mut self, schedule: BetaSchedule, start: f64, end: f64) -> Self {
        self.beta_schedule = schedule;
        self.beta_start = start;
        self.beta_end = end;
        self
    }

    pub fn with_prediction_type(mut self, prediction_type: PredictionType) -> Self {
        self.prediction_type = prediction_type;
        self
    }

    pub fn with_spacing(mut self, spacing: TimestepSpacing) -> Self {
        self.timestep_spacing = Some(spacing);
        self
    }

    pub fn with_karras_sigmas(mut self, enabled: bool) -> Self {
        self.use_karras_sigmas = enabled;
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn with_alpha_to_one(mut self, enabled: bool) -> Self {
        self.set_alpha_to_one = Some(enabled);
        self
    }

    pub fn with_steps_offset(mut self, offset: usize) -> Self {
        self.steps_offset = offset;
        self
    }

    pub fn with_strict_sequencing(mut self, strict: bool) -> Self {
        self.strict_sequencing = strict;
        self
    }

    /// Spacing policy, or `default` when unset
    pub fn spacing_or(&self, default: TimestepSpacing) -> TimestepSpacing {
        self.timestep_spacing.unwrap_or(default)
    }

    /// Reject configurations no scheduler can run
    pub fn validate(&self) -> Result<()> {
        if self.inference_step_count == 0 {
            return Err(SchedulerError::InvalidConfig(
                "inference_step_count must be at least 1".into(),
            ));
        }
        if self.train_step_count < self.inference_step_count {
            return Err(SchedulerError::InvalidConfig(format!(
                "train_step_count ({}) must not be smaller than inference_step_count ({})",
                self.train_step_count, self.inference_step_count
            )));
        }
        if self.beta_end <= self.beta_start {
            return Err(SchedulerError::InvalidConfig(format!(
                "beta_end ({}) must be greater than beta_start ({})",
                self.beta_end, self.beta_start
            )));
        }
        if self.beta_start < 0.0 || self.beta_end >= 1.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "betas must lie in [0, 1), got [{}, {}]",
                self.beta_start, self.beta_end
            )));
        }
        if let Some(strength) = self.strength {
            if strength.is_nan() || strength <= 0.0 || strength > 1.0 {
                return Err(SchedulerError::InvalidConfig(format!(
                    "strength must lie in (0, 1], got {strength}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Derived schedule
// ============================================================================

/// Precomputed noise schedule values
///
/// All tables are indexed by training timestep and hold `f64` values.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas: Vec<f64>,
    /// Cumulative product of alphas: ᾱₜ, strictly decreasing in (0, 1]
    pub alphas_cumprod: Vec<f64>,
    /// sqrt(ᾱₜ)
    pub alpha_t: Vec<f64>,
    /// sqrt(1 - ᾱₜ)
    pub sigma_t: Vec<f64>,
    /// Log signal-to-noise ratio: ln(alpha_t) - ln(sigma_t)
    pub lambda_t: Vec<f64>,
    /// k-diffusion sigmas: sqrt((1 - ᾱₜ) / ᾱₜ), ascending
    pub sigmas: Vec<f64>,
    pub log_sigmas: Vec<f64>,
}

impl NoiseSchedule {
    /// Build the tables for a validated config
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        config.validate()?;

        let n = config.train_step_count;
        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n, true),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n, true)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
        };
        Ok(Self::from_betas(betas))
    }

    /// Build the tables from an explicit beta ramp
    pub fn from_betas(betas: Vec<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        // Cumulative product
        let mut alphas_cumprod = Vec::with_capacity(alphas.len());
        let mut cumprod = 1.0f64;
        for alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod);
        }

        let alpha_t: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sigma_t: Vec<f64> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let lambda_t = alpha_t
            .iter()
            .zip(&sigma_t)
            .map(|(a, s)| a.ln() - s.ln())
            .collect();
        let sigmas: Vec<f64> = alphas_cumprod
            .iter()
            .map(|a| ((1.0 - a) / a).sqrt())
            .collect();
        let log_sigmas = sigmas.iter().map(|s| s.ln()).collect();

        Self {
            betas,
            alphas,
            alphas_cumprod,
            alpha_t,
            sigma_t,
            lambda_t,
            sigmas,
            log_sigmas,
        }
    }

    pub fn train_step_count(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// ᾱ at a discrete timestep (clamped to the table)
    pub fn alpha_cumprod_at(&self, timestep: f64) -> f64 {
        self.alphas_cumprod[self.table_index(timestep)]
    }

    fn table_index(&self, timestep: f64) -> usize {
        (timestep.max(0.0) as usize).min(self.train_step_count() - 1)
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigmas[0]
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigmas[self.train_step_count() - 1]
    }

    /// Linear interpolation of the sigma table at a fractional timestep
    pub fn interp_sigma(&self, timestep: f64) -> f64 {
        let last = self.train_step_count() - 1;
        let t = timestep.clamp(0.0, last as f64);
        let low = (t.floor() as usize).min(last);
        let high = (low + 1).min(last);
        let frac = t - low as f64;
        self.sigmas[low] * (1.0 - frac) + self.sigmas[high] * frac
    }

    /// Map a sigma back to a fractional timestep by log-sigma interpolation
    ///
    /// Zero maps to 0 and anything above the table maps to `train - 1`.
    pub fn sigma_to_t(&self, sigma: f64) -> f64 {
        let log_sigma = sigma.ln();
        let len = self.log_sigmas.len();
        if len < 2 {
            return 0.0;
        }

        let count = self
            .log_sigmas
            .iter()
            .filter(|&&ls| log_sigma - ls >= 0.0)
            .count();
        let low_idx = count.saturating_sub(1).min(len - 2);
        let high_idx = low_idx + 1;

        let low = self.log_sigmas[low_idx];
        let high = self.log_sigmas[high_idx];
        let w = (low - log_sigma) / (low - high);
        let w = if w.is_nan() { 0.0 } else { w.clamp(0.0, 1.0) };

        (1.0 - w) * low_idx as f64 + w * high_idx as f64
    }

    /// Inverse of [`sigma_to_t`](Self::sigma_to_t): log-sigma interpolation
    pub fn t_to_sigma(&self, timestep: f64) -> f64 {
        let last = self.train_step_count() - 1;
        let t = timestep.clamp(0.0, last as f64);
        let low = (t.floor() as usize).min(last.saturating_sub(1));
        let high = (low + 1).min(last);
        let w = t - low as f64;
        ((1.0 - w) * self.log_sigmas[low] + w * self.log_sigmas[high]).exp()
    }

    /// Full-table Karras sigmas, descending, and their (fractional) timesteps
    pub fn karras_table(&self, steps: usize) -> (Vec<f64>, Vec<f64>) {
        let sigmas = karras_sigmas(self.sigma_min(), self.sigma_max(), steps);
        let timesteps = sigmas.iter().map(|&s| self.sigma_to_t(s)).collect();
        (sigmas, timesteps)
    }
}

// ============================================================================
// Sigma Utilities (shared across samplers)
// ============================================================================

/// `count` evenly spaced values from `start` to `end`
///
/// With `endpoint` the last value is exactly `end`; without, the interval is
/// half-open. `count <= 1` yields `[start]`.
pub fn linspace(start: f64, end: f64, count: usize, endpoint: bool) -> Vec<f64> {
    if count <= 1 {
        return vec![start];
    }
    let divisor = if endpoint { count - 1 } else { count };
    let step = (end - start) / divisor as f64;
    let mut values: Vec<f64> = (0..count).map(|i| start + i as f64 * step).collect();
    if endpoint {
        values[count - 1] = end;
    }
    values
}

/// Karras et al. (2022) noise levels, descending from `sigma_max` to `sigma_min`
///
/// Uses rho=7.0 as recommended in the paper.
pub fn karras_sigmas(sigma_min: f64, sigma_max: f64, steps: usize) -> Vec<f64> {
    const RHO: f64 = 7.0;
    let min_inv_rho = sigma_min.powf(1.0 / RHO);
    let max_inv_rho = sigma_max.powf(1.0 / RHO);
    linspace(0.0, 1.0, steps, true)
        .into_iter()
        .map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(RHO))
        .collect()
}

/// Number of leading timesteps to skip for a partial-denoising strength
///
/// `init = min(round(steps * strength), steps)`, then
/// `start = clamp(steps - init, 0, len - 1)`.
pub fn strength_start(steps: usize, strength: Option<f64>, len: usize) -> usize {
    match strength {
        None => 0,
        Some(strength) => {
            let init = ((steps as f64 * strength).round().max(0.0) as usize).min(steps);
            (steps - init).min(len.saturating_sub(1))
        }
    }
}

/// Compute ancestral sampling step parameters
///
/// For stochastic samplers, computes:
/// - sigma_down: the deterministic step target
/// - sigma_up: the noise injection level
///
/// The eta parameter controls stochasticity (0 = ODE, 1 = full ancestral)
pub fn get_ancestral_step(sigma: f64, sigma_next: f64, eta: f64) -> (f64, f64) {
    if sigma_next == 0.0 {
        return (0.0, 0.0);
    }

    let sigma_up = ((sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
        .max(0.0)
        .sqrt()
        * eta)
        .min(sigma_next);
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();

    (sigma_down, sigma_up)
}

/// Adams-Bashforth coefficients for linear multi-step methods
///
/// Newest term first.
pub fn adams_bashforth_coefficients(order: usize) -> &'static [f64] {
    match order {
        2 => &[1.5, -0.5],
        3 => &[23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
        4 => &[55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
        _ => &[1.0],
    }
}

// ============================================================================
// Step sequencing
// ============================================================================

/// Index of `timestep` in the sequence, or the last index if absent
pub fn timestep_index(timesteps: &[f64], timestep: f64) -> usize {
    match timesteps.iter().position(|&t| t == timestep) {
        Some(index) => index,
        None => {
            let index = timesteps.len().saturating_sub(1);
            warn!(timestep, index, "timestep not in schedule, using last index");
            index
        }
    }
}

/// Tracks the position of the next expected `step` call
///
/// The sequence may contain duplicates (PNDM), so position rather than value
/// identifies a step.
#[derive(Debug, Clone, Default)]
pub struct StepCursor {
    next: usize,
    strict: bool,
}

impl StepCursor {
    pub fn new(strict: bool) -> Self {
        Self { next: 0, strict }
    }

    /// Index of the next expected step
    pub fn position(&self) -> usize {
        self.next
    }

    /// Resolve the sequence index for a call at `timestep`
    pub fn resolve(&self, timesteps: &[f64], timestep: f64) -> Result<usize> {
        let expected = timesteps.get(self.next).copied();
        if expected == Some(timestep) {
            return Ok(self.next);
        }
        if self.strict {
            return Err(SchedulerError::OutOfSequence { timestep, expected });
        }
        warn!(timestep, ?expected, "step called out of sequence");
        Ok(timestep_index(timesteps, timestep))
    }

    pub fn advance(&mut self, index: usize) {
        self.next = index + 1;
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> NoiseSchedule {
        NoiseSchedule::new(&ScheduleConfig::default()).unwrap()
    }

    #[test]
    fn test_alphas_cumprod_strictly_decreasing() {
        for beta_schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear] {
            let config = ScheduleConfig::default().with_beta_schedule(beta_schedule, 0.00085, 0.012);
            let schedule = NoiseSchedule::new(&config).unwrap();
            let acp = &schedule.alphas_cumprod;
            assert_eq!(acp.len(), 1000);
            assert!(acp[0] <= 1.0 && acp[999] > 0.0);
            assert!(acp.windows(2).all(|w| w[1] < w[0]));
        }
    }

    #[test]
    fn test_scaled_linear_betas() {
        let schedule = schedule();
        assert!((schedule.betas[0] - 0.00085).abs() < 1e-12);
        assert!((schedule.betas[999] - 0.012).abs() < 1e-12);
        // Midpoint of the sqrt ramp, squared
        let mid = (0.00085f64.sqrt() + (0.012f64.sqrt() - 0.00085f64.sqrt()) * 500.0 / 999.0).powi(2);
        assert!((schedule.betas[500] - mid).abs() < 1e-12);
    }

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(0.0, 1.0, 5, true), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(0.0, 1.0, 4, false), vec![0.0, 0.25, 0.5, 0.75]);
        assert_eq!(linspace(3.0, 9.0, 1, true), vec![3.0]);
        assert_eq!(linspace(3.0, 9.0, 0, true), vec![3.0]);
    }

    #[test]
    fn test_spacing_lengths_and_order() {
        for spacing in [
            TimestepSpacing::Linspace,
            TimestepSpacing::Leading,
            TimestepSpacing::Trailing,
        ] {
            for steps in [1, 2, 7, 33, 50, 1000] {
                for ts in [
                    spacing.timesteps(1000, steps, 0),
                    spacing.solver_timesteps(1000, steps, 0),
                ] {
                    assert_eq!(ts.len(), steps, "{spacing:?} {steps}");
                    assert!(ts.windows(2).all(|w| w[1] <= w[0]));
                    assert!(ts.iter().all(|&t| (0.0..=999.0).contains(&t)));
                }
            }
        }
    }

    #[test]
    fn test_trailing_spacing() {
        let ts = TimestepSpacing::Trailing.timesteps(1000, 33, 0);
        assert_eq!(&ts[..3], &[999.0, 969.0, 938.0]);
        assert_eq!(ts[32], 29.0);
    }

    #[test]
    fn test_solver_leading_spacing() {
        let ts = TimestepSpacing::Leading.solver_timesteps(1000, 50, 0);
        assert_eq!(ts[0], 950.0);
        assert_eq!(ts[49], 19.0);
    }

    #[test]
    fn test_sigma_to_t_round_trip() {
        let schedule = schedule();
        for sigma in karras_sigmas(schedule.sigma_min(), schedule.sigma_max(), 25) {
            let t = schedule.sigma_to_t(sigma);
            let back = schedule.t_to_sigma(t);
            assert!((back - sigma).abs() / sigma < 1e-9, "{sigma} -> {t} -> {back}");
        }
    }

    #[test]
    fn test_sigma_to_t_edges() {
        let schedule = schedule();
        assert_eq!(schedule.sigma_to_t(0.0), 0.0);
        assert!((schedule.sigma_to_t(schedule.sigma_max()) - 999.0).abs() < 1e-9);
        assert!((schedule.sigma_to_t(1e6) - 999.0).abs() < 1e-9);
    }

    #[test]
    fn test_karras_sigmas_bounds() {
        let sigmas = karras_sigmas(0.0292, 14.6146, 20);
        assert_eq!(sigmas.len(), 20);
        assert!((sigmas[0] - 14.6146).abs() < 1e-9);
        assert!((sigmas[19] - 0.0292).abs() < 1e-9);
        assert!(sigmas.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_strength_start() {
        assert_eq!(strength_start(50, None, 50), 0);
        assert_eq!(strength_start(50, Some(0.7), 50), 15);
        assert_eq!(strength_start(50, Some(1.0), 50), 0);
        assert_eq!(strength_start(1, Some(0.1), 1), 0);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(ScheduleConfig::default().with_steps(0).validate().is_err());
        assert!(ScheduleConfig::default().with_steps(2000).validate().is_err());
        assert!(
            ScheduleConfig::default()
                .with_beta_schedule(BetaSchedule::Linear, 0.02, 0.001)
                .validate()
                .is_err()
        );
        assert!(ScheduleConfig::default().with_strength(0.0).validate().is_err());
        assert!(ScheduleConfig::default().with_strength(1.5).validate().is_err());
        assert!(ScheduleConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config: ScheduleConfig = serde_json::from_str(
            r#"{"inference_step_count": 20, "prediction_type": "v_prediction", "timestep_spacing": "trailing"}"#,
        )
        .unwrap();
        assert_eq!(config.inference_step_count, 20);
        assert_eq!(config.prediction_type, PredictionType::VPrediction);
        assert_eq!(config.timestep_spacing, Some(TimestepSpacing::Trailing));
        assert_eq!(config.train_step_count, 1000);
    }

    #[test]
    fn test_cursor_fallback_and_strict() {
        let timesteps = [980.0, 960.0, 960.0, 940.0];
        let mut cursor = StepCursor::new(false);
        assert_eq!(cursor.resolve(&timesteps, 980.0).unwrap(), 0);
        cursor.advance(0);
        assert_eq!(cursor.resolve(&timesteps, 960.0).unwrap(), 1);
        cursor.advance(1);
        assert_eq!(cursor.resolve(&timesteps, 960.0).unwrap(), 2);
        // Out of order: first match, then last index when absent
        assert_eq!(cursor.resolve(&timesteps, 980.0).unwrap(), 0);
        assert_eq!(cursor.resolve(&timesteps, 123.0).unwrap(), 3);

        let strict = StepCursor::new(true);
        assert_eq!(
            strict.resolve(&timesteps, 960.0),
            Err(SchedulerError::OutOfSequence {
                timestep: 960.0,
                expected: Some(980.0)
            })
        );
    }

    #[test]
    fn test_ancestral_step_splits_variance() {
        let (down, up) = get_ancestral_step(2.0, 1.0, 1.0);
        assert!((down * down + up * up - 1.0).abs() < 1e-12);
        assert_eq!(get_ancestral_step(2.0, 0.0, 1.0), (0.0, 0.0));
    }
}
