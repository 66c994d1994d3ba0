//! Scheduler registry and enum dispatch
//!
//! `Scheduler::step` is generic over the noise source, so schedulers cannot be
//! boxed as trait objects. `AnyScheduler` wraps every variant instead.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ddim::DdimScheduler;
use crate::dpm::DpmSolverMultistepScheduler;
use crate::dpm2::Kdpm2DiscreteScheduler;
use crate::dpm_singlestep::DpmSolverSinglestepScheduler;
use crate::error::{Result, SchedulerError};
use crate::euler::{EulerAncestralDiscreteScheduler, EulerDiscreteScheduler};
use crate::lcm::LcmScheduler;
use crate::noise::NoiseSource;
use crate::pndm::PndmScheduler;
use crate::sampler::Scheduler;
use crate::scheduler::NoiseSchedule;
use crate::scheduler::ScheduleConfig;
use crate::wuerstchen::DdpmWuerstchenScheduler;

/// Available schedulers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    Ddim,
    Pndm,
    Euler,
    EulerAncestral,
    #[default]
    DpmSolverMultistep,
    DpmSolverSinglestep,
    Kdpm2,
    Lcm,
    Wuerstchen,
}

impl SchedulerKind {
    pub fn all() -> &'static [SchedulerKind] {
        &[
            SchedulerKind::Ddim,
            SchedulerKind::Pndm,
            SchedulerKind::Euler,
            SchedulerKind::EulerAncestral,
            SchedulerKind::DpmSolverMultistep,
            SchedulerKind::DpmSolverSinglestep,
            SchedulerKind::Kdpm2,
            SchedulerKind::Lcm,
            SchedulerKind::Wuerstchen,
        ]
    }

    /// Identifier used on the command line and in config files
    pub fn id(self) -> &'static str {
        match self {
            SchedulerKind::Ddim => "ddim",
            SchedulerKind::Pndm => "pndm",
            SchedulerKind::Euler => "euler",
            SchedulerKind::EulerAncestral => "euler-ancestral",
            SchedulerKind::DpmSolverMultistep => "dpm-solver-multistep",
            SchedulerKind::DpmSolverSinglestep => "dpm-solver-singlestep",
            SchedulerKind::Kdpm2 => "kdpm2",
            SchedulerKind::Lcm => "lcm",
            SchedulerKind::Wuerstchen => "wuerstchen",
        }
    }

    /// Human-readable name
    pub fn description(self) -> &'static str {
        match self {
            SchedulerKind::Ddim => "DDIM",
            SchedulerKind::Pndm => "PNDM",
            SchedulerKind::Euler => "Euler",
            SchedulerKind::EulerAncestral => "EulerA",
            SchedulerKind::DpmSolverMultistep => "DPM-Solver++",
            SchedulerKind::DpmSolverSinglestep => "DPM-Solver++ Singlestep",
            SchedulerKind::Kdpm2 => "DPM2 Karras",
            SchedulerKind::Lcm => "LCM",
            SchedulerKind::Wuerstchen => "Wuerstchen",
        }
    }

    /// Build the scheduler with default variant options
    pub fn build<B: Backend, const D: usize>(
        self,
        config: &ScheduleConfig,
    ) -> Result<AnyScheduler<B, D>> {
        Ok(match self {
            SchedulerKind::Ddim => AnyScheduler::Ddim(DdimScheduler::new(config)?),
            SchedulerKind::Pndm => AnyScheduler::Pndm(PndmScheduler::new(config)?),
            SchedulerKind::Euler => AnyScheduler::Euler(EulerDiscreteScheduler::new(config)?),
            SchedulerKind::EulerAncestral => {
                AnyScheduler::EulerAncestral(EulerAncestralDiscreteScheduler::new(config)?)
            }
            SchedulerKind::DpmSolverMultistep => {
                AnyScheduler::DpmSolverMultistep(DpmSolverMultistepScheduler::new(config)?)
            }
            SchedulerKind::DpmSolverSinglestep => {
                AnyScheduler::DpmSolverSinglestep(DpmSolverSinglestepScheduler::new(config)?)
            }
            SchedulerKind::Kdpm2 => AnyScheduler::Kdpm2(Kdpm2DiscreteScheduler::new(config)?),
            SchedulerKind::Lcm => AnyScheduler::Lcm(LcmScheduler::new(config)?),
            SchedulerKind::Wuerstchen => {
                AnyScheduler::Wuerstchen(DdpmWuerstchenScheduler::new(config)?)
            }
        })
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for SchedulerKind {
    type Err = SchedulerError;

    /// Accepts the id or the description, case-insensitively
    fn from_str(s: &str) -> Result<Self> {
        SchedulerKind::all()
            .iter()
            .copied()
            .find(|kind| {
                kind.id().eq_ignore_ascii_case(s) || kind.description().eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| SchedulerError::InvalidConfig(format!("unknown scheduler: {s}")))
    }
}

/// Any scheduler, dispatched by variant
pub enum AnyScheduler<B: Backend, const D: usize> {
    Ddim(DdimScheduler<B, D>),
    Pndm(PndmScheduler<B, D>),
    Euler(EulerDiscreteScheduler<B, D>),
    EulerAncestral(EulerAncestralDiscreteScheduler<B, D>),
    DpmSolverMultistep(DpmSolverMultistepScheduler<B, D>),
    DpmSolverSinglestep(DpmSolverSinglestepScheduler<B, D>),
    Kdpm2(Kdpm2DiscreteScheduler<B, D>),
    Lcm(LcmScheduler<B, D>),
    Wuerstchen(DdpmWuerstchenScheduler<B, D>),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            AnyScheduler::Ddim($inner) => $body,
            AnyScheduler::Pndm($inner) => $body,
            AnyScheduler::Euler($inner) => $body,
            AnyScheduler::EulerAncestral($inner) => $body,
            AnyScheduler::DpmSolverMultistep($inner) => $body,
            AnyScheduler::DpmSolverSinglestep($inner) => $body,
            AnyScheduler::Kdpm2($inner) => $body,
            AnyScheduler::Lcm($inner) => $body,
            AnyScheduler::Wuerstchen($inner) => $body,
        }
    };
}

impl<B: Backend, const D: usize> AnyScheduler<B, D> {
    pub fn kind(&self) -> SchedulerKind {
        match self {
            AnyScheduler::Ddim(_) => SchedulerKind::Ddim,
            AnyScheduler::Pndm(_) => SchedulerKind::Pndm,
            AnyScheduler::Euler(_) => SchedulerKind::Euler,
            AnyScheduler::EulerAncestral(_) => SchedulerKind::EulerAncestral,
            AnyScheduler::DpmSolverMultistep(_) => SchedulerKind::DpmSolverMultistep,
            AnyScheduler::DpmSolverSinglestep(_) => SchedulerKind::DpmSolverSinglestep,
            AnyScheduler::Kdpm2(_) => SchedulerKind::Kdpm2,
            AnyScheduler::Lcm(_) => SchedulerKind::Lcm,
            AnyScheduler::Wuerstchen(_) => SchedulerKind::Wuerstchen,
        }
    }
}

impl<B: Backend, const D: usize> Scheduler<B, D> for AnyScheduler<B, D> {
    fn schedule(&self) -> &NoiseSchedule {
        dispatch!(self, s => s.schedule())
    }

    fn timesteps(&self) -> &[f64] {
        dispatch!(self, s => s.timesteps())
    }

    fn init_noise_sigma(&self) -> f64 {
        dispatch!(self, s => s.init_noise_sigma())
    }

    fn scale_model_input(&self, timestep: f64, sample: Tensor<B, D>) -> Result<Tensor<B, D>> {
        dispatch!(self, s => s.scale_model_input(timestep, sample))
    }

    fn step<N: NoiseSource<B>>(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: f64,
        sample: Tensor<B, D>,
        noise: &mut N,
    ) -> Result<Tensor<B, D>> {
        dispatch!(self, s => s.step(model_output, timestep, sample, noise))
    }

    fn add_noise(
        &self,
        original: Tensor<B, D>,
        noise: &[Tensor<B, D>],
        timestep: Option<f64>,
    ) -> Result<Vec<Tensor<B, D>>> {
        dispatch!(self, s => s.add_noise(original, noise, timestep))
    }

    fn last_denoised(&self) -> Option<&Tensor<B, D>> {
        dispatch!(self, s => s.last_denoised())
    }

    fn reset(&mut self) {
        dispatch!(self, s => s.reset())
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
    fn test_parse_ids_and_descriptions() {
        for &kind in SchedulerKind::all() {
            assert_eq!(kind.id().parse::<SchedulerKind>().unwrap(), kind);
            assert_eq!(kind.to_string().parse::<SchedulerKind>().unwrap(), kind);
        }
        assert_eq!("eulera".parse::<SchedulerKind>().unwrap(), SchedulerKind::EulerAncestral);
        assert!("heun".parse::<SchedulerKind>().is_err());
    }

    #[test]
    fn test_serde_uses_ids() {
        let json = serde_json::to_string(&SchedulerKind::DpmSolverMultistep).unwrap();
        assert_eq!(json, "\"dpm-solver-multistep\"");
        let kind: SchedulerKind = serde_json::from_str("\"euler-ancestral\"").unwrap();
        assert_eq!(kind, SchedulerKind::EulerAncestral);
    }

    #[test]
    fn test_single_step_sequences() {
        let config = ScheduleConfig::default().with_steps(1);
        let first = |kind: SchedulerKind| {
            kind.build::<TestBackend, 1>(&config).unwrap().timesteps().to_vec()
        };
        assert_eq!(first(SchedulerKind::Ddim), vec![0.0]);
        assert_eq!(first(SchedulerKind::DpmSolverMultistep), vec![999.0]);
        assert_eq!(first(SchedulerKind::Lcm), vec![999.0]);
        assert_eq!(first(SchedulerKind::Wuerstchen), vec![1.0]);
    }

    #[test]
    fn test_every_kind_runs_to_completion() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(6);

        for &kind in SchedulerKind::all() {
            let mut scheduler = kind.build::<TestBackend, 2>(&config).unwrap();
            assert_eq!(scheduler.kind(), kind);
            let mut noise = SeededNoise::new(7);
            let mut sample = NoiseSource::<TestBackend>::normal(
                &mut noise,
                [2, 3],
                0.0,
                scheduler.init_noise_sigma(),
                &device,
            );

            for t in scheduler.timesteps().to_vec() {
                let input = scheduler.scale_model_input(t, sample.clone()).unwrap();
                let output = input.mul_scalar(0.1);
                sample = scheduler.step(output, t, sample, &mut noise).unwrap();
            }
            assert!(scheduler.last_denoised().is_some(), "{kind}");
            assert!(
                to_host(sample).unwrap().iter().all(|v| v.is_finite()),
                "{kind} produced non-finite values"
            );
        }
    }

    #[test]
    fn test_reset_allows_rerun() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ScheduleConfig::default().with_steps(4).with_strict_sequencing(true);
        let mut scheduler = SchedulerKind::Pndm.build::<TestBackend, 1>(&config).unwrap();

        let run = |scheduler: &mut AnyScheduler<TestBackend, 1>| {
            let mut noise = SeededNoise::new(1);
            let mut sample = Tensor::<TestBackend, 1>::ones([3], &device);
            for t in scheduler.timesteps().to_vec() {
                let output = sample.clone().mul_scalar(0.2);
                sample = scheduler.step(output, t, sample, &mut noise).unwrap();
            }
            to_host(sample).unwrap()
        };
        let first = run(&mut scheduler);
        scheduler.reset();
        assert_eq!(run(&mut scheduler), first);
    }
}
