//! Diffusion noise schedulers for burn
//!
//! Each scheduler fixes a timestep sequence at construction and then turns
//! model predictions into successively less noisy samples, one `step` call
//! per timestep.

pub mod error;
pub mod tensor;
pub mod noise;
pub mod scheduler;
pub mod sampler;
pub mod ddim;
pub mod pndm;
pub mod euler;
pub mod dpm;
pub mod dpm_singlestep;
pub mod dpm2;
pub mod lcm;
pub mod wuerstchen;
pub mod kind;

pub use error::{Result, SchedulerError};
pub use tensor::weighted_sum;
pub use noise::{BackendNoise, NoiseSource, SeededNoise};
pub use scheduler::{
    BetaSchedule, NoiseSchedule, PredictionType, ScheduleConfig, StepCursor, TimestepSpacing,
    karras_sigmas, linspace,
};
pub use sampler::Scheduler;
pub use ddim::{DdimOptions, DdimScheduler};
pub use pndm::PndmScheduler;
pub use euler::{EulerAncestralDiscreteScheduler, EulerAncestralOptions, EulerDiscreteScheduler};
pub use dpm::{DpmSolverMultistepScheduler, DpmSolverOptions};
pub use dpm_singlestep::DpmSolverSinglestepScheduler;
pub use dpm2::Kdpm2DiscreteScheduler;
pub use lcm::{LcmOptions, LcmScheduler};
pub use wuerstchen::{DdpmWuerstchenScheduler, WuerstchenOptions};
pub use kind::{AnyScheduler, SchedulerKind};
