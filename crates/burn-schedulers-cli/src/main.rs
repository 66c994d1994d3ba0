//! burn-schedulers CLI
//!
//! Command-line interface for inspecting diffusion schedulers.
//!
//! Supports:
//! - Printing the timestep sequence a configuration produces
//! - Running a full sampling loop against a synthetic model

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use burn_ndarray::NdArray;
use burn_schedulers::{
    AnyScheduler, BetaSchedule, PredictionType, ScheduleConfig, Scheduler, SchedulerKind,
    TimestepSpacing,
};

mod sample;

use sample::SyntheticModel;

type CliBackend = NdArray<f32>;

#[derive(Parser)]
#[command(name = "burn-schedulers")]
#[command(about = "Inspect and exercise diffusion noise schedulers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the timestep sequence for a scheduler as JSON
    Timesteps {
        /// Scheduler to build
        #[arg(short, long, value_enum, default_value = "dpm-plus-plus")]
        scheduler: SamplerType,

        #[command(flatten)]
        schedule: ScheduleArgs,
    },

    /// Run a full sampling loop with a synthetic model
    Sample {
        /// Scheduler to build
        #[arg(short, long, value_enum, default_value = "dpm-plus-plus")]
        scheduler: SamplerType,

        #[command(flatten)]
        schedule: ScheduleArgs,

        /// Random seed for the initial latent and ancestral noise
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Latent shape (batch, channels, height, width)
        #[arg(long, value_delimiter = ',', default_value = "1,4,8,8")]
        shape: Vec<usize>,

        /// What the synthetic model predicts
        #[arg(long, value_enum, default_value = "constant")]
        prediction: SyntheticModel,

        /// Value returned by the constant model
        #[arg(long, default_value = "0.1")]
        value: f32,
    },

    /// List the available schedulers
    List,
}

/// Schedule options, layered over an optional JSON config file
#[derive(clap::Args, Debug)]
struct ScheduleArgs {
    /// JSON file with a serialized schedule configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of inference steps
    #[arg(short = 'n', long)]
    steps: Option<usize>,

    /// Number of training timesteps
    #[arg(long)]
    train_steps: Option<usize>,

    /// Beta ramp shape
    #[arg(long, value_enum)]
    beta_schedule: Option<BetaScheduleArg>,

    #[arg(long)]
    beta_start: Option<f64>,

    #[arg(long)]
    beta_end: Option<f64>,

    /// What the model predicts
    #[arg(long, value_enum)]
    prediction_type: Option<PredictionArg>,

    /// Timestep spacing (defaults per scheduler)
    #[arg(long, value_enum)]
    spacing: Option<SpacingArg>,

    /// Use the Karras sigma schedule
    #[arg(long)]
    karras: bool,

    /// Partial denoising strength in (0, 1]
    #[arg(long)]
    strength: Option<f64>,

    /// Step to alpha=1 past the final timestep
    #[arg(long)]
    alpha_to_one: Option<bool>,

    /// Offset added to leading timesteps
    #[arg(long)]
    steps_offset: Option<usize>,

    /// Fail on out-of-sequence steps instead of warning
    #[arg(long)]
    strict: bool,
}

impl ScheduleArgs {
    /// Load the config file (if any) and apply flag overrides
    fn resolve(&self) -> Result<ScheduleConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => ScheduleConfig::default(),
        };

        if let Some(steps) = self.steps {
            config.inference_step_count = steps;
        }
        if let Some(steps) = self.train_steps {
            config.train_step_count = steps;
        }
        if let Some(schedule) = self.beta_schedule {
            config.beta_schedule = schedule.into();
        }
        if let Some(start) = self.beta_start {
            config.beta_start = start;
        }
        if let Some(end) = self.beta_end {
            config.beta_end = end;
        }
        if let Some(prediction) = self.prediction_type {
            config.prediction_type = prediction.into();
        }
        if let Some(spacing) = self.spacing {
            config.timestep_spacing = Some(spacing.into());
        }
        if self.karras {
            config.use_karras_sigmas = true;
        }
        if self.strength.is_some() {
            config.strength = self.strength;
        }
        if self.alpha_to_one.is_some() {
            config.set_alpha_to_one = self.alpha_to_one;
        }
        if let Some(offset) = self.steps_offset {
            config.steps_offset = offset;
        }
        if self.strict {
            config.strict_sequencing = true;
        }

        config.validate().context("Invalid schedule configuration")?;
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum SamplerType {
    /// DDIM - Deterministic, fast
    Ddim,
    /// PNDM - Pseudo numerical (PLMS)
    Pndm,
    /// Euler - Balanced speed/quality
    Euler,
    /// Euler Ancestral - Euler with noise injection
    EulerA,
    /// DPM++ 2M - Multistep (default)
    #[default]
    DpmPlusPlus,
    /// DPM++ singlestep, orders cycled per step
    DpmPlusPlusSinglestep,
    /// KDPM2 - Two model calls per interval
    Kdpm2,
    /// LCM - Fast (4-8 steps)
    Lcm,
    /// Wuerstchen - Continuous-time DDPM
    Wuerstchen,
}

impl From<SamplerType> for SchedulerKind {
    fn from(t: SamplerType) -> Self {
        match t {
            SamplerType::Ddim => SchedulerKind::Ddim,
            SamplerType::Pndm => SchedulerKind::Pndm,
            SamplerType::Euler => SchedulerKind::Euler,
            SamplerType::EulerA => SchedulerKind::EulerAncestral,
            SamplerType::DpmPlusPlus => SchedulerKind::DpmSolverMultistep,
            SamplerType::DpmPlusPlusSinglestep => SchedulerKind::DpmSolverSinglestep,
            SamplerType::Kdpm2 => SchedulerKind::Kdpm2,
            SamplerType::Lcm => SchedulerKind::Lcm,
            SamplerType::Wuerstchen => SchedulerKind::Wuerstchen,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BetaScheduleArg {
    Linear,
    ScaledLinear,
}

impl From<BetaScheduleArg> for BetaSchedule {
    fn from(s: BetaScheduleArg) -> Self {
        match s {
            BetaScheduleArg::Linear => BetaSchedule::Linear,
            BetaScheduleArg::ScaledLinear => BetaSchedule::ScaledLinear,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PredictionArg {
    /// Model predicts the added noise
    Epsilon,
    /// Model predicts velocity
    V,
}

impl From<PredictionArg> for PredictionType {
    fn from(p: PredictionArg) -> Self {
        match p {
            PredictionArg::Epsilon => PredictionType::Epsilon,
            PredictionArg::V => PredictionType::VPrediction,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SpacingArg {
    Linspace,
    Leading,
    Trailing,
}

impl From<SpacingArg> for TimestepSpacing {
    fn from(s: SpacingArg) -> Self {
        match s {
            SpacingArg::Linspace => TimestepSpacing::Linspace,
            SpacingArg::Leading => TimestepSpacing::Leading,
            SpacingArg::Trailing => TimestepSpacing::Trailing,
        }
    }
}

#[derive(Serialize)]
struct TimestepReport<'a> {
    scheduler: &'a str,
    description: &'a str,
    count: usize,
    init_noise_sigma: f64,
    timesteps: &'a [f64],
}

fn build(kind: SchedulerKind, config: &ScheduleConfig) -> Result<AnyScheduler<CliBackend, 4>> {
    kind.build(config)
        .with_context(|| format!("Failed to build {kind} scheduler"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

/// Application entry point
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Timesteps {
            scheduler,
            schedule,
        } => {
            let kind = SchedulerKind::from(scheduler);
            let config = schedule.resolve()?;
            let scheduler = build(kind, &config)?;

            print_json(&TimestepReport {
                scheduler: kind.id(),
                description: kind.description(),
                count: scheduler.timesteps().len(),
                init_noise_sigma: scheduler.init_noise_sigma(),
                timesteps: scheduler.timesteps(),
            })
        }

        Commands::Sample {
            scheduler,
            schedule,
            seed,
            shape,
            prediction,
            value,
        } => {
            let kind = SchedulerKind::from(scheduler);
            let config = schedule.resolve()?;
            let dims: [usize; 4] = shape.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("--shape needs exactly 4 dimensions, got {}", shape.len())
            })?;

            let mut scheduler = build(kind, &config)?;
            let report = sample::run(
                &mut scheduler,
                dims,
                seed,
                prediction,
                value,
                config.strength.is_some(),
            )?;
            print_json(&report)
        }

        Commands::List => {
            for kind in SchedulerKind::all() {
                println!("{:<24} {}", kind.id(), kind.description());
            }
            Ok(())
        }
    }
}
