use std::fs;

use serde::{Deserialize, Serialize};
use tch::{kind, Kind, Tensor};

use crate::error::DiffusionError;

pub mod ddim;
pub mod euler_ancestral;
pub mod ipndm;
pub mod types;

pub use types::Scheduler;

use self::ddim::{DDIMScheduler, DDIMSchedulerConfig};
use self::euler_ancestral::{EulerAncestralScheduler, EulerAncestralSchedulerConfig};
use self::ipndm::{IpndmScheduler, IpndmSchedulerConfig};

/// Timestep count the noise tables were trained over, by convention.
pub const DEFAULT_TRAIN_TIMESTEPS: usize = 1000;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the
/// cumulative product of `(1-beta)` over time from `t = [0,1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar = |time_step: f64| {
        f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2)
    };
    let mut betas = Vec::with_capacity(num_diffusion_timesteps);
    for i in 0..num_diffusion_timesteps {
        let t1 = i as f64 / num_diffusion_timesteps as f64;
        let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
        betas.push((1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta));
    }
    Tensor::from_slice(&betas)
}

/// Per-trained-timestep cumulative alpha table, fixed at construction.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(
        train_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        beta_schedule: BetaSchedule,
    ) -> Result<Self, DiffusionError> {
        if train_timesteps == 0 {
            return Err(DiffusionError::Configuration(
                "train_timesteps must be positive".to_string(),
            ));
        }
        if beta_start <= 0. || beta_end <= 0. {
            return Err(DiffusionError::Configuration(format!(
                "beta bounds must be positive, got start={beta_start} end={beta_end}"
            )));
        }
        if beta_start >= beta_end {
            return Err(DiffusionError::Configuration(format!(
                "beta_start must be below beta_end, got start={beta_start} end={beta_end}"
            )));
        }
        let betas = match beta_schedule {
            BetaSchedule::ScaledLinear => Tensor::linspace(
                beta_start.sqrt(),
                beta_end.sqrt(),
                train_timesteps as i64,
                kind::FLOAT_CPU,
            )
            .square(),
            BetaSchedule::Linear => {
                Tensor::linspace(beta_start, beta_end, train_timesteps as i64, kind::FLOAT_CPU)
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(train_timesteps, 0.999),
        };
        let alphas: Tensor = 1.0 - betas;
        let alphas_cumprod = Vec::<f64>::try_from(alphas.cumprod(0, Kind::Double)).unwrap();
        Ok(Self { alphas_cumprod })
    }

    pub fn len(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphas_cumprod.is_empty()
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// Noise level expressed in the sigma parameterization.
    pub fn sigma(&self, timestep: usize) -> f64 {
        let ac = self.alphas_cumprod[timestep];
        ((1. - ac) / ac).sqrt()
    }
}

/// Strided inference schedule over the trained range: strictly decreasing,
/// exactly `inference_steps` values, ending on the last stride boundary.
/// 20 steps over 1000 trained timesteps gives `[999, 949, .., 49]`.
pub(crate) fn inference_timesteps(
    train_timesteps: usize,
    inference_steps: usize,
) -> Result<Vec<usize>, DiffusionError> {
    if inference_steps == 0 {
        return Err(DiffusionError::Configuration(
            "inference_steps must be positive".to_string(),
        ));
    }
    if inference_steps > train_timesteps {
        return Err(DiffusionError::Configuration(format!(
            "inference_steps ({inference_steps}) cannot exceed train_timesteps ({train_timesteps})"
        )));
    }
    let step_ratio = train_timesteps / inference_steps;
    Ok((1..=inference_steps).map(|i| i * step_ratio - 1).rev().collect())
}

/// `sqrt(ac[t]) * original + sqrt(1 - ac[t]) * noise`, with each batch element
/// noised to its own trained timestep. A single timestep broadcasts over the
/// whole batch.
pub(crate) fn add_noise_alpha(
    schedule: &NoiseSchedule,
    original: &Tensor,
    noise: &Tensor,
    timesteps: &[usize],
) -> Result<Tensor, DiffusionError> {
    let batch = original.size().first().copied().unwrap_or(0);
    if timesteps.is_empty() || (timesteps.len() != 1 && timesteps.len() as i64 != batch) {
        return Err(DiffusionError::StateViolation(format!(
            "expected 1 or {batch} noising timesteps, got {}",
            timesteps.len()
        )));
    }
    let mut sqrt_alpha = Vec::with_capacity(timesteps.len());
    let mut sqrt_one_minus_alpha = Vec::with_capacity(timesteps.len());
    for &t in timesteps {
        if t >= schedule.len() {
            return Err(DiffusionError::StateViolation(format!(
                "noising timestep {t} outside the trained range 0..{}",
                schedule.len()
            )));
        }
        let ac = schedule.alpha_cumprod(t);
        sqrt_alpha.push(ac.sqrt());
        sqrt_one_minus_alpha.push((1.0 - ac).sqrt());
    }
    let sqrt_alpha = Tensor::from_slice(&sqrt_alpha)
        .view([-1, 1, 1, 1])
        .to_kind(original.kind())
        .to_device(original.device());
    let sqrt_one_minus_alpha = Tensor::from_slice(&sqrt_one_minus_alpha)
        .view([-1, 1, 1, 1])
        .to_kind(original.kind())
        .to_device(original.device());
    Ok(&sqrt_alpha * original + &sqrt_one_minus_alpha * noise)
}

/// Solver family plus its construction parameters. Families are picked here,
/// once, at build time; the returned trait object carries all per-family
/// coefficients and history policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheduler_name", content = "scheduler_args")]
pub enum SchedulerKind {
    DDIMScheduler(DDIMSchedulerConfig),
    EulerAncestralScheduler(EulerAncestralSchedulerConfig),
    IpndmScheduler(IpndmSchedulerConfig),
}

impl SchedulerKind {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: SchedulerKind = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn build(&self, inference_steps: usize) -> Result<Box<dyn Scheduler>, DiffusionError> {
        match self {
            SchedulerKind::DDIMScheduler(config) => {
                Ok(Box::new(DDIMScheduler::new(inference_steps, *config)?))
            }
            SchedulerKind::EulerAncestralScheduler(config) => {
                Ok(Box::new(EulerAncestralScheduler::new(inference_steps, *config)?))
            }
            SchedulerKind::IpndmScheduler(config) => {
                Ok(Box::new(IpndmScheduler::new(inference_steps, *config)?))
            }
        }
    }
}

impl Default for SchedulerKind {
    fn default() -> Self {
        SchedulerKind::DDIMScheduler(DDIMSchedulerConfig::default())
    }
}
