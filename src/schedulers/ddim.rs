//! # Denoising Diffusion Implicit Models
//!
//! Order-1 solver with a closed-form transition between scheduled timesteps.
//! Deterministic at `eta = 0`; a Gaussian term scaled by `eta` turns it into
//! the stochastic DDPM-like variant.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use serde::{Deserialize, Serialize};
use tch::Tensor;

use super::types::{Scheduler, StepCursor};
use super::{
    add_noise_alpha, inference_timesteps, BetaSchedule, NoiseSchedule, PredictionType,
    DEFAULT_TRAIN_TIMESTEPS,
};
use crate::error::DiffusionError;

/// The configuration for the DDIM scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DDIMSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// The amount of noise to be added at each step.
    pub eta: f64,
    /// prediction type of the scheduler function, one of `epsilon` (predicting
    /// the noise of the diffusion process) or `v_prediction` (see section 2.4
    /// https://imagen.research.google/video/paper.pdf)
    pub prediction_type: PredictionType,
    /// number of diffusion steps used to train the model
    pub train_timesteps: usize,
}

impl Default for DDIMSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085f64,
            beta_end: 0.012f64,
            beta_schedule: BetaSchedule::ScaledLinear,
            eta: 0.,
            prediction_type: PredictionType::Epsilon,
            train_timesteps: DEFAULT_TRAIN_TIMESTEPS,
        }
    }
}

/// The DDIM scheduler.
#[derive(Debug)]
pub struct DDIMScheduler {
    cursor: StepCursor,
    schedule: NoiseSchedule,
    pub config: DDIMSchedulerConfig,
}

impl DDIMScheduler {
    /// Creates a new DDIM scheduler for the given number of inference steps.
    pub fn new(inference_steps: usize, config: DDIMSchedulerConfig) -> Result<Self, DiffusionError> {
        if config.eta < 0. {
            return Err(DiffusionError::Configuration(format!(
                "eta must be non-negative, got {}",
                config.eta
            )));
        }
        let schedule = NoiseSchedule::new(
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        )?;
        let timesteps = inference_timesteps(config.train_timesteps, inference_steps)?;
        Ok(Self { cursor: StepCursor::new(timesteps), schedule, config })
    }

    fn prev_alpha_cumprod(&self, index: usize) -> f64 {
        match self.cursor.timesteps().get(index + 1) {
            Some(&prev) => self.schedule.alpha_cumprod(prev),
            // final transition targets the first trained timestep
            None => self.schedule.alpha_cumprod(0),
        }
    }
}

impl Scheduler for DDIMScheduler {
    fn timesteps(&self) -> &[usize] {
        self.cursor.timesteps()
    }

    fn init_noise_sigma(&self) -> f64 {
        1.
    }

    fn begin_at(&mut self, step_index: usize) -> Result<(), DiffusionError> {
        self.cursor.begin_at(step_index)
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor, DiffusionError> {
        Ok(sample)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor, DiffusionError> {
        let index = self.cursor.expect(timestep)?;
        let alpha_prod_t = self.schedule.alpha_cumprod(timestep);
        let alpha_prod_t_prev = self.prev_alpha_cumprod(index);
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        let (pred_original_sample, pred_epsilon) = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let pred_original_sample =
                    (sample - beta_prod_t.sqrt() * model_output) / alpha_prod_t.sqrt();
                (pred_original_sample, model_output.shallow_clone())
            }
            PredictionType::VPrediction => {
                let pred_original_sample =
                    alpha_prod_t.sqrt() * sample - beta_prod_t.sqrt() * model_output;
                let pred_epsilon = alpha_prod_t.sqrt() * model_output + beta_prod_t.sqrt() * sample;
                (pred_original_sample, pred_epsilon)
            }
        };

        let variance = (beta_prod_t_prev / beta_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.config.eta * variance.sqrt();

        let pred_sample_direction =
            (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).sqrt() * &pred_epsilon;
        let prev_sample = alpha_prod_t_prev.sqrt() * &pred_original_sample + pred_sample_direction;
        let prev_sample = if self.config.eta > 0. {
            &prev_sample + Tensor::randn_like(&prev_sample) * std_dev_t
        } else {
            prev_sample
        };
        self.cursor.advance();
        Ok(prev_sample)
    }

    fn add_noise(
        &self,
        original: &Tensor,
        noise: &Tensor,
        timesteps: &[usize],
    ) -> Result<Tensor, DiffusionError> {
        add_noise_alpha(&self.schedule, original, noise, timesteps)
    }
}
