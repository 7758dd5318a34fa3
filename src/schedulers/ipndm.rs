//! Improved Pseudo Numerical Diffusion Model sampler.
//!
//! Linear multistep method for the diffusion ODE: past epsilon predictions are
//! blended with Adams-Bashforth coefficients, so each network call buys a
//! higher-order update. The history buffer is bounded by the solver order and
//! the effective order ramps up from 1 while the buffer fills.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tch::Tensor;

use super::types::{Scheduler, StepCursor};
use super::{
    add_noise_alpha, inference_timesteps, BetaSchedule, NoiseSchedule, DEFAULT_TRAIN_TIMESTEPS,
};
use crate::error::DiffusionError;

const MAX_SOLVER_ORDER: usize = 4;

/// The configuration for the iPNDM scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IpndmSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// Number of historical epsilon predictions blended per step (1..=4).
    pub solver_order: usize,
    /// number of diffusion steps used to train the model
    pub train_timesteps: usize,
}

impl Default for IpndmSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085f64,
            beta_end: 0.012f64,
            beta_schedule: BetaSchedule::ScaledLinear,
            solver_order: MAX_SOLVER_ORDER,
            train_timesteps: DEFAULT_TRAIN_TIMESTEPS,
        }
    }
}

fn adams_bashforth_coefficients(order: usize) -> &'static [f64] {
    match order {
        1 => &[1.],
        2 => &[1.5, -0.5],
        3 => &[23. / 12., -16. / 12., 5. / 12.],
        4 => &[55. / 24., -59. / 24., 37. / 24., -9. / 24.],
        _ => unreachable!("solver order is validated at construction"),
    }
}

/// The iPNDM scheduler.
#[derive(Debug)]
pub struct IpndmScheduler {
    cursor: StepCursor,
    schedule: NoiseSchedule,
    // most recent first; never grows past solver_order
    ets: VecDeque<Tensor>,
    pub config: IpndmSchedulerConfig,
}

impl IpndmScheduler {
    pub fn new(inference_steps: usize, config: IpndmSchedulerConfig) -> Result<Self, DiffusionError> {
        if config.solver_order == 0 || config.solver_order > MAX_SOLVER_ORDER {
            return Err(DiffusionError::Configuration(format!(
                "solver_order must be within 1..={MAX_SOLVER_ORDER}, got {}",
                config.solver_order
            )));
        }
        let schedule = NoiseSchedule::new(
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        )?;
        let timesteps = inference_timesteps(config.train_timesteps, inference_steps)?;
        Ok(Self { cursor: StepCursor::new(timesteps), schedule, ets: VecDeque::new(), config })
    }

    fn prev_alpha_cumprod(&self, index: usize) -> f64 {
        match self.cursor.timesteps().get(index + 1) {
            Some(&prev) => self.schedule.alpha_cumprod(prev),
            None => self.schedule.alpha_cumprod(0),
        }
    }
}

impl Scheduler for IpndmScheduler {
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

        self.ets.push_front(model_output.shallow_clone());
        if self.ets.len() > self.config.solver_order {
            self.ets.pop_back();
        }

        let effective_order = self.ets.len();
        let coefficients = adams_bashforth_coefficients(effective_order);
        let mut e_t = Tensor::zeros_like(model_output);
        for (et, &coefficient) in self.ets.iter().zip(coefficients) {
            e_t = e_t + et * coefficient;
        }

        let pred_original_sample = (sample - beta_prod_t.sqrt() * &e_t) / alpha_prod_t.sqrt();
        let prev_sample =
            alpha_prod_t_prev.sqrt() * pred_original_sample + beta_prod_t_prev.sqrt() * e_t;
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
