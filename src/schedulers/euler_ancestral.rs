//! Ancestral sampling with Euler method steps.
//!
//! Sigma-parameterized: model inputs are rescaled by `1/sqrt(sigma^2+1)` and
//! every step re-injects fresh noise through the ancestral sigma split.
//!
//! Based on the original k-diffusion implementation by Katherine Crowson:
//! https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
use serde::{Deserialize, Serialize};
use tch::Tensor;

use super::types::{Scheduler, StepCursor};
use super::{
    inference_timesteps, BetaSchedule, NoiseSchedule, PredictionType, DEFAULT_TRAIN_TIMESTEPS,
};
use crate::error::DiffusionError;

/// The configuration for the EulerAncestral scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EulerAncestralSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// prediction type of the scheduler function
    pub prediction_type: PredictionType,
    /// number of diffusion steps used to train the model
    pub train_timesteps: usize,
}

impl Default for EulerAncestralSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085f64,
            beta_end: 0.012f64,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            train_timesteps: DEFAULT_TRAIN_TIMESTEPS,
        }
    }
}

/// The EulerAncestral scheduler.
#[derive(Debug)]
pub struct EulerAncestralScheduler {
    cursor: StepCursor,
    // per scheduled timestep, with a trailing 0.0 for the final transition
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    pub config: EulerAncestralSchedulerConfig,
}

impl EulerAncestralScheduler {
    pub fn new(
        inference_steps: usize,
        config: EulerAncestralSchedulerConfig,
    ) -> Result<Self, DiffusionError> {
        let schedule = NoiseSchedule::new(
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        )?;
        let timesteps = inference_timesteps(config.train_timesteps, inference_steps)?;
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| schedule.sigma(t)).collect();
        sigmas.push(0.0);
        // timesteps are decreasing, so the first sigma is the largest
        let init_noise_sigma = sigmas[0];
        Ok(Self { cursor: StepCursor::new(timesteps), sigmas, init_noise_sigma, config })
    }
}

impl Scheduler for EulerAncestralScheduler {
    fn timesteps(&self) -> &[usize] {
        self.cursor.timesteps()
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn begin_at(&mut self, step_index: usize) -> Result<(), DiffusionError> {
        self.cursor.begin_at(step_index)
    }

    /// Scales the denoising model input by `1 / (sigma^2 + 1) ** 0.5` to match
    /// the k-diffusion algorithm.
    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor, DiffusionError> {
        let step_index = self.cursor.position_of(timestep)?;
        let sigma = self.sigmas[step_index];
        Ok(sample / (sigma.powi(2) + 1.).sqrt())
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor, DiffusionError> {
        let index = self.cursor.expect(timestep)?;
        let sigma_from = self.sigmas[index];
        let sigma_to = self.sigmas[index + 1];

        // 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
        let pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => sample - sigma_from * model_output,
            PredictionType::VPrediction => {
                model_output * (-sigma_from / (sigma_from.powi(2) + 1.).sqrt())
                    + sample / (sigma_from.powi(2) + 1.)
            }
        };

        let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2))
            / sigma_from.powi(2))
        .sqrt();
        let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).sqrt();

        // 2. convert to an ODE derivative
        let derivative = (sample - &pred_original_sample) / sigma_from;
        let dt = sigma_down - sigma_from;
        let prev_sample = sample + derivative * dt;

        let noise = Tensor::randn_like(&prev_sample);
        self.cursor.advance();
        Ok(&prev_sample + noise * sigma_up)
    }

    /// Sigma-parameterized forward process: `original + sigma(t) * noise`.
    /// Timesteps must belong to the inference schedule.
    fn add_noise(
        &self,
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
        let mut sigmas = Vec::with_capacity(timesteps.len());
        for &t in timesteps {
            sigmas.push(self.sigmas[self.cursor.position_of(t)?]);
        }
        let sigmas = Tensor::from_slice(&sigmas)
            .view([-1, 1, 1, 1])
            .to_kind(original.kind())
            .to_device(original.device());
        Ok(original + &sigmas * noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{kind, Kind, Tensor};

    fn scheduler(steps: usize) -> EulerAncestralScheduler {
        EulerAncestralScheduler::new(steps, Default::default()).unwrap()
    }

    #[test]
    fn test_init_noise_sigma_matches_first_timestep() {
        let s = scheduler(20);
        let config = EulerAncestralSchedulerConfig::default();
        let schedule = NoiseSchedule::new(
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        )
        .unwrap();
        let expected = schedule.sigma(s.timesteps()[0]);
        assert!((s.init_noise_sigma() - expected).abs() < 1e-12);
        assert!(s.sigmas.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_scale_model_input_divides_by_sigma_norm() {
        let s = scheduler(10);
        let t = s.timesteps()[3];
        let sigma = s.sigmas[3];
        let sample = Tensor::ones([1, 4, 4, 4], kind::FLOAT_CPU);
        let scaled = s.scale_model_input(sample.shallow_clone(), t).unwrap();
        let restored = &scaled * (sigma.powi(2) + 1.).sqrt();
        let diff = (&restored - &sample).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_scale_model_input_rejects_unscheduled_timestep() {
        let s = scheduler(10);
        let sample = Tensor::ones([1, 4, 4, 4], kind::FLOAT_CPU);
        assert!(matches!(
            s.scale_model_input(sample, 123456),
            Err(DiffusionError::StateViolation(_))
        ));
    }

    #[test]
    fn test_add_noise_uses_sigma_of_each_batch_element() {
        let s = scheduler(10);
        let original = Tensor::zeros([2, 4, 4, 4], kind::FLOAT_CPU);
        let noise = Tensor::ones([2, 4, 4, 4], kind::FLOAT_CPU);
        let t0 = s.timesteps()[0];
        let t5 = s.timesteps()[5];
        let noised = s.add_noise(&original, &noise, &[t0, t5]).unwrap();
        for (i, sigma) in [s.sigmas[0], s.sigmas[5]].into_iter().enumerate() {
            let got = noised.get(i as i64).mean(Kind::Float).double_value(&[]);
            assert!((got - sigma).abs() < 1e-5);
        }
    }

    #[test]
    fn test_final_step_is_noise_free() {
        // sigma_to == 0 on the last transition, so the ancestral noise term
        // vanishes and the step lands exactly on the predicted original.
        let mut s = scheduler(4);
        let timesteps = s.timesteps().to_vec();
        s.begin_at(timesteps.len() - 1).unwrap();
        let last = *timesteps.last().unwrap();
        let sigma_from = s.sigmas[timesteps.len() - 1];
        let sample = Tensor::ones([1, 4, 4, 4], kind::FLOAT_CPU);
        let output = Tensor::ones([1, 4, 4, 4], kind::FLOAT_CPU) * 0.5;
        let prev = s.step(&output, last, &sample).unwrap();
        let expected = &sample - sigma_from * &output;
        let diff = (&prev - &expected).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_step_sequence_enforced() {
        let mut s = scheduler(5);
        let timesteps = s.timesteps().to_vec();
        let sample = Tensor::zeros([1, 4, 4, 4], kind::FLOAT_CPU);
        let output = Tensor::zeros([1, 4, 4, 4], kind::FLOAT_CPU);
        assert!(matches!(
            s.step(&output, timesteps[2], &sample),
            Err(DiffusionError::StateViolation(_))
        ));
        s.step(&output, timesteps[0], &sample).unwrap();
    }
}
