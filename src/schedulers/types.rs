use tch::Tensor;

use crate::error::DiffusionError;

/// Capability surface shared by all solver families.
///
/// A scheduler is owned by exactly one generation: `step` must be fed the
/// scheduled timesteps in their exact order, and stepping past the end of the
/// schedule is an error rather than a wrap-around.
pub trait Scheduler {
    fn timesteps(&self) -> &[usize];

    /// Standard deviation the initial pure-noise latent must be scaled by.
    fn init_noise_sigma(&self) -> f64;

    /// Skip the first `step_index` scheduled timesteps. Only legal before the
    /// first `step` call; used when a partially noised sample enters the
    /// schedule midway.
    fn begin_at(&mut self, step_index: usize) -> Result<(), DiffusionError>;

    /// Ensures interchangeability with families that need to scale the
    /// denoising model input depending on the current timestep.
    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor, DiffusionError>;

    /// Computes the sample at the previous timestep from the model output.
    /// Advances the internal position; neither input tensor is mutated.
    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor, DiffusionError>;

    /// Forward-noises `original` to the given per-batch-element trained
    /// timesteps. Stateless with respect to the stepping position.
    fn add_noise(
        &self,
        original: &Tensor,
        noise: &Tensor,
        timesteps: &[usize],
    ) -> Result<Tensor, DiffusionError>;
}

/// Owns the inference schedule and the expected-next-step position.
///
/// Lifecycle: constructed alongside the scheduler, advanced once per `step`,
/// exhausted after the final timestep. Any out-of-sequence use surfaces as a
/// `StateViolation`.
#[derive(Debug, Clone)]
pub(crate) struct StepCursor {
    timesteps: Vec<usize>,
    next: usize,
    started: bool,
}

impl StepCursor {
    pub fn new(timesteps: Vec<usize>) -> Self {
        Self { timesteps, next: 0, started: false }
    }

    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    /// Index of `timestep` in the schedule, independent of the current
    /// position. Used for pure per-timestep lookups.
    pub fn position_of(&self, timestep: usize) -> Result<usize, DiffusionError> {
        self.timesteps.iter().position(|&t| t == timestep).ok_or_else(|| {
            DiffusionError::StateViolation(format!("timestep {timestep} is not in the schedule"))
        })
    }

    pub fn begin_at(&mut self, step_index: usize) -> Result<(), DiffusionError> {
        if self.started {
            return Err(DiffusionError::StateViolation(
                "cannot move the starting position after stepping has begun".to_string(),
            ));
        }
        if step_index > self.timesteps.len() {
            return Err(DiffusionError::StateViolation(format!(
                "starting position {step_index} is outside the {}-step schedule",
                self.timesteps.len()
            )));
        }
        self.next = step_index;
        Ok(())
    }

    /// Validates that `timestep` is the expected next scheduled value and
    /// returns its index.
    pub fn expect(&self, timestep: usize) -> Result<usize, DiffusionError> {
        match self.timesteps.get(self.next) {
            None => Err(DiffusionError::StateViolation(format!(
                "schedule exhausted after {} steps, cannot step at timestep {timestep}",
                self.timesteps.len()
            ))),
            Some(&expected) if expected != timestep => Err(DiffusionError::StateViolation(format!(
                "out-of-sequence step: expected timestep {expected}, got {timestep}"
            ))),
            Some(_) => Ok(self.next),
        }
    }

    pub fn advance(&mut self) {
        self.next += 1;
        self.started = true;
    }
}
