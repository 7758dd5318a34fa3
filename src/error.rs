use tch::Tensor;
use thiserror::Error;

/// Failure taxonomy for schedulers and the generation loop.
///
/// `Configuration` is only ever raised while building options or a scheduler,
/// never mid-run. `StateViolation` means the caller drove a scheduler outside
/// its timestep sequence and is always fatal to the current run.
#[derive(Debug, Error)]
pub enum DiffusionError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("scheduler state violation: {0}")]
    StateViolation(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    /// Failure inside an external collaborator (noise predictor or codec).
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

/// Terminal result of one generation.
///
/// Cancellation is neither a success carrying a tensor nor an error; a
/// cancelled run produces no partial latents.
#[derive(Debug)]
pub enum GenerationOutcome {
    Complete(Tensor),
    Cancelled,
}

impl GenerationOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationOutcome::Cancelled)
    }

    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            GenerationOutcome::Complete(t) => Some(t),
            GenerationOutcome::Cancelled => None,
        }
    }
}
