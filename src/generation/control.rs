use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tch::Tensor;

/// Snapshot emitted once per completed denoising step.
#[derive(Debug)]
pub struct DiffusionProgress {
    /// Completed steps so far (1-based).
    pub step: usize,
    /// Steps this run will execute in total.
    pub total_steps: usize,
    /// Current latents, populated only when previews were requested.
    pub latents: Option<Tensor>,
}

/// Callback type for progress updates
pub type ProgressCallback = Box<dyn Fn(DiffusionProgress) + Send + Sync>;

/// Cancellation handle for a running generation. Clones share one flag, so a
/// handle can be kept on another thread while the loop runs.
#[derive(Debug, Clone)]
pub struct GenerationControl {
    cancelled: Arc<AtomicBool>,
}

impl GenerationControl {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// Request cancellation; the loop stops after the step in flight.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the handle can drive a new generation.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

impl Default for GenerationControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_cancellation_flag() {
        let control = GenerationControl::new();
        let clone = control.clone();
        assert!(!clone.is_cancelled());
        control.cancel();
        assert!(clone.is_cancelled());
        clone.reset();
        assert!(!control.is_cancelled());
    }
}
