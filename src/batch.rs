//! Lazy parameter sweeps: one generation per pulled item, nothing computed
//! ahead of the consumer.

use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::error::{DiffusionError, GenerationOutcome};
use crate::generation::{
    DiffusionPipeline, GenerateOptions, GenerationControl, NoisePredictor, ProgressCallback,
    PromptOptions,
};

/// Which parameter the sweep varies; everything else stays fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", content = "sweep")]
pub enum BatchMode {
    SeedSequence { start: i64, increment: i64 },
    StrengthSequence { start: f64, increment: f64 },
    StepSequence { start: usize, increment: usize },
}

impl BatchMode {
    /// The i-th swept options. Strength is clamped into its valid range and
    /// step counts never drop below one.
    fn apply(&self, base: &GenerateOptions, index: usize) -> GenerateOptions {
        let mut options = base.clone();
        match *self {
            BatchMode::SeedSequence { start, increment } => {
                options.seed = start + increment * index as i64;
            }
            BatchMode::StrengthSequence { start, increment } => {
                options.strength = (start + increment * index as f64).clamp(0., 1.);
            }
            BatchMode::StepSequence { start, increment } => {
                options.steps = (start + increment * index).max(1);
            }
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    pub mode: BatchMode,
    pub count: usize,
}

/// One sweep entry: the concrete options the run used and its final latents.
#[derive(Debug)]
pub struct BatchResult {
    pub options: GenerateOptions,
    pub latents: Tensor,
}

/// Pull-based sweep over generations.
///
/// Yields exactly `count` results in sweep order unless iteration ends early:
/// dropping the iterator, a failing run (the error is yielded, the remainder
/// of the sweep is abandoned), or cancellation (iteration just ends). Runs are
/// strictly serial; generation `i + 1` never starts before `i` finished.
pub struct BatchRun<'a, P: NoisePredictor> {
    pipeline: &'a DiffusionPipeline<P>,
    prompt: &'a PromptOptions,
    base: GenerateOptions,
    batch: BatchOptions,
    progress: Option<&'a ProgressCallback>,
    control: GenerationControl,
    produced: usize,
    halted: bool,
}

impl<'a, P: NoisePredictor> BatchRun<'a, P> {
    pub(crate) fn new(
        pipeline: &'a DiffusionPipeline<P>,
        prompt: &'a PromptOptions,
        base: GenerateOptions,
        batch: BatchOptions,
        progress: Option<&'a ProgressCallback>,
        control: GenerationControl,
    ) -> Self {
        Self { pipeline, prompt, base, batch, progress, control, produced: 0, halted: false }
    }
}

impl<P: NoisePredictor> Iterator for BatchRun<'_, P> {
    type Item = Result<BatchResult, DiffusionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted || self.produced >= self.batch.count || self.control.is_cancelled() {
            return None;
        }
        let options = self.batch.mode.apply(&self.base, self.produced);
        self.produced += 1;
        match self.pipeline.generate(self.prompt, &options, self.progress, &self.control) {
            Ok(GenerationOutcome::Complete(latents)) => Some(Ok(BatchResult { options, latents })),
            Ok(GenerationOutcome::Cancelled) => {
                self.halted = true;
                None
            }
            Err(error) => {
                self.halted = true;
                Some(Err(error))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.halted {
            (0, Some(0))
        } else {
            (0, Some(self.batch.count - self.produced))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tch::{kind, Device, Tensor};

    use super::*;

    struct FlatPredictor {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl NoisePredictor for FlatPredictor {
        fn predict(
            &self,
            latents: &Tensor,
            _conditioning: &Tensor,
            _timestep: usize,
        ) -> anyhow::Result<Tensor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("predictor offline");
            }
            Ok(latents * 0.1)
        }
    }

    fn pipeline(calls: Arc<AtomicUsize>, fail: bool) -> DiffusionPipeline<FlatPredictor> {
        DiffusionPipeline::new(FlatPredictor { calls, fail }, Device::Cpu)
    }

    fn base_options() -> GenerateOptions {
        GenerateOptions { steps: 2, width: 64, height: 64, guidance_scale: 1., ..Default::default() }
    }

    fn prompt() -> PromptOptions {
        PromptOptions::text(Tensor::ones([1, 8], kind::FLOAT_CPU))
    }

    #[test]
    fn test_seed_sweep_yields_the_arithmetic_sequence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = pipeline(calls, false);
        let prompt = prompt();
        let batch = BatchOptions {
            mode: BatchMode::SeedSequence { start: 100, increment: 5 },
            count: 4,
        };
        let seeds: Vec<i64> = p
            .generate_batch(&prompt, &base_options(), &batch, None, &GenerationControl::new())
            .map(|r| r.unwrap().options.seed)
            .collect();
        assert_eq!(seeds, vec![100, 105, 110, 115]);
    }

    #[test]
    fn test_early_termination_skips_remaining_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = pipeline(calls.clone(), false);
        let prompt = prompt();
        let batch = BatchOptions {
            mode: BatchMode::SeedSequence { start: 0, increment: 1 },
            count: 10,
        };
        let taken: Vec<_> = p
            .generate_batch(&prompt, &base_options(), &batch, None, &GenerationControl::new())
            .take(2)
            .collect();
        assert_eq!(taken.len(), 2);
        // two runs at two steps each
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_strength_sweep_clamps_into_range() {
        let batch = BatchMode::StrengthSequence { start: 0.8, increment: 0.3 };
        let swept = batch.apply(&base_options(), 2);
        assert_eq!(swept.strength, 1.);
    }

    #[test]
    fn test_step_sweep_never_drops_below_one_step() {
        let base = base_options();
        let mode = BatchMode::StepSequence { start: 4, increment: 2 };
        assert_eq!(mode.apply(&base, 0).steps, 4);
        assert_eq!(mode.apply(&base, 3).steps, 10);
        // a zero start is clamped rather than producing an invalid run
        let degenerate = BatchMode::StepSequence { start: 0, increment: 0 };
        assert_eq!(degenerate.apply(&base, 0).steps, 1);
    }

    #[test]
    fn test_step_sweep_runs_with_the_swept_step_count() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = pipeline(calls.clone(), false);
        let prompt = prompt();
        let batch = BatchOptions {
            mode: BatchMode::StepSequence { start: 1, increment: 1 },
            count: 3,
        };
        let produced: Vec<_> = p
            .generate_batch(&prompt, &base_options(), &batch, None, &GenerationControl::new())
            .map(|r| r.unwrap().options.steps)
            .collect();
        assert_eq!(produced, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_failing_run_halts_the_sweep() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = pipeline(calls, true);
        let prompt = prompt();
        let batch = BatchOptions {
            mode: BatchMode::SeedSequence { start: 0, increment: 1 },
            count: 5,
        };
        let mut run =
            p.generate_batch(&prompt, &base_options(), &batch, None, &GenerationControl::new());
        assert!(matches!(run.next(), Some(Err(DiffusionError::Collaborator(_)))));
        assert!(run.next().is_none());
    }

    #[test]
    fn test_cancellation_ends_iteration_without_results() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = pipeline(calls.clone(), false);
        let prompt = prompt();
        let control = GenerationControl::new();
        control.cancel();
        let batch = BatchOptions {
            mode: BatchMode::SeedSequence { start: 0, increment: 1 },
            count: 5,
        };
        let mut run = p.generate_batch(&prompt, &base_options(), &batch, None, &control);
        assert!(run.next().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
