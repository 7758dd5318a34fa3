pub mod control;
pub mod types;

pub use control::{DiffusionProgress, GenerationControl, ProgressCallback};
pub use types::{GenerateOptions, LatentCodec, NoisePredictor, PromptOptions};

use tch::{Kind, Tensor};

use crate::batch::{BatchOptions, BatchRun};
use crate::error::{DiffusionError, GenerationOutcome};

/// Drives complete generations against an external denoising network.
///
/// Each run owns its scheduler and latents; the pipeline itself holds no
/// per-run state, so one pipeline can serve any number of sequential runs.
pub struct DiffusionPipeline<P: NoisePredictor> {
    predictor: P,
    device: tch::Device,
}

impl<P: NoisePredictor> DiffusionPipeline<P> {
    pub fn new(predictor: P, device: tch::Device) -> Self {
        Self { predictor, device }
    }

    /// Runs one generation to its final latent tensor.
    ///
    /// Pure-noise start for text-to-image; when `prompt.source_latent` is set
    /// the source is partially noised according to `options.strength` and the
    /// schedule is entered midway. The cancellation flag is checked once per
    /// completed step.
    pub fn generate(
        &self,
        prompt: &PromptOptions,
        options: &GenerateOptions,
        progress: Option<&ProgressCallback>,
        control: &GenerationControl,
    ) -> Result<GenerationOutcome, DiffusionError> {
        options.validate()?;
        let guidance_enabled = options.guidance_scale != 1.;
        let unconditioning = match (guidance_enabled, prompt.unconditioning.as_ref()) {
            (true, None) => {
                return Err(DiffusionError::Configuration(
                    "guidance_scale != 1 requires an unconditional embedding".to_string(),
                ))
            }
            (true, Some(unconditioning)) => Some(unconditioning),
            (false, _) => None,
        };

        let mut scheduler = options.scheduler.build(options.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let shape = options.latent_shape();
        tch::manual_seed(options.seed);

        let start = match &prompt.source_latent {
            None => 0,
            Some(_) => {
                let noising_steps =
                    ((options.steps as f64 * options.strength).round() as usize).min(options.steps);
                options.steps - noising_steps
            }
        };
        let mut latents = match &prompt.source_latent {
            None => {
                // scale the initial noise by the standard deviation required
                // by the scheduler
                Tensor::randn(shape, (Kind::Float, self.device)) * scheduler.init_noise_sigma()
            }
            Some(source) => {
                if source.size() != shape {
                    return Err(DiffusionError::ShapeMismatch {
                        expected: shape.to_vec(),
                        actual: source.size(),
                    });
                }
                scheduler.begin_at(start)?;
                let source = source.to_device(self.device);
                if start == timesteps.len() {
                    // strength 0: nothing to denoise
                    source
                } else {
                    let noise = Tensor::randn(shape, (Kind::Float, self.device));
                    scheduler.add_noise(&source, &noise, &[timesteps[start]])?
                }
            }
        };

        let run_timesteps = &timesteps[start..];
        let total = run_timesteps.len();
        tracing::debug!(total, start, "starting denoising loop");

        for (i, &timestep) in run_timesteps.iter().enumerate() {
            let scaled = scheduler.scale_model_input(latents.shallow_clone(), timestep)?;
            let conditional =
                self.predict_checked(&scaled, &prompt.conditioning, timestep, &shape)?;
            let noise_pred = match unconditioning {
                Some(unconditioning) => {
                    let unconditional =
                        self.predict_checked(&scaled, unconditioning, timestep, &shape)?;
                    &unconditional + (conditional - &unconditional) * options.guidance_scale
                }
                None => conditional,
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!(step = i + 1, total, timestep, "denoise step");
            if let Some(callback) = progress {
                let preview = prompt.preview_latents.then(|| latents.shallow_clone());
                callback(DiffusionProgress { step: i + 1, total_steps: total, latents: preview });
            }
            if control.is_cancelled() {
                tracing::info!(step = i + 1, total, "generation cancelled");
                return Ok(GenerationOutcome::Cancelled);
            }
        }
        tracing::info!(steps = total, "denoising complete");
        Ok(GenerationOutcome::Complete(latents))
    }

    /// Like [`generate`](Self::generate), with the final latents decoded to an
    /// image tensor through the caller's codec.
    pub fn generate_image(
        &self,
        codec: &dyn LatentCodec,
        prompt: &PromptOptions,
        options: &GenerateOptions,
        progress: Option<&ProgressCallback>,
        control: &GenerationControl,
    ) -> Result<GenerationOutcome, DiffusionError> {
        match self.generate(prompt, options, progress, control)? {
            GenerationOutcome::Complete(latents) => {
                let image = codec.decode(&latents)?;
                Ok(GenerationOutcome::Complete(image))
            }
            GenerationOutcome::Cancelled => Ok(GenerationOutcome::Cancelled),
        }
    }

    /// Lazy parameter sweep: one full generation per pulled item.
    pub fn generate_batch<'a>(
        &'a self,
        prompt: &'a PromptOptions,
        options: &GenerateOptions,
        batch: &BatchOptions,
        progress: Option<&'a ProgressCallback>,
        control: &GenerationControl,
    ) -> BatchRun<'a, P> {
        BatchRun::new(self, prompt, options.clone(), batch.clone(), progress, control.clone())
    }

    fn predict_checked(
        &self,
        latents: &Tensor,
        conditioning: &Tensor,
        timestep: usize,
        expected: &[i64; 4],
    ) -> Result<Tensor, DiffusionError> {
        let prediction = self.predictor.predict(latents, conditioning, timestep)?;
        if prediction.size() != *expected {
            return Err(DiffusionError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: prediction.size(),
            });
        }
        Ok(prediction)
    }
}
