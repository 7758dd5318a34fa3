use std::fs;

use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::error::DiffusionError;
use crate::schedulers::SchedulerKind;

/// Denoising network collaborator. Called once (or twice, for guided runs)
/// per timestep; the returned prediction must match the latent shape.
pub trait NoisePredictor {
    fn predict(
        &self,
        latents: &Tensor,
        conditioning: &Tensor,
        timestep: usize,
    ) -> anyhow::Result<Tensor>;
}

/// Image/latent conversion collaborator: source images into latents and final
/// latents back into pixel space.
pub trait LatentCodec {
    fn encode(&self, image: &Tensor) -> anyhow::Result<Tensor>;
    fn decode(&self, latents: &Tensor) -> anyhow::Result<Tensor>;
}

/// Pre-encoded inputs for a single generation. Embeddings come from the
/// caller's text encoder; the source latent, when present, comes from the
/// caller's codec and switches the run to image-to-image.
pub struct PromptOptions {
    pub conditioning: Tensor,
    pub unconditioning: Option<Tensor>,
    pub source_latent: Option<Tensor>,
    pub preview_latents: bool,
}

impl PromptOptions {
    pub fn text(conditioning: Tensor) -> Self {
        Self { conditioning, unconditioning: None, source_latent: None, preview_latents: false }
    }

    pub fn with_unconditioning(mut self, unconditioning: Tensor) -> Self {
        self.unconditioning = Some(unconditioning);
        self
    }

    pub fn with_source_latent(mut self, source_latent: Tensor) -> Self {
        self.source_latent = Some(source_latent);
        self
    }

    pub fn with_previews(mut self) -> Self {
        self.preview_latents = true;
        self
    }
}

/// Per-run sampling parameters. Immutable once handed to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub steps: usize,
    pub width: i64,
    pub height: i64,
    /// Interpolation factor amplifying the conditional prediction over the
    /// unconditional one; 1.0 disables guidance.
    pub guidance_scale: f64,
    /// Fraction of the schedule applied when starting from a source image.
    pub strength: f64,
    pub seed: i64,
    pub scheduler: SchedulerKind,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            steps: 20,
            width: 512,
            height: 512,
            guidance_scale: 7.5,
            strength: 0.75,
            seed: 0,
            scheduler: SchedulerKind::default(),
        }
    }
}

impl GenerateOptions {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: GenerateOptions = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), DiffusionError> {
        if self.steps == 0 {
            return Err(DiffusionError::Configuration("steps must be positive".to_string()));
        }
        if self.width <= 0 || self.height <= 0 || self.width % 8 != 0 || self.height % 8 != 0 {
            return Err(DiffusionError::Configuration(format!(
                "width and height must be positive multiples of 8, got {}x{}",
                self.width, self.height
            )));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(DiffusionError::Configuration(format!(
                "strength must be within [0, 1], got {}",
                self.strength
            )));
        }
        if self.guidance_scale < 0. {
            return Err(DiffusionError::Configuration(format!(
                "guidance_scale must be non-negative, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }

    pub(crate) fn latent_shape(&self) -> [i64; 4] {
        [1, 4, self.height / 8, self.width / 8]
    }
}
