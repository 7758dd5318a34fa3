use anyhow::Result;
use clap::Parser;
use tch::{kind, Kind, Tensor};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;

use latentloop_rs::error::GenerationOutcome;
use latentloop_rs::generation::{
    DiffusionPipeline, GenerateOptions, GenerationControl, NoisePredictor, ProgressCallback,
    PromptOptions,
};
use latentloop_rs::schedulers::SchedulerKind;
use latentloop_rs::utils::get_device;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scheduler config to load, e.g. src/schedulers/config.ddim.default.toml
    #[arg(long)]
    scheduler_config: Option<String>,

    #[arg(long, default_value = "20")]
    n_steps: usize,

    #[arg(long, default_value = "9527")]
    seed: i64,

    #[arg(long, default_value = "512")]
    width: i64,

    #[arg(long, default_value = "512")]
    height: i64,

    #[arg(long, default_value = "7.5")]
    guidance_scale: f64,

    /// Write a chrome trace of the run.
    #[arg(long)]
    tracing: bool,
}

/// Stand-in for the denoising network so the sampling loop can run end to end
/// without model weights: predicts a damped copy of the current latents.
struct DampedPredictor;

impl NoisePredictor for DampedPredictor {
    fn predict(
        &self,
        latents: &Tensor,
        _conditioning: &Tensor,
        _timestep: usize,
    ) -> Result<Tensor> {
        Ok(latents * 0.2)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt::init();
        None
    };

    let scheduler = match &args.scheduler_config {
        Some(path) => SchedulerKind::from_file(path)?,
        None => SchedulerKind::default(),
    };
    let options = GenerateOptions {
        steps: args.n_steps,
        width: args.width,
        height: args.height,
        guidance_scale: args.guidance_scale,
        seed: args.seed,
        scheduler,
        ..Default::default()
    };

    let device = get_device();
    let pipeline = DiffusionPipeline::new(DampedPredictor, device);
    let prompt = PromptOptions::text(Tensor::ones([1, 77, 768], kind::FLOAT_CPU).to_device(device))
        .with_unconditioning(Tensor::zeros([1, 77, 768], kind::FLOAT_CPU).to_device(device));

    let progress: ProgressCallback = Box::new(|p| {
        println!("step {}/{}", p.step, p.total_steps);
    });
    let control = GenerationControl::new();

    match pipeline.generate(&prompt, &options, Some(&progress), &control)? {
        GenerationOutcome::Complete(latents) => {
            let mean = latents.mean(Kind::Float).double_value(&[]);
            let std = latents.std(true).double_value(&[]);
            println!("final latents {:?}, mean {mean:.5}, std {std:.5}", latents.size());
        }
        GenerationOutcome::Cancelled => println!("cancelled"),
    }
    Ok(())
}
