use anyhow::Result;
use clap::Parser;
use tch::{kind, Kind, Tensor};

use latentloop_rs::batch::{BatchMode, BatchOptions};
use latentloop_rs::generation::{
    DiffusionPipeline, GenerateOptions, GenerationControl, NoisePredictor, PromptOptions,
};
use latentloop_rs::utils::get_device;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "100")]
    start_seed: i64,

    #[arg(long, default_value = "1")]
    increment: i64,

    #[arg(long, default_value = "4")]
    count: usize,

    #[arg(long, default_value = "10")]
    n_steps: usize,
}

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
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = get_device();
    let pipeline = DiffusionPipeline::new(DampedPredictor, device);
    let prompt =
        PromptOptions::text(Tensor::ones([1, 77, 768], kind::FLOAT_CPU).to_device(device));
    let options = GenerateOptions {
        steps: args.n_steps,
        guidance_scale: 1.,
        ..Default::default()
    };
    let batch = BatchOptions {
        mode: BatchMode::SeedSequence { start: args.start_seed, increment: args.increment },
        count: args.count,
    };

    let control = GenerationControl::new();
    for result in pipeline.generate_batch(&prompt, &options, &batch, None, &control) {
        let result = result?;
        let mean = result.latents.mean(Kind::Float).double_value(&[]);
        println!("seed {} -> latent mean {mean:.5}", result.options.seed);
    }
    Ok(())
}
