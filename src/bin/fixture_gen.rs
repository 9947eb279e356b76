//! Reference fixture generator
//!
//! Runs the guided sampling loop once and writes the stage-boundary fixtures
//! (`text_encoder.json`, `text_encoder_empty.json`, `latents.json`,
//! `unet.json`, `vae.json` and optionally `trajectory.json`) into the output
//! directory.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin fixture-gen -- \
//!     --tokens castle_tokens.json \
//!     --uncond-tokens empty_tokens.json \
//!     --scheduler-config scheduler_config.json \
//!     --output-dir fixtures
//! ```
//!
//! The networks are the closed-form mocks, so the run needs no weights.

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use candle_sd_fixtures::{
    FixtureGenerator, GeneratorConfig, SchedulerConfig, TokenFixture,
    models::{MockDenoiser, MockTextEncoder},
};

/// Command line arguments for fixture generation
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate cross-implementation reference fixtures for the diffusion pipeline"
)]
struct Args {
    /// Generator configuration (JSON); missing keys take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Diffusers-style scheduler_config.json (defaults to the v-prediction
    /// reference setup)
    #[arg(long)]
    scheduler_config: Option<PathBuf>,

    /// Token fixture for the prompt
    #[arg(long)]
    tokens: PathBuf,

    /// Token fixture for the empty prompt
    #[arg(long)]
    uncond_tokens: PathBuf,

    /// Output directory for the fixture files
    #[arg(short, long, default_value = "fixtures")]
    output_dir: PathBuf,

    /// Override the prompt
    #[arg(short, long)]
    prompt: Option<String>,

    /// Override the image height (multiple of 8)
    #[arg(long)]
    height: Option<usize>,

    /// Override the image width (multiple of 8)
    #[arg(long)]
    width: Option<usize>,

    /// Override the number of inference steps
    #[arg(long)]
    num_inference_steps: Option<usize>,

    /// Override the classifier-free guidance scale
    #[arg(long)]
    guidance_scale: Option<f64>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Steps whose latent is written to trajectory.json (comma separated)
    #[arg(long, value_delimiter = ',')]
    snapshot_steps: Vec<usize>,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,
}

impl Args {
    fn generator_config(&self) -> Result<GeneratorConfig> {
        let mut config = match &self.config {
            Some(path) => GeneratorConfig::from_json_file(path)
                .with_context(|| format!("Failed to load generator config {:?}", path))?,
            None => GeneratorConfig::default(),
        };
        if let Some(prompt) = &self.prompt {
            config.prompt = vec![prompt.clone()];
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(steps) = self.num_inference_steps {
            config.num_inference_steps = steps;
        }
        if let Some(guidance_scale) = self.guidance_scale {
            config.guidance_scale = guidance_scale;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if !self.snapshot_steps.is_empty() {
            config.snapshot_steps = self.snapshot_steps.clone();
        }
        config.validate().context("Invalid generator configuration")?;
        Ok(config)
    }

    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        match &self.scheduler_config {
            Some(path) => SchedulerConfig::from_json_file(path)
                .with_context(|| format!("Failed to load scheduler config {:?}", path)),
            None => {
                warn!("No scheduler config given, using the reference v-prediction setup");
                Ok(SchedulerConfig::reference())
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_sd_fixtures=info".parse()?)
                .add_directive("fixture_gen=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.generator_config()?;
    let scheduler_config = args.scheduler_config()?;

    info!("Reference Fixture Generator");
    info!("===========================");
    info!("Prompt: {:?}", config.prompt);
    info!("Image: {}x{}", config.width, config.height);
    info!("Inference steps: {}", config.num_inference_steps);
    info!("Guidance scale: {}", config.guidance_scale);
    info!("Seed: {}", config.seed);
    info!("Prediction type: {:?}", scheduler_config.prediction_type);

    let device = if args.cpu {
        info!("Using CPU");
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };

    let tokens = TokenFixture::read(&args.tokens)
        .with_context(|| format!("Failed to read token fixture {:?}", args.tokens))?;
    let uncond_tokens = TokenFixture::read(&args.uncond_tokens)
        .with_context(|| format!("Failed to read token fixture {:?}", args.uncond_tokens))?;

    let text_encoder = MockTextEncoder::new(config.hidden_size, device.clone());
    let mut generator = FixtureGenerator::new(
        config,
        scheduler_config,
        text_encoder,
        MockDenoiser::new(),
        device,
    )?;

    let start = std::time::Instant::now();
    let fixtures = generator
        .generate(&tokens, &uncond_tokens)
        .context("Fixture generation failed")?;
    info!(
        "Generation finished in {:.2}s ({} denoiser calls)",
        start.elapsed().as_secs_f64(),
        generator.denoiser().calls()
    );

    let written = fixtures
        .write_all(&args.output_dir)
        .with_context(|| format!("Failed to write fixtures to {:?}", args.output_dir))?;
    for path in &written {
        info!("Wrote {:?}", path);
    }

    Ok(())
}
