//! Reference fixture generator.
//!
//! Runs the full text-to-latent pipeline once and captures the tensors every
//! stage boundary needs for cross-checking: the token ids of both prompts, the
//! seeded starting noise, the denoiser's first-step inputs and the latent
//! handed to the decoder.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::info;

use crate::config::{GeneratorConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::fixtures::{
    Fixture, FixtureRecorder, LATENTS, MetadataValue, TEXT_ENCODER, TEXT_ENCODER_EMPTY,
    TokenFixture, TrajectoryRecorder, UNET, VAE,
};
use crate::models::{Denoiser, TextEncoder};
use crate::noise::initial_latents;
use crate::sampling::{SamplingLoop, timestep_tensor};
use crate::scheduler::PndmScheduler;
use crate::tensor::ensure_dims;

/// Everything one generator run produces.
#[derive(Debug, Clone)]
pub struct GeneratedFixtures {
    pub tokens: TokenFixture,
    /// Ids of the empty prompt driving the unconditional branch.
    pub uncond_tokens: TokenFixture,
    /// The seeded starting noise, before `init_noise_sigma` scaling.
    pub latents: Fixture,
    pub unet: Fixture,
    pub vae: Fixture,
    pub trajectory: Option<Fixture>,
}

impl GeneratedFixtures {
    /// Serializes every fixture, then writes them all into `dir`.
    pub fn write_all(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut recorder = FixtureRecorder::new(dir);
        recorder.record_tokens(TEXT_ENCODER, &self.tokens)?;
        recorder.record_tokens(TEXT_ENCODER_EMPTY, &self.uncond_tokens)?;
        recorder.record(&self.latents)?;
        recorder.record(&self.unet)?;
        recorder.record(&self.vae)?;
        if let Some(trajectory) = &self.trajectory {
            recorder.record(trajectory)?;
        }
        recorder.flush()
    }
}

pub struct FixtureGenerator<E: TextEncoder, D: Denoiser> {
    config: GeneratorConfig,
    scheduler_config: SchedulerConfig,
    text_encoder: E,
    denoiser: D,
    device: Device,
}

impl<E: TextEncoder, D: Denoiser> FixtureGenerator<E, D> {
    pub fn new(
        config: GeneratorConfig,
        scheduler_config: SchedulerConfig,
        text_encoder: E,
        denoiser: D,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        scheduler_config.validate()?;
        Ok(Self {
            config,
            scheduler_config,
            text_encoder,
            denoiser,
            device,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn denoiser(&self) -> &D {
        &self.denoiser
    }

    /// Runs the pipeline for the conditional prompt `tokens`, using
    /// `uncond_tokens` (the empty prompt padded to the same length) for the
    /// unconditional branch.
    pub fn generate(
        &mut self,
        tokens: &TokenFixture,
        uncond_tokens: &TokenFixture,
    ) -> Result<GeneratedFixtures> {
        let config = self.config.clone();
        self.check_tokens("input_ids", tokens)?;
        self.check_tokens("uncond_input_ids", uncond_tokens)?;
        if tokens.prompt != config.prompt {
            return Err(Error::InvalidConfig(format!(
                "token fixture prompt {:?} does not match configured prompt {:?}",
                tokens.prompt, config.prompt
            )));
        }

        info!("Running text encoder...");
        let text_embeddings = self.encode(tokens)?;
        let uncond_embeddings = self.encode(uncond_tokens)?;
        ensure_dims(
            "text_encoder",
            "uncond_embeddings",
            &uncond_embeddings,
            text_embeddings.dims(),
        )?;
        let text_embeddings = Tensor::cat(&[&uncond_embeddings, &text_embeddings], 0)?;
        info!("Text embeddings shape: {:?}", text_embeddings.dims());

        let latent_shape = config.latent_shape();
        let latents = initial_latents(config.seed, &latent_shape, &self.device)?;
        info!("Initial latents shape: {:?} (seed {})", latent_shape, config.seed);
        let latents_fixture = Fixture::capture(
            LATENTS,
            [("latents", &latents)],
            [("seed", MetadataValue::Number(config.seed as f64))],
        )?;

        let mut scheduler = PndmScheduler::new(self.scheduler_config.clone());
        scheduler.configure(
            config.num_inference_steps,
            self.scheduler_config.num_train_timesteps,
        )?;

        // Standalone snapshot of the first denoiser call; the loop below
        // recomputes the same input on its own.
        let unet = {
            let latents = (&latents * scheduler.init_noise_sigma()?)?;
            let t = scheduler.timesteps()[0];
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, t)?;
            let timestep = timestep_tensor(t, &self.device)?;
            Fixture::capture(
                UNET,
                [
                    ("latent_model_input", &latent_model_input),
                    ("timestep", &timestep),
                    ("text_embeddings", &text_embeddings),
                ],
                [],
            )?
        };

        info!("Running denoising loop...");
        let sampling = SamplingLoop::new(config.guidance_scale, config.vae_scaling_factor);
        let mut trajectory = TrajectoryRecorder::new(config.snapshot_steps.iter().copied());
        let decoder_latents = sampling.run_observed(
            &latents,
            &text_embeddings,
            &mut scheduler,
            &mut self.denoiser,
            &mut trajectory,
        )?;
        ensure_dims("vae", "latents", &decoder_latents, &latent_shape)?;

        let vae = Fixture::capture(VAE, [("latents", &decoder_latents)], [])?;
        let trajectory = if trajectory.is_empty() {
            None
        } else {
            let fixture = trajectory.into_fixture()?;
            let mut metadata = fixture.metadata().clone();
            metadata.insert(
                "prompt".to_string(),
                MetadataValue::TextList(config.prompt.clone()),
            );
            metadata.insert(
                "guidance_scale".to_string(),
                MetadataValue::Number(config.guidance_scale),
            );
            Some(Fixture::from_parts(
                fixture.name(),
                fixture.tensors().clone(),
                metadata,
            )?)
        };
        info!("Decoder input latents shape: {:?}", decoder_latents.dims());

        Ok(GeneratedFixtures {
            tokens: tokens.clone(),
            uncond_tokens: uncond_tokens.clone(),
            latents: latents_fixture,
            unet,
            vae,
            trajectory,
        })
    }

    fn check_tokens(&self, name: &str, tokens: &TokenFixture) -> Result<()> {
        tokens.validate()?;
        let expected = [self.config.batch_size(), self.config.max_length];
        if tokens.shape != expected {
            return Err(Error::shape("tokenizer", name, &expected, &tokens.shape));
        }
        Ok(())
    }

    fn encode(&mut self, tokens: &TokenFixture) -> Result<Tensor> {
        let input_ids = tokens.to_tensor(&self.device)?;
        let embeddings = self.text_encoder.encode(&input_ids)?;
        let (batch, seq_len, _) = embeddings.dims3()?;
        if [batch, seq_len] != [tokens.shape[0], tokens.shape[1]] {
            return Err(Error::shape(
                "text_encoder",
                "text_embeddings",
                &[tokens.shape[0], tokens.shape[1], embeddings.dim(2)?],
                embeddings.dims(),
            ));
        }
        Ok(embeddings)
    }
}
