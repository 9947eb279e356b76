//! Configuration for the scheduler and the reference generator.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How beta ranges from its minimum value to the maximum during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

/// What the denoiser predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// The noise added to the sample.
    Epsilon,
    /// The velocity `sqrt(a) * eps - sqrt(1 - a) * x0`.
    VPrediction,
}

/// Scheduler configuration, readable from a diffusers `scheduler_config.json`.
///
/// Keys the scheduler does not use (`_class_name`, `skip_prk_steps`, ...) are
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    /// Number of diffusion steps used to train the model.
    pub num_train_timesteps: usize,
    /// Added to every inference timestep.
    pub steps_offset: usize,
    pub prediction_type: PredictionType,
    /// Use `1.0` instead of `alphas_cumprod[0]` past the last timestep.
    pub set_alpha_to_one: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            num_train_timesteps: 1000,
            steps_offset: 1,
            prediction_type: PredictionType::Epsilon,
            set_alpha_to_one: false,
        }
    }
}

impl SchedulerConfig {
    /// Configuration of the reference model, a v-prediction network.
    ///
    /// `Default` keeps the diffusers defaults (epsilon); the generator falls
    /// back to this when no scheduler config file is given.
    pub fn reference() -> Self {
        Self {
            prediction_type: PredictionType::VPrediction,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps < 2 {
            return Err(Error::InvalidConfig(format!(
                "num_train_timesteps must be at least 2, got {}",
                self.num_train_timesteps
            )));
        }
        if !(self.beta_start > 0.0 && self.beta_end < 1.0 && self.beta_start <= self.beta_end) {
            return Err(Error::InvalidConfig(format!(
                "betas must satisfy 0 < beta_start <= beta_end < 1, got [{}, {}]",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }
}

/// The configuration surface of the reference generator.
///
/// The defaults reproduce the reference run: one prompt, 512x512, 25 steps,
/// guidance 7.5, seed 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub prompt: Vec<String>,
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    /// Denoiser input channels.
    pub latent_channels: usize,
    /// Token sequence length the text encoder was trained with.
    pub max_length: usize,
    /// Text encoder hidden size, only used by the mock encoder.
    pub hidden_size: usize,
    /// Steps whose resulting latent is captured into the trajectory fixture.
    pub snapshot_steps: Vec<usize>,
    /// VAE latent scaling; the decoder receives `latents / vae_scaling_factor`.
    pub vae_scaling_factor: f64,
}

pub const VAE_SPATIAL_COMPRESSION: usize = 8;

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            prompt: vec!["a castle".to_string()],
            height: 512,
            width: 512,
            num_inference_steps: 25,
            guidance_scale: 7.5,
            seed: 0,
            latent_channels: 4,
            max_length: 77,
            hidden_size: 768,
            snapshot_steps: Vec::new(),
            vae_scaling_factor: 0.18215,
        }
    }
}

impl GeneratorConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Derived from the prompt count.
    pub fn batch_size(&self) -> usize {
        self.prompt.len()
    }

    /// `[batch, channels, height / 8, width / 8]`
    pub fn latent_shape(&self) -> [usize; 4] {
        [
            self.batch_size(),
            self.latent_channels,
            self.height / VAE_SPATIAL_COMPRESSION,
            self.width / VAE_SPATIAL_COMPRESSION,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.prompt.is_empty() {
            return invalid("prompt list is empty".into());
        }
        if self.prompt.len() != 1 {
            return invalid(format!(
                "exactly one prompt is supported, got {}",
                self.prompt.len()
            ));
        }
        for (name, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % VAE_SPATIAL_COMPRESSION != 0 {
                return invalid(format!(
                    "{name} must be a positive multiple of {VAE_SPATIAL_COMPRESSION}, got {value}"
                ));
            }
        }
        if self.num_inference_steps == 0 {
            return invalid("num_inference_steps must be at least 1".into());
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return invalid(format!(
                "guidance_scale must be finite and >= 0, got {}",
                self.guidance_scale
            ));
        }
        if self.latent_channels == 0 || self.max_length == 0 || self.hidden_size == 0 {
            return invalid("latent_channels, max_length and hidden_size must be positive".into());
        }
        if let Some(&step) = self
            .snapshot_steps
            .iter()
            .find(|&&s| s >= self.num_inference_steps)
        {
            return invalid(format!(
                "snapshot step {step} is outside the {}-step schedule",
                self.num_inference_steps
            ));
        }
        if !(self.vae_scaling_factor.is_finite() && self.vae_scaling_factor > 0.0) {
            return invalid(format!(
                "vae_scaling_factor must be positive, got {}",
                self.vae_scaling_factor
            ));
        }
        Ok(())
    }
}
