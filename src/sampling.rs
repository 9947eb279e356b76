//! The guided denoising loop.

use std::ops::ControlFlow;

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::guidance;
use crate::models::Denoiser;
use crate::scheduler::PndmScheduler;
use crate::tensor::{ensure_dims, ensure_same_shape};

/// Hooks into the loop at step boundaries.
///
/// Returning `ControlFlow::Break` from `on_step_end` cancels the run before
/// the next step starts; a step in progress is never interrupted.
pub trait StepObserver {
    /// Sees the scaled batch-of-2 input handed to the denoiser.
    fn on_model_input(&mut self, _step: usize, _timestep: usize, _input: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Sees the latent produced by `step`.
    fn on_step_end(
        &mut self,
        _step: usize,
        _timestep: usize,
        _latents: &Tensor,
    ) -> Result<ControlFlow<()>> {
        Ok(ControlFlow::Continue(()))
    }
}

/// Observer that does nothing.
impl StepObserver for () {}

/// Drives the denoiser, guidance and scheduler over the full schedule.
#[derive(Debug, Clone)]
pub struct SamplingLoop {
    pub guidance_scale: f64,
    /// The returned latent is divided by this factor for the decoder.
    pub vae_scaling_factor: f64,
}

impl SamplingLoop {
    pub fn new(guidance_scale: f64, vae_scaling_factor: f64) -> Self {
        Self {
            guidance_scale,
            vae_scaling_factor,
        }
    }

    /// Runs every scheduled step and returns the decoder-input latent.
    ///
    /// `latents` is `[1, c, h, w]`; `text_embeddings` is the batch-of-2
    /// unconditional-then-conditional concatenation.
    pub fn run<D: Denoiser>(
        &self,
        latents: &Tensor,
        text_embeddings: &Tensor,
        scheduler: &mut PndmScheduler,
        denoiser: &mut D,
    ) -> Result<Tensor> {
        self.run_observed(latents, text_embeddings, scheduler, denoiser, &mut ())
    }

    pub fn run_observed<D: Denoiser, O: StepObserver>(
        &self,
        latents: &Tensor,
        text_embeddings: &Tensor,
        scheduler: &mut PndmScheduler,
        denoiser: &mut D,
        observer: &mut O,
    ) -> Result<Tensor> {
        let (_, channels, height, width) = latents.dims4()?;
        ensure_dims("sampling", "latents", latents, &[1, channels, height, width])?;
        let embed_dims = text_embeddings.dims();
        if embed_dims.first() != Some(&2) {
            let mut expected = embed_dims.to_vec();
            match expected.first_mut() {
                Some(batch) => *batch = 2,
                None => expected.push(2),
            }
            return Err(Error::shape(
                "sampling",
                "text_embeddings",
                &expected,
                embed_dims,
            ));
        }

        let timesteps = scheduler.timesteps().to_vec();
        let mut latents = (latents * scheduler.init_noise_sigma()?)?;
        let device = latents.device().clone();
        info!(
            steps = timesteps.len(),
            guidance_scale = self.guidance_scale,
            "starting denoising loop"
        );

        for (i, &t) in timesteps.iter().enumerate() {
            debug!(step = i, timestep = t, "denoising step");

            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, t)?;
            observer.on_model_input(i, t, &latent_model_input)?;

            let timestep = timestep_tensor(t, &device)?;
            let noise_pred = denoiser.forward(&latent_model_input, &timestep, text_embeddings)?;
            ensure_same_shape("denoiser", "noise_pred", &latent_model_input, &noise_pred)?;

            let (noise_pred_uncond, noise_pred_text) = guidance::split_uncond_cond(&noise_pred)?;
            let noise_pred =
                guidance::combine(&noise_pred_uncond, &noise_pred_text, self.guidance_scale)?;

            latents = scheduler.step(&noise_pred, t, &latents)?;

            if observer.on_step_end(i, t, &latents)?.is_break() {
                info!(step = i, "denoising loop cancelled");
                return Err(Error::Cancelled { step: i });
            }
        }

        Ok(latents.affine(1.0 / self.vae_scaling_factor, 0.0)?)
    }
}

/// Wraps a timestep as the `[1]` i64 tensor the denoiser expects.
pub fn timestep_tensor(timestep: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(&[timestep as i64], device)?)
}
