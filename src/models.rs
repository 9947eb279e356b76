//! Tensor-in, tensor-out model capabilities.
//!
//! The text encoder and the denoiser are opaque networks; the sampling core
//! only relies on their tensor contracts. Real networks, replayed fixtures
//! and the closed-form mocks below all plug in through the same traits.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Maps token ids `[batch, seq_len]` (i64) to embeddings
/// `[batch, seq_len, hidden_size]` (f32).
pub trait TextEncoder {
    fn encode(&mut self, input_ids: &Tensor) -> Result<Tensor>;
}

/// Predicts noise for a `[batch, channels, h, w]` latent at a timestep
/// (shape `[1]`, i64) under `[batch, seq_len, hidden_size]` conditioning.
/// The output has the latent's shape.
pub trait Denoiser {
    fn forward(
        &mut self,
        latent_model_input: &Tensor,
        timestep: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor>;
}

impl<F> Denoiser for F
where
    F: FnMut(&Tensor, &Tensor, &Tensor) -> Result<Tensor>,
{
    fn forward(
        &mut self,
        latent_model_input: &Tensor,
        timestep: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        self(latent_model_input, timestep, encoder_hidden_states)
    }
}

/// Reads the scalar out of a `[1]` timestep tensor.
pub fn timestep_value(timestep: &Tensor) -> Result<i64> {
    let values = timestep.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    match values.as_slice() {
        [t] => Ok(*t),
        _ => Err(Error::shape("denoiser", "timestep", &[1], timestep.dims())),
    }
}

/// Closed-form stand-in for a text encoder.
///
/// `e[b, s, h] = sin(0.001 * (id + 1) * (h + 1) + 0.1 * s)`; deterministic and
/// different for different token ids.
#[derive(Debug, Clone)]
pub struct MockTextEncoder {
    hidden_size: usize,
    device: Device,
}

impl MockTextEncoder {
    pub fn new(hidden_size: usize, device: Device) -> Self {
        Self {
            hidden_size,
            device,
        }
    }
}

impl TextEncoder for MockTextEncoder {
    fn encode(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let ids = input_ids.to_dtype(DType::I64)?.to_vec2::<i64>()?;
        let mut data = Vec::with_capacity(batch * seq_len * self.hidden_size);
        for row in &ids {
            for (s, &id) in row.iter().enumerate() {
                for h in 0..self.hidden_size {
                    let x = 0.001 * (id + 1) as f64 * (h + 1) as f64 + 0.1 * s as f64;
                    data.push(x.sin() as f32);
                }
            }
        }
        Ok(Tensor::from_vec(
            data,
            (batch, seq_len, self.hidden_size),
            &self.device,
        )?)
    }
}

/// Closed-form stand-in for a denoiser.
///
/// `eps = 0.1 * x + 0.01 * t / 1000 + 0.05 * mean(embeddings[b])`, so the
/// conditional and unconditional halves differ whenever their embeddings do.
#[derive(Debug, Clone, Default)]
pub struct MockDenoiser {
    calls: usize,
}

impl MockDenoiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of forward passes served.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Denoiser for MockDenoiser {
    fn forward(
        &mut self,
        latent_model_input: &Tensor,
        timestep: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let (batch, _, _, _) = latent_model_input.dims4()?;
        let cond_batch = encoder_hidden_states.dim(0)?;
        if cond_batch != batch {
            let mut expected = encoder_hidden_states.dims().to_vec();
            expected[0] = batch;
            return Err(Error::shape(
                "denoiser",
                "encoder_hidden_states",
                &expected,
                encoder_hidden_states.dims(),
            ));
        }
        let t = timestep_value(timestep)? as f64;
        let conditioning = encoder_hidden_states
            .to_dtype(DType::F32)?
            .flatten_from(1)?
            .mean_keepdim(1)?
            .reshape((batch, 1, 1, 1))?
            .affine(0.05, 0.0)?;

        self.calls += 1;
        Ok(latent_model_input
            .affine(0.1, 0.01 * t / 1000.0)?
            .broadcast_add(&conditioning)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_encoder_shape_and_determinism() -> Result<()> {
        let device = Device::Cpu;
        let ids = Tensor::new(&[[49406i64, 320, 3540, 49407]], &device)?;
        let mut encoder = MockTextEncoder::new(8, device);
        let a = encoder.encode(&ids)?;
        let b = encoder.encode(&ids)?;
        assert_eq!(a.dims(), &[1, 4, 8]);
        assert_eq!(
            a.flatten_all()?.to_vec1::<f32>()?,
            b.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_mock_denoiser_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let latents = Tensor::randn(0f32, 1., (2, 4, 8, 8), &device)?;
        let t = Tensor::new(&[961i64], &device)?;
        let emb = Tensor::randn(0f32, 1., (2, 77, 16), &device)?;
        let mut denoiser = MockDenoiser::new();
        let out = denoiser.forward(&latents, &t, &emb)?;
        assert_eq!(out.dims(), latents.dims());
        assert_eq!(denoiser.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_mock_denoiser_rejects_batch_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device)?;
        let t = Tensor::new(&[1i64], &device)?;
        let emb = Tensor::zeros((1, 77, 16), DType::F32, &device)?;
        let err = MockDenoiser::new().forward(&latents, &t, &emb).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { stage: "denoiser", .. }));
        Ok(())
    }

    #[test]
    fn test_closure_denoiser() -> Result<()> {
        let device = Device::Cpu;
        let mut zero = |x: &Tensor, _t: &Tensor, _e: &Tensor| -> Result<Tensor> { Ok(x.zeros_like()?) };
        let x = Tensor::ones((2, 4, 2, 2), DType::F32, &device)?;
        let t = Tensor::new(&[1i64], &device)?;
        let out = zero.forward(&x, &t, &x)?;
        assert_eq!(out.sum_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_timestep_value() -> Result<()> {
        let device = Device::Cpu;
        assert_eq!(timestep_value(&Tensor::new(&[801i64], &device)?)?, 801);
        assert!(timestep_value(&Tensor::new(&[1i64, 2], &device)?).is_err());
        Ok(())
    }
}
