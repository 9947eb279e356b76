//! Seed-derived starting noise.
//!
//! The sampling loop never draws random numbers itself; the initial latent is
//! produced here and handed in as a value.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use crate::error::Result;

/// Standard-normal f32 tensor of `shape`, fully determined by `seed`.
pub fn initial_latents(seed: u64, shape: &[usize], device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_noise() -> Result<()> {
        let device = Device::Cpu;
        let a = initial_latents(0, &[1, 4, 8, 8], &device)?;
        let b = initial_latents(0, &[1, 4, 8, 8], &device)?;
        let c = initial_latents(1, &[1, 4, 8, 8], &device)?;
        assert_eq!(a.dims(), &[1, 4, 8, 8]);
        let a = a.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b.flatten_all()?.to_vec1::<f32>()?);
        assert_ne!(a, c.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_noise_is_roughly_standard() -> Result<()> {
        let t = initial_latents(42, &[1, 4, 64, 64], &Device::Cpu)?;
        let values = t.flatten_all()?.to_vec1::<f32>()?;
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
        Ok(())
    }
}
