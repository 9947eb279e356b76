//! Classifier-free guidance.

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::tensor::ensure_same_shape;

/// Combines an unconditional and a conditional prediction:
/// `uncond + guidance_scale * (cond - uncond)`.
///
/// `guidance_scale == 1` yields `cond`, `guidance_scale == 0` yields `uncond`.
pub fn combine(uncond: &Tensor, cond: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    if !guidance_scale.is_finite() || guidance_scale < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "guidance scale must be finite and >= 0, got {guidance_scale}"
        )));
    }
    ensure_same_shape("guidance", "noise_pred_text", uncond, cond)?;

    let diff = cond.sub(uncond)?;
    Ok(uncond.add(&diff.affine(guidance_scale, 0.0)?)?)
}

/// Splits a batch-of-2 prediction along the batch axis into
/// `(uncond, cond)`, unconditional half first.
pub fn split_uncond_cond(noise_pred: &Tensor) -> Result<(Tensor, Tensor)> {
    let dims = noise_pred.dims();
    if dims.is_empty() || dims[0] % 2 != 0 {
        let mut expected = dims.to_vec();
        if let Some(batch) = expected.first_mut() {
            *batch = 2;
        }
        return Err(Error::shape("guidance", "noise_pred", &expected, dims));
    }
    let half = dims[0] / 2;
    Ok((noise_pred.narrow(0, 0, half)?, noise_pred.narrow(0, half, half)?))
}
