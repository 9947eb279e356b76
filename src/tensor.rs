//! Flattened tensor records and shape checks shared by every stage.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A tensor as it appears in a fixture: explicit shape plus the row-major
/// flattening of its values.
///
/// Integer tensors (timesteps) are stored with the same numeric type as float
/// tensors; every integer below 2^24 round-trips exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorRecord {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self { shape, values })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        if let Err(reason) = self.check() {
            return Err(Error::InvalidConfig(format!(
                "tensor record cannot be materialized: {reason}"
            )));
        }
        Ok(Tensor::from_vec(
            self.values.clone(),
            self.shape.as_slice(),
            device,
        )?)
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Checks the record invariants, returning the first violation.
    ///
    /// The shape must be non-empty with positive dims whose product equals the
    /// number of values, and every value must be finite.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.shape.is_empty() {
            return Err("shape is empty".to_string());
        }
        if let Some(pos) = self.shape.iter().position(|&d| d == 0) {
            return Err(format!("dimension {pos} of shape {:?} is zero", self.shape));
        }
        if self.elem_count() != self.values.len() {
            return Err(format!(
                "shape {:?} holds {} elements but {} values were given",
                self.shape,
                self.elem_count(),
                self.values.len()
            ));
        }
        if let Some(pos) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(format!(
                "value at flat index {pos} is not finite ({})",
                self.values[pos]
            ));
        }
        Ok(())
    }
}

/// Fails with `ShapeMismatch` unless `tensor` has exactly the `expected` dims.
pub fn ensure_dims(
    stage: &'static str,
    name: &str,
    tensor: &Tensor,
    expected: &[usize],
) -> Result<()> {
    if tensor.dims() != expected {
        return Err(Error::shape(stage, name, expected, tensor.dims()));
    }
    Ok(())
}

/// Fails with `ShapeMismatch` unless both tensors share a shape.
pub fn ensure_same_shape(
    stage: &'static str,
    name: &str,
    reference: &Tensor,
    tensor: &Tensor,
) -> Result<()> {
    ensure_dims(stage, name, tensor, reference.dims())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_tensor_is_row_major() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &device)?;
        let record = TensorRecord::from_tensor(&t)?;
        assert_eq!(record.shape, vec![2, 3]);
        assert_eq!(record.values, vec![1., 2., 3., 4., 5., 6.]);

        let back = record.to_tensor(&device)?;
        assert_eq!(back.to_vec2::<f32>()?, vec![vec![1., 2., 3.], vec![4., 5., 6.]]);
        Ok(())
    }

    #[test]
    fn test_integer_timestep_record() -> Result<()> {
        let t = Tensor::new(&[961i64], &Device::Cpu)?;
        let record = TensorRecord::from_tensor(&t)?;
        assert_eq!(record.shape, vec![1]);
        assert_eq!(record.values, vec![961.0]);
        Ok(())
    }

    #[test]
    fn test_check_rejects_malformed_records() {
        assert!(TensorRecord::new(vec![], vec![]).check().is_err());
        assert!(TensorRecord::new(vec![2, 0], vec![]).check().is_err());
        assert!(TensorRecord::new(vec![2, 2], vec![0.0; 3]).check().is_err());
        assert!(TensorRecord::new(vec![2], vec![1.0, f32::NAN]).check().is_err());
        assert!(TensorRecord::new(vec![1], vec![f32::INFINITY]).check().is_err());
        assert!(TensorRecord::new(vec![2], vec![1.0, -1.0]).check().is_ok());
    }

    #[test]
    fn test_ensure_dims() -> Result<()> {
        let t = Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu)?;
        assert!(ensure_dims("sampling", "latents", &t, &[1, 4, 8, 8]).is_ok());
        let err = ensure_dims("sampling", "latents", &t, &[2, 4, 8, 8]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { stage: "sampling", .. }));
        Ok(())
    }
}
