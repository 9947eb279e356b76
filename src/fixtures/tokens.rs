use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Token ids for a prompt list, as emitted by the tokenizer stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFixture {
    pub prompt: Vec<String>,
    /// `[batch, max_length]`
    pub shape: Vec<usize>,
    /// Row-major flattening of the id tensor.
    pub input_ids: Vec<i64>,
}

impl TokenFixture {
    pub fn new(prompt: Vec<String>, shape: Vec<usize>, input_ids: Vec<i64>) -> Result<Self> {
        let fixture = Self {
            prompt,
            shape,
            input_ids,
        };
        fixture.validate()?;
        Ok(fixture)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(Error::Serialization {
                fixture: super::TEXT_ENCODER.to_string(),
                tensor: "input_ids".to_string(),
                reason,
            })
        };
        if self.shape.len() != 2 || self.shape.contains(&0) {
            return fail(format!("shape must be [batch, max_length], got {:?}", self.shape));
        }
        let count: usize = self.shape.iter().product();
        if count != self.input_ids.len() {
            return fail(format!(
                "shape {:?} holds {count} ids but {} were given",
                self.shape,
                self.input_ids.len()
            ));
        }
        if self.shape[0] != self.prompt.len() {
            return fail(format!(
                "batch {} does not match {} prompt(s)",
                self.shape[0],
                self.prompt.len()
            ));
        }
        if let Some(id) = self.input_ids.iter().find(|&&id| id < 0) {
            return fail(format!("negative token id {id}"));
        }
        Ok(())
    }

    /// `[batch, max_length]` i64 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        self.validate()?;
        Ok(Tensor::from_vec(
            self.input_ids.clone(),
            (self.shape[0], self.shape[1]),
            device,
        )?)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let fixture: Self = serde_json::from_slice(bytes)?;
        fixture.validate()?;
        Ok(fixture)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_slice(&bytes)
    }
}
