//! Fixture capture and the JSON exchange format.
//!
//! Two document shapes are produced:
//!
//! - token fixtures: `{"prompt": [..], "shape": [b, n], "input_ids": [..]}`,
//!   one for the prompt and one for the empty prompt
//! - tensor bundles: one object per stage mapping each tensor name to
//!   `{"shape": [..], "values": [..]}`, with scalar metadata alongside.
//!
//! Values are always the row-major flattening of the tensor.

mod tokens;
mod trajectory;
mod writer;

pub use tokens::TokenFixture;
pub use trajectory::TrajectoryRecorder;
pub use writer::{FixtureRecorder, write_atomic};

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tensor::TensorRecord;

pub const TEXT_ENCODER: &str = "text_encoder";
pub const TEXT_ENCODER_EMPTY: &str = "text_encoder_empty";
pub const LATENTS: &str = "latents";
pub const UNET: &str = "unet";
pub const VAE: &str = "vae";
pub const TRAJECTORY: &str = "trajectory";

/// Scalar metadata carried next to the tensors of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
    TextList(Vec<String>),
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(v: Vec<String>) -> Self {
        Self::TextList(v)
    }
}

/// An immutable named bundle of tensors plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    name: String,
    tensors: BTreeMap<String, TensorRecord>,
    metadata: BTreeMap<String, MetadataValue>,
}

impl Fixture {
    /// Snapshots `tensors` (in their current state) under `name`.
    pub fn capture<'a>(
        name: impl Into<String>,
        tensors: impl IntoIterator<Item = (&'a str, &'a Tensor)>,
        metadata: impl IntoIterator<Item = (&'a str, MetadataValue)>,
    ) -> Result<Self> {
        let name = name.into();
        let mut records = BTreeMap::new();
        for (tensor_name, tensor) in tensors {
            let record = TensorRecord::from_tensor(tensor)?;
            if records.insert(tensor_name.to_string(), record).is_some() {
                return Err(Error::Serialization {
                    fixture: name,
                    tensor: tensor_name.to_string(),
                    reason: "captured twice".to_string(),
                });
            }
        }
        Self::from_parts(
            name,
            records,
            metadata
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Builds a fixture from already flattened records, checking invariants.
    pub fn from_parts(
        name: impl Into<String>,
        tensors: BTreeMap<String, TensorRecord>,
        metadata: BTreeMap<String, MetadataValue>,
    ) -> Result<Self> {
        let fixture = Self {
            name: name.into(),
            tensors,
            metadata,
        };
        fixture.validate()?;
        Ok(fixture)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensors(&self) -> &BTreeMap<String, TensorRecord> {
        &self.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorRecord> {
        self.tensors.get(name)
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        &self.metadata
    }

    /// File the fixture is stored under.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.name)
    }

    fn validate(&self) -> Result<()> {
        for (tensor_name, record) in &self.tensors {
            if let Err(reason) = record.check() {
                return Err(self.serialization_error(tensor_name, reason));
            }
            if self.metadata.contains_key(tensor_name) {
                return Err(self.serialization_error(
                    tensor_name,
                    "name used for both a tensor and a metadata entry".to_string(),
                ));
            }
        }
        for (key, value) in &self.metadata {
            if let MetadataValue::Number(v) = value {
                if !v.is_finite() {
                    return Err(self.serialization_error(key, format!("metadata {v} is not finite")));
                }
            }
        }
        Ok(())
    }

    fn serialization_error(&self, tensor: &str, reason: String) -> Error {
        Error::Serialization {
            fixture: self.name.clone(),
            tensor: tensor.to_string(),
            reason,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a tensor bundle. Entries shaped like `{"shape", "values"}` are
    /// tensors; everything else must be scalar metadata.
    pub fn from_json_slice(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let document: serde_json::Map<String, Value> = serde_json::from_slice(bytes)?;
        let mut tensors = BTreeMap::new();
        let mut metadata = BTreeMap::new();
        for (key, value) in document {
            let is_tensor = value
                .as_object()
                .is_some_and(|o| o.contains_key("shape") && o.contains_key("values"));
            if is_tensor {
                tensors.insert(key, serde_json::from_value::<TensorRecord>(value)?);
            } else {
                let entry = serde_json::from_value::<MetadataValue>(value).map_err(|e| {
                    Error::Serialization {
                        fixture: name.clone(),
                        tensor: key.clone(),
                        reason: format!("not a tensor or scalar metadata: {e}"),
                    }
                })?;
                metadata.insert(key, entry);
            }
        }
        Self::from_parts(name, tensors, metadata)
    }
}

impl Serialize for Fixture {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.metadata.len() + self.tensors.len()))?;
        for (key, value) in &self.metadata {
            map.serialize_entry(key, value)?;
        }
        for (key, record) in &self.tensors {
            map.serialize_entry(key, record)?;
        }
        map.end()
    }
}
