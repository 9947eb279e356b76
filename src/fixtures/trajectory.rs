use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use candle_core::Tensor;

use super::{Fixture, MetadataValue, TRAJECTORY};
use crate::error::Result;
use crate::sampling::StepObserver;
use crate::tensor::TensorRecord;

/// Captures the latent after each selected step of the sampling loop.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryRecorder {
    steps: BTreeSet<usize>,
    captured: BTreeMap<usize, (usize, TensorRecord)>,
}

impl TrajectoryRecorder {
    pub fn new(steps: impl IntoIterator<Item = usize>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            captured: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Tensor key for the latent after `step`.
    pub fn key(step: usize) -> String {
        format!("latents_step_{step:03}")
    }

    /// Bundles the snapshots, with each step's timestep as metadata.
    pub fn into_fixture(self) -> Result<Fixture> {
        let mut tensors = BTreeMap::new();
        let mut metadata = BTreeMap::new();
        for (step, (timestep, record)) in self.captured {
            tensors.insert(Self::key(step), record);
            metadata.insert(
                format!("timestep_step_{step:03}"),
                MetadataValue::Number(timestep as f64),
            );
        }
        Fixture::from_parts(TRAJECTORY, tensors, metadata)
    }
}

impl StepObserver for TrajectoryRecorder {
    fn on_step_end(
        &mut self,
        step: usize,
        timestep: usize,
        latents: &Tensor,
    ) -> Result<ControlFlow<()>> {
        if self.steps.contains(&step) {
            self.captured
                .insert(step, (timestep, TensorRecord::from_tensor(latents)?));
        }
        Ok(ControlFlow::Continue(()))
    }
}
