//! Error kinds raised while generating fixtures.
//!
//! Every failure is fatal to the run that raised it. Diagnostics name the
//! pipeline stage and the tensor involved so a mismatch can be traced back
//! without re-running under a debugger.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Tensor shape invariants violated between stages.
    #[error("shape mismatch in {stage}: `{tensor}` expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        stage: &'static str,
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Scheduler stepped more times than it was configured for.
    #[error("scheduler out of schedule: step {step} requested but only {num_steps} configured")]
    OutOfSchedule { step: usize, num_steps: usize },

    /// Scheduler used before `configure`.
    #[error("scheduler not configured: `{op}` called before `configure`")]
    NotConfigured { op: &'static str },

    /// `step` was handed a timestep other than the scheduled one.
    #[error("unexpected timestep at step {step}: scheduled {expected}, got {actual}")]
    UnexpectedTimestep {
        step: usize,
        expected: usize,
        actual: usize,
    },

    /// Non-finite values or malformed shape during fixture write.
    #[error("cannot serialize fixture `{fixture}`, tensor `{tensor}`: {reason}")]
    Serialization {
        fixture: String,
        tensor: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An observer stopped the sampling loop at a step boundary.
    #[error("sampling cancelled after step {step}")]
    Cancelled { step: usize },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn shape(
        stage: &'static str,
        tensor: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            stage,
            tensor: tensor.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors raised by the scheduler's state machine.
    pub fn is_schedule_error(&self) -> bool {
        matches!(
            self,
            Self::OutOfSchedule { .. } | Self::NotConfigured { .. } | Self::UnexpectedTimestep { .. }
        )
    }
}
