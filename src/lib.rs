//! Reference-fixture generation for a latent text-to-image diffusion pipeline.
//!
//! The crate runs tokenized prompts through a text encoder, a classifier-free
//! guided denoising loop driven by a pseudo linear multistep scheduler, and
//! captures the tensors crossing each stage boundary as JSON fixtures that
//! independent implementations can be checked against.
//!
//! Model weights stay behind the [`models::TextEncoder`] and
//! [`models::Denoiser`] traits, so the loop can be exercised with the
//! deterministic mocks in [`models`] as well as real networks.

pub mod config;
pub mod error;
pub mod fixtures;
pub mod guidance;
pub mod models;
pub mod noise;
pub mod pipeline;
pub mod sampling;
pub mod scheduler;
pub mod tensor;

pub use config::{BetaSchedule, GeneratorConfig, PredictionType, SchedulerConfig};
pub use error::{Error, Result};
pub use fixtures::{Fixture, FixtureRecorder, MetadataValue, TokenFixture, TrajectoryRecorder};
pub use pipeline::{FixtureGenerator, GeneratedFixtures};
pub use sampling::{SamplingLoop, StepObserver};
pub use scheduler::{PndmScheduler, SchedulerPhase};
pub use tensor::TensorRecord;
