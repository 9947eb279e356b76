//! # Pseudo numerical multistep scheduler
//!
//! Integrates the reverse diffusion ODE over a fixed, evenly spaced timestep
//! schedule. The first three steps run a Runge-Kutta style warm-up that
//! accumulates the classical RK4 stage weights over successive predictions;
//! once three predictions are on record the scheduler switches to a 4-point
//! Adams-Bashforth combination. Both phases advance the sample with the
//! closed-form DDIM transfer between two timesteps.
//!
//! Pseudo Numerical Methods for Diffusion Models on Manifolds, L. Liu et al, 2022.
//! https://arxiv.org/abs/2202.09778

mod history;
mod schedule;

pub use history::{HISTORY_LEN, PredictionHistory};
pub use schedule::{alphas_cumprod, betas, leading_timesteps};

use std::ops::Range;

use candle_core::Tensor;
use tracing::debug;

use crate::config::{PredictionType, SchedulerConfig};
use crate::error::{Error, Result};
use crate::tensor::ensure_same_shape;

/// Classical RK4 stage weights.
const RK4_STAGE_WEIGHTS: [f64; 4] = [1. / 6., 1. / 3., 1. / 3., 1. / 6.];

/// Steps integrated with the Runge-Kutta warm-up before the multistep phase.
pub const WARMUP_STEPS: usize = HISTORY_LEN;

/// Observable lifecycle of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Unconfigured,
    Ready,
    Exhausted,
}

/// Partial RK sum carried across the warm-up steps.
#[derive(Debug, Clone)]
struct Warmup {
    /// Sample at the start of the warm-up; every warm-up update starts here.
    anchor: Tensor,
    anchor_timestep: usize,
    weighted_sum: Tensor,
    weight: f64,
}

/// Everything built by `configure` and mutated by `step`.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    step_ratio: usize,
    init_noise_sigma: f64,
    step_index: usize,
    history: PredictionHistory,
    warmup: Option<Warmup>,
}

impl SchedulerState {
    fn alpha_prod(&self, timestep: i64) -> f64 {
        if timestep >= 0 {
            self.alphas_cumprod[timestep as usize]
        } else {
            self.final_alpha_cumprod
        }
    }

    fn prev_timestep(&self, step: usize) -> i64 {
        match self.timesteps.get(step + 1) {
            Some(&t) => t as i64,
            None => self.timesteps[step] as i64 - self.step_ratio as i64,
        }
    }
}

/// The step scheduler.
#[derive(Debug, Clone)]
pub struct PndmScheduler {
    pub config: SchedulerConfig,
    state: Option<SchedulerState>,
}

impl PndmScheduler {
    /// Creates an unconfigured scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    /// Builds the timestep schedule and resets the integration state.
    ///
    /// Produces `num_inference_steps` strictly decreasing timesteps within
    /// `[0, num_train_timesteps)`.
    pub fn configure(
        &mut self,
        num_inference_steps: usize,
        num_train_timesteps: usize,
    ) -> Result<()> {
        self.config.validate()?;
        let (timesteps, step_ratio) = leading_timesteps(
            num_inference_steps,
            num_train_timesteps,
            self.config.steps_offset,
        )?;
        let alphas_cumprod = alphas_cumprod(&betas(&self.config, num_train_timesteps));
        let final_alpha_cumprod = if self.config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        debug!(
            num_inference_steps,
            num_train_timesteps,
            step_ratio,
            first = timesteps[0],
            "scheduler configured"
        );

        self.state = Some(SchedulerState {
            timesteps,
            alphas_cumprod,
            final_alpha_cumprod,
            step_ratio,
            init_noise_sigma: 1.0,
            step_index: 0,
            history: PredictionHistory::new(),
            warmup: None,
        });
        Ok(())
    }

    pub fn phase(&self) -> SchedulerPhase {
        match &self.state {
            None => SchedulerPhase::Unconfigured,
            Some(s) if s.step_index >= s.timesteps.len() => SchedulerPhase::Exhausted,
            Some(_) => SchedulerPhase::Ready,
        }
    }

    /// Scheduled timesteps, empty until configured.
    pub fn timesteps(&self) -> &[usize] {
        self.state
            .as_ref()
            .map(|s| s.timesteps.as_slice())
            .unwrap_or(&[])
    }

    /// Number of `step` calls made since `configure`.
    pub fn step_index(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.step_index)
    }

    pub fn num_inference_steps(&self) -> usize {
        self.timesteps().len()
    }

    /// Scale applied once to the starting latent.
    pub fn init_noise_sigma(&self) -> Result<f64> {
        self.configured("init_noise_sigma")
            .map(|s| s.init_noise_sigma)
    }

    /// Identity for this integrator; kept so call sequences line up with
    /// schedulers that do rescale the model input.
    pub fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        let state = self.configured("scale_model_input")?;
        if state.step_index >= state.timesteps.len() {
            return Err(Error::OutOfSchedule {
                step: state.step_index,
                num_steps: state.timesteps.len(),
            });
        }
        Ok(sample)
    }

    /// Forward diffusion of `original` to `timestep`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let state = self.configured("add_noise")?;
        ensure_same_shape("scheduler", "noise", original, noise)?;
        let alpha_prod = state
            .alphas_cumprod
            .get(timestep)
            .copied()
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "timestep {timestep} outside the {}-step training schedule",
                    state.alphas_cumprod.len()
                ))
            })?;
        Ok((original.affine(alpha_prod.sqrt(), 0.0)? + noise.affine((1.0 - alpha_prod).sqrt(), 0.0)?)?)
    }

    /// Advances `sample` by one scheduled step using the guided prediction
    /// `model_output`. Returns the new sample; the input is left untouched.
    pub fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let prediction_type = self.config.prediction_type;
        let state = self
            .state
            .as_mut()
            .ok_or(Error::NotConfigured { op: "step" })?;

        let num_steps = state.timesteps.len();
        let step = state.step_index;
        if step >= num_steps {
            return Err(Error::OutOfSchedule { step, num_steps });
        }
        let expected = state.timesteps[step];
        if timestep != expected {
            return Err(Error::UnexpectedTimestep {
                step,
                expected,
                actual: timestep,
            });
        }
        ensure_same_shape("scheduler", "model_output", sample, model_output)?;

        let prev_timestep = state.prev_timestep(step);
        let (origin, origin_timestep, effective) = if state.history.len() < WARMUP_STEPS {
            let stages = warmup_stages(step, step + 1 == num_steps);
            let weight: f64 = RK4_STAGE_WEIGHTS[stages.clone()].iter().sum();
            let weighted = model_output.affine(weight, 0.0)?;

            let warmup = match state.warmup.take() {
                None => Warmup {
                    anchor: sample.clone(),
                    anchor_timestep: timestep,
                    weighted_sum: weighted,
                    weight,
                },
                Some(mut w) => {
                    w.weighted_sum = w.weighted_sum.add(&weighted)?;
                    w.weight += weight;
                    w
                }
            };
            debug!(step, ?stages, accumulated = warmup.weight, "runge-kutta warm-up");

            let effective = warmup.weighted_sum.affine(1.0 / warmup.weight, 0.0)?;
            let origin = (warmup.anchor.clone(), warmup.anchor_timestep);
            if stages.end < RK4_STAGE_WEIGHTS.len() {
                state.warmup = Some(warmup);
            }
            (origin.0, origin.1, effective)
        } else {
            let recent = |age: usize| {
                state.history.recent(age).ok_or(Error::OutOfSchedule {
                    step,
                    num_steps,
                })
            };
            let (p1, p2, p3) = (recent(0)?, recent(1)?, recent(2)?);
            // (55 p_t - 59 p_{t-1} + 37 p_{t-2} - 9 p_{t-3}) / 24
            let effective = ((model_output.affine(55.0, 0.0)? - p1.affine(59.0, 0.0)?)?
                + (p2.affine(37.0, 0.0)? - p3.affine(9.0, 0.0)?)?)?
            .affine(1.0 / 24.0, 0.0)?;
            debug!(step, "adams-bashforth step");
            (sample.clone(), timestep, effective)
        };

        state.history.push(model_output.clone());
        let prev_sample = transfer(
            state,
            prediction_type,
            &origin,
            origin_timestep as i64,
            prev_timestep,
            &effective,
        )?;
        state.step_index += 1;
        Ok(prev_sample)
    }

    fn configured(&self, op: &'static str) -> Result<&SchedulerState> {
        self.state.as_ref().ok_or(Error::NotConfigured { op })
    }
}

/// RK4 stages folded into warm-up step `step`. The last warm-up step, and a
/// final scheduled step that falls inside the warm-up, absorb every remaining
/// stage so the weights always total one.
fn warmup_stages(step: usize, is_last_step: bool) -> Range<usize> {
    if is_last_step || step + 1 == WARMUP_STEPS {
        step..RK4_STAGE_WEIGHTS.len()
    } else {
        step..step + 1
    }
}

/// Closed-form DDIM transfer of `sample` from `timestep` to `prev_timestep`
/// given the effective prediction.
fn transfer(
    state: &SchedulerState,
    prediction_type: PredictionType,
    sample: &Tensor,
    timestep: i64,
    prev_timestep: i64,
    model_output: &Tensor,
) -> Result<Tensor> {
    let alpha_prod_t = state.alpha_prod(timestep);
    let alpha_prod_t_prev = state.alpha_prod(prev_timestep);
    let beta_prod_t = 1. - alpha_prod_t;
    let beta_prod_t_prev = 1. - alpha_prod_t_prev;

    let model_output = match prediction_type {
        PredictionType::Epsilon => model_output.clone(),
        PredictionType::VPrediction => {
            (model_output.affine(alpha_prod_t.sqrt(), 0.0)? + sample.affine(beta_prod_t.sqrt(), 0.0)?)?
        }
    };

    let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
    let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt()
        + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

    Ok((sample.affine(sample_coeff, 0.0)?
        - model_output.affine(
            (alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff,
            0.0,
        )?)?)
}
