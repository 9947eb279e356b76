//! Noise and timestep schedules.

use crate::config::{BetaSchedule, SchedulerConfig};
use crate::error::{Error, Result};

/// `num` evenly spaced values over `[start, end]`, inclusive of both ends.
pub(crate) fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Training betas for `num_train_timesteps` steps.
pub fn betas(config: &SchedulerConfig, num_train_timesteps: usize) -> Vec<f64> {
    match config.beta_schedule {
        BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, num_train_timesteps),
        BetaSchedule::ScaledLinear => linspace(
            config.beta_start.sqrt(),
            config.beta_end.sqrt(),
            num_train_timesteps,
        )
        .into_iter()
        .map(|b| b * b)
        .collect(),
    }
}

/// Running product of `1 - beta`.
pub fn alphas_cumprod(betas: &[f64]) -> Vec<f64> {
    let mut alphas_cumprod = Vec::with_capacity(betas.len());
    for &beta in betas {
        let alpha = 1.0 - beta;
        alphas_cumprod.push(alpha * *alphas_cumprod.last().unwrap_or(&1f64))
    }
    alphas_cumprod
}

/// Evenly spaced, strictly decreasing timesteps in `[0, num_train_timesteps)`
/// using leading spacing. Returns the timesteps and the step ratio.
///
/// The offset is capped at `step_ratio - 1` so the first timestep never
/// reaches `num_train_timesteps`.
pub fn leading_timesteps(
    num_inference_steps: usize,
    num_train_timesteps: usize,
    steps_offset: usize,
) -> Result<(Vec<usize>, usize)> {
    if num_inference_steps == 0 {
        return Err(Error::InvalidConfig(
            "num_inference_steps must be at least 1".to_string(),
        ));
    }
    if num_inference_steps > num_train_timesteps {
        return Err(Error::InvalidConfig(format!(
            "num_inference_steps ({num_inference_steps}) exceeds num_train_timesteps ({num_train_timesteps})"
        )));
    }
    let step_ratio = num_train_timesteps / num_inference_steps;
    let offset = steps_offset.min(step_ratio - 1);
    let timesteps = (0..num_inference_steps)
        .map(|s| s * step_ratio + offset)
        .rev()
        .collect();
    Ok((timesteps, step_ratio))
}
