//! Noise schedule and DDIM timestep subsequence.
//!
//! The training schedule is the standard scaled-linear beta schedule:
//! betas interpolated linearly in sqrt space, squared, then turned into
//! a cumulative product of retained-signal fractions (`alphas_cumprod`).
//! Sampling runs over a uniform-stride subsequence of those timesteps.

use crate::config::ScheduleConfig;
use crate::error::{Result, SdError};

/// Cumulative product of `1 - beta` over the training schedule.
///
/// Values are strictly decreasing and lie in (0, 1]. Computed once at
/// model construction and shared read-only afterwards.
pub fn alphas_cumprod(config: &ScheduleConfig) -> Vec<f64> {
    let n = config.num_train_timesteps;
    let start = config.beta_start.sqrt();
    let end = config.beta_end.sqrt();
    let mut cumprod = 1.0;
    (0..n)
        .map(|i| {
            let frac = i as f64 / (n - 1) as f64;
            let beta_sqrt = start + frac * (end - start);
            cumprod *= 1.0 - beta_sqrt * beta_sqrt;
            cumprod
        })
        .collect()
}

/// The timestep subsequence for one sampling run, with the cumulative
/// alphas gathered at those timesteps.
///
/// `timesteps` is strictly increasing; sampling consumes it in reverse
/// (most noise first). `alphas_prev` is `alphas` shifted right by one
/// with 1.0 prepended: the step before the first recorded index is
/// treated as fully denoised.
#[derive(Debug, Clone)]
pub struct DdimSchedule {
    pub timesteps: Vec<usize>,
    pub alphas: Vec<f64>,
    pub alphas_prev: Vec<f64>,
}

impl DdimSchedule {
    pub fn new(alphas_cumprod: &[f64], steps: usize) -> Result<Self> {
        let num_train = alphas_cumprod.len();
        if steps == 0 {
            return Err(SdError::Config("steps must be at least 1".to_string()));
        }
        if steps > num_train {
            return Err(SdError::Config(format!(
                "steps ({steps}) cannot exceed the training schedule length ({num_train})"
            )));
        }
        let stride = num_train / steps;
        let timesteps: Vec<usize> = (0..steps).map(|k| 1 + k * stride).collect();
        if timesteps.last().copied().unwrap_or(0) >= num_train {
            return Err(SdError::Config(format!(
                "steps ({steps}) leaves no room for the offset-1 subsequence"
            )));
        }
        let alphas: Vec<f64> = timesteps.iter().map(|&t| alphas_cumprod[t]).collect();
        let mut alphas_prev = Vec::with_capacity(steps);
        alphas_prev.push(1.0);
        alphas_prev.extend_from_slice(&alphas[..steps - 1]);
        Ok(Self {
            timesteps,
            alphas,
            alphas_prev,
        })
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }
}
