//! Configuration structures for the diffusion pipeline and benchmark harness.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};

/// Noise schedule hyperparameters.
///
/// The defaults reproduce the Stable Diffusion v1 training schedule:
/// betas interpolated linearly in sqrt space between `beta_start` and
/// `beta_end` over `num_train_timesteps` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.0120
}

fn default_num_train_timesteps() -> usize {
    1000
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            num_train_timesteps: default_num_train_timesteps(),
        }
    }
}

/// VAE geometry configuration.
///
/// The default matches the SD v1 autoencoder: four resolution stages at
/// widths 128/256/512/512, a factor-8 spatial compression and a
/// 4-channel latent space. The encoder emits `2 * latent_channels`
/// channels (mean and log-variance halves).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_in_channels")]
    pub out_channels: usize,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    /// Resnet blocks per encoder stage. The decoder runs one more per
    /// stage, mirroring the original architecture.
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
}

fn default_in_channels() -> usize {
    3
}

fn default_latent_channels() -> usize {
    4
}

fn default_block_out_channels() -> Vec<usize> {
    vec![128, 256, 512, 512]
}

fn default_layers_per_block() -> usize {
    2
}

fn default_norm_num_groups() -> usize {
    32
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            out_channels: default_in_channels(),
            latent_channels: default_latent_channels(),
            block_out_channels: default_block_out_channels(),
            layers_per_block: default_layers_per_block(),
            norm_num_groups: default_norm_num_groups(),
        }
    }
}

impl VaeConfig {
    /// Spatial compression factor between pixel and latent space.
    /// One stride-2 downsample after every stage except the last.
    pub fn downsample_factor(&self) -> usize {
        1 << (self.block_out_channels.len() - 1)
    }
}

/// Caller-facing knobs for one benchmark invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Number of diffusion steps.
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Classifier-free guidance scale (prompt strength).
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    /// Base seed for the latent noise. Run `i` uses `seed + i`.
    /// When absent, latents are drawn from the device RNG and runs are
    /// not reproducible.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Downcast the diffusion model weights to half precision.
    #[serde(default)]
    pub fp16: bool,
    /// Log per-step timing.
    #[serde(default)]
    pub timing: bool,
    /// Open each generated image with the system viewer.
    #[serde(default)]
    pub show: bool,
    /// Output directory for generated images and the stats file.
    /// Falls back to the system temp directory.
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
}

fn default_steps() -> usize {
    6
}

fn default_guidance_scale() -> f64 {
    7.5
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            seed: None,
            fp16: false,
            timing: false,
            show: false,
            out_dir: None,
        }
    }
}

impl InferenceConfig {
    /// Validate before any weight loading or sampling starts.
    pub fn validate(&self, schedule: &ScheduleConfig) -> Result<()> {
        if self.steps == 0 {
            return Err(SdError::Config("steps must be at least 1".to_string()));
        }
        if self.steps > schedule.num_train_timesteps {
            return Err(SdError::Config(format!(
                "steps ({}) cannot exceed the training schedule length ({})",
                self.steps, schedule.num_train_timesteps
            )));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(SdError::Config(format!(
                "guidance scale must be finite and non-negative, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_inference_config() {
        let cfg = InferenceConfig::default();
        assert_eq!(cfg.steps, 6);
        assert_eq!(cfg.guidance_scale, 7.5);
        assert!(cfg.seed.is_none());
        assert!(!cfg.fp16);
    }

    #[test]
    fn validate_rejects_zero_steps() {
        let cfg = InferenceConfig {
            steps: 0,
            ..Default::default()
        };
        assert!(cfg.validate(&ScheduleConfig::default()).is_err());
    }

    #[test]
    fn validate_rejects_oversized_steps() {
        let cfg = InferenceConfig {
            steps: 1001,
            ..Default::default()
        };
        assert!(cfg.validate(&ScheduleConfig::default()).is_err());
    }

    #[test]
    fn validate_rejects_nan_guidance() {
        let cfg = InferenceConfig {
            guidance_scale: f64::NAN,
            ..Default::default()
        };
        assert!(cfg.validate(&ScheduleConfig::default()).is_err());
    }

    #[test]
    fn vae_downsample_factor() {
        assert_eq!(VaeConfig::default().downsample_factor(), 8);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = InferenceConfig {
            seed: Some(42),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: InferenceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seed, Some(42));
        assert_eq!(back.steps, cfg.steps);
    }
}
