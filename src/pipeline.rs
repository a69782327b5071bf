//! Text-to-image generation pipeline.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::{ScheduleConfig, VaeConfig};
use crate::error::{Result, SdError};
use crate::metrics::{MemoryProbe, RunMetrics};
use crate::rng::Pcg32;
use crate::sampler::{self, Denoiser};
use crate::schedule::{alphas_cumprod, DdimSchedule};
use crate::vae::AutoencoderKl;

/// Scale applied to latents before decoding (SD v1 convention).
pub const LATENT_SCALE: f64 = 0.18215;

/// Owns the VAE, the denoiser and the precomputed noise schedule for
/// one image geometry. All state is read-only after construction; one
/// latent tensor exists per generation run.
pub struct StableDiffusion<D: Denoiser> {
    vae: AutoencoderKl,
    denoiser: D,
    alphas_cumprod: Vec<f64>,
    latent_channels: usize,
    latent_height: usize,
    latent_width: usize,
    device: Device,
}

impl<D: Denoiser> StableDiffusion<D> {
    pub fn new(
        vae: AutoencoderKl,
        denoiser: D,
        schedule_config: &ScheduleConfig,
        vae_config: &VaeConfig,
        height: usize,
        width: usize,
        device: Device,
    ) -> Result<Self> {
        let factor = vae_config.downsample_factor();
        if height % factor != 0 || width % factor != 0 {
            return Err(SdError::Config(format!(
                "image size {width}x{height} must be divisible by the VAE factor {factor}"
            )));
        }
        Ok(Self {
            vae,
            denoiser,
            alphas_cumprod: alphas_cumprod(schedule_config),
            latent_channels: vae_config.latent_channels,
            latent_height: height / factor,
            latent_width: width / factor,
            device,
        })
    }

    /// Timestep subsequence for a run of `steps` diffusion steps.
    pub fn schedule(&self, steps: usize) -> Result<DdimSchedule> {
        DdimSchedule::new(&self.alphas_cumprod, steps)
    }

    /// Fresh standard-normal latent. Seeded draws use the host PCG32
    /// stream and are bit-identical across runs; unseeded draws use the
    /// device RNG.
    pub fn init_latent(&self, seed: Option<u64>) -> Result<Tensor> {
        let shape = (1, self.latent_channels, self.latent_height, self.latent_width);
        let latent = match seed {
            Some(seed) => Pcg32::new(seed).randn(shape, &self.device)?,
            None => Tensor::randn(0f32, 1.0, shape, &self.device)?,
        };
        Ok(latent)
    }

    /// Run the full sampling loop, returning the final latent and the
    /// per-step metrics.
    pub fn generate(
        &self,
        uncond_context: &Tensor,
        context: &Tensor,
        latent: Tensor,
        schedule: &DdimSchedule,
        guidance_scale: f64,
        probe: &dyn MemoryProbe,
    ) -> Result<(Tensor, RunMetrics)> {
        let (latent, metrics) = sampler::sample(
            &self.denoiser,
            schedule,
            uncond_context,
            context,
            latent,
            guidance_scale,
            probe,
        )?;
        Ok((latent, metrics))
    }

    /// Decode a latent to an HWC u8 image tensor.
    ///
    /// Intensities are clamped to [0, 1] before the 255 scaling and
    /// integer cast, so every output value lies in [0, 255].
    pub fn decode_latent(&self, latent: &Tensor) -> Result<Tensor> {
        let z = (latent * (1.0 / LATENT_SCALE))?;
        let image = self.vae.decode(&z)?;
        let image = ((image + 1.0)? / 2.0)?;
        let image = image.squeeze(0)?.permute((1, 2, 0))?;
        debug!(dims = ?image.dims(), "decoded image");
        let image = (image.clamp(0f32, 1f32)? * 255.0)?;
        Ok(image.to_dtype(DType::U8)?)
    }

    pub fn vae(&self) -> &AutoencoderKl {
        &self.vae
    }

    pub fn latent_dims(&self) -> (usize, usize, usize) {
        (self.latent_channels, self.latent_height, self.latent_width)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
