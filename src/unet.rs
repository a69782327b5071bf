//! Denoising network adapter.
//!
//! The UNet itself comes from candle-transformers and is treated as an
//! opaque scorer; this module only adapts it to the [`Denoiser`] seam
//! used by the sampler.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig,
};

use crate::sampler::Denoiser;

/// UNet block layout for the SD v1 checkpoints: 320 base channels,
/// multipliers [1, 2, 4, 4], 8 attention heads, 768-dim context.
pub fn sd_v1_unet_config() -> UNet2DConditionModelConfig {
    let bc = |out_channels, use_cross_attn| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim: 8,
    };
    UNet2DConditionModelConfig {
        blocks: vec![
            bc(320, Some(1)),
            bc(640, Some(1)),
            bc(1280, Some(1)),
            bc(1280, None),
        ],
        center_input_sample: false,
        cross_attention_dim: 768,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: false,
    }
}

/// [`Denoiser`] backed by a conditional UNet.
pub struct UNetDenoiser {
    model: UNet2DConditionModel,
}

impl UNetDenoiser {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        config: UNet2DConditionModelConfig,
    ) -> Result<Self> {
        let model = UNet2DConditionModel::new(vb, in_channels, out_channels, false, config)?;
        Ok(Self { model })
    }
}

impl Denoiser for UNetDenoiser {
    fn forward(&self, latent: &Tensor, timestep: usize, context: &Tensor) -> Result<Tensor> {
        self.model.forward(latent, timestep as f64, context)
    }
}
