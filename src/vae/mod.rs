//! KL autoencoder for latent/pixel conversion.
//!
//! The generation path only ever decodes; `encode` and the end-to-end
//! `forward` exist for reconstruction checks and debugging.

pub mod blocks;
mod decoder;
mod encoder;

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, VarBuilder};

use crate::config::VaeConfig;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// Encoder + decoder with the two 1x1 projection convolutions that
/// bracket the latent space.
#[derive(Debug)]
pub struct AutoencoderKl {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    latent_channels: usize,
}

impl AutoencoderKl {
    pub fn new(vb: VarBuilder, config: &VaeConfig) -> Result<Self> {
        let encoder = Encoder::new(vb.pp("encoder"), config)?;
        let decoder = Decoder::new(vb.pp("decoder"), config)?;
        let moments = 2 * config.latent_channels;
        let quant_conv = conv2d(moments, moments, 1, Default::default(), vb.pp("quant_conv"))?;
        let post_quant_conv = conv2d(
            config.latent_channels,
            config.latent_channels,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;
        Ok(Self {
            encoder,
            decoder,
            quant_conv,
            post_quant_conv,
            latent_channels: config.latent_channels,
        })
    }

    /// Deterministic encode: run the encoder, project, and keep only the
    /// mean half of the moments. The log-variance half is discarded
    /// rather than sampled from.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let moments = self.encoder.forward(x)?;
        let moments = self.quant_conv.forward(&moments)?;
        moments.narrow(1, 0, self.latent_channels)
    }

    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let z = self.post_quant_conv.forward(z)?;
        self.decoder.forward(&z)
    }

    /// Reconstruction pass (encode then decode). Not used by the
    /// generation path.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let z = self.encode(x)?;
        self.decode(&z)
    }
}
