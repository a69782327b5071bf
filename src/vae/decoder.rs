//! VAE decoder: latent space back to pixels.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use crate::config::VaeConfig;
use crate::vae::blocks::{MidBlock, ResnetBlock, Upsample};

/// One decoder resolution stage: resnet blocks then an optional 2x
/// upsample.
#[derive(Debug)]
struct UpBlock {
    blocks: Vec<ResnetBlock>,
    upsample: Option<Upsample>,
}

impl UpBlock {
    fn new(
        vb: VarBuilder,
        groups: usize,
        in_ch: usize,
        out_ch: usize,
        num_layers: usize,
        add_upsample: bool,
    ) -> Result<Self> {
        let mut blocks = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let block_in = if i == 0 { in_ch } else { out_ch };
            blocks.push(ResnetBlock::new(
                vb.pp("block").pp(i),
                groups,
                block_in,
                out_ch,
            )?);
        }
        let upsample = if add_upsample {
            Some(Upsample::new(vb.pp("upsample"), out_ch)?)
        } else {
            None
        };
        Ok(Self { blocks, upsample })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        if let Some(up) = &self.upsample {
            h = up.forward(&h)?;
        }
        Ok(h)
    }
}

/// Multi-resolution decoder. Stages run coarse-to-fine; the checkpoint
/// indexes them fine-to-coarse, so stage `i` in processing order maps to
/// weight group `up.{n-1-i}`.
#[derive(Debug)]
pub struct Decoder {
    conv_in: Conv2d,
    mid: MidBlock,
    up: Vec<UpBlock>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    pub fn new(vb: VarBuilder, config: &VaeConfig) -> Result<Self> {
        let groups = config.norm_num_groups;
        let num_stages = config.block_out_channels.len();
        let reversed: Vec<usize> = config.block_out_channels.iter().rev().copied().collect();

        let conv_in = conv2d(
            config.latent_channels,
            reversed[0],
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv_in"),
        )?;
        let mid = MidBlock::new(vb.pp("mid"), groups, reversed[0])?;

        let mut up = Vec::with_capacity(num_stages);
        let mut output_channel = reversed[0];
        for (i, &out_ch) in reversed.iter().enumerate() {
            let input_channel = output_channel;
            output_channel = out_ch;
            let is_final = i == num_stages - 1;
            up.push(UpBlock::new(
                vb.pp("up").pp(num_stages - 1 - i),
                groups,
                input_channel,
                output_channel,
                config.layers_per_block + 1,
                !is_final,
            )?);
        }

        let bottom = config.block_out_channels[0];
        let norm_out = candle_nn::group_norm(groups, bottom, 1e-6, vb.pp("norm_out"))?;
        let conv_out = conv2d(
            bottom,
            config.out_channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv_out"),
        )?;

        Ok(Self {
            conv_in,
            mid,
            up,
            norm_out,
            conv_out,
        })
    }

    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(z)?;
        h = self.mid.forward(&h)?;
        for stage in &self.up {
            h = stage.forward(&h)?;
        }
        h = self.norm_out.forward(&h)?;
        h = candle_nn::ops::silu(&h)?;
        self.conv_out.forward(&h)
    }
}
