//! VAE encoder: pixel space to latent moments.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use crate::config::VaeConfig;
use crate::vae::blocks::{Downsample, MidBlock, ResnetBlock};

/// One encoder resolution stage: resnet blocks then an optional
/// stride-2 downsample.
#[derive(Debug)]
struct DownBlock {
    blocks: Vec<ResnetBlock>,
    downsample: Option<Downsample>,
}

impl DownBlock {
    fn new(
        vb: VarBuilder,
        groups: usize,
        in_ch: usize,
        out_ch: usize,
        num_layers: usize,
        add_downsample: bool,
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
        let downsample = if add_downsample {
            Some(Downsample::new(vb.pp("downsample"), out_ch)?)
        } else {
            None
        };
        Ok(Self { blocks, downsample })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        if let Some(down) = &self.downsample {
            h = down.forward(&h)?;
        }
        Ok(h)
    }
}

/// Multi-resolution encoder producing `2 * latent_channels` output
/// channels (mean and log-variance halves).
#[derive(Debug)]
pub struct Encoder {
    conv_in: Conv2d,
    down: Vec<DownBlock>,
    mid: MidBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    pub fn new(vb: VarBuilder, config: &VaeConfig) -> Result<Self> {
        let groups = config.norm_num_groups;
        let conv_in = conv2d(
            config.in_channels,
            config.block_out_channels[0],
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv_in"),
        )?;

        let num_stages = config.block_out_channels.len();
        let mut down = Vec::with_capacity(num_stages);
        let mut output_channel = config.block_out_channels[0];
        for (i, &out_ch) in config.block_out_channels.iter().enumerate() {
            let input_channel = output_channel;
            output_channel = out_ch;
            let is_final = i == num_stages - 1;
            down.push(DownBlock::new(
                vb.pp("down").pp(i),
                groups,
                input_channel,
                output_channel,
                config.layers_per_block,
                !is_final,
            )?);
        }

        let top = *config.block_out_channels.last().unwrap_or(&output_channel);
        let mid = MidBlock::new(vb.pp("mid"), groups, top)?;
        let norm_out = candle_nn::group_norm(groups, top, 1e-6, vb.pp("norm_out"))?;
        let conv_out = conv2d(
            top,
            2 * config.latent_channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv_out"),
        )?;

        Ok(Self {
            conv_in,
            down,
            mid,
            norm_out,
            conv_out,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(x)?;
        for stage in &self.down {
            h = stage.forward(&h)?;
        }
        h = self.mid.forward(&h)?;
        h = self.norm_out.forward(&h)?;
        h = candle_nn::ops::silu(&h)?;
        self.conv_out.forward(&h)
    }
}
