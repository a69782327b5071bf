//! Building blocks shared by the VAE encoder and decoder.
//!
//! Weight names follow the original CompVis checkpoint layout
//! (`norm1`/`conv1`/`nin_shortcut`, `q`/`k`/`v`/`proj_out`, ...).

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

const NORM_EPS: f64 = 1e-6;

fn norm(groups: usize, channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(groups, channels, NORM_EPS, vb)
}

fn conv3x3(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(
        in_ch,
        out_ch,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb,
    )
}

fn conv1x1(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_ch, out_ch, 1, Default::default(), vb)
}

/// Residual path of a [`ResnetBlock`], decided once at construction.
#[derive(Debug)]
enum Shortcut {
    Identity,
    Projection(Conv2d),
}

impl Shortcut {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Shortcut::Identity => Ok(x.clone()),
            Shortcut::Projection(conv) => conv.forward(x),
        }
    }
}

/// Two norm-silu-conv stages with a residual connection. The residual
/// is a learned 1x1 projection when the channel count changes.
#[derive(Debug)]
pub struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    shortcut: Shortcut,
}

impl ResnetBlock {
    pub fn new(vb: VarBuilder, groups: usize, in_ch: usize, out_ch: usize) -> Result<Self> {
        let norm1 = norm(groups, in_ch, vb.pp("norm1"))?;
        let conv1 = conv3x3(in_ch, out_ch, vb.pp("conv1"))?;
        let norm2 = norm(groups, out_ch, vb.pp("norm2"))?;
        let conv2 = conv3x3(out_ch, out_ch, vb.pp("conv2"))?;
        let shortcut = if in_ch != out_ch {
            Shortcut::Projection(conv1x1(in_ch, out_ch, vb.pp("nin_shortcut"))?)
        } else {
            Shortcut::Identity
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            shortcut,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm1.forward(x)?;
        let h = candle_nn::ops::silu(&h)?;
        let h = self.conv1.forward(&h)?;
        let h = self.norm2.forward(&h)?;
        let h = candle_nn::ops::silu(&h)?;
        let h = self.conv2.forward(&h)?;
        self.shortcut.forward(x)? + h
    }
}

/// Single-head self-attention over the H*W spatial positions.
///
/// Projections are 1x1 convolutions; attention is scaled dot-product
/// over the full spatial extent with no masking.
#[derive(Debug)]
pub struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
    channels: usize,
}

impl AttnBlock {
    pub fn new(vb: VarBuilder, groups: usize, channels: usize) -> Result<Self> {
        let norm = norm(groups, channels, vb.pp("norm"))?;
        let q = conv1x1(channels, channels, vb.pp("q"))?;
        let k = conv1x1(channels, channels, vb.pp("k"))?;
        let v = conv1x1(channels, channels, vb.pp("v"))?;
        let proj_out = conv1x1(channels, channels, vb.pp("proj_out"))?;
        Ok(Self {
            norm,
            q,
            k,
            v,
            proj_out,
            channels,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let hidden = self.norm.forward(x)?;
        let q = self.q.forward(&hidden)?;
        let k = self.k.forward(&hidden)?;
        let v = self.v.forward(&hidden)?;

        // (b, c, h, w) -> (b, h*w, c): each spatial position is a token.
        let q = q.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let k = k.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let v = v.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;

        let scale = (self.channels as f64).powf(-0.5);
        let attn = (q.matmul(&k.transpose(1, 2)?)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?;

        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, c, h, w))?;
        x + self.proj_out.forward(&out)?
    }
}

/// Fixed resnet -> attention -> resnet stage at constant width, shared
/// by the encoder and decoder.
#[derive(Debug)]
pub struct MidBlock {
    block_1: ResnetBlock,
    attn_1: AttnBlock,
    block_2: ResnetBlock,
}

impl MidBlock {
    pub fn new(vb: VarBuilder, groups: usize, channels: usize) -> Result<Self> {
        let block_1 = ResnetBlock::new(vb.pp("block_1"), groups, channels, channels)?;
        let attn_1 = AttnBlock::new(vb.pp("attn_1"), groups, channels)?;
        let block_2 = ResnetBlock::new(vb.pp("block_2"), groups, channels, channels)?;
        Ok(Self {
            block_1,
            attn_1,
            block_2,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.block_1.forward(x)?;
        let h = self.attn_1.forward(&h)?;
        self.block_2.forward(&h)
    }
}

/// Stride-2 downsampling convolution with asymmetric padding.
///
/// Pads one zero row/column on the bottom/right only so a 2N input maps
/// to exactly N.
#[derive(Debug)]
pub struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv2d(
            channels,
            channels,
            3,
            Conv2dConfig {
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x
            .pad_with_zeros(D::Minus1, 0, 1)?
            .pad_with_zeros(D::Minus2, 0, 1)?;
        self.conv.forward(&x)
    }
}

/// Nearest-neighbor 2x spatial upsample followed by a 3x3 convolution.
#[derive(Debug)]
pub struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv3x3(channels, channels, vb.pp("conv"))?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(h * 2, w * 2)?;
        self.conv.forward(&x)
    }
}
