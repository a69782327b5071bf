//! Shape tests for the KL autoencoder.
//!
//! Small two-stage geometries keep the tests fast; the full SD v1
//! geometry runs under `--ignored`.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_sd::config::VaeConfig;
use candle_sd::vae::AutoencoderKl;

fn small_config() -> VaeConfig {
    VaeConfig {
        in_channels: 3,
        out_channels: 3,
        latent_channels: 2,
        block_out_channels: vec![8, 16],
        layers_per_block: 1,
        norm_num_groups: 4,
    }
}

fn zeros_vae(config: &VaeConfig, device: &Device) -> Result<AutoencoderKl> {
    let vb = VarBuilder::zeros(DType::F32, device);
    AutoencoderKl::new(vb, config)
}

#[test]
fn test_encode_compresses_by_downsample_factor() -> Result<()> {
    let device = Device::Cpu;
    let config = small_config();
    assert_eq!(config.downsample_factor(), 2);
    let vae = zeros_vae(&config, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &device)?;
    let z = vae.encode(&x)?;
    // Mean half only: latent_channels, not 2 * latent_channels.
    assert_eq!(z.dims(), &[1, 2, 8, 8]);
    Ok(())
}

#[test]
fn test_decode_restores_pixel_geometry() -> Result<()> {
    let device = Device::Cpu;
    let config = small_config();
    let vae = zeros_vae(&config, &device)?;
    let z = Tensor::randn(0f32, 1.0, (1, 2, 8, 8), &device)?;
    let x = vae.decode(&z)?;
    assert_eq!(x.dims(), &[1, 3, 16, 16]);
    Ok(())
}

#[test]
fn test_roundtrip_preserves_shape() -> Result<()> {
    let device = Device::Cpu;
    let config = small_config();
    let vae = zeros_vae(&config, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, 32, 32), &device)?;
    let y = vae.forward(&x)?;
    assert_eq!(y.dims(), x.dims());
    Ok(())
}

#[test]
fn test_encode_is_deterministic() -> Result<()> {
    // No sampling from the posterior: two encodes of the same input
    // must agree exactly.
    let device = Device::Cpu;
    let config = small_config();
    let vae = zeros_vae(&config, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &device)?;
    let a = vae.encode(&x)?.flatten_all()?.to_vec1::<f32>()?;
    let b = vae.encode(&x)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_batched_input() -> Result<()> {
    let device = Device::Cpu;
    let config = small_config();
    let vae = zeros_vae(&config, &device)?;
    let x = Tensor::randn(0f32, 1.0, (3, 3, 16, 16), &device)?;
    let z = vae.encode(&x)?;
    assert_eq!(z.dims(), &[3, 2, 8, 8]);
    Ok(())
}

#[test]
#[ignore = "full SD v1 geometry, slow on CPU"]
fn test_full_size_geometry() -> Result<()> {
    let device = Device::Cpu;
    let config = VaeConfig::default();
    assert_eq!(config.downsample_factor(), 8);
    let vae = zeros_vae(&config, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, 512, 512), &device)?;
    let z = vae.encode(&x)?;
    assert_eq!(z.dims(), &[1, 4, 64, 64]);
    let y = vae.decode(&z)?;
    assert_eq!(y.dims(), &[1, 3, 512, 512]);
    Ok(())
}
