//! Tests for the sampling loop: guidance batching and DDIM telescoping.

use std::cell::Cell;

use candle_core::{DType, Device, Result, Tensor};
use candle_sd::config::ScheduleConfig;
use candle_sd::metrics::NullProbe;
use candle_sd::sampler::{sample, Denoiser};
use candle_sd::schedule::{alphas_cumprod, DdimSchedule};

/// Denoiser that predicts zero noise and counts its invocations.
struct ZeroNoise {
    calls: Cell<usize>,
}

impl ZeroNoise {
    fn new() -> Self {
        Self {
            calls: Cell::new(0),
        }
    }
}

impl Denoiser for ZeroNoise {
    fn forward(&self, latent: &Tensor, _timestep: usize, context: &Tensor) -> Result<Tensor> {
        assert_eq!(latent.dim(0)?, 2, "guidance runs one batch of two");
        assert_eq!(context.dim(0)?, 2);
        self.calls.set(self.calls.get() + 1);
        latent.zeros_like()
    }
}

fn contexts(device: &Device) -> Result<(Tensor, Tensor)> {
    let u = Tensor::zeros((1, 77, 16), DType::F32, device)?;
    let c = Tensor::ones((1, 77, 16), DType::F32, device)?;
    Ok((u, c))
}

#[test]
fn test_one_denoiser_call_per_step() -> Result<()> {
    let device = Device::Cpu;
    let acp = alphas_cumprod(&ScheduleConfig::default());
    let schedule = DdimSchedule::new(&acp, 6).unwrap();
    let denoiser = ZeroNoise::new();
    let (u, c) = contexts(&device)?;
    let latent = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device)?;
    sample(&denoiser, &schedule, &u, &c, latent, 7.5, &NullProbe)?;
    assert_eq!(denoiser.calls.get(), 6);
    Ok(())
}

#[test]
fn test_zero_noise_prediction_telescopes() -> Result<()> {
    // With e_t = 0 every step reduces to x <- x * sqrt(a_prev / a_t),
    // so the product over the reversed schedule telescopes down to
    // 1 / sqrt(a_last).
    let device = Device::Cpu;
    let acp = alphas_cumprod(&ScheduleConfig::default());
    let schedule = DdimSchedule::new(&acp, 6).unwrap();
    let denoiser = ZeroNoise::new();
    let (u, c) = contexts(&device)?;
    let latent = Tensor::full(1.0f32, (1, 4, 8, 8), &device)?;
    let (out, _) = sample(&denoiser, &schedule, &u, &c, latent, 7.5, &NullProbe)?;
    let expected = 1.0 / schedule.alphas.last().unwrap().sqrt();
    let values = out.flatten_all()?.to_vec1::<f32>()?;
    for v in values {
        assert!(
            (v as f64 - expected).abs() < 1e-3,
            "got {v}, expected {expected}"
        );
    }
    Ok(())
}

#[test]
fn test_sampling_is_deterministic() -> Result<()> {
    let device = Device::Cpu;
    let acp = alphas_cumprod(&ScheduleConfig::default());
    let schedule = DdimSchedule::new(&acp, 4).unwrap();
    let (u, c) = contexts(&device)?;
    let latent = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device)?;

    let (a, _) = sample(
        &ZeroNoise::new(),
        &schedule,
        &u,
        &c,
        latent.clone(),
        7.5,
        &NullProbe,
    )?;
    let (b, _) = sample(&ZeroNoise::new(), &schedule, &u, &c, latent, 7.5, &NullProbe)?;
    assert_eq!(
        a.flatten_all()?.to_vec1::<f32>()?,
        b.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn test_metrics_cover_every_step_in_reverse_order() -> Result<()> {
    let device = Device::Cpu;
    let acp = alphas_cumprod(&ScheduleConfig::default());
    let schedule = DdimSchedule::new(&acp, 6).unwrap();
    let (u, c) = contexts(&device)?;
    let latent = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device)?;
    let (_, metrics) = sample(
        &ZeroNoise::new(),
        &schedule,
        &u,
        &c,
        latent,
        7.5,
        &NullProbe,
    )?;
    let timesteps: Vec<usize> = metrics.steps.iter().map(|s| s.timestep).collect();
    assert_eq!(timesteps, vec![831, 665, 499, 333, 167, 1]);
    assert!(metrics.total_elapsed().as_nanos() > 0);
    Ok(())
}
