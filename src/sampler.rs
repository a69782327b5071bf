//! Reverse-diffusion sampling: classifier-free guidance and the DDIM
//! update rule.

use std::time::Instant;

use candle_core::{IndexOp, Result, Tensor};
use tracing::debug;

use crate::metrics::{MemoryProbe, RunMetrics, StepMetrics};
use crate::schedule::DdimSchedule;

/// Opaque noise estimator. Batch dimensions of `latent` and `context`
/// must match; the output has the same shape as `latent`.
pub trait Denoiser {
    fn forward(&self, latent: &Tensor, timestep: usize, context: &Tensor) -> Result<Tensor>;
}

/// Classifier-free-guidance noise estimate.
///
/// The denoiser runs once on a batch of two: the latent duplicated, with
/// the unconditional and conditional contexts stacked. The two
/// predictions are then extrapolated by the guidance scale:
/// `e_t = e_uncond + w * (e_cond - e_uncond)`.
pub fn guided_noise_estimate<D: Denoiser>(
    denoiser: &D,
    uncond_context: &Tensor,
    context: &Tensor,
    latent: &Tensor,
    timestep: usize,
    guidance_scale: f64,
) -> Result<Tensor> {
    let latent_pair = Tensor::cat(&[latent, latent], 0)?;
    let context_pair = Tensor::cat(&[uncond_context, context], 0)?;
    let noise = denoiser.forward(&latent_pair, timestep, &context_pair)?;
    let e_uncond = noise.i(0..1)?;
    let e_cond = noise.i(1..2)?;
    let delta = (&e_cond - &e_uncond)?;
    e_uncond + (delta * guidance_scale)?
}

/// One deterministic DDIM update (the stochastic noise term is zero).
///
/// Pure function of its inputs: `a_t` must be strictly positive, which
/// the schedule invariant guarantees.
pub fn ddim_step(x: &Tensor, e_t: &Tensor, a_t: f64, a_prev: f64) -> Result<Tensor> {
    let pred_x0 = ((x - (e_t * (1.0 - a_t).sqrt())?)? / a_t.sqrt())?;
    let dir_xt = (e_t * (1.0 - a_prev).sqrt())?;
    (pred_x0 * a_prev.sqrt())? + dir_xt
}

/// Drive the sampling loop over the schedule, most-noisy timestep first.
///
/// Strictly sequential: each step consumes the previous step's output
/// latent. Per-step wall time and a memory-probe sample are recorded
/// into the returned metrics.
pub fn sample<D: Denoiser>(
    denoiser: &D,
    schedule: &DdimSchedule,
    uncond_context: &Tensor,
    context: &Tensor,
    mut latent: Tensor,
    guidance_scale: f64,
    probe: &dyn MemoryProbe,
) -> Result<(Tensor, RunMetrics)> {
    let mut metrics = RunMetrics::default();
    for index in (0..schedule.len()).rev() {
        let timestep = schedule.timesteps[index];
        let started = Instant::now();
        let e_t = guided_noise_estimate(
            denoiser,
            uncond_context,
            context,
            &latent,
            timestep,
            guidance_scale,
        )?;
        latent = ddim_step(
            &latent,
            &e_t,
            schedule.alphas[index],
            schedule.alphas_prev[index],
        )?;
        let elapsed = started.elapsed();
        let mem_bytes = probe.current_bytes();
        debug!(index, timestep, ?elapsed, mem_bytes, "sampling step");
        metrics.record(StepMetrics {
            index,
            timestep,
            elapsed,
            mem_bytes,
        });
    }
    Ok((latent, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::metrics::NullProbe;
    use crate::schedule::alphas_cumprod;
    use candle_core::Device;

    /// Denoiser returning a constant per batch entry, so guidance
    /// arithmetic can be checked exactly.
    struct SplitConstant {
        uncond: f32,
        cond: f32,
    }

    impl Denoiser for SplitConstant {
        fn forward(&self, latent: &Tensor, _timestep: usize, context: &Tensor) -> Result<Tensor> {
            assert_eq!(latent.dim(0)?, context.dim(0)?);
            let (b, c, h, w) = latent.dims4()?;
            assert_eq!(b, 2);
            let uncond = Tensor::full(self.uncond, (1, c, h, w), latent.device())?;
            let cond = Tensor::full(self.cond, (1, c, h, w), latent.device())?;
            Tensor::cat(&[uncond, cond], 0)
        }
    }

    fn contexts(device: &Device) -> Result<(Tensor, Tensor)> {
        let u = Tensor::zeros((1, 4, 8), candle_core::DType::F32, device)?;
        let c = Tensor::ones((1, 4, 8), candle_core::DType::F32, device)?;
        Ok((u, c))
    }

    #[test]
    fn guidance_scale_one_returns_conditional() -> Result<()> {
        let device = Device::Cpu;
        let denoiser = SplitConstant {
            uncond: 1.0,
            cond: 2.0,
        };
        let (u, c) = contexts(&device)?;
        let latent = Tensor::zeros((1, 2, 4, 4), candle_core::DType::F32, &device)?;
        let e_t = guided_noise_estimate(&denoiser, &u, &c, &latent, 500, 1.0)?;
        let values = e_t.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| v == 2.0));
        Ok(())
    }

    #[test]
    fn guidance_extrapolates_past_conditional() -> Result<()> {
        let device = Device::Cpu;
        let denoiser = SplitConstant {
            uncond: 1.0,
            cond: 2.0,
        };
        let (u, c) = contexts(&device)?;
        let latent = Tensor::zeros((1, 2, 4, 4), candle_core::DType::F32, &device)?;
        // 1 + 7.5 * (2 - 1) = 8.5
        let e_t = guided_noise_estimate(&denoiser, &u, &c, &latent, 500, 7.5)?;
        let values = e_t.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| (v - 8.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn ddim_step_matches_hand_computation() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::full(1.0f32, (1, 1, 1, 1), &device)?;
        let e_t = Tensor::full(0.5f32, (1, 1, 1, 1), &device)?;
        let (a_t, a_prev) = (0.25, 0.81);
        let out = ddim_step(&x, &e_t, a_t, a_prev)?.flatten_all()?.to_vec1::<f32>()?;
        let pred_x0 = (1.0 - (1.0f64 - a_t).sqrt() * 0.5) / a_t.sqrt();
        let expected = a_prev.sqrt() * pred_x0 + (1.0f64 - a_prev).sqrt() * 0.5;
        assert!((out[0] as f64 - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn ddim_step_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device)?;
        let e_t = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device)?;
        let a = ddim_step(&x, &e_t, 0.3, 0.7)?.flatten_all()?.to_vec1::<f32>()?;
        let b = ddim_step(&x, &e_t, 0.3, 0.7)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn ddim_step_at_full_signal_recovers_pred_x0() -> Result<()> {
        // a_prev = 1.0 means the direction term vanishes and the output
        // is exactly the denoised estimate.
        let device = Device::Cpu;
        let x = Tensor::full(2.0f32, (1, 1, 1, 1), &device)?;
        let e_t = Tensor::full(0.0f32, (1, 1, 1, 1), &device)?;
        let out = ddim_step(&x, &e_t, 0.25, 1.0)?.flatten_all()?.to_vec1::<f32>()?;
        // pred_x0 = x / sqrt(a_t) = 2 / 0.5 = 4
        assert!((out[0] - 4.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn sample_runs_all_steps_in_reverse() -> Result<()> {
        let device = Device::Cpu;
        let acp = alphas_cumprod(&ScheduleConfig::default());
        let schedule = DdimSchedule::new(&acp, 6).unwrap();
        let denoiser = SplitConstant {
            uncond: 0.0,
            cond: 0.0,
        };
        let (u, c) = contexts(&device)?;
        let latent = Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &device)?;
        let (out, metrics) = sample(&denoiser, &schedule, &u, &c, latent, 7.5, &NullProbe)?;
        assert_eq!(out.dims(), &[1, 2, 4, 4]);
        assert_eq!(metrics.steps.len(), 6);
        let order: Vec<usize> = metrics.steps.iter().map(|s| s.timestep).collect();
        assert_eq!(order, vec![831, 665, 499, 333, 167, 1]);
        Ok(())
    }
}
