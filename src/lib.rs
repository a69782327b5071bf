//! Stable Diffusion text-to-image generation for the Candle framework.
//!
//! Implements DDIM sampling with classifier-free guidance over a KL
//! autoencoder, plus a multi-prompt benchmark harness that aggregates
//! timing and memory statistics across runs.

pub mod bench;
pub mod config;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod rng;
pub mod sampler;
pub mod schedule;
pub mod text_encoder;
pub mod unet;
pub mod vae;

pub use bench::{run_benchmark, BenchmarkSummary, RunRecord};
pub use config::{InferenceConfig, ScheduleConfig, VaeConfig};
pub use error::{Result, SdError};
pub use pipeline::StableDiffusion;
pub use sampler::Denoiser;
pub use schedule::DdimSchedule;
pub use text_encoder::{ClipTextEncoder, PromptEncoder};
