//! Stable Diffusion benchmark CLI.
//!
//! Generates one 512x512 image per prompt from a CSV prompt list and
//! reports timing/memory statistics, keeping the warm-up run separate
//! from the aggregate.
//!
//! ```bash
//! cargo run --release --bin txt2img -- \
//!     --prompts image_generation_prompts.csv \
//!     --steps 6 --seed 42 --out ./outputs
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_transformers::models::stable_diffusion::clip;
use clap::Parser;
use tracing::info;

use candle_sd::{
    bench,
    config::{InferenceConfig, ScheduleConfig, VaeConfig},
    loader,
    pipeline::StableDiffusion,
    text_encoder::ClipTextEncoder,
    unet::{sd_v1_unet_config, UNetDenoiser},
    vae::AutoencoderKl,
};

const DEFAULT_MODEL_REPO: &str = "runwayml/stable-diffusion-v1-5";
const DEFAULT_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const VAE_WEIGHTS: &str = "vae/diffusion_pytorch_model.safetensors";
const UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";
const CLIP_WEIGHTS: &str = "text_encoder/model.safetensors";

const IMAGE_SIZE: usize = 512;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the Stable Diffusion benchmark")]
struct Args {
    /// CSV file with a `Prompt` column, one generation run per row
    #[arg(long, default_value = "image_generation_prompts.csv")]
    prompts: PathBuf,

    /// Single prompt overriding the CSV source
    #[arg(short, long)]
    prompt: Option<String>,

    /// Number of diffusion steps
    #[arg(long, default_value_t = 6)]
    steps: usize,

    /// Prompt strength (classifier-free guidance scale)
    #[arg(long, default_value_t = 7.5)]
    guidance: f64,

    /// Output directory for images and the stats file
    #[arg(long)]
    out: Option<PathBuf>,

    /// Do not open generated images in the system viewer
    #[arg(long)]
    noshow: bool,

    /// Cast the diffusion model weights to float16
    #[arg(long)]
    fp16: bool,

    /// Log timing for every sampling step
    #[arg(long)]
    timing: bool,

    /// Base seed for the latent noise (run i uses seed + i)
    #[arg(long)]
    seed: Option<u64>,

    /// Model repository on the Hugging Face hub
    #[arg(long, default_value = DEFAULT_MODEL_REPO)]
    model_repo: String,

    /// Run on CPU instead of the default device
    #[arg(long)]
    cpu: bool,
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_sd=info".parse()?)
                .add_directive("txt2img=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let schedule_config = ScheduleConfig::default();
    let vae_config = VaeConfig::default();
    let inference = InferenceConfig {
        steps: args.steps,
        guidance_scale: args.guidance,
        seed: args.seed,
        fp16: args.fp16,
        timing: args.timing,
        show: !args.noshow,
        out_dir: args.out.clone(),
    };
    inference.validate(&schedule_config)?;

    let prompts = match &args.prompt {
        Some(prompt) => vec![prompt.clone()],
        None => bench::load_prompts(&args.prompts)
            .with_context(|| format!("loading prompts from {}", args.prompts.display()))?,
    };
    info!(count = prompts.len(), "loaded prompts");

    let device = device(args.cpu)?;
    let unet_dtype = if args.fp16 { DType::F16 } else { DType::F32 };

    info!(repo = args.model_repo, "fetching weights");
    let vae_path = loader::fetch_hf(&args.model_repo, VAE_WEIGHTS)?;
    let unet_path = loader::fetch_hf(&args.model_repo, UNET_WEIGHTS)?;
    let clip_path = loader::fetch_hf(&args.model_repo, CLIP_WEIGHTS)?;
    let tokenizer_path = loader::fetch_hf(DEFAULT_TOKENIZER_REPO, "tokenizer.json")?;

    let vae_tensors = loader::load_file(&vae_path, &device)?;
    let vae_tensors =
        loader::remap_diffusers_vae(vae_tensors, vae_config.block_out_channels.len())?;
    let vae_vb = loader::var_builder(vae_tensors, DType::F32, &device);
    let vae = AutoencoderKl::new(vae_vb, &vae_config)?;
    info!("VAE ready");

    let mut unet_tensors = loader::load_file(&unet_path, &device)?;
    if args.fp16 {
        // The per-component checkpoint holds only diffusion model tensors.
        unet_tensors = loader::downcast_to_f16(unet_tensors, "")?;
    }
    let unet_vb = loader::var_builder(unet_tensors, unet_dtype, &device);
    let denoiser = UNetDenoiser::new(
        unet_vb,
        vae_config.latent_channels,
        vae_config.latent_channels,
        sd_v1_unet_config(),
    )?;
    info!("UNet ready");

    let clip_tensors = loader::load_file(&clip_path, &device)?;
    let clip_vb = loader::var_builder(clip_tensors, DType::F32, &device);
    let mut text_encoder = ClipTextEncoder::new(
        &tokenizer_path,
        clip_vb,
        clip::Config::v1_5(),
        device.clone(),
    )?;
    info!("text encoder ready");

    let pipeline = StableDiffusion::new(
        vae,
        denoiser,
        &schedule_config,
        &vae_config,
        IMAGE_SIZE,
        IMAGE_SIZE,
        device,
    )?;

    let summary = bench::run_benchmark(&pipeline, &mut text_encoder, &prompts, &inference)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
